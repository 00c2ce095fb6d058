//! 启动命令的文本形式
//!
//! `rez env <packages> [--exclude RULE].. --time T [--no-local] -- <tool>`，可在别的机器上原样复现同一解析。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::core::session::SerialisationMode;
use crate::rez::{GatewayError, PackageFilter, ResolvedContext, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub packages: Vec<String>,
    pub exclude: Vec<String>,
    pub time: i64,
    pub no_local: bool,
    pub tool: String,
}

/// 构建命令所需的会话输入
#[derive(Debug, Clone, Copy)]
pub struct CommandInputs<'a> {
    pub mode: SerialisationMode,
    pub filter: &'a PackageFilter,
    pub no_local: bool,
    pub tool: &'a str,
    pub overrides: &'a HashMap<String, Version>,
    pub disabled: &'a HashSet<String>,
}

impl LaunchCommand {
    pub fn from_context(context: &dyn ResolvedContext, inputs: CommandInputs<'_>) -> Self {
        let tokens: Vec<(String, String)> = match inputs.mode {
            SerialisationMode::UsedResolve => context
                .resolved_packages()
                .iter()
                .map(|p| (p.name.clone(), p.request_string()))
                .collect(),
            SerialisationMode::UsedRequest => context
                .requested_packages()
                .iter()
                .map(|r| (r.name.clone(), r.to_string()))
                .collect(),
        };

        let packages = tokens
            .into_iter()
            .filter(|(name, _)| !inputs.disabled.contains(name))
            .map(|(name, token)| match inputs.overrides.get(&name) {
                Some(version) => format!("{name}=={version}"),
                None => token,
            })
            .collect();

        Self {
            packages,
            exclude: inputs
                .filter
                .to_string()
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            time: context.timestamp(),
            no_local: inputs.no_local,
            tool: inputs.tool.to_string(),
        }
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = vec!["rez", "env"];
        parts.extend(self.packages.iter().map(String::as_str));
        for rule in &self.exclude {
            parts.push("--exclude");
            parts.push(rule);
        }
        let time = self.time.to_string();
        parts.push("--time");
        parts.push(&time);
        if self.no_local {
            parts.push("--no-local");
        }
        parts.push("--");
        parts.push(&self.tool);
        f.write_str(&parts.join(" "))
    }
}

impl FromStr for LaunchCommand {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || GatewayError::RequestParse(raw.to_string());
        let mut tokens = raw.split_whitespace();
        if tokens.next() != Some("rez") || tokens.next() != Some("env") {
            return Err(invalid());
        }

        let mut packages = Vec::new();
        let mut exclude = Vec::new();
        let mut time = None;
        let mut no_local = false;
        loop {
            match tokens.next().ok_or_else(invalid)? {
                "--" => break,
                "--exclude" => exclude.push(tokens.next().ok_or_else(invalid)?.to_string()),
                "--time" => {
                    let t = tokens.next().ok_or_else(invalid)?;
                    time = Some(t.parse().map_err(|_| invalid())?);
                }
                "--no-local" => no_local = true,
                package => packages.push(package.to_string()),
            }
        }
        let tool = tokens.collect::<Vec<_>>().join(" ");
        if tool.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            packages,
            exclude,
            time: time.ok_or_else(invalid)?,
            no_local,
            tool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rez::{Package, PackageRepository, PackageRequest, ResolverGateway};

    fn context() -> std::sync::Arc<dyn ResolvedContext> {
        let repo = PackageRepository::from_packages(vec![
            Package::new("foo", "1.0.0").with_requires(&["python-3"]).unwrap(),
            Package::new("python", "3.7"),
            Package::new("app_A", "1.0.0"),
        ]);
        repo.resolve(&PackageRequest::parse_list("foo==1.0.0 app_A==1.0.0").unwrap(), None)
            .unwrap()
    }

    #[test]
    fn test_used_request_and_used_resolve() {
        let ctx = context();
        let filter = PackageFilter::parse("*.beta").unwrap();
        let overrides = HashMap::new();
        let disabled = HashSet::new();
        let mut inputs = CommandInputs {
            mode: SerialisationMode::UsedRequest,
            filter: &filter,
            no_local: true,
            tool: "app_A",
            overrides: &overrides,
            disabled: &disabled,
        };

        let request = LaunchCommand::from_context(ctx.as_ref(), inputs);
        assert_eq!(
            request.to_string(),
            format!(
                "rez env foo==1.0.0 app_A==1.0.0 --exclude *.beta --time {} --no-local -- app_A",
                ctx.timestamp()
            )
        );

        inputs.mode = SerialisationMode::UsedResolve;
        let resolve = LaunchCommand::from_context(ctx.as_ref(), inputs);
        assert_eq!(
            resolve.packages,
            vec!["foo==1.0.0", "app_A==1.0.0", "python==3.7"]
        );
        assert_eq!(resolve.exclude, request.exclude);
        assert_eq!(resolve.time, request.time);
        assert_eq!(resolve.tool, request.tool);
    }

    #[test]
    fn test_overrides_and_disabled() {
        let ctx = context();
        let filter = PackageFilter::default();
        let overrides = HashMap::from([("python".to_string(), Version::from("3.9"))]);
        let disabled = HashSet::from(["app_A".to_string()]);
        let cmd = LaunchCommand::from_context(
            ctx.as_ref(),
            CommandInputs {
                mode: SerialisationMode::UsedResolve,
                filter: &filter,
                no_local: false,
                tool: "python",
                overrides: &overrides,
                disabled: &disabled,
            },
        );
        assert_eq!(cmd.packages, vec!["foo==1.0.0", "python==3.9"]);
        assert!(cmd.exclude.is_empty());
        assert!(!cmd.to_string().contains("--no-local"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("rez env foo".parse::<LaunchCommand>().is_err());
        assert!("rez env foo --time x -- app".parse::<LaunchCommand>().is_err());
        assert!("bash -c foo".parse::<LaunchCommand>().is_err());
        let cmd: LaunchCommand = "rez env foo --time 3 -- app --flag".parse().unwrap();
        assert_eq!(cmd.tool, "app --flag");
    }
}
