//! 参考网关实现：内存或目录包仓库
//!
//! - 内存仓库：直接由 Package 列表构建（测试与 `--demo` 使用）
//! - 目录仓库：`<path>/<name>/<version>/package.toml`，首次查找时扫描并缓存，clear_caches 后重新扫描

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::rez::solver::{solve, SolveOutcome};
use crate::rez::{
    Environ, GatewayError, Package, PackageFilter, PackageRequest, ResolvedContext,
    ResolverGateway, VersionRange,
};

const MEMORY_LOCATION: &str = "memory@any";
const DEFINITION_FILE: &str = "package.toml";

type Families = HashMap<String, Vec<Package>>;

#[derive(Debug)]
enum Source {
    Memory(Arc<Families>),
    Directories(Vec<PathBuf>),
}

/// 包仓库：实现 ResolverGateway
#[derive(Debug)]
pub struct PackageRepository {
    source: Source,
    cache: RwLock<Option<Arc<Families>>>,
    cache_clears: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct PackageDocument {
    #[serde(default, rename = "package")]
    packages: Vec<Package>,
}

impl PackageRepository {
    pub fn from_packages(packages: Vec<Package>) -> Self {
        let mut families: Families = HashMap::new();
        for package in packages {
            families.entry(package.name.clone()).or_default().push(package);
        }
        Self {
            source: Source::Memory(Arc::new(families)),
            cache: RwLock::new(None),
            cache_clears: AtomicUsize::new(0),
        }
    }

    /// 由 `[[package]]` 数组形式的 TOML 文档构建内存仓库
    pub fn from_toml_str(document: &str) -> Result<Self, GatewayError> {
        let doc: PackageDocument = toml::from_str(document).map_err(|e| GatewayError::Definition {
            path: MEMORY_LOCATION.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_packages(doc.packages))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            source: Source::Directories(paths),
            cache: RwLock::new(None),
            cache_clears: AtomicUsize::new(0),
        }
    }

    /// clear_caches 被调用的次数
    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::Relaxed)
    }

    fn families(&self) -> Arc<Families> {
        let paths = match &self.source {
            Source::Memory(families) => return Arc::clone(families),
            Source::Directories(paths) => paths,
        };
        if let Ok(guard) = self.cache.read() {
            if let Some(families) = guard.as_ref() {
                return Arc::clone(families);
            }
        }
        let scanned = Arc::new(scan_paths(paths));
        if let Ok(mut guard) = self.cache.write() {
            *guard = Some(Arc::clone(&scanned));
        }
        scanned
    }
}

fn load_definition(path: &Path) -> Result<Package, GatewayError> {
    let definition_error = |reason: String| GatewayError::Definition {
        path: path.display().to_string(),
        reason,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| definition_error(e.to_string()))?;
    toml::from_str(&raw).map_err(|e| definition_error(e.to_string()))
}

fn scan_paths(paths: &[PathBuf]) -> Families {
    let mut families: Families = HashMap::new();
    for root in paths {
        let entries = WalkDir::new(root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() && e.file_name() == DEFINITION_FILE);
        for entry in entries {
            match load_definition(entry.path()) {
                Ok(package) => families.entry(package.name.clone()).or_default().push(package),
                Err(e) => tracing::warn!(error = %e, "skipping package definition"),
            }
        }
    }
    tracing::debug!(families = families.len(), "scanned package repository");
    families
}

impl ResolverGateway for PackageRepository {
    fn find(
        &self,
        name: &str,
        range: &VersionRange,
        filter: Option<&PackageFilter>,
    ) -> Result<Vec<Package>, GatewayError> {
        let families = self.families();
        let Some(family) = families.get(name) else {
            return Ok(Vec::new());
        };
        Ok(family
            .iter()
            .filter(|p| range.contains(&p.version))
            .filter(|p| {
                let excluded = filter.map_or(false, |f| f.excludes(p));
                if excluded {
                    tracing::debug!(package = %p.qualified_name(), "excluded by filter");
                }
                !excluded
            })
            .cloned()
            .collect())
    }

    fn resolve(
        &self,
        requests: &[PackageRequest],
        filter: Option<&PackageFilter>,
    ) -> Result<Arc<dyn ResolvedContext>, GatewayError> {
        let families = self.families();
        let searched = self.package_paths();
        let outcome = solve(&families, requests, filter, &searched)?;
        let (resolved, failure) = match outcome {
            SolveOutcome::Solved(resolved) => (resolved, None),
            SolveOutcome::Failed(reason) => (Vec::new(), Some(reason)),
        };
        Ok(Arc::new(RepositoryContext {
            requested: requests.to_vec(),
            resolved,
            failure,
            timestamp: chrono::Utc::now().timestamp(),
            package_paths: searched,
        }))
    }

    fn clear_caches(&self) {
        self.cache_clears.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.cache.write() {
            *guard = None;
        }
    }

    fn package_paths(&self) -> Vec<String> {
        match &self.source {
            Source::Memory(_) => vec![MEMORY_LOCATION.to_string()],
            Source::Directories(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
        }
    }
}

/// PackageRepository 产生的 Context
#[derive(Debug)]
pub struct RepositoryContext {
    requested: Vec<PackageRequest>,
    resolved: Vec<Package>,
    failure: Option<String>,
    timestamp: i64,
    package_paths: Vec<String>,
}

fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex"))
}

fn expand(package: &Package, value: &str, environ: &Environ) -> Result<String, GatewayError> {
    let mut out = String::with_capacity(value.len());
    let mut last = 0;
    for caps in variable_re().captures_iter(value) {
        let whole = caps.get(0).expect("group 0 always present");
        let name = &caps[1];
        let substituted = environ.get(name).ok_or_else(|| GatewayError::UndefinedVariable {
            package: package.qualified_name(),
            variable: name.to_string(),
        })?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(substituted);
        last = whole.end();
    }
    out.push_str(&value[last..]);
    Ok(out)
}

impl RepositoryContext {
    fn ensure_success(&self, operation: &str) -> Result<(), GatewayError> {
        if self.failure.is_some() {
            return Err(GatewayError::ResolvedContext(operation.to_string()));
        }
        Ok(())
    }

    fn requested_line(&self) -> String {
        self.requested
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ResolvedContext for RepositoryContext {
    fn success(&self) -> bool {
        self.failure.is_none()
    }

    fn resolved_packages(&self) -> &[Package] {
        &self.resolved
    }

    fn requested_packages(&self) -> &[PackageRequest] {
        &self.requested
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn failure_description(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    fn get_environ(&self, parent: &Environ) -> Result<Environ, GatewayError> {
        self.ensure_success("get_environ")?;
        let mut environ = parent.clone();
        environ.insert("REZ_USED_REQUEST".to_string(), self.requested_line());
        for package in &self.resolved {
            let key = format!("REZ_{}_VERSION", package.name.to_uppercase());
            environ.insert(key, package.version.to_string());
            for (name, value) in &package.environ {
                let value = expand(package, value, &environ)?;
                environ.insert(name.clone(), value);
            }
        }
        Ok(environ)
    }

    fn shell_code(&self, parent: &Environ) -> Result<String, GatewayError> {
        let environ = self.get_environ(parent)?;
        Ok(environ
            .iter()
            .filter(|(k, v)| parent.get(*k) != Some(*v))
            .map(|(k, v)| format!("export {}=\"{}\"", k, v.replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "success": self.success(),
            "timestamp": self.timestamp,
            "requested_packages": self.requested.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            "resolved_packages": self.resolved.iter().map(|p| p.qualified_name()).collect::<Vec<_>>(),
            "failure_description": self.failure,
            "package_paths": self.package_paths,
        })
    }

    fn graph(&self) -> Result<String, GatewayError> {
        let mut lines = vec!["digraph resolve {".to_string()];
        if let Some(reason) = &self.failure {
            lines.push(format!("  label=\"{}\";", reason.replace('"', "'")));
            for request in &self.requested {
                lines.push(format!("  \"{request}\" [color=red];"));
            }
        }
        for package in &self.resolved {
            lines.push(format!("  \"{}\";", package.qualified_name()));
            for dep in package.requires.iter().filter(|r| !r.is_weak()) {
                if let Some(target) = self.resolved.iter().find(|p| p.name == dep.name) {
                    lines.push(format!(
                        "  \"{}\" -> \"{}\";",
                        package.qualified_name(),
                        target.qualified_name()
                    ));
                }
            }
        }
        lines.push("}".to_string());
        Ok(lines.join("\n"))
    }

    fn execute_shell(
        &self,
        command: &str,
        parent: &Environ,
    ) -> Result<tokio::process::Command, GatewayError> {
        let environ = self.get_environ(parent)?;
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = tokio::process::Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.env_clear().envs(environ);
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_package(root: &Path, name: &str, version: &str, body: &str) {
        let dir = root.join(name).join(version);
        std::fs::create_dir_all(&dir).unwrap();
        let doc = format!("name = \"{name}\"\nversion = \"{version}\"\n{body}");
        std::fs::write(dir.join(DEFINITION_FILE), doc).unwrap();
    }

    #[test]
    fn test_directory_repository_rescans_after_clear() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), "foo", "1.0.0", "");
        let repo = PackageRepository::from_paths(vec![dir.path().to_path_buf()]);

        assert_eq!(repo.find("foo", &VersionRange::Any, None).unwrap().len(), 1);

        write_package(dir.path(), "foo", "2.0.0", "");
        // 缓存未清空时看不到新包
        assert_eq!(repo.find("foo", &VersionRange::Any, None).unwrap().len(), 1);

        repo.clear_caches();
        assert_eq!(repo.find("foo", &VersionRange::Any, None).unwrap().len(), 2);
        assert_eq!(repo.cache_clears(), 1);
    }

    #[test]
    fn test_environ_layers_packages_over_parent() {
        let repo = PackageRepository::from_toml_str(
            r#"
            [[package]]
            name = "foo"
            version = "1"
            requires = ["app"]
            environ = { FOO = "BAR" }

            [[package]]
            name = "app"
            version = "2"
            environ = { APP_PATH = "${FOO}/app", FOO = "OVERRIDDEN" }
            "#,
        )
        .unwrap();
        let ctx = repo
            .resolve(&PackageRequest::parse_list("foo").unwrap(), None)
            .unwrap();
        assert!(ctx.success());

        let mut parent = Environ::new();
        parent.insert("FOO".into(), "parent".into());
        let env = ctx.get_environ(&parent).unwrap();
        assert_eq!(env["APP_PATH"], "BAR/app");
        assert_eq!(env["FOO"], "OVERRIDDEN");
        assert_eq!(env["REZ_APP_VERSION"], "2");
        assert_eq!(env["REZ_USED_REQUEST"], "foo");
    }

    #[test]
    fn test_undefined_variable_is_reported() {
        let repo = PackageRepository::from_packages(vec![
            Package::new("app", "1").with_environ("X", "${NOPE}")
        ]);
        let ctx = repo
            .resolve(&PackageRequest::parse_list("app").unwrap(), None)
            .unwrap();
        let err = ctx.get_environ(&Environ::new()).unwrap_err();
        assert!(matches!(err, GatewayError::UndefinedVariable { ref variable, .. } if variable == "NOPE"));
    }

    #[test]
    fn test_failed_context_refuses_environ() {
        let repo = PackageRepository::from_packages(vec![Package::new("app", "1")]);
        let ctx = repo
            .resolve(&PackageRequest::parse_list("app==2").unwrap(), None)
            .unwrap();
        assert!(!ctx.success());
        assert!(ctx.failure_description().is_some());
        assert!(matches!(
            ctx.get_environ(&Environ::new()),
            Err(GatewayError::ResolvedContext(_))
        ));
        assert!(ctx.graph().unwrap().contains("color=red"));
    }
}
