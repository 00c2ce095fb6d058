//! 会话数据：Profile、应用、Context 缓存与当前选择
//!
//! SessionState 只由控制器修改；worker 计算纯结果交回控制循环后再写入。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::NameSource;
use crate::launch::LaunchedCommand;
use crate::rez::{Environ, Package, ResolvedContext, Version};

/// 缺失 Profile 的占位版本
pub const BROKEN_VERSION: &str = "0.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileVersion {
    Latest,
    Exact(Version),
}

impl From<Option<&str>> for ProfileVersion {
    fn from(raw: Option<&str>) -> Self {
        match raw {
            Some(v) if !v.is_empty() && v != "latest" => ProfileVersion::Exact(Version::from(v)),
            _ => ProfileVersion::Latest,
        }
    }
}

/// 一个 Profile 版本；包索引中找不到时为 Broken
#[derive(Debug, Clone, PartialEq)]
pub enum Profile {
    Found(Package),
    Broken { name: String },
}

impl Profile {
    pub fn name(&self) -> &str {
        match self {
            Profile::Found(p) => &p.name,
            Profile::Broken { name } => name,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            Profile::Found(p) => p.version.clone(),
            Profile::Broken { .. } => Version::from(BROKEN_VERSION),
        }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, Profile::Broken { .. })
    }

    pub fn package(&self) -> Option<&Package> {
        match self {
            Profile::Found(p) => Some(p),
            Profile::Broken { .. } => None,
        }
    }
}

/// 同名 Profile 的全部版本，按自然顺序升序；最后一个即 Latest
#[derive(Debug, Clone)]
pub struct ProfileFamily {
    pub name: String,
    versions: Vec<Profile>,
}

impl ProfileFamily {
    /// `packages` 为空时得到只含一个 Broken 占位的家族
    pub fn new(name: impl Into<String>, mut packages: Vec<Package>) -> Self {
        let name = name.into();
        packages.sort_by(|a, b| a.version.cmp(&b.version));
        let versions = if packages.is_empty() {
            vec![Profile::Broken { name: name.clone() }]
        } else {
            packages.into_iter().map(Profile::Found).collect()
        };
        Self { name, versions }
    }

    pub fn latest(&self) -> Option<&Profile> {
        self.versions.last()
    }

    pub fn get(&self, version: &ProfileVersion) -> Option<&Profile> {
        match version {
            ProfileVersion::Latest => self.latest(),
            ProfileVersion::Exact(v) => self.versions.iter().find(|p| &p.version() == v),
        }
    }

    pub fn is_broken(&self) -> bool {
        self.versions.iter().all(Profile::is_broken)
    }

    /// 版本名，最新在前
    pub fn version_names(&self) -> Vec<String> {
        self.versions
            .iter()
            .rev()
            .map(|p| p.version().to_string())
            .collect()
    }
}

/// 一个应用的解析结果
#[derive(Debug, Clone)]
pub enum AppContext {
    Resolved(Arc<dyn ResolvedContext>),
    Broken { request: String, reason: String },
}

impl AppContext {
    pub fn success(&self) -> bool {
        match self {
            AppContext::Resolved(ctx) => ctx.success(),
            AppContext::Broken { .. } => false,
        }
    }

    pub fn failure_description(&self) -> Option<&str> {
        match self {
            AppContext::Resolved(ctx) => ctx.failure_description(),
            AppContext::Broken { reason, .. } => Some(reason),
        }
    }

    /// 成功解析的 Context；失败的 Context 与 Broken 都返回 None
    pub fn resolved(&self) -> Option<&Arc<dyn ResolvedContext>> {
        match self {
            AppContext::Resolved(ctx) if ctx.success() => Some(ctx),
            _ => None,
        }
    }

    pub fn resolved_packages(&self) -> &[Package] {
        match self {
            AppContext::Resolved(ctx) => ctx.resolved_packages(),
            AppContext::Broken { .. } => &[],
        }
    }

    pub fn to_dict(&self) -> serde_json::Value {
        match self {
            AppContext::Resolved(ctx) => ctx.to_dict(),
            AppContext::Broken { request, reason } => serde_json::json!({
                "success": false,
                "requested_packages": request.split_whitespace().collect::<Vec<_>>(),
                "resolved_packages": [],
                "failure_description": reason,
            }),
        }
    }
}

/// 应用对应的包；被补丁移除或解析失败时为 Broken
#[derive(Debug, Clone, PartialEq)]
pub enum AppPackage {
    Found(Package),
    Broken { request: String },
}

impl AppPackage {
    pub fn package(&self) -> Option<&Package> {
        match self {
            AppPackage::Found(p) => Some(p),
            AppPackage::Broken { .. } => None,
        }
    }

    pub fn is_broken(&self) -> bool {
        matches!(self, AppPackage::Broken { .. })
    }
}

/// 展示用元数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppMetadata {
    pub label: String,
    pub background: Option<String>,
    pub icon: String,
    pub hidden: bool,
}

#[derive(Debug, Clone)]
pub struct Application {
    /// `name==version`；找不到包时为去掉 `~` 后的原始请求
    pub request: String,
    pub name: String,
    pub package: AppPackage,
    pub metadata: AppMetadata,
    pub tools: Vec<String>,
    pub detached: bool,
    /// 可选版本（升序）
    pub versions: Vec<Version>,
}

impl Application {
    pub fn is_broken(&self) -> bool {
        self.package.is_broken()
    }
}

/// 启动命令的复现方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialisationMode {
    /// 原始请求
    #[default]
    UsedRequest,
    /// 完整锁定的解析结果
    UsedResolve,
}

impl SerialisationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SerialisationMode::UsedRequest => "used_request",
            SerialisationMode::UsedResolve => "used_resolve",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "used_request" => Some(SerialisationMode::UsedRequest),
            "used_resolve" => Some(SerialisationMode::UsedResolve),
            _ => None,
        }
    }
}

impl fmt::Display for SerialisationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
pub struct SessionState {
    pub profile_name: Option<String>,
    pub profile_version: Option<Version>,
    pub app_request: Option<String>,
    pub tool: Option<String>,
    pub root: Option<NameSource>,
    pub error: Option<String>,

    /// 按发现顺序
    pub profiles: Vec<ProfileFamily>,
    pub contexts: HashMap<String, AppContext>,
    pub environs: HashMap<String, Environ>,
    pub tested_environs: HashMap<String, Environ>,
    /// 可见应用，按 Profile 声明顺序
    pub apps: Vec<Application>,

    pub parent_environ: Environ,
    pub commands: Vec<Arc<LaunchedCommand>>,
    pub full_command: String,
    pub serialisation_mode: SerialisationMode,

    pub overrides: HashMap<String, Version>,
    pub disabled: HashSet<String>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("profile_name", &self.profile_name)
            .field("app_request", &self.app_request)
            .field("tool", &self.tool)
            .field("profiles", &self.profiles.len())
            .field("contexts", &self.contexts.len())
            .field("apps", &self.apps.len())
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl SessionState {
    pub fn profile_family(&self, name: &str) -> Option<&ProfileFamily> {
        self.profiles.iter().find(|f| f.name == name)
    }

    pub fn profile(&self, name: &str, version: &ProfileVersion) -> Option<&Profile> {
        self.profile_family(name)?.get(version)
    }

    pub fn application(&self, request: &str) -> Option<&Application> {
        self.apps.iter().find(|a| a.request == request)
    }

    /// 当前应用已解析的 Context
    pub fn current_context(&self) -> Option<&AppContext> {
        self.contexts.get(self.app_request.as_deref()?)
    }

    /// 所有按应用缓存的数据；切换 Profile 时整体失效
    pub fn clear_application_caches(&mut self) {
        self.contexts.clear();
        self.environs.clear();
        self.tested_environs.clear();
        self.apps.clear();
        self.overrides.clear();
        self.disabled.clear();
        self.tool = None;
        self.full_command.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_orders_naturally() {
        let family = ProfileFamily::new(
            "foo",
            vec![
                Package::new("foo", "1.10"),
                Package::new("foo", "1.9"),
                Package::new("foo", "1.2"),
            ],
        );
        assert_eq!(family.latest().unwrap().version().as_str(), "1.10");
        assert_eq!(family.version_names(), vec!["1.10", "1.9", "1.2"]);
        assert!(family
            .get(&ProfileVersion::Exact(Version::from("1.9")))
            .is_some());
        assert!(family
            .get(&ProfileVersion::Exact(Version::from("3")))
            .is_none());
    }

    #[test]
    fn test_empty_family_is_broken() {
        let family = ProfileFamily::new("ghost", vec![]);
        assert!(family.is_broken());
        let latest = family.latest().unwrap();
        assert_eq!(latest.name(), "ghost");
        assert_eq!(latest.version().as_str(), BROKEN_VERSION);
        assert!(latest.package().is_none());
    }

    #[test]
    fn test_serialisation_mode_names() {
        assert_eq!(
            SerialisationMode::parse("used_resolve"),
            Some(SerialisationMode::UsedResolve)
        );
        assert_eq!(SerialisationMode::default().as_str(), "used_request");
        assert!(SerialisationMode::parse("nope").is_none());
    }

    #[test]
    fn test_broken_context_reports_reason() {
        let ctx = AppContext::Broken {
            request: "foo==1 app==2".into(),
            reason: "package not found: app==2".into(),
        };
        assert!(!ctx.success());
        assert!(ctx.resolved().is_none());
        assert_eq!(ctx.to_dict()["requested_packages"][1], "app==2");
    }
}
