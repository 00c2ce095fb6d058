//! 可由宿主替换的应用钩子：应用列表、展示元数据、启动前环境校验

use crate::core::session::{AppMetadata, Application};
use crate::rez::{Environ, Package, PackageRequest};

pub trait ApplicationHooks: Send + Sync {
    /// Profile 暴露的应用请求，默认取弱引用依赖
    fn applications_from_package(&self, profile: &Package) -> Vec<PackageRequest> {
        profile.weak_requires().map(PackageRequest::to_normal).collect()
    }

    /// 读取包的 `data` 中的 label / background / icon / hidden
    fn metadata_from_package(&self, package: &Package) -> AppMetadata {
        let text = |key: &str| {
            package
                .data
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        AppMetadata {
            label: text("label").unwrap_or_else(|| package.name.clone()),
            background: text("background"),
            icon: text("icon").unwrap_or_default(),
            hidden: package
                .data
                .get("hidden")
                .and_then(crate::store::truthy)
                .unwrap_or(false),
        }
    }

    /// 启动前校验；返回 Some(原因) 时拒绝启动
    fn validate_environment(&self, _app: &Application, _environ: &Environ) -> Option<String> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl ApplicationHooks for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_weak_requires_become_apps() {
        let profile = Package::new("foo", "1")
            .with_requires(&["~app_A", "base", "~app_B-2"])
            .unwrap();
        let apps: Vec<String> = DefaultHooks
            .applications_from_package(&profile)
            .iter()
            .map(|r| r.to_string())
            .collect();
        assert_eq!(apps, vec!["app_A", "app_B-2"]);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = DefaultHooks.metadata_from_package(&Package::new("maya", "2020"));
        assert_eq!(meta.label, "maya");
        assert_eq!(meta.icon, "");
        assert!(!meta.hidden);

        let meta = DefaultHooks.metadata_from_package(
            &Package::new("maya", "2020")
                .with_data("label", json!("Autodesk Maya"))
                .with_data("hidden", json!("true")),
        );
        assert_eq!(meta.label, "Autodesk Maya");
        assert!(meta.hidden);
    }
}
