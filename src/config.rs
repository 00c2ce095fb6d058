//! 应用配置：从 config/default.toml、用户配置文件与环境变量加载
//!
//! 加载顺序：先读默认 TOML 文件，再叠加 `--config-file` 指定的文件，最后用环境变量 `ALLZPARK__*` 覆盖
//! （双下划线表示嵌套，如 `ALLZPARK__FILTER__EXCLUDE=*.beta`）。所有字段都有默认值，缺省的键沿用默认。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::NameSource;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub profiles: ListingSection,
    pub applications: ListingSection,
    pub filter: FilterSection,
    pub launch: LaunchSection,
    pub store: StoreSection,
    pub repository: RepositorySection,
}

/// [app] 段：首次启动时的默认选择
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 启动时加载的 Profile，缺省为最后发现的那个
    pub startup_profile: Option<String>,
    /// 启动 Profile 中预选的应用
    pub startup_application: Option<String>,
}

/// [profiles] / [applications] 段：名称列表来源，显式列表优先于目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListingSection {
    #[serde(default)]
    pub names: Vec<String>,
    pub directory: Option<PathBuf>,
}

impl ListingSection {
    pub fn source(&self) -> Option<NameSource> {
        if !self.names.is_empty() {
            Some(NameSource::Explicit(self.names.clone()))
        } else {
            self.directory.clone().map(NameSource::Directory)
        }
    }
}

/// [filter] 段
#[derive(Debug, Clone, Deserialize)]
pub struct FilterSection {
    /// 排除规则，可被偏好 `exclusionFilter` 覆盖
    #[serde(default = "default_exclude")]
    pub exclude: String,
}

fn default_exclude() -> String {
    "*.beta".to_string()
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
        }
    }
}

/// [launch] 段
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchSection {
    /// 进入 launching 后自动回到 ready 的延迟（毫秒）
    #[serde(default = "default_launching_delay_ms")]
    pub launching_delay_ms: u64,
    /// 运行中命令的轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 不继承当前进程环境，改用这里给出的父环境
    pub parent_environ: Option<std::collections::BTreeMap<String, String>>,
    /// 测试环境时运行的命令，须在 stdout 打印一行 JSON 对象；缺省为 `allzpark --dump-environ`
    pub environ_dump: Option<String>,
}

fn default_launching_delay_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for LaunchSection {
    fn default() -> Self {
        Self {
            launching_delay_ms: default_launching_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            parent_environ: None,
            environ_dump: None,
        }
    }
}

impl LaunchSection {
    pub fn launching_delay(&self) -> Duration {
        Duration::from_millis(self.launching_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// [store] 段：设置文件位置，未设置时只保存在内存
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StoreSection {
    pub path: Option<PathBuf>,
}

/// [repository] 段：包仓库目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RepositorySection {
    #[serde(default)]
    pub packages_path: Vec<PathBuf>,
}

/// 加载配置
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源（`no_defaults` 时跳过）
/// 2. 若传入 config_path，则追加该文件（可覆盖前面的键）；文件不存在视为错误
/// 3. 最后叠加环境变量 ALLZPARK__*
pub fn load_config(config_path: Option<&Path>, no_defaults: bool) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    if !no_defaults {
        for name in ["config/default", "../config/default"] {
            if Path::new(&format!("{name}.toml")).exists() {
                builder = builder.add_source(config::File::with_name(name).required(false));
                break;
            }
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ALLZPARK")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.filter.exclude, "*.beta");
        assert_eq!(cfg.launch.launching_delay(), Duration::from_millis(500));
        assert!(cfg.profiles.source().is_none());
        assert!(cfg.launch.environ_dump.is_none());
    }

    #[test]
    fn test_user_file_overrides_only_given_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("allzpark.toml");
        std::fs::write(
            &path,
            "[profiles]\nnames = [\"foo\", \"bar\"]\n\n[launch]\nlaunching_delay_ms = 50\nenviron_dump = \"printenv-json\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(&path), true).unwrap();
        assert_eq!(cfg.launch.launching_delay_ms, 50);
        assert_eq!(cfg.launch.poll_interval_ms, 500);
        assert_eq!(cfg.launch.environ_dump.as_deref(), Some("printenv-json"));
        assert_eq!(cfg.filter.exclude, "*.beta");
        match cfg.profiles.source() {
            Some(NameSource::Explicit(names)) => assert_eq!(names, vec!["foo", "bar"]),
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn test_missing_user_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_config(Some(&dir.path().join("nope.toml")), true).is_err());
    }
}
