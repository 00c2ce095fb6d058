//! 控制器错误类型
//!
//! 与 classify 配合：每个错误映射为一次阶段迁移和一条用户可见的消息。

use thiserror::Error;

use crate::rez::GatewayError;

#[derive(Error, Debug, Clone)]
pub enum ControlError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// 选中的 Profile 在包索引中不存在（Broken 占位）
    #[error("package not found: {name}")]
    ProfileMissing { name: String, searched: Vec<String> },

    #[error("profile {profile} could not be resolved: {description}")]
    ProfileNotResolved { profile: String, description: String },

    #[error("Tried resetting without a root, this is a bug")]
    NoRoot,

    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    #[error("unknown application: {0}")]
    UnknownApplication(String),

    #[error("no application selected")]
    NoCurrentApplication,

    #[error("cannot use a broken context for {request}: {reason}")]
    BrokenContext { request: String, reason: String },

    #[error("There should have been at least one tool name. This is a bug")]
    MissingTool,

    #[error("Plugin environment validation failed:\n{0}")]
    LaunchVetoed(String),

    #[error("background worker failed: {0}")]
    WorkerPanicked(String),

    #[error("failed to spawn command: {0}")]
    Spawn(String),

    /// 控制循环已退出
    #[error("controller has shut down")]
    Closed,
}

impl ControlError {
    /// 缺失包时的提示：包名与搜索路径
    pub fn not_found_message(package: &str, searched: &[String]) -> String {
        let mut message = format!(
            "Package '{package}' is required by this profile, but could not be found.\n\nI searched in these paths:"
        );
        for path in searched {
            message.push_str("\n  - ");
            message.push_str(path);
        }
        message
    }
}
