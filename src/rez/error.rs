//! 解析引擎边界上的错误类型
//!
//! 与 Rez 的异常种类一一对应，控制器据此决定状态迁移（见 core::classify）。

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("package family not found: {name} (searched: {})", .searched.join("; "))]
    PackageFamilyNotFound { name: String, searched: Vec<String> },

    #[error("package not found: {request}")]
    PackageNotFound { request: String },

    #[error("resolve error: {0}")]
    Resolve(String),

    /// 对失败的 Context 做了只对成功 Context 有意义的操作
    #[error("cannot perform operation in a failed context: {0}")]
    ResolvedContext(String),

    #[error("undefined variable '{variable}' in commands of {package}")]
    UndefinedVariable { package: String, variable: String },

    #[error("command execution failed: {0}")]
    CommandExecution(String),

    #[error("invalid package request '{0}'")]
    RequestParse(String),

    #[error("invalid filter rule '{rule}': {reason}")]
    FilterParse { rule: String, reason: String },

    #[error("bad package definition {path}: {reason}")]
    Definition { path: String, reason: String },
}
