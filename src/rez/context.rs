//! 已解析的运行环境（Context）抽象
//!
//! 一次解析的结果：成功时有解析出的包列表、时间戳与可查询的环境变量；失败时带 failure_description。
//! 所有网关实现返回 `Arc<dyn ResolvedContext>`，控制器缓存并在多个线程间共享。

use std::collections::BTreeMap;
use std::fmt;

use crate::rez::{GatewayError, Package, PackageRequest};

/// 环境变量表（有序，便于展示与比较）
pub type Environ = BTreeMap<String, String>;

pub trait ResolvedContext: Send + Sync + fmt::Debug {
    fn success(&self) -> bool;

    /// 解析出的包，按解析顺序；失败时为空
    fn resolved_packages(&self) -> &[Package];

    /// 原始请求
    fn requested_packages(&self) -> &[PackageRequest];

    /// 解析时间（Unix 秒），用于跨机器、跨时间复现同一解析
    fn timestamp(&self) -> i64;

    fn failure_description(&self) -> Option<&str>;

    /// 在 `parent` 之上叠加所有包的环境命令；包优先于父环境
    fn get_environ(&self, parent: &Environ) -> Result<Environ, GatewayError>;

    /// 可粘贴到 shell 的激活脚本
    fn shell_code(&self, parent: &Environ) -> Result<String, GatewayError>;

    /// 结构化描述，供 Context 视图展示
    fn to_dict(&self) -> serde_json::Value;

    /// 依赖图（DOT 格式）
    fn graph(&self) -> Result<String, GatewayError>;

    /// 准备一个在该环境中执行 `command` 的 shell 进程（尚未启动）
    fn execute_shell(
        &self,
        command: &str,
        parent: &Environ,
    ) -> Result<tokio::process::Command, GatewayError>;

    /// 在原始请求上叠加补丁
    fn patched_request(&self, patch: &[PackageRequest]) -> Vec<PackageRequest> {
        PackageRequest::patch(self.requested_packages(), patch)
    }
}
