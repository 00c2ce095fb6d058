//! 解析引擎网关
//!
//! 控制器对包索引与解析器的全部依赖都经由 ResolverGateway：查找包、解析环境、清缓存。
//! 调用可能很慢（磁盘 / 子进程），控制器只在后台 worker 中调用它。

use std::sync::Arc;

use crate::rez::{GatewayError, Package, PackageFilter, PackageRequest, ResolvedContext, VersionRange};

pub trait ResolverGateway: Send + Sync {
    /// 查找 `name` 在 `range` 内、未被 `filter` 排除的所有版本；家族不存在时返回空列表。
    /// 返回顺序不做保证，由调用方按自然顺序排序。
    fn find(
        &self,
        name: &str,
        range: &VersionRange,
        filter: Option<&PackageFilter>,
    ) -> Result<Vec<Package>, GatewayError>;

    /// 解析一组请求。求解冲突返回 `success() == false` 的 Context；
    /// 缺失的包家族等硬错误返回 Err。
    fn resolve(
        &self,
        requests: &[PackageRequest],
        filter: Option<&PackageFilter>,
    ) -> Result<Arc<dyn ResolvedContext>, GatewayError>;

    /// 丢弃内存中的包列表缓存，使下一次查找重新读取磁盘
    fn clear_caches(&self);

    /// 搜索路径，用于错误提示
    fn package_paths(&self) -> Vec<String>;
}
