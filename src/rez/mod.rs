//! 解析引擎边界：包、请求、版本、过滤器、Context 与网关 trait，以及参考实现 PackageRepository

pub mod context;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod package;
pub mod repository;
pub mod request;
mod solver;
pub mod version;

pub use context::{Environ, ResolvedContext};
pub use error::GatewayError;
pub use filter::PackageFilter;
pub use gateway::ResolverGateway;
pub use package::Package;
pub use repository::{PackageRepository, RepositoryContext};
pub use request::{PackageRequest, RequestKind, VersionRange};
pub use version::Version;
