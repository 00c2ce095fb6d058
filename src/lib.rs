//! Allzpark - 基于 Rez 的应用启动器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话阶段机、Profile/应用发现、控制器与主循环
//! - **launch**: 在解析好的环境中启动进程并转发输出
//! - **observability**: 日志初始化
//! - **rez**: 解析引擎边界（包、请求、过滤器、Context、网关）与参考实现
//! - **store**: 持久化设置

pub mod config;
pub mod core;
pub mod launch;
pub mod observability;
pub mod rez;
pub mod store;

pub use crate::core::{Controller, ControlError, SessionPhase};
