//! 进程启动：在解析好的环境中运行应用并转发其输出

pub mod command;

pub use command::{adhoc_requests, CommandEvent, EventSink, LaunchSpec, LaunchedCommand};
