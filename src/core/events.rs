//! 控制器对外广播的事件

use chrono::{DateTime, Utc};

use crate::core::state::SessionPhase;
use crate::launch::CommandEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// 每次迁移都会发出，包括迁移到相同阶段
    StateChanged {
        from: SessionPhase,
        to: SessionPhase,
    },
    Logged(LogRecord),
    /// reset 完成，Profile 列表已替换
    Resetted,
    ProfileChanged {
        name: String,
        version: String,
        /// 重新加载同一个 Profile
        refreshed: bool,
    },
    ApplicationChanged {
        request: String,
    },
    CommandChanged(String),
    PatchChanged(String),
    Command(CommandEvent),
    RunningCommands(usize),
}
