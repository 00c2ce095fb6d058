//! 控制台日志：每条消息同时写入 tracing、有界历史与事件广播

use std::collections::VecDeque;

use tokio::sync::broadcast;

use crate::core::events::{ControllerEvent, LogLevel, LogRecord};

pub const DEFAULT_HISTORY: usize = 2000;

#[derive(Debug)]
pub struct ConsoleLog {
    history: VecDeque<LogRecord>,
    capacity: usize,
    events: broadcast::Sender<ControllerEvent>,
}

impl ConsoleLog {
    pub fn new(events: broadcast::Sender<ControllerEvent>, capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
            events,
        }
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Debug, message.into());
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warning, message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    pub fn push(&mut self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "allzpark::console", "{message}"),
            LogLevel::Info => tracing::info!(target: "allzpark::console", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "allzpark::console", "{message}"),
            LogLevel::Error => tracing::error!(target: "allzpark::console", "{message}"),
        }

        let record = LogRecord {
            level,
            message,
            time: chrono::Utc::now(),
        };
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(ControllerEvent::Logged(record));
    }

    pub fn history(&self) -> impl Iterator<Item = &LogRecord> {
        self.history.iter()
    }

    /// 历史中是否有包含 `needle` 的消息
    pub fn contains(&self, needle: &str) -> bool {
        self.history.iter().any(|r| r.message.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded_and_broadcast() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut log = ConsoleLog::new(tx, 2);
        log.info("one");
        log.warning("two");
        log.error("three");

        let messages: Vec<&str> = log.history().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["two", "three"]);
        assert!(!log.contains("one"));

        match rx.try_recv().unwrap() {
            ControllerEvent::Logged(record) => {
                assert_eq!(record.message, "one");
                assert_eq!(record.level, LogLevel::Info);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_records_keep_level_and_time_order() {
        let (tx, _rx) = broadcast::channel(16);
        let mut log = ConsoleLog::new(tx, 8);
        log.debug("first");
        log.error("second");

        let records: Vec<&LogRecord> = log.history().collect();
        assert_eq!(records[0].level, LogLevel::Debug);
        assert_eq!(records[1].level, LogLevel::Error);
        assert!(records[0].time <= records[1].time);
        assert!(LogLevel::Error > LogLevel::Warning);
    }
}
