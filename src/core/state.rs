//! 会话阶段状态机
//!
//! 阶段（SessionPhase）与会话数据（SessionState）分离：状态机只负责 `(阶段, 事件) -> 阶段` 的迁移表，
//! 进入阶段时的副作用（日志、launching 的定时回落）由控制器在收到 Transition 后执行。

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Booting,
    Resolving,
    Loading,
    Errored,
    Launching,
    Ready,
    NoProfiles,
    NoApps,
    NotResolved,
    PkgNotFound,
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::Booting => "booting",
            SessionPhase::Resolving => "resolving",
            SessionPhase::Loading => "loading",
            SessionPhase::Errored => "errored",
            SessionPhase::Launching => "launching",
            SessionPhase::Ready => "ready",
            SessionPhase::NoProfiles => "noprofiles",
            SessionPhase::NoApps => "noapps",
            SessionPhase::NotResolved => "notresolved",
            SessionPhase::PkgNotFound => "pkgnotfound",
        }
    }

    /// 状态栏提示
    pub fn help(&self) -> &'static str {
        match self {
            SessionPhase::Booting => "Initialising..",
            SessionPhase::Resolving => "Resolving..",
            SessionPhase::Loading => "Loading..",
            SessionPhase::Errored => "Something has gone wrong",
            SessionPhase::Launching => "Launching..",
            SessionPhase::Ready => "Ready",
            SessionPhase::NoProfiles => "No profiles found",
            SessionPhase::NoApps => "No applications found",
            SessionPhase::NotResolved => "Profile could not be resolved",
            SessionPhase::PkgNotFound => "Package not found",
        }
    }

    /// 失败页：可通过 reset 或 Continue 恢复
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionPhase::Errored
                | SessionPhase::NoProfiles
                | SessionPhase::NoApps
                | SessionPhase::NotResolved
                | SessionPhase::PkgNotFound
        )
    }

    /// 进入阶段时写入控制台的消息
    pub fn entry_message(&self) -> Option<&'static str> {
        match self {
            SessionPhase::Booting => Some("Booting.."),
            SessionPhase::Resolving => Some("Resolving.."),
            SessionPhase::Loading => Some("Loading.."),
            SessionPhase::Launching => Some("Application is being launched.."),
            SessionPhase::Ready => Some("Ready"),
            _ => None,
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 触发迁移的事件；只有控制器会触发
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    ToBooting,
    ToResolving,
    ToLoading,
    ToErrored,
    ToLaunching,
    ToReady,
    ToNoProfiles,
    ToNoApps,
    ToNotResolved,
    ToPkgNotFound,
    /// launching 定时结束
    Settle,
    /// 用户在失败页选择继续
    Continue,
}

impl PhaseEvent {
    /// 迁移表；None 表示该事件在当前阶段无效
    pub fn target(self, from: SessionPhase) -> Option<SessionPhase> {
        use SessionPhase as P;
        match self {
            PhaseEvent::ToBooting => Some(P::Booting),
            PhaseEvent::ToResolving => Some(P::Resolving),
            PhaseEvent::ToLoading => Some(P::Loading),
            PhaseEvent::ToErrored => Some(P::Errored),
            PhaseEvent::ToLaunching => Some(P::Launching),
            PhaseEvent::ToReady => Some(P::Ready),
            PhaseEvent::ToNoProfiles => Some(P::NoProfiles),
            PhaseEvent::ToNoApps => Some(P::NoApps),
            PhaseEvent::ToNotResolved => Some(P::NotResolved),
            PhaseEvent::ToPkgNotFound => Some(P::PkgNotFound),
            PhaseEvent::Settle => (from == P::Launching).then_some(P::Ready),
            PhaseEvent::Continue => from.is_failure().then_some(P::Ready),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub event: PhaseEvent,
}

#[derive(Debug)]
pub struct StateMachine {
    phase: SessionPhase,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Booting,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// 触发事件；无效事件返回 None 且阶段不变。
    /// 迁移到相同阶段也算一次迁移（仍需通知与执行进入副作用）。
    pub fn fire(&mut self, event: PhaseEvent) -> Option<Transition> {
        let to = event.target(self.phase)?;
        let transition = Transition {
            from: self.phase,
            to,
            event,
        };
        self.phase = to;
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_booting() {
        assert_eq!(StateMachine::new().phase(), SessionPhase::Booting);
    }

    #[test]
    fn test_settle_only_from_launching() {
        let mut sm = StateMachine::new();
        assert!(sm.fire(PhaseEvent::Settle).is_none());
        assert_eq!(sm.phase(), SessionPhase::Booting);

        sm.fire(PhaseEvent::ToLaunching).unwrap();
        let t = sm.fire(PhaseEvent::Settle).unwrap();
        assert_eq!(t.from, SessionPhase::Launching);
        assert_eq!(t.to, SessionPhase::Ready);
    }

    #[test]
    fn test_continue_recovers_failures() {
        let mut sm = StateMachine::new();
        assert!(sm.fire(PhaseEvent::Continue).is_none());
        for event in [
            PhaseEvent::ToErrored,
            PhaseEvent::ToNoApps,
            PhaseEvent::ToNoProfiles,
            PhaseEvent::ToNotResolved,
            PhaseEvent::ToPkgNotFound,
        ] {
            sm.fire(event).unwrap();
            assert!(sm.phase().is_failure());
            assert_eq!(sm.fire(PhaseEvent::Continue).unwrap().to, SessionPhase::Ready);
        }
    }

    #[test]
    fn test_self_transition_is_reported() {
        let mut sm = StateMachine::new();
        sm.fire(PhaseEvent::ToReady).unwrap();
        let t = sm.fire(PhaseEvent::ToReady).unwrap();
        assert_eq!((t.from, t.to), (SessionPhase::Ready, SessionPhase::Ready));
    }

    #[test]
    fn test_names() {
        assert_eq!(SessionPhase::PkgNotFound.to_string(), "pkgnotfound");
        assert_eq!(
            serde_json::to_string(&SessionPhase::NoApps).unwrap(),
            "\"noapps\""
        );
    }
}
