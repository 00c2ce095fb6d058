//! 控制器主循环
//!
//! 建立 action/snapshot/event 三通道，在后台任务中驱动 Controller：
//! 前端发来的 Action、后台工作者的结果、定时轮询运行中的命令，三者在同一个 select! 中串行处理。

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::controller::{Controller, LaunchOptions};
use crate::core::events::ControllerEvent;
use crate::core::session::{ProfileVersion, SerialisationMode};
use crate::core::state::SessionPhase;
use crate::core::NameSource;
use crate::rez::Version;

/// 前端发往控制器的操作
#[derive(Debug, Clone)]
pub enum Action {
    Reset(Option<NameSource>),
    SelectProfile { name: String, version: Option<String> },
    SelectApplication(String),
    SelectTool(String),
    Patch(String),
    Launch(LaunchOptions),
    TestEnvironment,
    SetOverride { package: String, version: Option<String> },
    SetDisabled { package: String, disabled: bool },
    SetSerialisationMode(SerialisationMode),
    Continue,
    Quit,
}

/// 应用列表中的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppSummary {
    pub request: String,
    pub label: String,
    pub tools: Vec<String>,
    pub broken: bool,
}

/// 供前端渲染的只读快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub profile: Option<String>,
    pub profile_version: Option<String>,
    pub profiles: Vec<String>,
    pub application: Option<String>,
    pub tool: Option<String>,
    pub apps: Vec<AppSummary>,
    pub command: String,
    pub patch: String,
    pub error: Option<String>,
    pub running_commands: usize,
}

impl SessionSnapshot {
    pub fn capture(controller: &Controller) -> Self {
        let state = controller.state();
        Self {
            phase: controller.phase(),
            profile: state.profile_name.clone(),
            profile_version: state.profile_version.as_ref().map(|v| v.to_string()),
            profiles: state.profiles.iter().map(|f| f.name.clone()).collect(),
            application: state.app_request.clone(),
            tool: state.tool.clone(),
            apps: state
                .apps
                .iter()
                .map(|a| AppSummary {
                    request: a.request.clone(),
                    label: a.metadata.label.clone(),
                    tools: a.tools.clone(),
                    broken: a.is_broken(),
                })
                .collect(),
            command: state.full_command.clone(),
            patch: controller.patch_string(),
            error: state.error.clone(),
            running_commands: state.commands.iter().filter(|c| c.is_running()).count(),
        }
    }
}

pub struct ControllerHandle {
    pub actions: mpsc::UnboundedSender<Action>,
    pub snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<ControllerEvent>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn send(&self, action: Action) -> bool {
        self.actions.send(action).is_ok()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// 等待主循环退出
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "controller loop panicked");
        }
    }
}

/// 在后台任务中运行控制器，返回句柄
pub fn spawn_controller(mut controller: Controller, poll_interval: Duration) -> ControllerHandle {
    let (actions_tx, mut actions_rx) = mpsc::unbounded_channel::<Action>();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::capture(&controller));
    let events = controller.event_sender();
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                action = actions_rx.recv() => {
                    match action {
                        Some(Action::Quit) | None => break,
                        Some(action) => apply(&mut controller, action),
                    }
                }
                Some(message) = controller.next_message() => {
                    controller.handle_message(message);
                }
                _ = ticker.tick() => {
                    controller.poll_commands();
                }
            }
            let _ = snapshot_tx.send(SessionSnapshot::capture(&controller));
        }
        tracing::info!("controller loop stopped");
    });

    ControllerHandle {
        actions: actions_tx,
        snapshot: snapshot_rx,
        events,
        cancel,
        join,
    }
}

fn apply(controller: &mut Controller, action: Action) {
    let result = match action {
        Action::Reset(root) => controller.reset(root),
        Action::SelectProfile { name, version } => {
            controller.select_profile(&name, ProfileVersion::from(version.as_deref()))
        }
        Action::SelectApplication(request) => controller.select_application(&request),
        Action::SelectTool(tool) => controller.select_tool(&tool),
        Action::Patch(requirement) => controller.patch(&requirement),
        Action::Launch(options) => controller.launch(options).map(|_| ()),
        Action::TestEnvironment => controller.test_environment().map(|_| ()),
        Action::SetOverride { package, version } => {
            controller.set_package_override(&package, version.map(Version::from));
            Ok(())
        }
        Action::SetDisabled { package, disabled } => {
            controller.set_package_disabled(&package, disabled);
            Ok(())
        }
        Action::SetSerialisationMode(mode) => {
            controller.set_serialisation_mode(mode);
            Ok(())
        }
        Action::Continue => {
            controller.continue_session();
            Ok(())
        }
        Action::Quit => Ok(()),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "action failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::AppConfig;
    use crate::rez::{Package, PackageRepository};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_loop_reaches_ready_and_quits() {
        let repo = PackageRepository::from_packages(vec![
            Package::new("alita", "1.0").with_requires(&["~maya"]).unwrap(),
            Package::new("maya", "2020"),
        ]);
        let controller = Controller::new(
            &AppConfig::default(),
            Arc::new(repo),
            Arc::new(MemoryStore::new()),
        );
        let mut handle = spawn_controller(controller, Duration::from_millis(50));

        assert!(handle.send(Action::Reset(Some(NameSource::from(&["alita"][..])))));
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let snapshot = handle.snapshot.borrow_and_update();
                    if snapshot.phase == SessionPhase::Ready && snapshot.tool.is_some() {
                        return snapshot.clone();
                    }
                }
                if handle.snapshot.changed().await.is_err() {
                    return SessionSnapshot::default();
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(reached.profile.as_deref(), Some("alita"));
        assert_eq!(reached.application.as_deref(), Some("maya==2020"));
        assert_eq!(reached.tool.as_deref(), Some("maya"));

        handle.send(Action::Quit);
        handle.join().await;
    }
}
