//! 编排控制器
//!
//! 拥有 SessionState 与状态机，是唯一修改它们的地方。耗时的网关调用（发现 Profile、解析应用、
//! 计算环境）放到 spawn_blocking 中执行，结果作为 Message 投递到控制器自己的信箱，
//! 由 `handle_message` 在控制循环中逐个应用，回调之间不会并发。
//!
//! reset / select_profile / select_application 各带一个 epoch，过期的后台结果直接丢弃。

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::classify::classify;
use crate::core::command_line::{CommandInputs, LaunchCommand};
use crate::core::console::{ConsoleLog, DEFAULT_HISTORY};
use crate::core::discovery::{discover_profiles, AppListing, ListAppsJob, ListOptions, Notes, ProfileDiscovery};
use crate::core::error::ControlError;
use crate::core::events::ControllerEvent;
use crate::core::hooks::{ApplicationHooks, DefaultHooks};
use crate::core::session::{AppContext, Profile, ProfileVersion, SerialisationMode, SessionState};
use crate::core::state::{PhaseEvent, SessionPhase, StateMachine};
use crate::core::NameSource;
use crate::launch::{CommandEvent, EventSink, LaunchSpec, LaunchedCommand};
use crate::rez::{
    Environ, GatewayError, PackageFilter, PackageRequest, RequestKind, ResolverGateway, Version,
    VersionRange,
};
use crate::store::PersistentStore;

/// 持久化设置的键
pub mod prefs {
    pub const STARTUP_PROFILE: &str = "startupProfile";
    pub const STARTUP_APPLICATION: &str = "startupApplication";
    pub const SHOW_ALL_APPS: &str = "showAllApps";
    pub const SHOW_HIDDEN_APPS: &str = "showHiddenApps";
    pub const SHOW_ALL_VERSIONS: &str = "showAllVersions";
    pub const PATCH_WITH_FILTER: &str = "patchWithFilter";
    pub const EXCLUSION_FILTER: &str = "exclusionFilter";
    pub const USE_DEVELOPMENT_PACKAGES: &str = "useDevelopmentPackages";
    pub const SERIALISATION_MODE: &str = "serialisationMode";
    pub const PATCH: &str = "patch";
    pub const USER_ENV: &str = "userEnv";

    pub fn last_used(request: &str) -> String {
        format!("app/{request}/lastUsed")
    }
}

const NO_APPS_MESSAGE: &str = "The profile was found, but no applications.\n\n\
The profile didn't specify an application for you to use. This is likely due to a \
misconfigured profile. Don't forget to provide one or more packages as weak references.";

/// 让 allzpark 可执行文件把自身环境以一行 JSON 打印出来的参数
pub const DUMP_ENVIRON_FLAG: &str = "--dump-environ";

/// 投递到控制器信箱的消息
pub(crate) enum Message {
    ProfilesDiscovered {
        epoch: u64,
        root: NameSource,
        result: Result<ProfileDiscovery, ControlError>,
    },
    AppsListed {
        epoch: u64,
        profile: String,
        result: Result<AppListing, ControlError>,
    },
    EnvironResolved {
        epoch: u64,
        request: String,
        result: Result<Environ, ControlError>,
    },
    LaunchSettled,
    Command(CommandEvent),
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// 替代当前工具的命令
    pub command: Option<String>,
    pub detached: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Graph {
    pub dot: String,
    /// GraphViz 可用时渲染的 PNG 数据
    pub image: Option<Vec<u8>>,
}

/// Packages 视图中的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageRow {
    pub name: String,
    pub version: String,
    pub versions: Vec<String>,
    #[serde(rename = "override")]
    pub override_version: Option<String>,
    pub disabled: bool,
}

struct Settings {
    exclude: String,
    applications: Option<NameSource>,
    launching_delay: Duration,
    environ_dump: Option<String>,
}

pub struct Controller {
    gateway: Arc<dyn ResolverGateway>,
    store: Arc<dyn PersistentStore>,
    hooks: Arc<dyn ApplicationHooks>,
    settings: Settings,

    state: SessionState,
    machine: StateMachine,
    console: ConsoleLog,
    events: broadcast::Sender<ControllerEvent>,

    mailbox_tx: mpsc::UnboundedSender<Message>,
    mailbox_rx: mpsc::UnboundedReceiver<Message>,
    pending: usize,
    reset_epoch: u64,
    apps_epoch: u64,
    env_epoch: u64,

    /// test_environment 启动的命令：id -> (应用请求, 子进程报告的环境)
    diagnostics: HashMap<Uuid, (String, Option<Environ>)>,
    running_count: usize,
}

impl Controller {
    pub fn new(
        config: &AppConfig,
        gateway: Arc<dyn ResolverGateway>,
        store: Arc<dyn PersistentStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let mut console = ConsoleLog::new(events.clone(), DEFAULT_HISTORY);
        let machine = StateMachine::new();
        if let Some(message) = machine.phase().entry_message() {
            console.debug(message);
        }

        let state = SessionState {
            profile_name: store
                .retrieve_string(prefs::STARTUP_PROFILE)
                .or_else(|| config.app.startup_profile.clone()),
            app_request: store
                .retrieve_string(prefs::STARTUP_APPLICATION)
                .or_else(|| config.app.startup_application.clone()),
            serialisation_mode: store
                .retrieve_string(prefs::SERIALISATION_MODE)
                .and_then(|m| SerialisationMode::parse(&m))
                .unwrap_or_default(),
            parent_environ: config
                .launch
                .parent_environ
                .clone()
                .unwrap_or_else(|| std::env::vars().collect()),
            root: config.profiles.source(),
            ..SessionState::default()
        };

        Self {
            gateway,
            store,
            hooks: Arc::new(DefaultHooks),
            settings: Settings {
                exclude: config.filter.exclude.clone(),
                applications: config.applications.source(),
                launching_delay: config.launch.launching_delay(),
                environ_dump: config.launch.environ_dump.clone(),
            },
            state,
            machine,
            console,
            events,
            mailbox_tx,
            mailbox_rx,
            pending: 0,
            reset_epoch: 0,
            apps_epoch: 0,
            env_epoch: 0,
            diagnostics: HashMap::new(),
            running_count: 0,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ApplicationHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    // ---------- 只读访问 ----------

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<ControllerEvent> {
        self.events.clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.machine.phase()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn console(&self) -> &ConsoleLog {
        &self.console
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub fn current_profile(&self) -> Option<&str> {
        self.state.profile_name.as_deref()
    }

    pub fn current_application(&self) -> Option<&str> {
        self.state.app_request.as_deref()
    }

    pub fn current_tool(&self) -> Option<&str> {
        self.state.tool.as_deref()
    }

    pub fn current_error(&self) -> Option<&str> {
        self.state.error.as_deref()
    }

    pub fn full_command(&self) -> &str {
        &self.state.full_command
    }

    pub fn context(&self, request: &str) -> Option<&AppContext> {
        self.state.contexts.get(request)
    }

    /// 尚未完成的后台操作数
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// 当前补丁串
    pub fn patch_string(&self) -> String {
        self.store.retrieve_string(prefs::PATCH).unwrap_or_default()
    }

    /// Profile 的全部版本，最新在前
    pub fn profile_versions(&self, name: &str) -> Vec<String> {
        self.state
            .profile_family(name)
            .map(|f| f.version_names())
            .unwrap_or_default()
    }

    /// 父环境：配置（或当前进程）环境叠加用户设置 `userEnv`；包的环境优先于它
    pub fn parent_environ(&self) -> Environ {
        let mut environ = self.state.parent_environ.clone();
        if let Some(Value::Object(user)) = self.store.retrieve(prefs::USER_ENV) {
            for (key, value) in user {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                environ.insert(key, value);
            }
        }
        environ
    }

    // ---------- 内部工具 ----------

    fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    /// 触发迁移并执行进入副作用；返回迁移是否发生
    fn fire(&mut self, event: PhaseEvent) -> bool {
        let Some(transition) = self.machine.fire(event) else {
            tracing::debug!(?event, phase = %self.machine.phase(), "ignored phase event");
            return false;
        };
        if let Some(message) = transition.to.entry_message() {
            self.console.debug(message);
        }
        if transition.to == SessionPhase::Launching {
            let tx = self.mailbox_tx.clone();
            let delay = self.settings.launching_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Message::LaunchSettled);
            });
        }
        self.emit(ControllerEvent::StateChanged {
            from: transition.from,
            to: transition.to,
        });
        true
    }

    /// 分类错误、迁移阶段、记录消息，再把错误交还调用方
    fn report(&mut self, err: ControlError) -> ControlError {
        let paths = self.gateway.package_paths();
        let classification = classify(&err, &paths);
        self.state.error = Some(classification.message.clone());
        if classification.handled {
            self.console.warning(classification.message);
        } else {
            self.console.error(classification.message);
        }
        self.fire(classification.event);
        err
    }

    fn log_notes(&mut self, notes: Notes) {
        for (level, message) in notes {
            self.console.push(level, message);
        }
    }

    /// 在阻塞线程中运行 `work`，结果经 `wrap` 投递回信箱
    fn defer<T, W, M>(&mut self, work: W, wrap: M)
    where
        T: Send + 'static,
        W: FnOnce() -> Result<T, ControlError> + Send + 'static,
        M: FnOnce(Result<T, ControlError>) -> Message + Send + 'static,
    {
        self.pending += 1;
        let tx = self.mailbox_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(work).await {
                Ok(result) => result,
                Err(e) => Err(ControlError::WorkerPanicked(e.to_string())),
            };
            let _ = tx.send(wrap(result));
        });
    }

    fn package_filter(&self) -> Result<PackageFilter, ControlError> {
        let raw = self
            .store
            .retrieve(prefs::EXCLUSION_FILTER)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| self.settings.exclude.clone());
        Ok(PackageFilter::parse(&raw)?)
    }

    fn patch_requests(&mut self) -> Vec<PackageRequest> {
        let raw = self.patch_string();
        let mut requests = Vec::new();
        for token in raw.split_whitespace() {
            match token.parse() {
                Ok(request) => requests.push(request),
                Err(e) => self.console.warning(format!("Ignoring patch entry: {e}")),
            }
        }
        requests
    }

    fn list_options(&mut self) -> Result<ListOptions, ControlError> {
        Ok(ListOptions {
            filter: self.package_filter()?,
            patch: self.patch_requests(),
            patch_with_filter: self.store.retrieve_bool(prefs::PATCH_WITH_FILTER, false),
            show_all_apps: self.store.retrieve_bool(prefs::SHOW_ALL_APPS, false),
            show_hidden_apps: self.store.retrieve_bool(prefs::SHOW_HIDDEN_APPS, false),
            applications: self.settings.applications.clone(),
            current_app: self.state.app_request.clone(),
        })
    }

    fn update_command(&mut self, mode: Option<SerialisationMode>) {
        if let Some(mode) = mode {
            self.state.serialisation_mode = mode;
            self.store.store(prefs::SERIALISATION_MODE, json!(mode.as_str()));
        }

        let context = self
            .state
            .current_context()
            .and_then(AppContext::resolved)
            .cloned();
        let (Some(context), Some(tool)) = (context, self.state.tool.clone()) else {
            self.state.full_command.clear();
            self.emit(ControllerEvent::CommandChanged(String::new()));
            return;
        };

        let filter = self.package_filter().unwrap_or_default();
        let command = LaunchCommand::from_context(
            context.as_ref(),
            CommandInputs {
                mode: self.state.serialisation_mode,
                filter: &filter,
                no_local: !self.store.retrieve_bool(prefs::USE_DEVELOPMENT_PACKAGES, false),
                tool: &tool,
                overrides: &self.state.overrides,
                disabled: &self.state.disabled,
            },
        );
        self.state.full_command = command.to_string();
        self.emit(ControllerEvent::CommandChanged(self.state.full_command.clone()));
    }

    async fn compute_environ(
        &mut self,
        request: &str,
        context: &AppContext,
    ) -> Result<Environ, ControlError> {
        if let Some(environ) = self.state.environs.get(request) {
            return Ok(environ.clone());
        }
        let Some(resolved) = context.resolved().cloned() else {
            self.console.warning(format!(
                "Context for '{request}' is broken: {}",
                context.failure_description().unwrap_or("unknown failure")
            ));
            return Ok(Environ::new());
        };
        let parent = self.parent_environ();
        let environ = tokio::task::spawn_blocking(move || resolved.get_environ(&parent))
            .await
            .map_err(|e| ControlError::WorkerPanicked(e.to_string()))??;
        self.state
            .environs
            .insert(request.to_string(), environ.clone());
        Ok(environ)
    }

    // ---------- 公开操作 ----------

    /// 重新发现 Profile。`root` 为空时沿用上一次的来源。
    pub fn reset(&mut self, root: Option<NameSource>) -> Result<(), ControlError> {
        self.console.info("Resetting..");
        let Some(root) = root.or_else(|| self.state.root.clone()) else {
            return Err(self.report(ControlError::NoRoot));
        };
        let filter = match self.package_filter() {
            Ok(filter) => filter,
            Err(e) => return Err(self.report(e)),
        };

        self.fire(PhaseEvent::ToBooting);
        self.state.clear_application_caches();
        self.state.error = None;
        // 让网关重新读取磁盘，才能看到新发布的包
        self.gateway.clear_caches();
        self.fire(PhaseEvent::ToLoading);

        self.reset_epoch += 1;
        self.apps_epoch += 1;
        self.env_epoch += 1;
        let epoch = self.reset_epoch;
        let gateway = Arc::clone(&self.gateway);
        let listing = root.clone();
        self.defer(
            move || Ok(discover_profiles(gateway.as_ref(), &listing, &filter)),
            move |result| Message::ProfilesDiscovered {
                epoch,
                root,
                result,
            },
        );
        Ok(())
    }

    fn on_profiles_discovered(
        &mut self,
        epoch: u64,
        root: NameSource,
        result: Result<ProfileDiscovery, ControlError>,
    ) {
        if epoch != self.reset_epoch {
            tracing::debug!(epoch, current = self.reset_epoch, "discarding stale profile discovery");
            return;
        }
        let discovery = match result {
            Ok(discovery) => discovery,
            Err(e) => {
                self.report(e);
                return;
            }
        };
        self.log_notes(discovery.notes);
        self.state.profiles = discovery.families;

        let mut current = self.state.profile_name.clone();
        if let Some(name) = current.clone() {
            if self.state.profile_family(&name).is_none() {
                self.console
                    .warning(format!("Startup profile '{name}' did not exist"));
                current = None;
            }
        }
        let current = current.or(discovery.default);

        self.state.profile_name = current.clone();
        self.state.root = Some(root);
        self.fire(PhaseEvent::ToReady);
        self.emit(ControllerEvent::Resetted);

        match current {
            None => {
                self.fire(PhaseEvent::ToNoProfiles);
            }
            Some(name) => {
                // 失败已由 report 处理
                let _ = self.select_profile(&name, ProfileVersion::Latest);
            }
        }
    }

    /// 切换 Profile：同步清空所有应用缓存，再在后台枚举应用
    pub fn select_profile(
        &mut self,
        name: &str,
        version: ProfileVersion,
    ) -> Result<(), ControlError> {
        self.state.clear_application_caches();
        self.apps_epoch += 1;
        self.env_epoch += 1;

        let found = self.state.profile(name, &version).cloned();
        let (name, profile) = match found {
            Some(profile) => (name.to_string(), profile),
            None => {
                let fallback = self.state.profile_name.clone().and_then(|current| {
                    self.state
                        .profile(&current, &ProfileVersion::Latest)
                        .cloned()
                        .map(|profile| (current, profile))
                });
                match fallback {
                    Some(fallback) => {
                        self.console.warning(format!("{name} was not found"));
                        fallback
                    }
                    None => {
                        return Err(self.report(ControlError::UnknownProfile(name.to_string())))
                    }
                }
            }
        };

        let refreshed = self.state.profile_name.as_deref() == Some(name.as_str());
        self.state.profile_name = Some(name.clone());
        self.state.profile_version = Some(profile.version());
        self.store.store(prefs::STARTUP_PROFILE, json!(name));
        self.emit(ControllerEvent::ProfileChanged {
            name: name.clone(),
            version: profile.version().to_string(),
            refreshed,
        });

        let package = match profile {
            Profile::Found(package) => package,
            Profile::Broken { .. } => {
                let searched = self.gateway.package_paths();
                return Err(self.report(ControlError::ProfileMissing { name, searched }));
            }
        };

        let options = match self.list_options() {
            Ok(options) => options,
            Err(e) => return Err(self.report(e)),
        };
        self.fire(PhaseEvent::ToLoading);

        let epoch = self.apps_epoch;
        let job = ListAppsJob {
            gateway: Arc::clone(&self.gateway),
            hooks: Arc::clone(&self.hooks),
            profile: package,
            options,
        };
        self.defer(move || job.run(), move |result| Message::AppsListed {
            epoch,
            profile: name,
            result,
        });
        Ok(())
    }

    fn on_apps_listed(
        &mut self,
        epoch: u64,
        profile: String,
        result: Result<AppListing, ControlError>,
    ) {
        if epoch != self.apps_epoch {
            tracing::debug!(epoch, current = self.apps_epoch, %profile, "discarding stale application listing");
            return;
        }
        let listing = match result {
            Ok(listing) => listing,
            Err(e) => {
                self.report(e);
                return;
            }
        };
        self.log_notes(listing.notes);

        if let Some(request) = listing.startup_application {
            self.store.store(prefs::STARTUP_APPLICATION, json!(request));
            self.state.app_request = Some(request);
        }
        self.state.contexts = listing.contexts.into_iter().collect();

        if listing.apps.is_empty() {
            self.state.error = Some(NO_APPS_MESSAGE.to_string());
            self.console
                .warning(format!("No applications were found for {profile}"));
            self.fire(PhaseEvent::ToNoApps);
            return;
        }

        self.state.apps = listing.apps;
        self.fire(PhaseEvent::ToReady);

        let remembered = self
            .state
            .app_request
            .clone()
            .or_else(|| self.store.retrieve_string(prefs::STARTUP_APPLICATION));
        let initial = remembered
            .filter(|request| self.state.application(request).is_some())
            .or_else(|| self.state.apps.first().map(|a| a.request.clone()));
        if let Some(request) = initial {
            let _ = self.select_application(&request);
        }
    }

    /// 切换当前应用：进入 resolving，环境未缓存时在后台计算，
    /// 完成后选第一个工具并更新启动命令。连续切换时只有最后一次生效。
    pub fn select_application(&mut self, request: &str) -> Result<(), ControlError> {
        let Some(context) = self.state.contexts.get(request).cloned() else {
            return Err(self.report(ControlError::UnknownApplication(request.to_string())));
        };
        self.state.app_request = Some(request.to_string());
        self.env_epoch += 1;
        self.fire(PhaseEvent::ToResolving);

        if self.state.environs.contains_key(request) {
            self.finish_application(request, &context);
            return Ok(());
        }
        let Some(resolved) = context.resolved().cloned() else {
            self.console.warning(format!(
                "Context for '{request}' is broken: {}",
                context.failure_description().unwrap_or("unknown failure")
            ));
            self.finish_application(request, &context);
            return Ok(());
        };

        let parent = self.parent_environ();
        let epoch = self.env_epoch;
        let key = request.to_string();
        self.defer(
            move || resolved.get_environ(&parent).map_err(ControlError::from),
            move |result| Message::EnvironResolved {
                epoch,
                request: key,
                result,
            },
        );
        Ok(())
    }

    fn on_environ_resolved(
        &mut self,
        epoch: u64,
        request: String,
        result: Result<Environ, ControlError>,
    ) {
        if epoch != self.env_epoch {
            tracing::debug!(epoch, current = self.env_epoch, %request, "discarding stale environment");
            return;
        }
        let Some(context) = self.state.contexts.get(&request).cloned() else {
            return;
        };
        match result {
            Ok(environ) => {
                self.state.environs.insert(request.clone(), environ);
                self.finish_application(&request, &context);
            }
            Err(e) => {
                self.state.tool = None;
                self.state.full_command.clear();
                self.emit(ControllerEvent::CommandChanged(String::new()));
                self.report(e);
            }
        }
    }

    fn finish_application(&mut self, request: &str, context: &AppContext) {
        let tools = match self.state.application(request) {
            Some(app) => app.tools.clone(),
            None => vec![request.split("==").next().unwrap_or(request).to_string()],
        };
        self.state.tool = tools.into_iter().next();
        self.update_command(None);

        self.store.store(prefs::STARTUP_APPLICATION, json!(request));
        self.emit(ControllerEvent::ApplicationChanged {
            request: request.to_string(),
        });
        if !context.success() {
            self.console.debug(format!("{request} did not resolve"));
        }
        self.fire(PhaseEvent::ToReady);
    }

    /// 应用的环境；首次访问时计算并缓存
    pub async fn environ(&mut self, request: &str) -> Result<Environ, ControlError> {
        let Some(context) = self.state.contexts.get(request).cloned() else {
            return Err(ControlError::UnknownApplication(request.to_string()));
        };
        self.compute_environ(request, &context).await
    }

    pub fn select_tool(&mut self, tool: &str) -> Result<(), ControlError> {
        if self.state.app_request.is_none() {
            return Err(ControlError::NoCurrentApplication);
        }
        self.state.tool = Some(tool.to_string());
        self.update_command(None);
        Ok(())
    }

    /// 在补丁串中替换同名条目（裸名称表示清除），然后完整 reset
    pub fn patch(&mut self, requirement: &str) -> Result<(), ControlError> {
        self.console.debug(format!("Patching {requirement}.."));
        let new: PackageRequest = match requirement.parse() {
            Ok(request) => request,
            Err(e) => return Err(self.report(ControlError::from(e))),
        };

        let mut entries = self.patch_requests();
        entries.retain(|r| r.name != new.name);
        if !new.range.is_any() || new.kind != RequestKind::Normal {
            entries.push(new);
        }
        let patch = entries
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        self.store.store(prefs::PATCH, json!(patch));
        self.emit(ControllerEvent::PatchChanged(patch));
        self.reset(None)
    }

    /// 启动当前应用（或 `options.command`）
    pub fn launch(&mut self, options: LaunchOptions) -> Result<Arc<LaunchedCommand>, ControlError> {
        let Some(request) = self.state.app_request.clone() else {
            return Err(ControlError::NoCurrentApplication);
        };
        self.fire(PhaseEvent::ToLoading);

        let context = match self.state.contexts.get(&request).cloned() {
            Some(entry) => match entry.resolved() {
                Some(context) => Arc::clone(context),
                None => {
                    let reason = entry
                        .failure_description()
                        .unwrap_or("unknown failure")
                        .to_string();
                    return Err(self.report(ControlError::BrokenContext { request, reason }));
                }
            },
            None => return Err(self.report(ControlError::UnknownApplication(request))),
        };

        let app = self.state.application(&request).cloned();
        let Some(tool) = options.command.clone().or_else(|| self.state.tool.clone()) else {
            return Err(self.report(ControlError::MissingTool));
        };
        let detached = options
            .detached
            .or(app.as_ref().map(|a| a.detached))
            .unwrap_or(false);

        let environ = self.parent_environ();
        if let Some(app) = &app {
            if let Some(reason) = self.hooks.validate_environment(app, &environ) {
                self.console
                    .error(format!("Plugin environment validation failed:\n{reason}"));
                self.fire(PhaseEvent::ToReady);
                return Err(ControlError::LaunchVetoed(reason));
            }
        }

        self.console.debug(format!(
            "Launching {tool}{}..",
            if detached { " (detached)" } else { "" }
        ));

        let tx = self.mailbox_tx.clone();
        let sink: EventSink = Arc::new(move |event| {
            let _ = tx.send(Message::Command(event));
        });
        let spec = LaunchSpec {
            app_request: request.clone(),
            command: tool,
            context,
            parent_environ: environ,
            overrides: self.state.overrides.clone(),
            disabled: self.state.disabled.clone(),
            detached,
        };
        let command = LaunchedCommand::execute(spec, Arc::clone(&self.gateway), sink);
        self.state.commands.push(Arc::clone(&command));

        self.store.store(
            &prefs::last_used(&request),
            json!(chrono::Utc::now().timestamp()),
        );
        self.fire(PhaseEvent::ToLaunching);
        Ok(command)
    }

    /// 在应用环境中运行一个以 JSON 打印自身环境的进程，结束后把结果存为该应用的实测环境
    ///
    /// 命令取 `[launch] environ_dump`，未配置时用当前可执行文件加 `--dump-environ`。
    pub fn test_environment(&mut self) -> Result<Arc<LaunchedCommand>, ControlError> {
        let Some(request) = self.state.app_request.clone() else {
            return Err(ControlError::NoCurrentApplication);
        };
        let dump = match self.environ_dump_command() {
            Ok(dump) => dump,
            Err(e) => return Err(self.report(e)),
        };
        let command = self.launch(LaunchOptions {
            command: Some(dump),
            detached: Some(false),
        })?;
        self.diagnostics.insert(command.id(), (request, None));
        Ok(command)
    }

    fn environ_dump_command(&self) -> Result<String, ControlError> {
        if let Some(command) = &self.settings.environ_dump {
            return Ok(command.clone());
        }
        let exe = std::env::current_exe()
            .map_err(|e| ControlError::Spawn(format!("cannot locate allzpark executable: {e}")))?;
        Ok(format!(
            "{} {DUMP_ENVIRON_FLAG}",
            shell_quote(&exe.to_string_lossy())
        ))
    }

    /// 当前应用的依赖图；GraphViz 不可用时只返回 DOT 文本
    pub async fn graph(&mut self) -> Result<Graph, ControlError> {
        let Some(request) = self.state.app_request.clone() else {
            return Err(ControlError::NoCurrentApplication);
        };
        let context = match self.state.contexts.get(&request).cloned() {
            Some(AppContext::Resolved(context)) => context,
            Some(AppContext::Broken { reason, .. }) => {
                self.console.error("Can not graph a broken context.");
                return Err(ControlError::BrokenContext { request, reason });
            }
            None => return Err(ControlError::UnknownApplication(request)),
        };

        let dot = match context.graph() {
            Ok(dot) => dot,
            Err(e) => return Err(self.report(e.into())),
        };
        let image = match render_graph(&dot).await {
            Ok(png) => Some(png),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.console.error("GraphViz not found");
                None
            }
            Err(e) => {
                self.console.error(format!("Could not render graph: {e}"));
                None
            }
        };
        Ok(Graph { dot, image })
    }

    /// 可粘贴到 shell 的激活脚本
    pub fn shell_code(&mut self) -> Result<String, ControlError> {
        let Some(request) = self.state.app_request.clone() else {
            return Err(ControlError::NoCurrentApplication);
        };
        let context = match self.state.contexts.get(&request).cloned() {
            Some(AppContext::Resolved(context)) => context,
            Some(AppContext::Broken { reason, .. }) => {
                return Err(ControlError::BrokenContext { request, reason })
            }
            None => return Err(ControlError::UnknownApplication(request)),
        };
        let parent = self.parent_environ();
        context
            .shell_code(&parent)
            .map_err(|e| self.report(e.into()))
    }

    /// Packages 视图：Profile 行锁定自身版本，应用行列出应用的可选版本，
    /// 其余行列出自身版本，开启 showAllVersions 时列出全部版本
    pub async fn resolved_packages(&mut self, request: &str) -> Result<Vec<PackageRow>, ControlError> {
        let Some(context) = self.state.contexts.get(request).cloned() else {
            return Err(ControlError::UnknownApplication(request.to_string()));
        };
        let all_versions = self.store.retrieve_bool(prefs::SHOW_ALL_VERSIONS, false);
        let profile_name = self.state.profile_name.clone().unwrap_or_default();
        let app_versions: HashMap<String, Vec<String>> = self
            .state
            .apps
            .iter()
            .map(|a| {
                let versions = a.versions.iter().map(|v| v.to_string()).collect();
                (a.name.clone(), versions)
            })
            .collect();
        let packages = context.resolved_packages().to_vec();

        let lookups: Vec<String> = if all_versions {
            packages
                .iter()
                .filter(|p| p.name != profile_name && !app_versions.contains_key(&p.name))
                .map(|p| p.name.clone())
                .collect()
        } else {
            Vec::new()
        };
        let filter = self.package_filter().unwrap_or_default();
        let gateway = Arc::clone(&self.gateway);
        let found = tokio::task::spawn_blocking(move || {
            let mut found: HashMap<String, Vec<String>> = HashMap::new();
            for name in lookups {
                let mut versions = gateway.find(&name, &VersionRange::Any, Some(&filter))?;
                versions.sort_by(|a, b| a.version.cmp(&b.version));
                found.insert(name, versions.iter().map(|p| p.version.to_string()).collect());
            }
            Ok::<_, GatewayError>(found)
        })
        .await
        .map_err(|e| ControlError::WorkerPanicked(e.to_string()))??;

        Ok(packages
            .into_iter()
            .map(|p| {
                let versions = if p.name == profile_name {
                    vec![p.version.to_string()]
                } else if let Some(versions) = app_versions.get(&p.name) {
                    versions.clone()
                } else {
                    found
                        .get(&p.name)
                        .cloned()
                        .unwrap_or_else(|| vec![p.version.to_string()])
                };
                PackageRow {
                    override_version: self.state.overrides.get(&p.name).map(|v| v.to_string()),
                    disabled: self.state.disabled.contains(&p.name),
                    version: p.version.to_string(),
                    versions,
                    name: p.name,
                }
            })
            .collect())
    }

    /// 覆盖某个包的版本（None 清除），只影响启动命令与启动时的临时解析
    pub fn set_package_override(&mut self, name: &str, version: Option<Version>) {
        match version {
            Some(version) => {
                self.state.overrides.insert(name.to_string(), version);
            }
            None => {
                self.state.overrides.remove(name);
            }
        }
        self.update_command(None);
    }

    pub fn set_package_disabled(&mut self, name: &str, disabled: bool) {
        if disabled {
            self.state.disabled.insert(name.to_string());
        } else {
            self.state.disabled.remove(name);
        }
        self.update_command(None);
    }

    pub fn set_serialisation_mode(&mut self, mode: SerialisationMode) {
        self.update_command(Some(mode));
    }

    /// 从失败页回到 ready
    pub fn continue_session(&mut self) -> bool {
        self.fire(PhaseEvent::Continue)
    }

    /// 清理已结束的命令，返回仍在运行的数量；数量变化时广播
    pub fn poll_commands(&mut self) -> usize {
        self.state.commands.retain(|c| !c.is_finished());
        let count = self.state.commands.iter().filter(|c| c.is_running()).count();
        if count != self.running_count {
            self.running_count = count;
            self.emit(ControllerEvent::RunningCommands(count));
        }
        count
    }

    // ---------- 消息处理 ----------

    pub(crate) async fn next_message(&mut self) -> Option<Message> {
        self.mailbox_rx.recv().await
    }

    pub(crate) fn handle_message(&mut self, message: Message) {
        match message {
            Message::ProfilesDiscovered {
                epoch,
                root,
                result,
            } => {
                self.pending = self.pending.saturating_sub(1);
                self.on_profiles_discovered(epoch, root, result);
            }
            Message::AppsListed {
                epoch,
                profile,
                result,
            } => {
                self.pending = self.pending.saturating_sub(1);
                self.on_apps_listed(epoch, profile, result);
            }
            Message::EnvironResolved {
                epoch,
                request,
                result,
            } => {
                self.pending = self.pending.saturating_sub(1);
                self.on_environ_resolved(epoch, request, result);
            }
            Message::LaunchSettled => {
                self.fire(PhaseEvent::Settle);
            }
            Message::Command(event) => self.on_command_event(event),
        }
    }

    fn on_command_event(&mut self, event: CommandEvent) {
        match &event {
            CommandEvent::Stdout { id, line } => match self.diagnostics.get_mut(id) {
                Some((_, reported)) => match serde_json::from_str::<Environ>(line) {
                    Ok(environ) => *reported = Some(environ),
                    Err(_) => self.console.info(line.clone()),
                },
                None => self.console.info(line.clone()),
            },
            CommandEvent::Stderr { line, .. } => self.console.error(line.clone()),
            CommandEvent::Error { id, message } => {
                self.diagnostics.remove(id);
                self.report(ControlError::Spawn(message.clone()));
            }
            CommandEvent::Killed { id } => match self.diagnostics.remove(id) {
                Some((request, Some(environ))) => {
                    self.console.debug(format!(
                        "Tested environment of {request} ({} variables)",
                        environ.len()
                    ));
                    self.state.tested_environs.insert(request, environ);
                }
                Some((request, None)) => self
                    .console
                    .warning(format!("No environment was reported for {request}")),
                None => self.console.debug(format!("Command {id} finished")),
            },
        }
        self.emit(ControllerEvent::Command(event));
    }

    /// 处理信箱直到所有后台操作完成
    pub async fn settle(&mut self) {
        while self.pending > 0 {
            match self.mailbox_rx.recv().await {
                Some(message) => self.handle_message(message),
                None => break,
            }
        }
    }

    /// 处理信箱直到 `done` 成立或超时；返回 `done` 最终是否成立
    pub async fn process_until<F>(&mut self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !done(self) {
            match tokio::time::timeout_at(deadline, self.mailbox_rx.recv()).await {
                Ok(Some(message)) => self.handle_message(message),
                Ok(None) | Err(_) => return done(self),
            }
        }
        true
    }
}

/// 用 GraphViz 把 DOT 渲染成 PNG，数据经 stdout 读回，不落盘
async fn render_graph(dot: &str) -> io::Result<Vec<u8>> {
    let mut child = tokio::process::Command::new("dot")
        .arg("-Tpng")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(dot.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(io::Error::new(io::ErrorKind::Other, stderr));
    }
    Ok(output.stdout)
}

/// 把路径包成一个 shell 参数
fn shell_quote(raw: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("\"{raw}\"")
    } else {
        format!("'{}'", raw.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(target_os = "windows"))]
    fn test_shell_quote_survives_spaces_and_quotes() {
        assert_eq!(shell_quote("/opt/my tools/allzpark"), "'/opt/my tools/allzpark'");
        assert_eq!(shell_quote("/it's/here"), "'/it'\\''s/here'");
    }
}
