//! 已启动的应用进程
//!
//! 启动在后台任务中完成，控制器不等待；stdout / stderr 各由一个任务逐行读取并通过事件回调送出。
//! 是否仍在运行由 stdout 读取循环是否存活决定，而不是轮询进程句柄（shell 包装可能让句柄提前退出）。
//! 存在版本覆盖或禁用包时，启动前临时重新解析一次，不修改缓存的 Context。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::rez::{Environ, PackageRequest, ResolvedContext, ResolverGateway, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    Stdout { id: Uuid, line: String },
    Stderr { id: Uuid, line: String },
    /// 启动失败（临时解析失败、spawn 失败）
    Error { id: Uuid, message: String },
    /// stdout 关闭，进程视为结束
    Killed { id: Uuid },
}

impl CommandEvent {
    pub fn id(&self) -> Uuid {
        match self {
            CommandEvent::Stdout { id, .. }
            | CommandEvent::Stderr { id, .. }
            | CommandEvent::Error { id, .. }
            | CommandEvent::Killed { id } => *id,
        }
    }
}

pub type EventSink = Arc<dyn Fn(CommandEvent) + Send + Sync>;

/// 启动一个命令所需的全部输入
pub struct LaunchSpec {
    pub app_request: String,
    pub command: String,
    pub context: Arc<dyn ResolvedContext>,
    pub parent_environ: Environ,
    pub overrides: HashMap<String, Version>,
    pub disabled: HashSet<String>,
    pub detached: bool,
}

pub struct LaunchedCommand {
    id: Uuid,
    app_request: String,
    command: String,
    detached: bool,
    started: DateTime<Utc>,
    running: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    kill: CancellationToken,
}

impl fmt::Debug for LaunchedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedCommand")
            .field("id", &self.id)
            .field("app_request", &self.app_request)
            .field("command", &self.command)
            .field("running", &self.is_running())
            .finish()
    }
}

impl fmt::Display for LaunchedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command('{}')", self.command)
    }
}

/// 临时解析的请求：锁定已解析版本，替换覆盖版本，去掉禁用的包
pub fn adhoc_requests(
    context: &dyn ResolvedContext,
    overrides: &HashMap<String, Version>,
    disabled: &HashSet<String>,
) -> Vec<PackageRequest> {
    context
        .resolved_packages()
        .iter()
        .filter(|p| !disabled.contains(&p.name))
        .map(|p| {
            let version = overrides.get(&p.name).unwrap_or(&p.version);
            PackageRequest::exact(p.name.clone(), version)
        })
        .collect()
}

impl LaunchedCommand {
    /// 立即在后台开始执行，返回句柄；失败通过 `CommandEvent::Error` 报告
    pub fn execute(
        spec: LaunchSpec,
        gateway: Arc<dyn ResolverGateway>,
        sink: EventSink,
    ) -> Arc<Self> {
        let command = Arc::new(Self {
            id: Uuid::new_v4(),
            app_request: spec.app_request.clone(),
            command: spec.command.clone(),
            detached: spec.detached,
            started: Utc::now(),
            running: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
            kill: CancellationToken::new(),
        });

        let id = command.id;
        let running = Arc::clone(&command.running);
        let finished = Arc::clone(&command.finished);
        let kill = command.kill.clone();
        tokio::spawn(async move {
            let flags = (running, Arc::clone(&finished));
            if let Err(message) = run(id, spec, gateway, flags, kill, sink.clone()).await {
                tracing::warn!(%id, error = %message, "command failed to start");
                finished.store(true, Ordering::SeqCst);
                sink(CommandEvent::Error { id, message });
            }
        });
        command
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn app_request(&self) -> &str {
        &self.app_request
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn detached(&self) -> bool {
        self.detached
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 输出已关闭或启动失败
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// 终止进程；已结束时无效果
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

async fn run(
    id: Uuid,
    spec: LaunchSpec,
    gateway: Arc<dyn ResolverGateway>,
    (running, finished): (Arc<AtomicBool>, Arc<AtomicBool>),
    kill: CancellationToken,
    sink: EventSink,
) -> Result<(), String> {
    let context = if spec.overrides.is_empty() && spec.disabled.is_empty() {
        spec.context
    } else {
        let requests = adhoc_requests(spec.context.as_ref(), &spec.overrides, &spec.disabled);
        tracing::debug!(%id, packages = requests.len(), "re-resolving with overrides");
        let context = tokio::task::spawn_blocking(move || gateway.resolve(&requests, None))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        if !context.success() {
            return Err(context
                .failure_description()
                .unwrap_or("resolve failed")
                .to_string());
        }
        context
    };

    let mut cmd = context
        .execute_shell(&spec.command, &spec.parent_environ)
        .map_err(|e| e.to_string())?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| e.to_string())?;
    tracing::info!(%id, command = %spec.command, pid = ?child.id(), "command started");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    running.store(true, Ordering::SeqCst);

    if let Some(stdout) = stdout {
        let sink = sink.clone();
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            drain(stdout, |line| sink(CommandEvent::Stdout { id, line })).await;
            running.store(false, Ordering::SeqCst);
            finished.store(true, Ordering::SeqCst);
            sink(CommandEvent::Killed { id });
        });
    } else {
        running.store(false, Ordering::SeqCst);
        finished.store(true, Ordering::SeqCst);
        sink(CommandEvent::Killed { id });
    }
    if let Some(stderr) = stderr {
        let sink = sink.clone();
        tokio::spawn(async move {
            drain(stderr, |line| sink(CommandEvent::Stderr { id, line })).await;
        });
    }

    tokio::spawn(async move {
        tokio::select! {
            _ = kill.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(%id, error = %e, "failed to kill command");
                }
            }
            status = child.wait() => {
                tracing::debug!(%id, ?status, "command exited");
            }
        }
    });
    Ok(())
}

/// 逐行读取直到 EOF；非 UTF-8 字节按替换字符处理
async fn drain<R, F>(reader: R, mut emit: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                emit(line.trim_end_matches(['\r', '\n']).to_string());
            }
            Err(e) => {
                tracing::debug!(error = %e, "stream closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rez::{Package, PackageRepository};

    #[test]
    fn test_adhoc_requests_pin_override_and_drop() {
        let repo = PackageRepository::from_packages(vec![
            Package::new("foo", "1").with_requires(&["python"]).unwrap(),
            Package::new("python", "3.7"),
            Package::new("python", "3.9"),
        ]);
        let ctx = repo
            .resolve(&PackageRequest::parse_list("foo python-3.7").unwrap(), None)
            .unwrap();

        let overrides = HashMap::from([("python".to_string(), Version::from("3.9"))]);
        let requests = adhoc_requests(ctx.as_ref(), &overrides, &HashSet::new());
        let rendered: Vec<String> = requests.iter().map(|r| r.to_string()).collect();
        assert_eq!(rendered, vec!["foo==1", "python==3.9"]);

        let disabled = HashSet::from(["python".to_string()]);
        let requests = adhoc_requests(ctx.as_ref(), &HashMap::new(), &disabled);
        assert_eq!(requests.len(), 1);
    }
}
