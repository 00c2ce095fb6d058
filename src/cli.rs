//! 命令行参数与行式控制台前端

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use allzpark::config::{load_config, AppConfig};
use allzpark::core::{
    spawn_controller, Action, Controller, ControllerEvent, ControllerHandle, LaunchOptions,
    LogLevel, SerialisationMode,
};
use allzpark::rez::{Environ, PackageRepository, ResolverGateway};
use allzpark::store::{JsonFileStore, MemoryStore, PersistentStore};

const DEMO_PACKAGES: &str = include_str!("../config/demo_packages.toml");
const DEMO_PROFILES: [&str; 3] = ["alita", "lotus", "broken_project"];

#[derive(Debug, Parser, Clone)]
#[command(
    name = "allzpark",
    version,
    about = "Application launcher and environment manager built on Rez"
)]
pub struct Cli {
    /// Additional configuration file, layered over config/default.toml
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Do not read config/default.toml
    #[arg(long)]
    pub no_config: bool,

    /// Start from empty user settings
    #[arg(long, alias = "clear-settings")]
    pub clean: bool,

    /// Use the built-in demo repository and profiles
    #[arg(long)]
    pub demo: bool,

    /// (Deprecated) comma-separated list of profile names
    #[arg(long)]
    pub root: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print this process' environment as one JSON object and exit
    #[arg(long, hide = true)]
    pub dump_environ: bool,
}

/// 以一行 JSON 打印当前进程环境，供测试环境时在解析好的环境中运行
pub fn dump_environ() -> Result<()> {
    let environ: Environ = std::env::vars_os()
        .map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect();
    println!("{}", serde_json::to_string(&environ)?);
    Ok(())
}

pub async fn run(args: Cli) -> Result<()> {
    let mut config = load_config(args.config_file.as_deref(), args.no_config)
        .context("Failed to load configuration")?;

    if let Some(root) = &args.root {
        tracing::warn!("--root is deprecated, list profiles under [profiles] in the config file");
        config.profiles.names = root
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }

    let store = open_store(&config)?;
    if args.clean {
        store.clear();
        tracing::info!("User settings cleared");
    }

    let gateway = open_gateway(&mut config, args.demo)?;
    let controller = Controller::new(&config, gateway, store);
    let handle = spawn_controller(controller, config.launch.poll_interval());
    let printer = spawn_printer(&handle, args.verbose > 1);

    handle.send(Action::Reset(None));
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(w, r)| (w, r.trim()))
            .unwrap_or((line, ""));

        let action = match word {
            "quit" | "exit" => break,
            "help" => {
                print_help();
                continue;
            }
            "status" => {
                let snapshot = handle.snapshot.borrow().clone();
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                continue;
            }
            "reset" => Action::Reset(None),
            "continue" => Action::Continue,
            "profile" if !rest.is_empty() => {
                let mut parts = rest.split_whitespace();
                let name = parts.next().unwrap_or_default().to_string();
                let version = parts.next().map(str::to_string);
                Action::SelectProfile { name, version }
            }
            "app" if !rest.is_empty() => Action::SelectApplication(rest.to_string()),
            "tool" if !rest.is_empty() => Action::SelectTool(rest.to_string()),
            "launch" => Action::Launch(LaunchOptions {
                command: (!rest.is_empty()).then(|| rest.to_string()),
                detached: None,
            }),
            "env" => Action::TestEnvironment,
            "patch" if !rest.is_empty() => Action::Patch(rest.to_string()),
            "override" if !rest.is_empty() => {
                let mut parts = rest.split_whitespace();
                let package = parts.next().unwrap_or_default().to_string();
                let version = parts.next().map(str::to_string);
                Action::SetOverride { package, version }
            }
            "disable" | "enable" if !rest.is_empty() => Action::SetDisabled {
                package: rest.to_string(),
                disabled: word == "disable",
            },
            "mode" => match SerialisationMode::parse(rest) {
                Some(mode) => Action::SetSerialisationMode(mode),
                None => {
                    eprintln!("Unknown mode '{rest}', expected used_request or used_resolve");
                    continue;
                }
            },
            _ => {
                eprintln!("Unknown command: {line} (type 'help')");
                continue;
            }
        };
        if !handle.send(action) {
            break;
        }
    }

    handle.send(Action::Quit);
    printer.abort();
    handle.join().await;
    Ok(())
}

fn open_store(config: &AppConfig) -> Result<Arc<dyn PersistentStore>> {
    Ok(match &config.store.path {
        Some(path) => Arc::new(
            JsonFileStore::open(path)
                .with_context(|| format!("Failed to open settings file {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    })
}

fn open_gateway(config: &mut AppConfig, demo: bool) -> Result<Arc<dyn ResolverGateway>> {
    if demo {
        if config.profiles.source().is_none() {
            config.profiles.names = DEMO_PROFILES.iter().map(|s| s.to_string()).collect();
        }
        let repository =
            PackageRepository::from_toml_str(DEMO_PACKAGES).context("Invalid demo packages")?;
        return Ok(Arc::new(repository));
    }
    if config.repository.packages_path.is_empty() {
        anyhow::bail!(
            "No package repository configured: set [repository] packages_path or pass --demo"
        );
    }
    Ok(Arc::new(PackageRepository::from_paths(
        config.repository.packages_path.clone(),
    )))
}

/// 把控制器事件打印到终端
fn spawn_printer(handle: &ControllerHandle, debug: bool) -> tokio::task::JoinHandle<()> {
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("({n} messages skipped)");
                    continue;
                }
                Err(_) => break,
            };
            match event {
                ControllerEvent::Logged(record) => {
                    let tag = match record.level {
                        LogLevel::Debug if !debug => continue,
                        LogLevel::Debug => "debug",
                        LogLevel::Info => "info",
                        LogLevel::Warning => "warning",
                        LogLevel::Error => "error",
                    };
                    println!("[{}] {tag}: {}", record.time.format("%H:%M:%S"), record.message);
                }
                ControllerEvent::StateChanged { from, to } if from != to => {
                    println!("-- {to}: {}", to.help());
                }
                ControllerEvent::CommandChanged(command) if !command.is_empty() => {
                    println!("$ {command}");
                }
                ControllerEvent::RunningCommands(count) => {
                    println!("({count} running)");
                }
                _ => {}
            }
        }
    })
}

fn print_help() {
    println!(
        "Commands:\n  \
         status                    show the current session\n  \
         profile NAME [VERSION]    select a profile\n  \
         app REQUEST               select an application, e.g. maya==2020\n  \
         tool NAME                 select the tool to launch\n  \
         launch [COMMAND]          launch the current tool or COMMAND\n  \
         env                       record the environment of the current application\n  \
         patch REQUEST             patch the profile request, bare name clears\n  \
         override PKG [VERSION]    override or clear a package version\n  \
         disable|enable PKG        drop or restore a package\n  \
         mode used_request|used_resolve\n  \
         reset | continue | quit"
    );
}
