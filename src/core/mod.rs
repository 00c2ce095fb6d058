//! 核心编排层：会话状态与阶段机、错误分类、Profile/应用发现、控制器与主循环

pub mod classify;
pub mod command_line;
pub mod console;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod events;
pub mod hooks;
pub mod orchestrator;
pub mod session;
pub mod source;
pub mod state;

pub use classify::{classify, Classification};
pub use command_line::{CommandInputs, LaunchCommand};
pub use console::ConsoleLog;
pub use controller::{prefs, Controller, Graph, LaunchOptions, PackageRow};
pub use error::ControlError;
pub use events::{ControllerEvent, LogLevel, LogRecord};
pub use hooks::{ApplicationHooks, DefaultHooks};
pub use orchestrator::{spawn_controller, Action, ControllerHandle, SessionSnapshot};
pub use session::{
    AppContext, AppMetadata, AppPackage, Application, Profile, ProfileFamily, ProfileVersion,
    SerialisationMode, SessionState,
};
pub use source::NameSource;
pub use state::{PhaseEvent, SessionPhase, StateMachine, Transition};
