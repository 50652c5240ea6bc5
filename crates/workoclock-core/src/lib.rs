pub mod calendar;
pub mod config;
pub mod enforcement;
pub mod enforcer;
pub mod error;
pub mod ipc;
pub mod pid_file;
pub mod supervisor;

pub use config::Config;
pub use enforcement::EnforcementService;
pub use ipc::{ChannelMessage, ControlChannel, MessageKind};
pub use supervisor::{HostCapabilities, ServiceSupervisor, SupervisorState};
