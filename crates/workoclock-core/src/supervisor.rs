//! Starts and stops the background enforcement process.
//!
//! The strategy is chosen once, at construction, from a [`HostCapabilities`]
//! descriptor:
//!
//! - managed service: the host launches a detached process that the
//!   supervisor does not own after the launch call;
//! - local worker: a background thread the supervisor owns and can join, but
//!   never cancels.
//!
//! Either way the stop request travels over the control channel.

use async_trait::async_trait;
use std::{
    net::SocketAddr,
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::{
    config::{Config, ServiceMode},
    error::SupervisorError,
    ipc::{ChannelMessage, ControlChannel},
    pid_file::PidFile,
};

/// Hidden CLI subcommand that runs the enforcement process.
pub const SERVICE_ENTRY_COMMAND: &str = "service-internal-start";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
    Stopped,
    Failed,
}

/// Observed state of the background unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Running,
    Exited,
    Failed,
}

/// Command the host uses to launch the enforcement service. The opaque
/// argument is appended as the last parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub pid_file: PathBuf,
}

impl LaunchCommand {
    /// Relaunch the running executable with the hidden service subcommand.
    ///
    /// # Errors
    ///
    /// Returns an error if the current executable cannot be located.
    pub fn current_exe(pid_file: PathBuf) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec![SERVICE_ENTRY_COMMAND.to_string()],
            pid_file,
        })
    }
}

/// What the running host can do to host the enforcement process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    pub service_launcher: Option<LaunchCommand>,
    pub local_worker: bool,
}

impl HostCapabilities {
    /// Capabilities of this host, narrowed by the configured service mode.
    #[must_use]
    pub fn detect(config: &Config) -> Self {
        let launcher = if cfg!(any(unix, windows)) {
            LaunchCommand::current_exe(config.pid_path())
                .map_err(|e| log::warn!("Cannot locate executable for managed service: {e}"))
                .ok()
        } else {
            None
        };
        let worker = cfg!(not(target_family = "wasm"));

        match config.service.mode {
            ServiceMode::Auto => Self {
                service_launcher: launcher,
                local_worker: worker,
            },
            ServiceMode::Managed => Self {
                service_launcher: launcher,
                local_worker: false,
            },
            ServiceMode::Worker => Self::local_worker_only(),
        }
    }

    #[must_use]
    pub fn local_worker_only() -> Self {
        Self {
            service_launcher: None,
            local_worker: cfg!(not(target_family = "wasm")),
        }
    }
}

/// Entry point the local worker runs, given the opaque argument.
pub type WorkerEntry = Arc<dyn Fn(String) -> anyhow::Result<()> + Send + Sync>;

/// One way of hosting the enforcement process.
#[async_trait]
pub trait ServiceStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Launch the enforcement process with `argument`.
    async fn launch(&mut self, argument: &str) -> Result<(), SupervisorError>;

    /// Check on the launched unit without blocking.
    fn status(&mut self) -> UnitStatus;

    /// Wait up to `timeout` for the unit to exit after a stop request.
    async fn wait_stopped(&mut self, timeout: Duration) -> UnitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.status();
            if status != UnitStatus::Running || Instant::now() >= deadline {
                return status;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Detached process launched through the host.
pub struct ManagedService {
    command: LaunchCommand,
    pid_file: PidFile,
}

impl ManagedService {
    #[must_use]
    pub fn new(command: LaunchCommand) -> Self {
        let pid_file = PidFile::new(command.pid_file.clone());
        Self { command, pid_file }
    }
}

#[async_trait]
impl ServiceStrategy for ManagedService {
    fn name(&self) -> &'static str {
        "managed-service"
    }

    async fn launch(&mut self, argument: &str) -> Result<(), SupervisorError> {
        if self.pid_file.is_running() {
            return Err(SupervisorError::AlreadyRunning);
        }
        let launch_error = |source| SupervisorError::Launch {
            strategy: "managed-service",
            source,
        };

        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .arg(argument)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(launch_error)?;

        log::info!("Enforcement service launched with PID: {}", child.id());
        if let Err(e) = self.pid_file.write(child.id()) {
            log::warn!("Failed to record enforcement PID: {e:#}");
        }
        Ok(())
    }

    fn status(&mut self) -> UnitStatus {
        if self.pid_file.is_running() {
            return UnitStatus::Running;
        }
        if let Err(e) = self.pid_file.remove() {
            log::warn!("Failed to remove stale PID file: {e:#}");
        }
        UnitStatus::Exited
    }
}

/// Background thread inside the foreground process.
pub struct LocalWorker {
    entry: WorkerEntry,
    handle: Option<thread::JoinHandle<anyhow::Result<()>>>,
}

impl LocalWorker {
    #[must_use]
    pub fn new(entry: WorkerEntry) -> Self {
        Self {
            entry,
            handle: None,
        }
    }
}

#[async_trait]
impl ServiceStrategy for LocalWorker {
    fn name(&self) -> &'static str {
        "local-worker"
    }

    /// Refuses while the previous thread is still alive; a finished one is
    /// joined first.
    async fn launch(&mut self, argument: &str) -> Result<(), SupervisorError> {
        if self.status() == UnitStatus::Running {
            return Err(SupervisorError::AlreadyRunning);
        }
        let entry = Arc::clone(&self.entry);
        let argument = argument.to_string();
        let handle = thread::Builder::new()
            .name("workoclock-enforcer".to_string())
            .spawn(move || entry(argument))
            .map_err(|source| SupervisorError::Launch {
                strategy: "local-worker",
                source,
            })?;

        log::info!("Enforcement worker thread started");
        self.handle = Some(handle);
        Ok(())
    }

    fn status(&mut self) -> UnitStatus {
        match self.handle.take() {
            None => UnitStatus::Exited,
            Some(handle) if !handle.is_finished() => {
                self.handle = Some(handle);
                UnitStatus::Running
            }
            Some(handle) => match handle.join() {
                Ok(Ok(())) => UnitStatus::Exited,
                Ok(Err(e)) => {
                    log::error!("Enforcement worker failed: {e:#}");
                    UnitStatus::Failed
                }
                Err(_) => {
                    log::error!("Enforcement worker panicked");
                    UnitStatus::Failed
                }
            },
        }
    }
}

/// Pick the strategy for `capabilities`, preferring a managed service.
#[must_use]
pub fn select_strategy(
    capabilities: &HostCapabilities,
    entry: WorkerEntry,
) -> Option<Box<dyn ServiceStrategy>> {
    if let Some(command) = &capabilities.service_launcher {
        return Some(Box::new(ManagedService::new(command.clone())));
    }
    if capabilities.local_worker {
        return Some(Box::new(LocalWorker::new(entry)));
    }
    None
}

pub struct ServiceSupervisor {
    state: SupervisorState,
    strategy: Option<Box<dyn ServiceStrategy>>,
    channel: Arc<ControlChannel>,
    enforcement_addr: SocketAddr,
    stop_timeout: Duration,
}

impl ServiceSupervisor {
    #[must_use]
    pub fn new(
        capabilities: &HostCapabilities,
        entry: WorkerEntry,
        channel: Arc<ControlChannel>,
        enforcement_addr: SocketAddr,
    ) -> Self {
        let strategy = select_strategy(capabilities, entry);
        match &strategy {
            Some(strategy) => log::debug!("Selected {} strategy", strategy.name()),
            None => log::warn!("No enforcement strategy available on this host"),
        }

        Self {
            state: SupervisorState::NotStarted,
            strategy,
            channel,
            enforcement_addr,
            stop_timeout: Duration::from_secs(5),
        }
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    #[must_use]
    pub fn strategy_name(&self) -> Option<&'static str> {
        self.strategy.as_ref().map(|strategy| strategy.name())
    }

    /// Launch enforcement with the opaque `argument`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] while starting, or while the
    /// previously launched unit is still alive,
    /// [`SupervisorError::UnsupportedPlatform`] without a strategy, and
    /// [`SupervisorError::Launch`] if the launch itself fails.
    pub async fn start(&mut self, argument: &str) -> Result<(), SupervisorError> {
        if matches!(
            self.refresh(),
            SupervisorState::Starting | SupervisorState::Running
        ) {
            return Err(SupervisorError::AlreadyRunning);
        }
        let Some(strategy) = self.strategy.as_mut() else {
            self.state = SupervisorState::Failed;
            return Err(SupervisorError::UnsupportedPlatform);
        };

        self.state = SupervisorState::Starting;
        log::info!("Starting enforcement ({})", strategy.name());
        match strategy.launch(argument).await {
            Ok(()) => {
                self.state = SupervisorState::Running;
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start enforcement: {e}");
                self.state = SupervisorState::Failed;
                Err(e)
            }
        }
    }

    /// Ask enforcement to shut down and wait for it cooperatively. A no-op
    /// unless starting or running. A unit that outlives the stop timeout is
    /// never killed; the state stays `Running` until [`Self::refresh`] sees it
    /// exit.
    pub async fn stop(&mut self) {
        if !matches!(
            self.state,
            SupervisorState::Starting | SupervisorState::Running
        ) {
            log::debug!("Stop requested in state {:?}, nothing to do", self.state);
            return;
        }

        if let Err(e) = self
            .channel
            .send(self.enforcement_addr, &ChannelMessage::Shutdown)
            .await
        {
            log::warn!("Failed to send shutdown request: {e}");
        }

        if let Some(strategy) = self.strategy.as_mut() {
            if strategy.wait_stopped(self.stop_timeout).await == UnitStatus::Running {
                log::warn!(
                    "Enforcement still running after {:?}; leaving it to finish on its own",
                    self.stop_timeout
                );
                self.state = SupervisorState::Running;
                return;
            }
            log::info!("Enforcement stopped");
        }
        self.state = SupervisorState::Stopped;
    }

    /// Re-check a running unit and record whether it has exited.
    pub fn refresh(&mut self) -> SupervisorState {
        if self.state == SupervisorState::Running {
            if let Some(strategy) = self.strategy.as_mut() {
                self.state = match strategy.status() {
                    UnitStatus::Running => SupervisorState::Running,
                    UnitStatus::Exited => SupervisorState::Stopped,
                    UnitStatus::Failed => SupervisorState::Failed,
                };
            }
        }
        self.state
    }

    /// Send a liveness check to enforcement.
    ///
    /// # Errors
    ///
    /// Returns an error if the local socket fails.
    pub async fn ping(&self) -> Result<(), SupervisorError> {
        self.channel
            .send(self.enforcement_addr, &ChannelMessage::Ping)
            .await?;
        Ok(())
    }
}
