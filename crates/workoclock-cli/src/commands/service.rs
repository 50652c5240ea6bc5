//! Enforcement service lifecycle commands

use anyhow::{Context, Result};
use chrono::Local;
use std::{
    fs::{create_dir_all, OpenOptions},
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use workoclock_core::{
    calendar::CalendarEvaluator,
    enforcement::{run_enforcement, run_enforcement_blocking},
    pid_file::{is_process_alive, kill_process, PidFile},
    supervisor::WorkerEntry,
    ChannelMessage, Config, ControlChannel, HostCapabilities, MessageKind, ServiceSupervisor,
    SupervisorState,
};
use workoclock_storage::PresetStore;

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn worker_entry() -> WorkerEntry {
    Arc::new(run_enforcement_blocking)
}

/// A channel on an OS-chosen port of the configured loopback host, for
/// one-shot requests that must not collide with a running foreground.
async fn ephemeral_channel(config: &Config) -> Result<ControlChannel> {
    let channel = ControlChannel::bind(SocketAddr::new(config.channel.host, 0)).await?;
    Ok(channel)
}

/// Bind `channel`'s status handler to a queue of status texts.
async fn status_updates(channel: &ControlChannel) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel
        .on(MessageKind::StatusUpdate, move |message, _| {
            if let ChannelMessage::StatusUpdate(text) = message {
                let _ = tx.send(text);
            }
        })
        .await;
    channel.start().await;
    rx
}

/// Ping enforcement and wait for its status answer.
async fn query_status(config: &Config) -> Result<Option<String>> {
    let channel = ephemeral_channel(config).await?;
    let mut updates = status_updates(&channel).await;
    channel
        .send(config.channel.enforcement_addr(), &ChannelMessage::Ping)
        .await?;
    Ok(tokio::time::timeout(STATUS_TIMEOUT, updates.recv())
        .await
        .ok()
        .flatten())
}

/// Launch enforcement as a detached managed service
///
/// # Errors
///
/// Returns an error if no managed launcher is available or the launch fails
pub async fn start_service(config: &Config) -> Result<()> {
    let pid_file = PidFile::new(config.pid_path());
    if let Some(pid) = pid_file.read()? {
        if is_process_alive(pid) {
            log::info!("Enforcement service is already running (PID: {pid}).");
            return Ok(());
        }
        log::warn!("Removing stale PID file.");
        pid_file.remove()?;
    }

    let capabilities = HostCapabilities::detect(config);
    if capabilities.service_launcher.is_none() {
        anyhow::bail!(
            "No managed service launcher in '{:?}' mode. Use `workoclock run` to enforce in the foreground.",
            config.service.mode
        );
    }

    // Validate the preset file before handing it to a process we cannot watch.
    PresetStore::open(config.presets_path())?;

    log::info!("Starting WorkOClock enforcement service...");
    let mut supervisor = ServiceSupervisor::new(
        &capabilities,
        worker_entry(),
        Arc::new(ephemeral_channel(config).await?),
        config.channel.enforcement_addr(),
    );
    supervisor.start(&config.service_argument()).await?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    if supervisor.refresh() != SupervisorState::Running {
        anyhow::bail!(
            "Enforcement service exited right after launch, see {}",
            config.log_path().display()
        );
    }

    if let Some(pid) = pid_file.read()? {
        println!("Enforcement service started (PID: {pid}).");
    }
    println!("Logs: {}", config.log_path().display());
    Ok(())
}

/// Run enforcement on a local worker thread and print status updates until
/// Ctrl-C or until the worker ends
///
/// # Errors
///
/// Returns an error if the foreground port is taken or the worker fails
pub async fn run_foreground(config: &Config) -> Result<()> {
    let channel = ControlChannel::bind(config.channel.foreground_addr())
        .await
        .context("Is another `workoclock run` active?")?;
    let channel = Arc::new(channel);
    let mut updates = status_updates(&channel).await;

    // Enforcement only reads the preset file, so it must exist first.
    PresetStore::open(config.presets_path())?;

    let mut supervisor = ServiceSupervisor::new(
        &HostCapabilities::local_worker_only(),
        worker_entry(),
        Arc::clone(&channel),
        config.channel.enforcement_addr(),
    )
    .with_stop_timeout(Duration::from_secs(config.service.stop_timeout_secs));
    supervisor.start(&config.service_argument()).await?;

    println!("Enforcing in the foreground. Press Ctrl-C to stop.");
    let mut check = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            Some(status) = updates.recv() => {
                println!("[{}] {status}", Local::now().format("%H:%M:%S"));
            }
            _ = check.tick() => {
                if supervisor.refresh() != SupervisorState::Running {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Stopping...");
                supervisor.stop().await;
                break;
            }
        }
    }
    channel.close().await;

    if supervisor.state() == SupervisorState::Failed {
        anyhow::bail!("Enforcement stopped with an error");
    }
    Ok(())
}

/// Ask the detached enforcement service to shut down
///
/// # Errors
///
/// Returns an error if the PID file is unreadable or the service outlives the
/// stop timeout without `force`
pub async fn stop_service(config: &Config, force: bool) -> Result<()> {
    let pid_file = PidFile::new(config.pid_path());
    let Some(pid) = pid_file.read()? else {
        log::info!("Enforcement service is not running (no PID file).");
        return Ok(());
    };
    if !is_process_alive(pid) {
        log::warn!("Enforcement service is not running, removing stale PID file.");
        return pid_file.remove();
    }

    log::info!("Stopping enforcement service (PID: {pid})...");
    let channel = ephemeral_channel(config).await?;
    channel
        .send(config.channel.enforcement_addr(), &ChannelMessage::Shutdown)
        .await?;

    let deadline = Instant::now() + Duration::from_secs(config.service.stop_timeout_secs);
    while is_process_alive(pid) && Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if is_process_alive(pid) {
        if !force {
            anyhow::bail!("Enforcement service (PID: {pid}) is still running. Retry with --force.");
        }
        log::warn!("Enforcement service did not stop gracefully. Force killing...");
        if !kill_process(pid) {
            anyhow::bail!("Failed to kill enforcement service (PID: {pid})");
        }
    } else {
        log::info!("Enforcement service stopped successfully.");
    }

    pid_file.remove()
}

/// Show service liveness, its reported status and the preset summary
///
/// # Errors
///
/// Returns an error if the PID file or preset file cannot be read
pub async fn show_status(config: &Config) -> Result<()> {
    println!("WorkOClock Status");
    println!("{}", "=".repeat(40));

    match PidFile::new(config.pid_path()).read()? {
        Some(pid) if is_process_alive(pid) => println!("Service:  running (PID: {pid})"),
        _ => println!("Service:  not running"),
    }
    match query_status(config).await? {
        Some(status) => println!("Status:   {status}"),
        None => println!("Status:   no answer from {}", config.channel.enforcement_addr()),
    }

    let store = PresetStore::open(config.presets_path())?;
    let presets = store.load_all()?;
    let now = chrono::Utc::now();
    let active: Vec<&str> = presets
        .iter()
        .filter(|preset| preset.is_active(now, &CalendarEvaluator))
        .map(|preset| preset.name())
        .collect();
    let enabled = presets.iter().filter(|preset| preset.enable()).count();
    println!(
        "Presets:  {} stored, {enabled} enabled, {} active now",
        presets.len(),
        active.len()
    );
    if !active.is_empty() {
        println!("Active:   {}", active.join(", "));
    }
    Ok(())
}

/// Ping the enforcement service and report the round trip
///
/// # Errors
///
/// Returns an error if nothing answers within the timeout
pub async fn ping(config: &Config) -> Result<()> {
    let started = Instant::now();
    let Some(status) = query_status(config).await? else {
        anyhow::bail!(
            "No answer from enforcement at {} within {}s",
            config.channel.enforcement_addr(),
            STATUS_TIMEOUT.as_secs()
        );
    };
    println!(
        "Pong from {} in {} ms: {status}",
        config.channel.enforcement_addr(),
        started.elapsed().as_millis()
    );
    Ok(())
}

/// Body of the detached enforcement process
///
/// # Errors
///
/// Returns an error if logging cannot be set up or enforcement fails
pub async fn run_service_process(argument: &str) -> Result<()> {
    // This is the detached process: nothing it prints is seen.
    let config = Config::from_service_argument(argument)?;
    setup_service_logging(&config.log_path())?;
    log::info!("Enforcement process started internally.");

    let result = run_enforcement(argument).await;
    if let Err(e) = &result {
        log::error!("Enforcement exited with a fatal error: {e:#}");
    }
    if let Err(e) = PidFile::new(config.pid_path()).remove() {
        log::warn!("Failed to remove PID file: {e:#}");
    }
    result
}

fn setup_service_logging(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::load_from_dir(dir.path()).unwrap();
        // Point the channel at a port nothing listens on.
        let unused = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        config.channel.enforcement_port = unused.local_addr().unwrap().port();
        config
    }

    #[tokio::test]
    async fn test_stop_without_pid_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        stop_service(&config(&dir), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_removes_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let pid_file = PidFile::new(config.pid_path());
        pid_file.write(u32::MAX - 1).unwrap();

        stop_service(&config, false).await.unwrap();
        assert!(!pid_file.path().exists());
    }

    #[tokio::test]
    async fn test_ping_without_service_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ping(&config(&dir)).await.is_err());
    }

    #[tokio::test]
    async fn test_status_without_service() {
        let dir = tempfile::tempdir().unwrap();
        show_status(&config(&dir)).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_status_reaches_enforcement() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        let enforcement = ControlChannel::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        config.channel.enforcement_port = enforcement.local_addr().unwrap().port();

        let enforcement = Arc::new(enforcement);
        let replier = Arc::clone(&enforcement);
        enforcement
            .on(MessageKind::Ping, move |_, sender| {
                let replier = Arc::clone(&replier);
                tokio::spawn(async move {
                    let reply = ChannelMessage::StatusUpdate("No active presets".to_string());
                    let _ = replier.send(sender, &reply).await;
                });
            })
            .await;
        enforcement.start().await;

        assert_eq!(
            query_status(&config).await.unwrap(),
            Some("No active presets".to_string())
        );
        ping(&config).await.unwrap();
    }
}
