use crate::{
    calendar::CalendarEvaluator,
    config::Config,
    enforcer::{create_enforcer, BlockPlan, Enforcer},
    ipc::{ChannelMessage, ControlChannel, MessageKind},
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::interval};
use workoclock_storage::{PresetStore, SettingPreset, StoreError};

/// Requests handed off from the channel listener to the service loop.
#[derive(Debug)]
enum Request {
    Ping(SocketAddr),
    Shutdown,
}

/// The background process: re-reads presets on every tick, hands the merged
/// block plan to the enforcer and reports status to the foreground.
pub struct EnforcementService {
    store: PresetStore,
    channel: Arc<ControlChannel>,
    enforcer: Box<dyn Enforcer>,
    evaluator: CalendarEvaluator,
    foreground_addr: SocketAddr,
    tick_interval: Duration,
    status: String,
}

impl EnforcementService {
    /// Open the shared preset file for reading and bind the enforcement side
    /// of the channel. The foreground owns the file; this side never writes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the preset file is missing or fails validation, or
    /// the port is taken.
    pub async fn new(config: &Config, enforcer: Box<dyn Enforcer>) -> Result<Self> {
        let store = PresetStore::open_read_only(config.presets_path())?;
        let channel = ControlChannel::bind(config.channel.enforcement_addr()).await?;
        Ok(Self::with_parts(
            store,
            Arc::new(channel),
            enforcer,
            config.channel.foreground_addr(),
            Duration::from_secs(config.service.tick_interval_secs),
        ))
    }

    #[must_use]
    pub fn with_parts(
        store: PresetStore,
        channel: Arc<ControlChannel>,
        enforcer: Box<dyn Enforcer>,
        foreground_addr: SocketAddr,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            enforcer,
            evaluator: CalendarEvaluator,
            foreground_addr,
            tick_interval,
            status: "Starting".to_string(),
        }
    }

    #[must_use]
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Serve until a shutdown request or Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the preset store becomes corrupted or the enforcer
    /// cannot release its blocks.
    pub async fn run(&mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ping_tx = tx.clone();
        self.channel
            .on(MessageKind::Ping, move |_, sender| {
                let _ = ping_tx.send(Request::Ping(sender));
            })
            .await;
        self.channel
            .on(MessageKind::Shutdown, move |_, _| {
                let _ = tx.send(Request::Shutdown);
            })
            .await;
        self.channel.start().await;

        let mut ticker = interval(self.tick_interval);
        log::info!("Enforcement service started");

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        if e.downcast_ref::<StoreError>().is_some_and(StoreError::is_fatal) {
                            log::error!("Stopping enforcement: {e:#}");
                            self.publish(format!("Stopped: {e}")).await;
                            break Err(e);
                        }
                        log::error!("Enforcement tick failed: {e:#}");
                    }
                }
                Some(request) = rx.recv() => match request {
                    Request::Ping(sender) => self.reply(sender).await,
                    Request::Shutdown => {
                        log::info!("Shutdown requested over control channel");
                        break Ok(());
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received Ctrl-C, shutting down...");
                    break Ok(());
                }
            }
        };

        self.enforcer.release().await?;
        if outcome.is_ok() {
            self.publish("Enforcement stopped".to_string()).await;
        }
        self.channel.close().await;
        log::info!("Enforcement service shut down.");
        outcome
    }

    /// Re-evaluate presets at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error if presets cannot be loaded or the enforcer fails.
    pub async fn tick(&mut self) -> Result<()> {
        self.tick_at(Utc::now()).await
    }

    async fn tick_at(&mut self, now: DateTime<Utc>) -> Result<()> {
        let active: Vec<SettingPreset> = self
            .store
            .load_all()?
            .into_iter()
            .filter(|preset| preset.is_active(now, &self.evaluator))
            .collect();
        let plan = BlockPlan::from_active(&active);

        if plan.is_empty() {
            self.enforcer.release().await?;
        } else {
            self.enforcer.apply(&plan).await?;
        }

        let status = plan.describe();
        if status != self.status {
            log::debug!("Status changed: {status}");
            self.publish(status).await;
        }
        Ok(())
    }

    async fn reply(&self, sender: SocketAddr) {
        log::debug!("Ping from {sender}");
        let message = ChannelMessage::status(self.status.as_str());
        if let Err(e) = self.channel.send(sender, &message).await {
            log::warn!("Failed to answer ping: {e}");
        }
    }

    async fn publish(&mut self, status: String) {
        let message = ChannelMessage::status(status.as_str());
        self.status = status;
        if let Err(e) = self.channel.send(self.foreground_addr, &message).await {
            log::warn!("Failed to publish status: {e}");
        }
    }
}

/// Run the enforcement process for the opaque service `argument`.
///
/// # Errors
///
/// Returns an error if the configuration, store or channel cannot be set up,
/// or the service stops with an error.
pub async fn run_enforcement(argument: &str) -> Result<()> {
    let config = Config::from_service_argument(argument)?;
    let mut service = EnforcementService::new(&config, create_enforcer()).await?;
    service.run().await
}

/// Blocking variant for a worker thread: drives [`run_enforcement`] on a
/// runtime of its own.
///
/// # Errors
///
/// Same as [`run_enforcement`].
pub fn run_enforcement_blocking(argument: String) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_enforcement(&argument))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use workoclock_storage::{AppCategory, FixedSchedule};

    #[derive(Default)]
    struct RecordingEnforcer {
        plans: Arc<Mutex<Vec<Option<BlockPlan>>>>,
    }

    #[async_trait]
    impl Enforcer for RecordingEnforcer {
        async fn apply(&mut self, plan: &BlockPlan) -> Result<()> {
            self.plans.lock().unwrap().push(Some(plan.clone()));
            Ok(())
        }

        async fn release(&mut self) -> Result<()> {
            self.plans.lock().unwrap().push(None);
            Ok(())
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    type Plans = Arc<Mutex<Vec<Option<BlockPlan>>>>;

    /// The service reads through its own read-only store; tests edit presets
    /// through the returned writer.
    async fn service(
        dir: &TempDir,
        foreground_addr: SocketAddr,
    ) -> (EnforcementService, Plans, PresetStore) {
        let path = dir.path().join("presets.json");
        let writer = PresetStore::open(&path).unwrap();
        let store = PresetStore::open_read_only(&path).unwrap();
        let channel = Arc::new(ControlChannel::bind(loopback()).await.unwrap());
        let enforcer = RecordingEnforcer::default();
        let plans = Arc::clone(&enforcer.plans);
        let service = EnforcementService::with_parts(
            store,
            channel,
            Box::new(enforcer),
            foreground_addr,
            std::time::Duration::from_millis(50),
        );
        (service, plans, writer)
    }

    #[tokio::test]
    async fn test_tick_applies_only_active_presets() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, plans, writer) = service(&dir, loopback()).await;

        let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let zen = SettingPreset::new(
            "zen",
            [AppCategory::Messenger],
            FixedSchedule::for_duration(start, ChronoDuration::hours(8)).unwrap(),
        )
        .unwrap()
        .with_enable(true);
        writer.create(&zen, false).unwrap();

        service
            .tick_at(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(service.status(), "Active: zen | blocking: messenger");

        service
            .tick_at(Utc.with_ymd_and_hms(2024, 5, 1, 17, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(service.status(), "No active presets");

        let plans = plans.lock().unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].as_ref().unwrap().presets, vec!["zen".to_string()]);
        assert!(plans[1].is_none());
    }

    #[tokio::test]
    async fn test_disabled_default_preset_blocks_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _plans, _writer) = service(&dir, loopback()).await;

        service.tick().await.unwrap();
        assert_eq!(service.status(), "No active presets");
    }

    #[tokio::test]
    async fn test_ping_status_and_shutdown_over_channel() {
        let dir = tempfile::tempdir().unwrap();
        let foreground = ControlChannel::bind(loopback()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        foreground
            .on(MessageKind::StatusUpdate, move |message, _| {
                let _ = tx.send(message);
            })
            .await;
        foreground.start().await;

        let (mut service, _plans, _writer) = service(&dir, foreground.local_addr().unwrap()).await;
        let enforcement_addr = service.channel.local_addr().unwrap();
        let running = tokio::spawn(async move { service.run().await });

        let first = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            ChannelMessage::StatusUpdate("No active presets".to_string())
        );

        foreground
            .send(enforcement_addr, &ChannelMessage::Ping)
            .await
            .unwrap();
        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, first);

        foreground
            .send(enforcement_addr, &ChannelMessage::Shutdown)
            .await
            .unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_preset_file_is_not_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _plans, writer) = service(&dir, loopback()).await;
        std::fs::remove_file(writer.path()).unwrap();

        let err = service.tick().await.unwrap_err();
        let store_err = err.downcast_ref::<StoreError>().unwrap();
        assert!(matches!(store_err, StoreError::Missing { .. }));
        assert!(!store_err.is_fatal());
        assert!(!writer.path().exists());
    }

    #[tokio::test]
    async fn test_new_requires_existing_preset_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load_from_dir(dir.path()).unwrap();
        config.channel.enforcement_port = 0;

        let result = EnforcementService::new(&config, create_enforcer()).await;
        assert!(result.is_err());
        assert!(!config.presets_path().exists());
    }

    #[tokio::test]
    async fn test_corrupted_store_stops_service() {
        let dir = tempfile::tempdir().unwrap();
        let (mut service, _plans, _writer) = service(&dir, loopback()).await;
        std::fs::write(dir.path().join("presets.json"), "{}").unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), service.run())
            .await
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some_and(StoreError::is_fatal));
    }
}
