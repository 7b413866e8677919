use alarmd_engine::auto_close::AutoCloser;
use alarmd_engine::config::EngineConfig;
use alarmd_engine::lock::FingerprintLocks;
use alarmd_engine::recovery::{SessionSweeper, SweepReport};
use alarmd_engine::scheduler::{ScanScheduler, ScheduleSummary};
use alarmd_engine::AlertNotifier;
use alarmd_notify::manager::NotificationManager;
use alarmd_storage::AlarmStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::ServerConfig;

/// The engine components wired to one store, sharing one set of
/// fingerprint locks.
pub struct Daemon {
    store: Arc<AlarmStore>,
    scheduler: ScanScheduler,
    auto_closer: AutoCloser,
    sessions: SessionSweeper,
    config: Arc<EngineConfig>,
}

impl Daemon {
    /// Connects the store, creates missing tables and builds the notifier
    /// from the `[notification]` section.
    pub async fn connect(config: &ServerConfig) -> anyhow::Result<Self> {
        let store =
            AlarmStore::connect(&config.database.url, config.database.max_connections).await?;
        store.ensure_schema().await?;

        let notifier: Option<Arc<dyn AlertNotifier>> = if config.notification.webhooks.is_empty() {
            tracing::info!("No notification targets configured");
            None
        } else {
            let manager = NotificationManager::from_config(&config.notification)?;
            tracing::info!(
                channels = manager.channels().len(),
                "Notification manager ready"
            );
            Some(Arc::new(manager))
        };

        Ok(Self::new(store, config.engine.clone(), notifier))
    }

    pub fn new(
        store: AlarmStore,
        engine: EngineConfig,
        notifier: Option<Arc<dyn AlertNotifier>>,
    ) -> Self {
        let store = Arc::new(store);
        let config = Arc::new(engine);
        let locks = Arc::new(FingerprintLocks::new());

        let mut scheduler = ScanScheduler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            locks.clone(),
            config.clone(),
        );
        if let Some(notifier) = notifier {
            scheduler = scheduler.with_notifier(notifier);
        }
        let auto_closer = AutoCloser::new(store.clone(), store.clone(), locks.clone(), config.clone());
        let sessions = SessionSweeper::new(store.clone(), store.clone(), locks, config.clone());

        Self {
            store,
            scheduler,
            auto_closer,
            sessions,
            config,
        }
    }

    pub fn store(&self) -> &AlarmStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionSweeper {
        &self.sessions
    }

    pub async fn scan_once(&self) -> anyhow::Result<ScheduleSummary> {
        Ok(self.scheduler.run_all().await?)
    }

    /// One auto-close pass. The sweeper logs its own summary, so only a
    /// failed pass is logged here.
    pub async fn auto_close_once(&self) -> Option<SweepReport> {
        self.auto_closer
            .sweep(Utc::now())
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Auto-close sweep failed"))
            .ok()
    }

    /// One session-confirmation pass, logged like [`Self::auto_close_once`].
    pub async fn session_sweep_once(&self) -> Option<SweepReport> {
        self.sessions
            .sweep(Utc::now())
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Session sweep failed"))
            .ok()
    }

    /// Runs the scan, auto-close and session loops until `shutdown`
    /// resolves. A failing round is logged and the loop keeps going.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let scan_every = period(self.config.scan_interval_secs);
        let close_every = period(self.config.auto_close_interval_secs);
        let session_every = period(self.config.session_check_interval_secs);

        let daemon = self.clone();
        let scan_handle = tokio::spawn(async move {
            let mut tick = interval(scan_every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(e) = daemon.scan_once().await {
                    tracing::error!(error = %e, "Scan round failed");
                }
            }
        });

        let daemon = self.clone();
        let close_handle = tokio::spawn(async move {
            let mut tick = interval(close_every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                daemon.auto_close_once().await;
            }
        });

        let daemon = self.clone();
        let session_handle = tokio::spawn(async move {
            let mut tick = interval(session_every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                daemon.session_sweep_once().await;
            }
        });

        tracing::info!(
            scan_interval_secs = scan_every.as_secs(),
            auto_close_interval_secs = close_every.as_secs(),
            session_check_interval_secs = session_every.as_secs(),
            "Engine loops started"
        );

        shutdown.await;
        tracing::info!("Shutting down gracefully");

        scan_handle.abort();
        close_handle.abort();
        session_handle.abort();
    }
}

/// `interval` panics on a zero period.
fn period(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}
