use crate::aggregation::aggregate;
use crate::builder::{AlertBuilder, LinkCache};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lock::FingerprintLocks;
use crate::matcher::Matcher;
use crate::recovery::RecoveryLinker;
use crate::window::WindowConfig;
use crate::{AlertNotifier, AlertStore, EventSource, StrategySource};
use alarmd_common::types::{AlarmStrategy, Alert, WindowType};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;

/// Last successful scan time per strategy, kept in process.
#[derive(Debug, Default)]
pub struct QueryTracker {
    last: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl QueryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_query_time(&self, strategy_id: i64) -> Option<DateTime<Utc>> {
        let map = self.last.lock().unwrap_or_else(|p| p.into_inner());
        map.get(&strategy_id).copied()
    }

    pub fn record(&self, strategy_id: i64, at: DateTime<Utc>) {
        let mut map = self.last.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(strategy_id, at);
    }

    pub fn forget(&self, strategy_id: i64) {
        let mut map = self.last.lock().unwrap_or_else(|p| p.into_inner());
        map.remove(&strategy_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Success,
    Skipped,
    Failed,
}

/// Outcome of one strategy scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub status: ScanStatus,
    pub rule_id: i64,
    pub rule_name: Option<String>,
    pub window_type: Option<WindowType>,
    /// Alerts created or updated.
    pub alert_count: usize,
    pub duration_ms: u64,
    pub reason: Option<String>,
}

impl ScanReport {
    fn skipped(strategy_id: i64, name: Option<&str>, started: Instant, reason: &str) -> Self {
        Self {
            status: ScanStatus::Skipped,
            rule_id: strategy_id,
            rule_name: name.map(str::to_string),
            window_type: None,
            alert_count: 0,
            duration_ms: started.elapsed().as_millis() as u64,
            reason: Some(reason.to_string()),
        }
    }
}

/// Counters of one scheduling pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub reports: Vec<ScanReport>,
}

/// Runs the scan pipeline for every active strategy.
pub struct ScanScheduler {
    ctx: Arc<ScanContext>,
}

struct ScanContext {
    strategies: Arc<dyn StrategySource>,
    events: Arc<dyn EventSource>,
    store: Arc<dyn AlertStore>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    builder: AlertBuilder,
    linker: RecoveryLinker,
    tracker: QueryTracker,
    config: Arc<EngineConfig>,
}

impl ScanScheduler {
    pub fn new(
        strategies: Arc<dyn StrategySource>,
        events: Arc<dyn EventSource>,
        store: Arc<dyn AlertStore>,
        locks: Arc<FingerprintLocks>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let builder = AlertBuilder::new(store.clone(), locks.clone());
        let linker = RecoveryLinker::new(store.clone(), events.clone(), locks);
        Self {
            ctx: Arc::new(ScanContext {
                strategies,
                events,
                store,
                notifier: None,
                builder,
                linker,
                tracker: QueryTracker::new(),
                config,
            }),
        }
    }

    /// Installs the hook called for created and escalated alerts.
    pub fn with_notifier(self, notifier: Arc<dyn AlertNotifier>) -> Self {
        match Arc::try_unwrap(self.ctx) {
            Ok(mut ctx) => {
                ctx.notifier = Some(notifier);
                Self { ctx: Arc::new(ctx) }
            }
            Err(ctx) => {
                tracing::warn!("Scheduler already shared, notifier not installed");
                Self { ctx }
            }
        }
    }

    pub fn tracker(&self) -> &QueryTracker {
        &self.ctx.tracker
    }

    /// Scans all active strategies, highest priority first, at most
    /// `max_concurrent_strategies` at a time, then links resolution events.
    pub async fn run_all(&self) -> Result<ScheduleSummary> {
        let started = Instant::now();
        let mut strategies = self.ctx.strategies.list_active().await?;
        strategies.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });

        let max_lookback = strategies
            .iter()
            .map(|s| WindowConfig::resolve(s, &self.ctx.config).lookback)
            .max();

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.max_concurrent_strategies.max(1)));
        let mut handles = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Collaborator(e.into()))?;
            let ctx = self.ctx.clone();
            let id = strategy.id;
            let name = strategy.name.clone();
            let handle = tokio::spawn(async move {
                let report = ctx.scan(&strategy).await;
                drop(permit);
                report
            });
            handles.push((id, name, handle));
        }

        let mut summary = ScheduleSummary::default();
        for (id, name, handle) in handles {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(strategy_id = id, error = %e, "Strategy scan task panicked");
                    ScanReport {
                        status: ScanStatus::Failed,
                        rule_id: id,
                        rule_name: Some(name),
                        window_type: None,
                        alert_count: 0,
                        duration_ms: 0,
                        reason: Some(e.to_string()),
                    }
                }
            };
            match report.status {
                ScanStatus::Success => summary.success += 1,
                ScanStatus::Skipped => summary.skipped += 1,
                ScanStatus::Failed => summary.failed += 1,
            }
            summary.total += 1;
            summary.reports.push(report);
        }

        let lookback = max_lookback.unwrap_or_else(|| default_link_lookback(&self.ctx.config));
        match self.ctx.linker.link_since(Utc::now() - lookback).await {
            Ok(r) if r.checked > 0 => tracing::info!(
                checked = r.checked,
                recovered = r.transitioned,
                failed = r.failed,
                "Resolution events linked"
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Recovery linking failed"),
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            total = summary.total,
            success = summary.success,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            "Scan pass finished"
        );
        Ok(summary)
    }

    /// Scans a single strategy by id. A missing or inactive strategy is
    /// reported as skipped.
    pub async fn run_strategy(&self, strategy_id: i64) -> ScanReport {
        let started = Instant::now();
        match self.ctx.strategies.get(strategy_id).await {
            Ok(Some(strategy)) => self.ctx.scan(&strategy).await,
            Ok(None) => ScanReport::skipped(strategy_id, None, started, "strategy not found"),
            Err(e) => {
                tracing::error!(strategy_id, error = %e, "Failed to load strategy");
                ScanReport {
                    status: ScanStatus::Failed,
                    rule_id: strategy_id,
                    rule_name: None,
                    window_type: None,
                    alert_count: 0,
                    duration_ms: started.elapsed().as_millis() as u64,
                    reason: Some(e.to_string()),
                }
            }
        }
    }
}

impl ScanContext {
    async fn scan(&self, strategy: &AlarmStrategy) -> ScanReport {
        let started = Instant::now();
        let scan_time = Utc::now();

        if !strategy.is_active {
            return ScanReport::skipped(strategy.id, Some(strategy.name.as_str()), started, "strategy inactive");
        }

        let window = WindowConfig::resolve(strategy, &self.config);

        if self.config.smart_scheduling {
            if let Some(last) = self.tracker.last_query_time(strategy.id) {
                match self.events.count_created_since(last).await {
                    Ok(0) => {
                        tracing::debug!(strategy_id = strategy.id, "No new events, scan skipped");
                        let mut report = ScanReport::skipped(
                            strategy.id,
                            Some(strategy.name.as_str()),
                            started,
                            "no new events",
                        );
                        report.window_type = Some(window.window_type);
                        return report;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(strategy_id = strategy.id, error = %e, "New-event check failed, scanning anyway");
                    }
                }
            }
        }

        let (status, alert_count, reason) = match self.process(strategy, &window, scan_time).await {
            Ok((count, 0)) => {
                self.tracker.record(strategy.id, scan_time);
                (ScanStatus::Success, count, None)
            }
            // Not recorded, so the next pass rescans and retries the failed groups.
            Ok((count, failures)) => {
                (
                    ScanStatus::Success,
                    count,
                    Some(format!("{failures} alert upserts failed")),
                )
            }
            Err(e) => {
                tracing::error!(
                    strategy_id = strategy.id,
                    strategy = %strategy.name,
                    error = %e,
                    "Strategy scan failed"
                );
                (ScanStatus::Failed, 0, Some(e.to_string()))
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            strategy_id = strategy.id,
            window_type = %window.window_type,
            alerts = alert_count,
            duration_ms,
            "Strategy scanned"
        );
        ScanReport {
            status,
            rule_id: strategy.id,
            rule_name: Some(strategy.name.clone()),
            window_type: Some(window.window_type),
            alert_count,
            duration_ms,
            reason,
        }
    }

    /// Fetch, match, aggregate, upsert. Returns `(upserted, failed)`.
    async fn process(
        &self,
        strategy: &AlarmStrategy,
        window: &WindowConfig,
        scan_time: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let events = self
            .events
            .created_events_since(window.cutoff(scan_time))
            .await?;

        let results = {
            let matched = Matcher::compile(&strategy.match_rules).filter(&events);
            tracing::debug!(
                strategy_id = strategy.id,
                fetched = events.len(),
                matched = matched.len(),
                "Events matched"
            );
            aggregate(&matched, &strategy.params.group_by, window, strategy.id)?
        };
        if results.is_empty() {
            return Ok((0, 0));
        }

        let group_by_field = strategy.params.group_by.join(",");
        let mut cache = LinkCache::new();
        let mut upserted = 0usize;
        let mut failed = 0usize;
        let mut logs = Vec::new();

        for result in &results {
            match self
                .builder
                .upsert(result, strategy, window, &group_by_field, &mut cache)
                .await
            {
                Ok(outcome) => {
                    upserted += 1;
                    if outcome.created || outcome.escalated {
                        self.dispatch(&outcome.alert, strategy);
                    }
                    if let Some(log) = outcome.log {
                        logs.push(log);
                    }
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(
                        strategy_id = strategy.id,
                        fingerprint = %result.fingerprint,
                        error = %e,
                        "Alert upsert failed"
                    );
                }
            }
        }

        if !logs.is_empty() {
            self.store.append_operator_logs(&logs).await?;
        }
        Ok((upserted, failed))
    }

    fn dispatch(&self, alert: &Alert, strategy: &AlarmStrategy) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let alert = alert.clone();
        let strategy = strategy.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&alert, &strategy).await {
                tracing::warn!(alert_id = %alert.alert_id, error = %e, "Alert notification failed");
            }
        });
    }
}

/// Lookback used for resolution linking when no strategy is active.
fn default_link_lookback(config: &EngineConfig) -> Duration {
    Duration::minutes(config.default_window_minutes * config.fixed_buffer_multiplier)
}
