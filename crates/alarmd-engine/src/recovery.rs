//! Recovery detection and session sweeps.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lock::FingerprintLocks;
use crate::window::WindowConfig;
use crate::{AlertStore, AlertTransaction, EventSource, StrategySource};
use alarmd_common::types::{
    Alert, AlertField, AlertStatus, Event, EventAction, OperatorLog, SessionStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub transitioned: usize,
    pub failed: usize,
}

/// True when every `created` event has a `closed`/`recovery` event with the
/// same `external_id` that arrived later. A `created` event without an
/// `external_id` can never be recovered.
pub fn all_created_recovered(events: &[Event]) -> bool {
    let mut resolutions: HashMap<&str, Vec<DateTime<Utc>>> = HashMap::new();
    for event in events.iter().filter(|e| e.action.is_resolution()) {
        if let Some(ext) = event.external_id.as_deref() {
            resolutions.entry(ext).or_default().push(event.received_at);
        }
    }

    let mut created = events
        .iter()
        .filter(|e| e.action == EventAction::Created)
        .peekable();
    if created.peek().is_none() {
        return false;
    }
    created.all(|c| {
        c.external_id
            .as_deref()
            .and_then(|ext| resolutions.get(ext))
            .is_some_and(|times| times.iter().any(|t| *t > c.received_at))
    })
}

/// Moves `alert` to `auto_recovery` when all its created events are
/// resolved. Must run inside the transaction that holds the alert's lock.
pub async fn check_recovery(
    tx: &mut dyn AlertTransaction,
    alert: &mut Alert,
    now: DateTime<Utc>,
) -> Result<Option<OperatorLog>> {
    if !alert.status.is_active() {
        return Ok(None);
    }
    let events = tx.linked_events(&alert.alert_id).await?;
    if !all_created_recovered(&events) {
        return Ok(None);
    }

    alert.status = AlertStatus::AutoRecovery;
    alert.updated_at = now;
    let mut fields = vec![AlertField::Status, AlertField::UpdatedAt];
    if alert.is_session_alert && alert.session_status == Some(SessionStatus::Observing) {
        alert.session_status = Some(SessionStatus::Recovered);
        fields.push(AlertField::SessionStatus);
    }
    tx.update_alert(alert, &fields).await?;

    tracing::info!(
        alert_id = %alert.alert_id,
        fingerprint = %alert.fingerprint,
        session = alert.is_session_alert,
        "Alert auto-recovered"
    );
    Ok(Some(OperatorLog::system(
        "Alert processing-auto recovery",
        &alert.alert_id,
        format!("All events of alert {} recovered, status set to auto_recovery", alert.alert_id),
    )))
}

/// Links `closed`/`recovery` events to the active alerts whose created
/// events share their `external_id`, then re-checks those alerts.
pub struct RecoveryLinker {
    store: Arc<dyn AlertStore>,
    events: Arc<dyn EventSource>,
    locks: Arc<FingerprintLocks>,
}

impl RecoveryLinker {
    pub fn new(
        store: Arc<dyn AlertStore>,
        events: Arc<dyn EventSource>,
        locks: Arc<FingerprintLocks>,
    ) -> Self {
        Self {
            store,
            events,
            locks,
        }
    }

    pub async fn link_since(&self, cutoff: DateTime<Utc>) -> Result<SweepReport> {
        let resolutions = self.events.resolution_events_since(cutoff).await?;
        let mut report = SweepReport::default();
        if resolutions.is_empty() {
            return Ok(report);
        }

        let mut by_external: HashMap<String, Vec<String>> = HashMap::new();
        for event in &resolutions {
            if let Some(ext) = &event.external_id {
                by_external
                    .entry(ext.clone())
                    .or_default()
                    .push(event.event_id.clone());
            }
        }
        let external_ids: Vec<String> = by_external.keys().cloned().collect();
        let matches = self.store.active_alerts_by_external_ids(&external_ids).await?;

        let mut targets: HashMap<String, (Alert, Vec<String>)> = HashMap::new();
        for (ext, alert) in matches {
            let ids = by_external.get(&ext).cloned().unwrap_or_default();
            targets
                .entry(alert.alert_id.clone())
                .or_insert_with(|| (alert, Vec::new()))
                .1
                .extend(ids);
        }

        let mut logs = Vec::new();
        for (alert, event_ids) in targets.into_values() {
            report.checked += 1;
            match self.link_one(&alert, &event_ids).await {
                Ok(Some(log)) => {
                    report.transitioned += 1;
                    logs.push(log);
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(alert_id = %alert.alert_id, error = %e, "Recovery linking failed");
                }
            }
        }

        if !logs.is_empty() {
            self.store.append_operator_logs(&logs).await?;
        }
        Ok(report)
    }

    async fn link_one(&self, alert: &Alert, event_ids: &[String]) -> Result<Option<OperatorLog>> {
        let _guard = self.locks.acquire(&alert.fingerprint).await;
        let mut tx = self.store.begin().await?;
        let Some(mut current) = tx.get_for_update(&alert.alert_id).await? else {
            return Err(EngineError::AlertNotFound(alert.alert_id.clone()));
        };
        if !current.status.is_active() {
            return Ok(None);
        }
        let added = tx.link_events(&current.alert_id, event_ids).await?;
        let log = if added > 0 {
            tracing::debug!(alert_id = %current.alert_id, added, "Linked resolution events");
            check_recovery(tx.as_mut(), &mut current, Utc::now()).await?
        } else {
            None
        };
        tx.commit().await?;
        Ok(log)
    }
}

/// Keyset pages over observing session alerts, `batch` at a time.
struct ObservingPager {
    rule_id: Option<i64>,
    batch: u64,
    after: Option<String>,
    page: std::vec::IntoIter<Alert>,
    exhausted: bool,
}

impl ObservingPager {
    fn new(rule_id: Option<i64>, batch: u64) -> Self {
        Self {
            rule_id,
            batch: batch.max(1),
            after: None,
            page: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    async fn next(&mut self, store: &dyn AlertStore) -> Result<Option<Alert>> {
        if let Some(alert) = self.page.next() {
            return Ok(Some(alert));
        }
        if self.exhausted {
            return Ok(None);
        }
        let page = store
            .list_observing_session_alerts(self.rule_id, self.after.as_deref(), self.batch)
            .await?;
        self.exhausted = (page.len() as u64) < self.batch;
        if let Some(last) = page.last() {
            self.after = Some(last.alert_id.clone());
        }
        self.page = page.into_iter();
        Ok(self.page.next())
    }
}

/// Confirms session alerts whose observation period is over.
pub struct SessionSweeper {
    store: Arc<dyn AlertStore>,
    strategies: Arc<dyn StrategySource>,
    locks: Arc<FingerprintLocks>,
    config: Arc<EngineConfig>,
}

impl SessionSweeper {
    pub fn new(
        store: Arc<dyn AlertStore>,
        strategies: Arc<dyn StrategySource>,
        locks: Arc<FingerprintLocks>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            strategies,
            locks,
            config,
        }
    }

    /// Confirms every observing session alert that is past its
    /// `session_end_time` or has hit a session cap.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut windows: HashMap<i64, Option<WindowConfig>> = HashMap::new();
        let mut report = SweepReport::default();
        let mut logs = Vec::new();
        let mut pager = ObservingPager::new(None, self.config.batch_size);

        while let Some(alert) = pager.next(self.store.as_ref()).await? {
            report.checked += 1;
            let window = match alert.rule_id {
                Some(id) => match windows.get(&id) {
                    Some(w) => w.clone(),
                    None => {
                        let w = match self.strategies.get(id).await {
                            Ok(s) => s.map(|s| WindowConfig::resolve(&s, &self.config)),
                            Err(e) => {
                                tracing::warn!(strategy_id = id, error = %e, "Failed to load strategy");
                                None
                            }
                        };
                        windows.insert(id, w.clone());
                        w
                    }
                },
                None => None,
            };

            if !session_due(&alert, window.as_ref(), now) {
                continue;
            }

            match self.confirm_one(&alert, Some(window.as_ref()), now, "session expired").await {
                Ok(Some(log)) => {
                    report.transitioned += 1;
                    logs.push(log);
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(alert_id = %alert.alert_id, error = %e, "Session confirm failed");
                }
            }
        }

        if !logs.is_empty() {
            self.store.append_operator_logs(&logs).await?;
        }
        tracing::info!(
            checked = report.checked,
            confirmed = report.transitioned,
            failed = report.failed,
            "Session sweep finished"
        );
        Ok(report)
    }

    /// Confirms all observing alerts of a strategy whose session settings
    /// changed.
    pub async fn confirm_observing_for_strategy(&self, strategy_id: i64) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();
        let mut logs = Vec::new();
        let mut pager = ObservingPager::new(Some(strategy_id), self.config.batch_size);
        while let Some(alert) = pager.next(self.store.as_ref()).await? {
            report.checked += 1;
            match self.confirm_one(&alert, None, now, "strategy changed").await {
                Ok(Some(log)) => {
                    report.transitioned += 1;
                    logs.push(log);
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(alert_id = %alert.alert_id, error = %e, "Session confirm failed");
                }
            }
        }
        if !logs.is_empty() {
            self.store.append_operator_logs(&logs).await?;
        }
        tracing::info!(strategy_id, confirmed = report.transitioned, "Confirmed observing alerts");
        Ok(report)
    }

    /// Closes all observing alerts of a deleted strategy.
    pub async fn close_observing_for_strategy(&self, strategy_id: i64) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut logs = Vec::new();
        let mut pager = ObservingPager::new(Some(strategy_id), self.config.batch_size);
        while let Some(alert) = pager.next(self.store.as_ref()).await? {
            report.checked += 1;
            match self.close_one(&alert).await {
                Ok(Some(log)) => {
                    report.transitioned += 1;
                    logs.push(log);
                }
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(alert_id = %alert.alert_id, error = %e, "Session close failed");
                }
            }
        }
        if !logs.is_empty() {
            self.store.append_operator_logs(&logs).await?;
        }
        tracing::info!(strategy_id, closed = report.transitioned, "Closed observing alerts");
        Ok(report)
    }

    async fn confirm_one(
        &self,
        alert: &Alert,
        recheck: Option<Option<&WindowConfig>>,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<OperatorLog>> {
        let _guard = self.locks.acquire(&alert.fingerprint).await;
        let mut tx = self.store.begin().await?;
        let Some(mut current) = tx.get_for_update(&alert.alert_id).await? else {
            return Err(EngineError::AlertNotFound(alert.alert_id.clone()));
        };
        if !is_observing(&current) {
            return Ok(None);
        }
        // An upsert may have extended the session while we waited.
        if let Some(window) = recheck {
            if !session_due(&current, window, now) {
                return Ok(None);
            }
        }

        current.session_status = Some(SessionStatus::Confirmed);
        current.updated_at = now;
        tx.update_alert(&current, &[AlertField::SessionStatus, AlertField::UpdatedAt])
            .await?;
        tx.commit().await?;

        tracing::info!(
            alert_id = %current.alert_id,
            fingerprint = %current.fingerprint,
            reason,
            "Session alert confirmed"
        );
        Ok(Some(OperatorLog::system(
            "Alert processing-session confirm",
            &current.alert_id,
            format!("Session of alert {} confirmed: {reason}", current.alert_id),
        )))
    }

    async fn close_one(&self, alert: &Alert) -> Result<Option<OperatorLog>> {
        let _guard = self.locks.acquire(&alert.fingerprint).await;
        let mut tx = self.store.begin().await?;
        let Some(mut current) = tx.get_for_update(&alert.alert_id).await? else {
            return Err(EngineError::AlertNotFound(alert.alert_id.clone()));
        };
        if !is_observing(&current) {
            return Ok(None);
        }

        let previous = current.status;
        current.status = AlertStatus::Closed;
        current.session_status = Some(SessionStatus::Recovered);
        current.updated_at = Utc::now();
        tx.update_alert(
            &current,
            &[
                AlertField::Status,
                AlertField::SessionStatus,
                AlertField::UpdatedAt,
            ],
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            alert_id = %current.alert_id,
            previous = %previous,
            "Observing alert closed after strategy removal"
        );
        Ok(Some(OperatorLog::system(
            "Alert processing-session close",
            &current.alert_id,
            format!(
                "Alert {} closed because its strategy was removed (was {previous})",
                current.alert_id
            ),
        )))
    }
}

fn is_observing(alert: &Alert) -> bool {
    alert.status.is_active()
        && alert.is_session_alert
        && alert.session_status == Some(SessionStatus::Observing)
}

fn session_due(alert: &Alert, window: Option<&WindowConfig>, now: DateTime<Utc>) -> bool {
    let expired = alert.session_end_time.is_some_and(|end| now >= end);
    let capped = window.is_some_and(|w| {
        w.session_cap_reached(alert.first_event_time, alert.event_count, now)
    });
    expired || capped
}
