use crate::aggregation::AggregationResult;
use crate::error::Result;
use crate::lock::FingerprintLocks;
use crate::recovery::check_recovery;
use crate::window::WindowConfig;
use crate::{AlertStore, AlertTransaction};
use alarmd_common::types::{
    AlarmStrategy, Alert, AlertField, AlertStatus, OperatorLog, SessionStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const DEFAULT_TITLE: &str = "Aggregated alert";

/// Event ids known to be linked, per alert id. Lives for one scan only.
#[derive(Debug, Default)]
pub struct LinkCache {
    linked: HashMap<String, HashSet<String>>,
}

impl LinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_linked(&self, alert_id: &str, event_id: &str) -> bool {
        self.linked
            .get(alert_id)
            .is_some_and(|ids| ids.contains(event_id))
    }

    pub fn alerts(&self) -> usize {
        self.linked.len()
    }
}

/// Result of one upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub alert: Alert,
    pub created: bool,
    /// Stored level was raised.
    pub escalated: bool,
    /// The alert moved to `auto_recovery` inside this upsert.
    pub recovered: bool,
    /// Audit entry of a recovery, for the caller to append.
    pub log: Option<OperatorLog>,
}

/// Turns aggregation results into alert inserts and updates.
pub struct AlertBuilder {
    store: Arc<dyn AlertStore>,
    locks: Arc<FingerprintLocks>,
}

impl AlertBuilder {
    pub fn new(store: Arc<dyn AlertStore>, locks: Arc<FingerprintLocks>) -> Self {
        Self { store, locks }
    }

    /// Creates or updates the single active alert for `result.fingerprint`.
    ///
    /// The fingerprint guard and the transaction's row lock are both held
    /// until commit, so a concurrent upsert of the same fingerprint waits and
    /// then sees the row written here.
    pub async fn upsert(
        &self,
        result: &AggregationResult,
        strategy: &AlarmStrategy,
        window: &WindowConfig,
        group_by_field: &str,
        cache: &mut LinkCache,
    ) -> Result<UpsertOutcome> {
        let _guard = self.locks.acquire(&result.fingerprint).await;
        let mut tx = self.store.begin().await?;
        let now = Utc::now();

        let mut existing = tx.select_active_for_update(&result.fingerprint).await?;
        let mut outcome = if existing.is_empty() {
            create_alert(tx.as_mut(), result, strategy, window, group_by_field, cache, now).await?
        } else {
            if existing.len() > 1 {
                tracing::warn!(
                    fingerprint = %result.fingerprint,
                    count = existing.len(),
                    "Multiple active alerts share a fingerprint, using the latest"
                );
            }
            existing.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            let alert = existing.swap_remove(0);
            update_alert(tx.as_mut(), alert, result, window, cache, now).await?
        };

        if let Some(log) = check_recovery(tx.as_mut(), &mut outcome.alert, now).await? {
            outcome.recovered = true;
            outcome.log = Some(log);
        }
        tx.commit().await?;
        Ok(outcome)
    }
}

async fn create_alert(
    tx: &mut dyn AlertTransaction,
    result: &AggregationResult,
    strategy: &AlarmStrategy,
    window: &WindowConfig,
    group_by_field: &str,
    cache: &mut LinkCache,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome> {
    let session = window.session_timeout.is_some();
    let mut alert = Alert {
        alert_id: alarmd_common::id::next_alert_id(),
        fingerprint: result.fingerprint.clone(),
        rule_id: Some(strategy.id),
        level: result.level,
        title: if result.title.is_empty() {
            DEFAULT_TITLE.to_string()
        } else {
            result.title.clone()
        },
        content: result.description.clone(),
        status: AlertStatus::Unassigned,
        operate: None,
        first_event_time: result.first_event_time,
        last_event_time: result.last_event_time,
        event_count: 0,
        group_by_field: group_by_field.to_string(),
        is_session_alert: window.is_session(),
        session_status: session.then_some(SessionStatus::Observing),
        session_end_time: window.session_end_time(now),
        team: strategy.dispatch_team.clone(),
        created_at: now,
        updated_at: now,
    };
    tx.insert_alert(&alert).await?;

    let added = tx.link_events(&alert.alert_id, &result.event_ids).await?;
    cache.linked.insert(
        alert.alert_id.clone(),
        result.event_ids.iter().cloned().collect(),
    );
    if added > 0 {
        alert.event_count = added as i64;
        tx.update_alert(&alert, &[AlertField::EventCount]).await?;
    }

    tracing::info!(
        alert_id = %alert.alert_id,
        strategy_id = strategy.id,
        fingerprint = %alert.fingerprint,
        level = alert.level,
        events = added,
        session = alert.is_session_alert,
        "Alert created"
    );
    Ok(UpsertOutcome {
        alert,
        created: true,
        escalated: false,
        recovered: false,
        log: None,
    })
}

async fn update_alert(
    tx: &mut dyn AlertTransaction,
    mut alert: Alert,
    result: &AggregationResult,
    window: &WindowConfig,
    cache: &mut LinkCache,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome> {
    if !cache.linked.contains_key(&alert.alert_id) {
        let known = tx.linked_event_ids(&alert.alert_id).await?;
        cache.linked.insert(alert.alert_id.clone(), known);
    }
    let known = cache.linked.entry(alert.alert_id.clone()).or_default();
    let new_ids: Vec<String> = result
        .event_ids
        .iter()
        .filter(|id| !known.contains(id.as_str()))
        .cloned()
        .collect();

    let added = if new_ids.is_empty() {
        0
    } else {
        let added = tx.link_events(&alert.alert_id, &new_ids).await?;
        known.extend(new_ids);
        added
    };

    let escalated = result.level > alert.level;
    if added == 0 && !escalated {
        return Ok(UpsertOutcome {
            alert,
            created: false,
            escalated: false,
            recovered: false,
            log: None,
        });
    }

    let mut fields = vec![AlertField::LastEventTime, AlertField::Level, AlertField::UpdatedAt];
    if result.last_event_time > alert.last_event_time {
        alert.last_event_time = result.last_event_time;
    }
    if escalated {
        tracing::info!(
            alert_id = %alert.alert_id,
            from = alert.level,
            to = result.level,
            "Alert escalated"
        );
        alert.level = result.level;
    }
    alert.updated_at = now;
    if added > 0 {
        alert.event_count += added as i64;
        fields.push(AlertField::EventCount);
    }

    if added > 0 && alert.is_session_alert && alert.session_status == Some(SessionStatus::Observing) {
        if window.session_cap_reached(alert.first_event_time, alert.event_count, now) {
            alert.session_status = Some(SessionStatus::Confirmed);
            fields.push(AlertField::SessionStatus);
            tracing::info!(
                alert_id = %alert.alert_id,
                events = alert.event_count,
                "Session cap reached, alert confirmed"
            );
        } else if window.extend_on_activity {
            alert.session_end_time = window.session_end_time(now);
            fields.push(AlertField::SessionEndTime);
        }
    }

    tx.update_alert(&alert, &fields).await?;
    tracing::debug!(
        alert_id = %alert.alert_id,
        fingerprint = %alert.fingerprint,
        added,
        level = alert.level,
        "Alert updated"
    );
    Ok(UpsertOutcome {
        alert,
        created: false,
        escalated,
        recovered: false,
        log: None,
    })
}
