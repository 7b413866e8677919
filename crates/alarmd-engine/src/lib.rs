//! Event aggregation and alert lifecycle engine.
//!
//! A scan takes the events that arrived inside a strategy's window, filters
//! them through the compiled match rules ([`matcher::Matcher`]), groups them
//! by the strategy's dimensions ([`aggregation::EventFrame`]) and upserts one
//! alert per fingerprint ([`builder::AlertBuilder`]). Independent sweeps move
//! alerts on to recovered, confirmed or auto-closed states.
//!
//! Persistence and notification are collaborators behind the traits below.
//! With the `memory` feature, `memory::MemoryStore` implements all of them
//! in process.

pub mod aggregation;
pub mod auto_close;
pub mod builder;
pub mod config;
pub mod error;
pub mod lock;
pub mod matcher;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod recovery;
pub mod scheduler;
pub mod window;


use alarmd_common::types::{AlarmStrategy, Alert, AlertField, Event, OperatorLog};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Read model over ingested events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// `created` events with `received_at >= cutoff`, oldest first.
    async fn created_events_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Number of `created` events with `received_at > since`. Backs the
    /// scheduler's skip heuristic, so it should be cheap.
    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64>;

    /// `closed` and `recovery` events with `received_at >= cutoff` that carry
    /// an `external_id`.
    async fn resolution_events_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>>;
}

/// Read model over aggregation strategies.
#[async_trait]
pub trait StrategySource: Send + Sync {
    /// All active strategies.
    async fn list_active(&self) -> Result<Vec<AlarmStrategy>>;

    async fn get(&self, id: i64) -> Result<Option<AlarmStrategy>>;
}

/// Alert persistence.
///
/// All alert mutations go through an [`AlertTransaction`]; the read-only
/// listing methods exist so sweeps can page through candidates without
/// holding locks.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn AlertTransaction>>;

    /// Active alerts ordered by `alert_id`, strictly after `after_id`.
    async fn list_active_alerts(&self, after_id: Option<&str>, limit: u64) -> Result<Vec<Alert>>;

    /// Active session alerts still observing, optionally for one strategy,
    /// ordered by `alert_id` and strictly after `after_id`.
    async fn list_observing_session_alerts(
        &self,
        rule_id: Option<i64>,
        after_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<Alert>>;

    /// `(external_id, alert)` pairs for active alerts linked to a `created`
    /// event carrying one of `external_ids`.
    async fn active_alerts_by_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<(String, Alert)>>;

    async fn append_operator_logs(&self, logs: &[OperatorLog]) -> Result<()>;
}

/// A write transaction over alerts and their event links.
///
/// Dropping a transaction without calling [`commit`](Self::commit) discards
/// every write made through it.
#[async_trait]
pub trait AlertTransaction: Send {
    /// Active alerts with this fingerprint, exclusively locked until the
    /// transaction ends.
    async fn select_active_for_update(&mut self, fingerprint: &str) -> Result<Vec<Alert>>;

    async fn get_for_update(&mut self, alert_id: &str) -> Result<Option<Alert>>;

    async fn insert_alert(&mut self, alert: &Alert) -> Result<()>;

    /// Writes back only the listed columns.
    async fn update_alert(&mut self, alert: &Alert, fields: &[AlertField]) -> Result<()>;

    async fn linked_event_ids(&mut self, alert_id: &str) -> Result<HashSet<String>>;

    async fn linked_events(&mut self, alert_id: &str) -> Result<Vec<Event>>;

    /// Adds links that do not exist yet and returns how many were added.
    async fn link_events(&mut self, alert_id: &str, event_ids: &[String]) -> Result<usize>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Notification dispatch for newly created or escalated alerts.
///
/// Called fire-and-forget; an error is logged and never fails a scan.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert, strategy: &AlarmStrategy) -> Result<()>;
}
