//! In-process implementation of every collaborator trait.
//!
//! A transaction takes the store's write lock and works on a private copy of
//! the state; `commit` swaps the copy in, dropping the transaction discards
//! it. Writers are therefore fully serialized, which is stricter than a row
//! lock but satisfies the same contract.

use crate::{AlertStore, AlertTransaction, EventSource, StrategySource};
use alarmd_common::types::{
    AlarmStrategy, Alert, AlertField, Event, EventAction, OperatorLog, SessionStatus,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct State {
    events: BTreeMap<String, Event>,
    strategies: BTreeMap<i64, AlarmStrategy>,
    alerts: BTreeMap<String, Alert>,
    links: BTreeMap<String, BTreeSet<String>>,
    logs: Vec<OperatorLog>,
}

impl State {
    fn linked_events(&self, alert_id: &str) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .links
            .get(alert_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.events.get(id).cloned())
            .collect();
        events.sort_by_key(|e| e.received_at);
        events
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_event(&self, event: Event) {
        let mut state = self.state.lock().await;
        state.events.insert(event.event_id.clone(), event);
    }

    pub async fn upsert_strategy(&self, strategy: AlarmStrategy) {
        let mut state = self.state.lock().await;
        state.strategies.insert(strategy.id, strategy);
    }

    pub async fn remove_strategy(&self, id: i64) -> Option<AlarmStrategy> {
        let mut state = self.state.lock().await;
        state.strategies.remove(&id)
    }

    /// Every stored alert, in alert id order.
    pub async fn alerts(&self) -> Vec<Alert> {
        let state = self.state.lock().await;
        state.alerts.values().cloned().collect()
    }

    pub async fn alert(&self, alert_id: &str) -> Option<Alert> {
        let state = self.state.lock().await;
        state.alerts.get(alert_id).cloned()
    }

    pub async fn linked_event_ids(&self, alert_id: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .links
            .get(alert_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn operator_logs(&self) -> Vec<OperatorLog> {
        let state = self.state.lock().await;
        state.logs.clone()
    }

    /// Overwrites an alert as is; for seeding and fixture changes.
    pub async fn put_alert(&self, alert: Alert) {
        let mut state = self.state.lock().await;
        state.alerts.insert(alert.alert_id.clone(), alert);
    }
}

#[async_trait]
impl EventSource for MemoryStore {
    async fn created_events_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.action == EventAction::Created && e.received_at >= cutoff)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.received_at);
        Ok(events)
    }

    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .values()
            .filter(|e| e.action == EventAction::Created && e.received_at > since)
            .count() as u64)
    }

    async fn resolution_events_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Event>> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| {
                e.action.is_resolution() && e.external_id.is_some() && e.received_at >= cutoff
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.received_at);
        Ok(events)
    }
}

#[async_trait]
impl StrategySource for MemoryStore {
    async fn list_active(&self) -> Result<Vec<AlarmStrategy>> {
        let state = self.state.lock().await;
        Ok(state
            .strategies
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn get(&self, id: i64) -> Result<Option<AlarmStrategy>> {
        let state = self.state.lock().await;
        Ok(state.strategies.get(&id).cloned())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn AlertTransaction>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, staged }))
    }

    async fn list_active_alerts(&self, after_id: Option<&str>, limit: u64) -> Result<Vec<Alert>> {
        let state = self.state.lock().await;
        Ok(state
            .alerts
            .values()
            .filter(|a| a.status.is_active())
            .filter(|a| after_id.map_or(true, |after| a.alert_id.as_str() > after))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_observing_session_alerts(
        &self,
        rule_id: Option<i64>,
        after_id: Option<&str>,
        limit: u64,
    ) -> Result<Vec<Alert>> {
        let state = self.state.lock().await;
        Ok(state
            .alerts
            .values()
            .filter(|a| {
                a.status.is_active()
                    && a.is_session_alert
                    && a.session_status == Some(SessionStatus::Observing)
                    && rule_id.map_or(true, |id| a.rule_id == Some(id))
            })
            .filter(|a| after_id.map_or(true, |after| a.alert_id.as_str() > after))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn active_alerts_by_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<(String, Alert)>> {
        let wanted: HashSet<&str> = external_ids.iter().map(String::as_str).collect();
        let state = self.state.lock().await;
        let mut pairs = Vec::new();
        for alert in state.alerts.values().filter(|a| a.status.is_active()) {
            let mut seen = HashSet::new();
            for event in state.linked_events(&alert.alert_id) {
                if event.action != EventAction::Created {
                    continue;
                }
                if let Some(ext) = event.external_id {
                    if wanted.contains(ext.as_str()) && seen.insert(ext.clone()) {
                        pairs.push((ext, alert.clone()));
                    }
                }
            }
        }
        Ok(pairs)
    }

    async fn append_operator_logs(&self, logs: &[OperatorLog]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.logs.extend_from_slice(logs);
        Ok(())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    staged: State,
}

#[async_trait]
impl AlertTransaction for MemoryTransaction {
    async fn select_active_for_update(&mut self, fingerprint: &str) -> Result<Vec<Alert>> {
        Ok(self
            .staged
            .alerts
            .values()
            .filter(|a| a.fingerprint == fingerprint && a.status.is_active())
            .cloned()
            .collect())
    }

    async fn get_for_update(&mut self, alert_id: &str) -> Result<Option<Alert>> {
        Ok(self.staged.alerts.get(alert_id).cloned())
    }

    async fn insert_alert(&mut self, alert: &Alert) -> Result<()> {
        if self.staged.alerts.contains_key(&alert.alert_id) {
            bail!("alert {} already exists", alert.alert_id);
        }
        self.staged
            .alerts
            .insert(alert.alert_id.clone(), alert.clone());
        Ok(())
    }

    async fn update_alert(&mut self, alert: &Alert, fields: &[AlertField]) -> Result<()> {
        let Some(stored) = self.staged.alerts.get_mut(&alert.alert_id) else {
            bail!("alert {} not found", alert.alert_id);
        };
        for field in fields {
            match field {
                AlertField::Level => stored.level = alert.level,
                AlertField::LastEventTime => stored.last_event_time = alert.last_event_time,
                AlertField::EventCount => stored.event_count = alert.event_count,
                AlertField::Status => stored.status = alert.status,
                AlertField::Operate => stored.operate = alert.operate,
                AlertField::SessionStatus => stored.session_status = alert.session_status,
                AlertField::SessionEndTime => stored.session_end_time = alert.session_end_time,
                AlertField::UpdatedAt => stored.updated_at = alert.updated_at,
            }
        }
        Ok(())
    }

    async fn linked_event_ids(&mut self, alert_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .staged
            .links
            .get(alert_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn linked_events(&mut self, alert_id: &str) -> Result<Vec<Event>> {
        Ok(self.staged.linked_events(alert_id))
    }

    async fn link_events(&mut self, alert_id: &str, event_ids: &[String]) -> Result<usize> {
        if !self.staged.alerts.contains_key(alert_id) {
            bail!("alert {alert_id} not found");
        }
        let known: Vec<String> = event_ids
            .iter()
            .filter(|id| self.staged.events.contains_key(id.as_str()))
            .cloned()
            .collect();
        let links = self.staged.links.entry(alert_id.to_string()).or_default();
        Ok(known
            .into_iter()
            .filter(|id| links.insert(id.clone()))
            .count())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}
