use alarmd_common::types::{
    Alert, AlertField, AlertStatus, Event, EventAction, LogAction, OperatorLog, SessionStatus,
};
use alarmd_engine::{AlertStore, AlertTransaction};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait,
    ActiveValue::{Set, Unchanged},
    ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseTransaction, EntityTrait, Order,
    QueryFilter, QueryOrder, QuerySelect, Select, TransactionTrait,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::OwnedMutexGuard;

use crate::entities::{alert, alert_event, event, operator_log};
use crate::error::{Result, StorageError};
use crate::store::events::to_event;
use crate::store::{parse_column, AlarmStore, IN_CHUNK};

fn active_statuses() -> Vec<&'static str> {
    AlertStatus::ACTIVE.iter().map(|s| s.as_str()).collect()
}

pub(crate) fn to_alert(m: alert::Model) -> Result<Alert> {
    Ok(Alert {
        status: parse_column("status", &m.status)?,
        operate: m
            .operate
            .as_deref()
            .map(|v| parse_column("operate", v))
            .transpose()?,
        session_status: m
            .session_status
            .as_deref()
            .map(|v| parse_column::<SessionStatus>("session_status", v))
            .transpose()?,
        team: serde_json::from_str(&m.team)?,
        alert_id: m.alert_id,
        fingerprint: m.fingerprint,
        rule_id: m.rule_id,
        level: m.level,
        title: m.title,
        content: m.content,
        first_event_time: m.first_event_time.with_timezone(&Utc),
        last_event_time: m.last_event_time.with_timezone(&Utc),
        event_count: m.event_count,
        group_by_field: m.group_by_field,
        is_session_alert: m.is_session_alert,
        session_end_time: m.session_end_time.map(|t| t.with_timezone(&Utc)),
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
    })
}

fn to_active_model(a: &Alert) -> Result<alert::ActiveModel> {
    Ok(alert::ActiveModel {
        alert_id: Set(a.alert_id.clone()),
        fingerprint: Set(a.fingerprint.clone()),
        rule_id: Set(a.rule_id),
        level: Set(a.level),
        title: Set(a.title.clone()),
        content: Set(a.content.clone()),
        status: Set(a.status.as_str().to_string()),
        operate: Set(a.operate.map(|o| o.as_str().to_string())),
        first_event_time: Set(a.first_event_time.fixed_offset()),
        last_event_time: Set(a.last_event_time.fixed_offset()),
        event_count: Set(a.event_count),
        group_by_field: Set(a.group_by_field.clone()),
        is_session_alert: Set(a.is_session_alert),
        session_status: Set(a.session_status.map(|s| s.as_str().to_string())),
        session_end_time: Set(a.session_end_time.map(|t| t.fixed_offset())),
        team: Set(serde_json::to_string(&a.team)?),
        created_at: Set(a.created_at.fixed_offset()),
        updated_at: Set(a.updated_at.fixed_offset()),
    })
}

fn into_alerts(models: Vec<alert::Model>) -> Result<Vec<Alert>> {
    models.into_iter().map(to_alert).collect()
}

fn to_log_model(log: &OperatorLog) -> operator_log::ActiveModel {
    operator_log::ActiveModel {
        id: Set(log.id.clone()),
        action: Set(log.action.as_str().to_string()),
        target_type: Set(log.target_type.clone()),
        operator: Set(log.operator.clone()),
        operator_object: Set(log.operator_object.clone()),
        target_id: Set(log.target_id.clone()),
        overview: Set(log.overview.clone()),
        created_at: Set(log.created_at.fixed_offset()),
    }
}

fn to_log(m: operator_log::Model) -> Result<OperatorLog> {
    Ok(OperatorLog {
        action: parse_column::<LogAction>("action", &m.action)?,
        id: m.id,
        target_type: m.target_type,
        operator: m.operator,
        operator_object: m.operator_object,
        target_id: m.target_id,
        overview: m.overview,
        created_at: m.created_at.with_timezone(&Utc),
    })
}

impl AlarmStore {
    pub async fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        alert::Entity::find_by_id(alert_id)
            .one(self.db())
            .await?
            .map(to_alert)
            .transpose()
    }

    pub async fn list_alerts_by_fingerprint(&self, fingerprint: &str) -> Result<Vec<Alert>> {
        let rows = alert::Entity::find()
            .filter(alert::Column::Fingerprint.eq(fingerprint))
            .order_by(alert::Column::CreatedAt, Order::Asc)
            .all(self.db())
            .await?;
        into_alerts(rows)
    }

    pub async fn linked_event_ids(&self, alert_id: &str) -> Result<Vec<String>> {
        Ok(alert_event::Entity::find()
            .select_only()
            .column(alert_event::Column::EventId)
            .filter(alert_event::Column::AlertId.eq(alert_id))
            .order_by(alert_event::Column::EventId, Order::Asc)
            .into_tuple::<String>()
            .all(self.db())
            .await?)
    }

    /// Audit entries written for one alert, oldest first.
    pub async fn operator_logs_for(&self, alert_id: &str) -> Result<Vec<OperatorLog>> {
        let rows = operator_log::Entity::find()
            .filter(operator_log::Column::TargetId.eq(alert_id))
            .order_by(operator_log::Column::CreatedAt, Order::Asc)
            .all(self.db())
            .await?;
        rows.into_iter().map(to_log).collect()
    }
}

#[async_trait]
impl AlertStore for AlarmStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn AlertTransaction>> {
        let permit = self.write_permit().await;
        let txn = self.db().begin().await?;
        Ok(Box::new(SeaAlertTransaction {
            txn,
            _permit: permit,
        }))
    }

    async fn list_active_alerts(
        &self,
        after_id: Option<&str>,
        limit: u64,
    ) -> anyhow::Result<Vec<Alert>> {
        let mut q = alert::Entity::find().filter(alert::Column::Status.is_in(active_statuses()));
        if let Some(after) = after_id {
            q = q.filter(alert::Column::AlertId.gt(after));
        }
        let rows = q
            .order_by(alert::Column::AlertId, Order::Asc)
            .limit(limit)
            .all(self.db())
            .await?;
        Ok(into_alerts(rows)?)
    }

    async fn list_observing_session_alerts(
        &self,
        rule_id: Option<i64>,
        after_id: Option<&str>,
        limit: u64,
    ) -> anyhow::Result<Vec<Alert>> {
        let mut q = alert::Entity::find()
            .filter(alert::Column::Status.is_in(active_statuses()))
            .filter(alert::Column::IsSessionAlert.eq(true))
            .filter(alert::Column::SessionStatus.eq(SessionStatus::Observing.as_str()));
        if let Some(id) = rule_id {
            q = q.filter(alert::Column::RuleId.eq(id));
        }
        if let Some(after) = after_id {
            q = q.filter(alert::Column::AlertId.gt(after));
        }
        let rows = q
            .order_by(alert::Column::AlertId, Order::Asc)
            .limit(limit)
            .all(self.db())
            .await?;
        Ok(into_alerts(rows)?)
    }

    async fn active_alerts_by_external_ids(
        &self,
        external_ids: &[String],
    ) -> anyhow::Result<Vec<(String, Alert)>> {
        let mut pairs = Vec::new();
        let mut seen = HashSet::new();

        for chunk in external_ids.chunks(IN_CHUNK) {
            let created: Vec<(String, Option<String>)> = event::Entity::find()
                .select_only()
                .column(event::Column::EventId)
                .column(event::Column::ExternalId)
                .filter(event::Column::ExternalId.is_in(chunk.iter().cloned()))
                .filter(event::Column::Action.eq(EventAction::Created.as_str()))
                .into_tuple()
                .all(self.db())
                .await?;
            let ext_by_event: HashMap<String, String> = created
                .into_iter()
                .filter_map(|(id, ext)| ext.map(|ext| (id, ext)))
                .collect();
            if ext_by_event.is_empty() {
                continue;
            }

            let event_ids: Vec<String> = ext_by_event.keys().cloned().collect();
            let mut links: Vec<(String, String)> = Vec::new();
            for ids in event_ids.chunks(IN_CHUNK) {
                let rows: Vec<(String, String)> = alert_event::Entity::find()
                    .select_only()
                    .column(alert_event::Column::AlertId)
                    .column(alert_event::Column::EventId)
                    .filter(alert_event::Column::EventId.is_in(ids.iter().cloned()))
                    .into_tuple()
                    .all(self.db())
                    .await?;
                links.extend(rows);
            }

            let alert_ids: Vec<String> = links
                .iter()
                .map(|(a, _)| a.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            let mut alerts: HashMap<String, Alert> = HashMap::new();
            for ids in alert_ids.chunks(IN_CHUNK) {
                let rows = alert::Entity::find()
                    .filter(alert::Column::AlertId.is_in(ids.iter().cloned()))
                    .filter(alert::Column::Status.is_in(active_statuses()))
                    .all(self.db())
                    .await?;
                for a in into_alerts(rows)? {
                    alerts.insert(a.alert_id.clone(), a);
                }
            }

            for (alert_id, event_id) in links {
                let (Some(alert), Some(ext)) = (alerts.get(&alert_id), ext_by_event.get(&event_id))
                else {
                    continue;
                };
                if seen.insert((ext.clone(), alert_id)) {
                    pairs.push((ext.clone(), alert.clone()));
                }
            }
        }
        Ok(pairs)
    }

    async fn append_operator_logs(&self, logs: &[OperatorLog]) -> anyhow::Result<()> {
        let _permit = self.write_permit().await;
        for chunk in logs.chunks(IN_CHUNK) {
            operator_log::Entity::insert_many(chunk.iter().map(to_log_model))
                .exec_without_returning(self.db())
                .await?;
        }
        Ok(())
    }
}

/// Alert mutations inside one database transaction. Dropping it without
/// `commit` rolls back.
pub struct SeaAlertTransaction {
    txn: DatabaseTransaction,
    // Declared after `txn` so the rollback is queued before the gate opens.
    _permit: Option<OwnedMutexGuard<()>>,
}

impl SeaAlertTransaction {
    /// `FOR UPDATE` on backends that have row locks.
    fn locked(&self, select: Select<alert::Entity>) -> Select<alert::Entity> {
        if self.txn.get_database_backend() == DatabaseBackend::Sqlite {
            select
        } else {
            select.lock_exclusive()
        }
    }

    async fn require_alert(&self, alert_id: &str) -> Result<()> {
        let found = alert::Entity::find_by_id(alert_id)
            .select_only()
            .column(alert::Column::AlertId)
            .into_tuple::<String>()
            .one(&self.txn)
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound {
                entity: "alert",
                id: alert_id.to_string(),
            }),
        }
    }
}

#[async_trait]
impl AlertTransaction for SeaAlertTransaction {
    async fn select_active_for_update(&mut self, fingerprint: &str) -> anyhow::Result<Vec<Alert>> {
        let q = alert::Entity::find()
            .filter(alert::Column::Fingerprint.eq(fingerprint))
            .filter(alert::Column::Status.is_in(active_statuses()));
        let rows = self.locked(q).all(&self.txn).await?;
        Ok(into_alerts(rows)?)
    }

    async fn get_for_update(&mut self, alert_id: &str) -> anyhow::Result<Option<Alert>> {
        let q = alert::Entity::find_by_id(alert_id);
        let row = self.locked(q).one(&self.txn).await?;
        Ok(row.map(to_alert).transpose()?)
    }

    async fn insert_alert(&mut self, alert: &Alert) -> anyhow::Result<()> {
        alert::Entity::insert(to_active_model(alert)?)
            .exec_without_returning(&self.txn)
            .await?;
        Ok(())
    }

    async fn update_alert(&mut self, a: &Alert, fields: &[AlertField]) -> anyhow::Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut am = alert::ActiveModel {
            alert_id: Unchanged(a.alert_id.clone()),
            ..Default::default()
        };
        for field in fields {
            match field {
                AlertField::Level => am.level = Set(a.level),
                AlertField::LastEventTime => {
                    am.last_event_time = Set(a.last_event_time.fixed_offset())
                }
                AlertField::EventCount => am.event_count = Set(a.event_count),
                AlertField::Status => am.status = Set(a.status.as_str().to_string()),
                AlertField::Operate => {
                    am.operate = Set(a.operate.map(|o| o.as_str().to_string()))
                }
                AlertField::SessionStatus => {
                    am.session_status = Set(a.session_status.map(|s| s.as_str().to_string()))
                }
                AlertField::SessionEndTime => {
                    am.session_end_time = Set(a.session_end_time.map(|t| t.fixed_offset()))
                }
                AlertField::UpdatedAt => am.updated_at = Set(a.updated_at.fixed_offset()),
            }
        }
        am.update(&self.txn).await?;
        Ok(())
    }

    async fn linked_event_ids(&mut self, alert_id: &str) -> anyhow::Result<HashSet<String>> {
        let ids: Vec<String> = alert_event::Entity::find()
            .select_only()
            .column(alert_event::Column::EventId)
            .filter(alert_event::Column::AlertId.eq(alert_id))
            .into_tuple()
            .all(&self.txn)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn linked_events(&mut self, alert_id: &str) -> anyhow::Result<Vec<Event>> {
        let ids: Vec<String> = self.linked_event_ids(alert_id).await?.into_iter().collect();
        let mut events = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let rows = event::Entity::find()
                .filter(event::Column::EventId.is_in(chunk.iter().cloned()))
                .all(&self.txn)
                .await?;
            for row in rows {
                events.push(to_event(row)?);
            }
        }
        events.sort_by_key(|e| e.received_at);
        Ok(events)
    }

    async fn link_events(&mut self, alert_id: &str, event_ids: &[String]) -> anyhow::Result<usize> {
        self.require_alert(alert_id).await?;
        let now = Utc::now().fixed_offset();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut added = 0;

        for chunk in event_ids.chunks(IN_CHUNK) {
            let known: HashSet<String> = event::Entity::find()
                .select_only()
                .column(event::Column::EventId)
                .filter(event::Column::EventId.is_in(chunk.iter().cloned()))
                .into_tuple::<String>()
                .all(&self.txn)
                .await?
                .into_iter()
                .collect();
            if known.is_empty() {
                continue;
            }
            let linked: HashSet<String> = alert_event::Entity::find()
                .select_only()
                .column(alert_event::Column::EventId)
                .filter(alert_event::Column::AlertId.eq(alert_id))
                .filter(alert_event::Column::EventId.is_in(known.iter().cloned()))
                .into_tuple::<String>()
                .all(&self.txn)
                .await?
                .into_iter()
                .collect();

            let fresh: Vec<alert_event::ActiveModel> = chunk
                .iter()
                .filter(|id| known.contains(id.as_str()) && !linked.contains(id.as_str()))
                .filter(|id| seen.insert(id.as_str()))
                .map(|id| alert_event::ActiveModel {
                    alert_id: Set(alert_id.to_string()),
                    event_id: Set(id.clone()),
                    created_at: Set(now),
                })
                .collect();
            if fresh.is_empty() {
                continue;
            }
            added += fresh.len();
            alert_event::Entity::insert_many(fresh)
                .exec_without_returning(&self.txn)
                .await?;
        }
        Ok(added)
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.txn.commit().await?;
        Ok(())
    }
}
