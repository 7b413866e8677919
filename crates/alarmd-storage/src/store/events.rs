use alarmd_common::types::{Event, EventAction};
use alarmd_engine::EventSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, EntityTrait, Order, PaginatorTrait, QueryFilter, QueryOrder,
};

use crate::entities::event::{self, Column, Entity};
use crate::error::Result;
use crate::store::{parse_column, AlarmStore};

pub(crate) fn to_event(m: event::Model) -> Result<Event> {
    Ok(Event {
        action: parse_column("action", &m.action)?,
        labels: serde_json::from_str(&m.labels)?,
        tags: serde_json::from_str(&m.tags)?,
        event_id: m.event_id,
        external_id: m.external_id,
        title: m.title,
        description: m.description,
        level: m.level,
        service: m.service,
        location: m.location,
        resource_id: m.resource_id,
        resource_name: m.resource_name,
        resource_type: m.resource_type,
        event_type: m.event_type,
        item: m.item,
        source: m.source,
        received_at: m.received_at.with_timezone(&Utc),
    })
}

fn to_active_model(e: &Event) -> Result<event::ActiveModel> {
    Ok(event::ActiveModel {
        event_id: Set(e.event_id.clone()),
        external_id: Set(e.external_id.clone()),
        title: Set(e.title.clone()),
        description: Set(e.description.clone()),
        level: Set(e.level),
        service: Set(e.service.clone()),
        location: Set(e.location.clone()),
        resource_id: Set(e.resource_id.clone()),
        resource_name: Set(e.resource_name.clone()),
        resource_type: Set(e.resource_type.clone()),
        event_type: Set(e.event_type.clone()),
        item: Set(e.item.clone()),
        source: Set(e.source.clone()),
        labels: Set(serde_json::to_string(&e.labels)?),
        tags: Set(serde_json::to_string(&e.tags)?),
        received_at: Set(e.received_at.fixed_offset()),
        action: Set(e.action.as_str().to_string()),
    })
}

fn into_events(models: Vec<event::Model>) -> Result<Vec<Event>> {
    models.into_iter().map(to_event).collect()
}

impl AlarmStore {
    /// Stores events; ids that already exist are skipped. Returns the number
    /// of rows written.
    pub async fn insert_events(&self, events: &[Event]) -> Result<u64> {
        let _permit = self.write_permit().await;
        let mut written = 0;
        for chunk in events.chunks(super::IN_CHUNK) {
            let models = chunk
                .iter()
                .map(to_active_model)
                .collect::<Result<Vec<_>>>()?;
            written += Entity::insert_many(models)
                .on_conflict(OnConflict::column(Column::EventId).do_nothing().to_owned())
                .exec_without_returning(self.db())
                .await?;
        }
        Ok(written)
    }

    pub async fn insert_event(&self, event: &Event) -> Result<bool> {
        Ok(self.insert_events(std::slice::from_ref(event)).await? > 0)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<Event>> {
        Entity::find_by_id(event_id)
            .one(self.db())
            .await?
            .map(to_event)
            .transpose()
    }
}

#[async_trait]
impl EventSource for AlarmStore {
    async fn created_events_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<Event>> {
        let rows = Entity::find()
            .filter(Column::Action.eq(EventAction::Created.as_str()))
            .filter(Column::ReceivedAt.gte(cutoff.fixed_offset()))
            .order_by(Column::ReceivedAt, Order::Asc)
            .all(self.db())
            .await?;
        Ok(into_events(rows)?)
    }

    async fn count_created_since(&self, since: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(Entity::find()
            .filter(Column::Action.eq(EventAction::Created.as_str()))
            .filter(Column::ReceivedAt.gt(since.fixed_offset()))
            .count(self.db())
            .await?)
    }

    async fn resolution_events_since(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<Event>> {
        let rows = Entity::find()
            .filter(Column::Action.is_in([
                EventAction::Closed.as_str(),
                EventAction::Recovery.as_str(),
            ]))
            .filter(Column::ExternalId.is_not_null())
            .filter(Column::ReceivedAt.gte(cutoff.fixed_offset()))
            .order_by(Column::ReceivedAt, Order::Asc)
            .all(self.db())
            .await?;
        Ok(into_events(rows)?)
    }
}
