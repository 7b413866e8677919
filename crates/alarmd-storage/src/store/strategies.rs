use alarmd_common::types::AlarmStrategy;
use alarmd_engine::StrategySource;
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, ColumnTrait, EntityTrait, Order, QueryFilter, QueryOrder};

use crate::entities::alarm_strategy::{self, Column, Entity};
use crate::error::Result;
use crate::store::AlarmStore;

fn to_strategy(m: alarm_strategy::Model) -> Result<AlarmStrategy> {
    Ok(AlarmStrategy {
        match_rules: serde_json::from_str(&m.match_rules)?,
        params: serde_json::from_str(&m.params)?,
        dispatch_team: serde_json::from_str(&m.dispatch_team)?,
        id: m.id,
        name: m.name,
        is_active: m.is_active,
        priority: m.priority,
        auto_close: m.auto_close,
        close_minutes: m.close_minutes,
        updated_at: m.updated_at.with_timezone(&Utc),
    })
}

impl AlarmStore {
    /// Inserts the strategy, or overwrites every column of an existing one
    /// with the same id.
    pub async fn upsert_strategy(&self, s: &AlarmStrategy) -> Result<()> {
        let am = alarm_strategy::ActiveModel {
            id: Set(s.id),
            name: Set(s.name.clone()),
            is_active: Set(s.is_active),
            priority: Set(s.priority),
            match_rules: Set(serde_json::to_string(&s.match_rules)?),
            params: Set(serde_json::to_string(&s.params)?),
            auto_close: Set(s.auto_close),
            close_minutes: Set(s.close_minutes),
            dispatch_team: Set(serde_json::to_string(&s.dispatch_team)?),
            updated_at: Set(s.updated_at.fixed_offset()),
        };
        let _permit = self.write_permit().await;
        Entity::insert(am)
            .on_conflict(
                OnConflict::column(Column::Id)
                    .update_columns([
                        Column::Name,
                        Column::IsActive,
                        Column::Priority,
                        Column::MatchRules,
                        Column::Params,
                        Column::AutoClose,
                        Column::CloseMinutes,
                        Column::DispatchTeam,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.db())
            .await?;
        tracing::debug!(strategy_id = s.id, name = %s.name, "Strategy stored");
        Ok(())
    }

    /// Returns true if a row was removed.
    pub async fn delete_strategy(&self, id: i64) -> Result<bool> {
        let _permit = self.write_permit().await;
        let res = Entity::delete_by_id(id).exec(self.db()).await?;
        Ok(res.rows_affected > 0)
    }

    pub async fn list_strategies(&self) -> Result<Vec<AlarmStrategy>> {
        let rows = Entity::find()
            .order_by(Column::Id, Order::Asc)
            .all(self.db())
            .await?;
        rows.into_iter().map(to_strategy).collect()
    }
}

#[async_trait]
impl StrategySource for AlarmStore {
    async fn list_active(&self) -> anyhow::Result<Vec<AlarmStrategy>> {
        let rows = Entity::find()
            .filter(Column::IsActive.eq(true))
            .order_by(Column::Priority, Order::Desc)
            .all(self.db())
            .await?;
        Ok(rows
            .into_iter()
            .map(to_strategy)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<AlarmStrategy>> {
        Ok(Entity::find_by_id(id)
            .one(self.db())
            .await?
            .map(to_strategy)
            .transpose()?)
    }
}
