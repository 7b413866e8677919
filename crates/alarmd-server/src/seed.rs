use alarmd_common::types::{AlarmStrategy, RawCondition, StrategyParams};
use alarmd_engine::recovery::SessionSweeper;
use alarmd_storage::AlarmStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

// ---- Strategies seed file (used by the `init-strategies` subcommand) ----

#[derive(Debug, Clone, Deserialize)]
pub struct StrategiesSeedFile {
    #[serde(default)]
    pub strategies: Vec<SeedStrategy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedStrategy {
    pub id: i64,
    pub name: String,
    #[serde(default = "default_seed_active")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub match_rules: Vec<Vec<RawCondition>>,
    #[serde(default)]
    pub params: StrategyParams,
    #[serde(default)]
    pub auto_close: bool,
    #[serde(default)]
    pub close_minutes: i64,
    #[serde(default)]
    pub dispatch_team: Vec<i64>,
    /// Removes the strategy instead of storing it.
    #[serde(default)]
    pub deleted: bool,
}

fn default_seed_active() -> bool {
    true
}

impl SeedStrategy {
    pub fn into_strategy(self, now: DateTime<Utc>) -> AlarmStrategy {
        AlarmStrategy {
            id: self.id,
            name: self.name,
            is_active: self.is_active,
            priority: self.priority,
            match_rules: self.match_rules,
            params: self.params,
            auto_close: self.auto_close,
            close_minutes: self.close_minutes,
            dispatch_team: self.dispatch_team,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub sessions_confirmed: usize,
    pub sessions_closed: usize,
}

pub fn load_seed_file(path: &str) -> anyhow::Result<StrategiesSeedFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", path, e))
}

/// Stores every seeded strategy, replacing existing ones with the same id.
///
/// Observing session alerts of a strategy whose params changed are
/// confirmed; those of a deleted strategy are closed.
pub async fn init_strategies(
    store: &AlarmStore,
    sessions: &SessionSweeper,
    seed: StrategiesSeedFile,
) -> anyhow::Result<SeedSummary> {
    let mut existing: HashMap<i64, AlarmStrategy> = store
        .list_strategies()
        .await?
        .into_iter()
        .map(|s| (s.id, s))
        .collect();

    let mut summary = SeedSummary::default();
    let now = Utc::now();

    for entry in seed.strategies {
        let id = entry.id;
        if entry.deleted {
            if store.delete_strategy(id).await? {
                summary.deleted += 1;
                tracing::info!(strategy_id = id, "Strategy deleted");
            }
            existing.remove(&id);
            let report = sessions.close_observing_for_strategy(id).await?;
            summary.sessions_closed += report.transitioned;
            continue;
        }

        let strategy = entry.into_strategy(now);
        let previous = existing.remove(&id);
        store.upsert_strategy(&strategy).await?;

        match previous {
            None => {
                summary.created += 1;
                tracing::info!(strategy_id = id, name = %strategy.name, "Strategy created");
            }
            Some(old) => {
                summary.updated += 1;
                tracing::info!(strategy_id = id, name = %strategy.name, "Strategy updated");
                if serde_json::to_value(&old.params)? != serde_json::to_value(&strategy.params)? {
                    let report = sessions.confirm_observing_for_strategy(id).await?;
                    summary.sessions_confirmed += report.transitioned;
                }
            }
        }
    }

    tracing::info!(
        created = summary.created,
        updated = summary.updated,
        deleted = summary.deleted,
        sessions_confirmed = summary.sessions_confirmed,
        sessions_closed = summary.sessions_closed,
        "init-strategies completed"
    );
    Ok(summary)
}
