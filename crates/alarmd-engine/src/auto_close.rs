use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lock::FingerprintLocks;
use crate::recovery::SweepReport;
use crate::{AlertStore, StrategySource};
use alarmd_common::types::{
    AlarmStrategy, Alert, AlertField, AlertOperate, AlertStatus, OperatorLog, SessionStatus,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Closes active alerts that have been quiet for their strategy's
/// `close_minutes`.
pub struct AutoCloser {
    store: Arc<dyn AlertStore>,
    strategies: Arc<dyn StrategySource>,
    locks: Arc<FingerprintLocks>,
    config: Arc<EngineConfig>,
}

/// Whether `alert` is due for auto-close at `now` under `strategy`.
///
/// Session alerts are only eligible once confirmed.
pub fn should_auto_close(alert: &Alert, strategy: &AlarmStrategy, now: DateTime<Utc>) -> bool {
    if !alert.status.is_active() || !strategy.auto_close || strategy.close_minutes <= 0 {
        return false;
    }
    if alert.is_session_alert && alert.session_status != Some(SessionStatus::Confirmed) {
        return false;
    }
    now >= alert.last_event_time + Duration::minutes(strategy.close_minutes)
}

impl AutoCloser {
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

    /// One pass over all active alerts, paged by alert id.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let strategies: HashMap<i64, AlarmStrategy> = self
            .strategies
            .list_active()
            .await?
            .into_iter()
            .filter(|s| s.auto_close && s.close_minutes > 0)
            .map(|s| (s.id, s))
            .collect();

        let mut report = SweepReport::default();
        if strategies.is_empty() {
            tracing::debug!("No strategy with auto-close enabled");
            return Ok(report);
        }

        let batch = self.config.batch_size.max(1);
        let mut logs = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .store
                .list_active_alerts(after.as_deref(), batch)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.alert_id.clone());
            let page_len = page.len();

            for alert in page {
                report.checked += 1;
                let Some(strategy) = alert.rule_id.and_then(|id| strategies.get(&id)) else {
                    continue;
                };
                if !should_auto_close(&alert, strategy, now) {
                    continue;
                }
                match self.close_one(&alert, strategy, now).await {
                    Ok(Some(log)) => {
                        report.transitioned += 1;
                        logs.push(log);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(alert_id = %alert.alert_id, error = %e, "Auto-close failed");
                    }
                }
            }

            if (page_len as u64) < batch {
                break;
            }
        }

        if !logs.is_empty() {
            self.store.append_operator_logs(&logs).await?;
        }
        tracing::info!(
            checked = report.checked,
            closed = report.transitioned,
            failed = report.failed,
            "Auto-close sweep finished"
        );
        Ok(report)
    }

    async fn close_one(
        &self,
        alert: &Alert,
        strategy: &AlarmStrategy,
        now: DateTime<Utc>,
    ) -> Result<Option<OperatorLog>> {
        let _guard = self.locks.acquire(&alert.fingerprint).await;
        let mut tx = self.store.begin().await?;
        let Some(mut current) = tx.get_for_update(&alert.alert_id).await? else {
            return Err(EngineError::AlertNotFound(alert.alert_id.clone()));
        };
        // Re-check under the lock: an upsert may have bumped last_event_time.
        if !should_auto_close(&current, strategy, now) {
            return Ok(None);
        }

        current.status = AlertStatus::AutoClose;
        current.operate = Some(AlertOperate::Close);
        current.updated_at = now;
        tx.update_alert(
            &current,
            &[AlertField::Status, AlertField::Operate, AlertField::UpdatedAt],
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            alert_id = %current.alert_id,
            strategy_id = strategy.id,
            close_minutes = strategy.close_minutes,
            "Alert auto-closed"
        );
        Ok(Some(OperatorLog::system(
            "Alert processing-auto close",
            &current.alert_id,
            format!(
                "Alert {} auto-closed after {} minutes without new events",
                current.alert_id, strategy.close_minutes
            ),
        )))
    }
}
