use crate::channels::WebhookChannel;
use crate::config::NotificationConfig;
use crate::error::Result;
use crate::routing::ChannelRoute;
use crate::NotificationChannel;
use alarmd_common::types::{AlarmStrategy, Alert};
use alarmd_engine::AlertNotifier;
use async_trait::async_trait;
use std::time::Duration;

/// Delivery counts of one alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

pub struct NotificationManager {
    channels: Vec<Box<dyn NotificationChannel>>,
    routes: Vec<ChannelRoute>,
}

impl NotificationManager {
    pub fn new(channels: Vec<Box<dyn NotificationChannel>>, routes: Vec<ChannelRoute>) -> Self {
        Self { channels, routes }
    }

    /// One webhook channel and route per configured target.
    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        let mut channels: Vec<Box<dyn NotificationChannel>> = Vec::new();
        let mut routes = Vec::new();
        for target in &config.webhooks {
            let channel = WebhookChannel::new(
                &target.name,
                &target.url,
                target.body_template.clone(),
                Duration::from_secs(target.timeout_secs.max(1)),
            )?;
            routes.push(ChannelRoute {
                min_level: target.min_level,
                strategy_ids: target.strategy_ids.clone(),
                channel_index: channels.len(),
            });
            channels.push(Box::new(channel));
        }
        tracing::info!(channels = channels.len(), "Notification channels configured");
        Ok(Self::new(channels, routes))
    }

    /// Sends `alert` through every channel whose route accepts it. A failing
    /// channel does not stop the others.
    pub async fn send_to_channels(&self, alert: &Alert, strategy: &AlarmStrategy) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for route in &self.routes {
            if !route.should_send(alert.level, strategy.id) {
                continue;
            }
            let Some(channel) = self.channels.get(route.channel_index) else {
                continue;
            };
            match channel.send(alert, strategy).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        channel = channel.channel_name(),
                        alert_id = %alert.alert_id,
                        error = %e,
                        "Failed to send notification"
                    );
                }
            }
        }
        report
    }

    pub fn channels(&self) -> &[Box<dyn NotificationChannel>] {
        &self.channels
    }
}

#[async_trait]
impl AlertNotifier for NotificationManager {
    async fn notify(&self, alert: &Alert, strategy: &AlarmStrategy) -> anyhow::Result<()> {
        let report = self.send_to_channels(alert, strategy).await;
        if report.failed > 0 {
            anyhow::bail!(
                "{} of {} notification channels failed",
                report.failed,
                report.sent + report.failed
            );
        }
        Ok(())
    }
}
