//! Alert notification delivery.
//!
//! [`manager::NotificationManager`] implements the engine's
//! [`AlertNotifier`](alarmd_engine::AlertNotifier) hook and fans each created
//! or escalated alert out to the [`NotificationChannel`]s whose route accepts
//! its level. The built-in channel is a JSON webhook.

pub mod channels;
pub mod config;
pub mod error;
pub mod manager;
pub mod routing;
pub mod utils;

#[cfg(test)]
mod tests;

use alarmd_common::types::{AlarmStrategy, Alert};
use anyhow::Result;
use async_trait::async_trait;

/// A notification delivery channel that sends alerts to an external
/// service.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Delivers `alert`, raised by `strategy`, through this channel.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails after retries (if applicable).
    async fn send(&self, alert: &Alert, strategy: &AlarmStrategy) -> Result<()>;

    /// Returns the channel instance name used in logs.
    fn channel_name(&self) -> &str;
}
