use serde::Deserialize;

/// `[notification]` section of the server configuration.
///
/// # Examples
///
/// ```
/// use alarmd_notify::config::NotificationConfig;
///
/// let cfg: NotificationConfig = serde_json::from_str(
///     r#"{"webhooks": [{"name": "ops", "url": "http://hooks.local/alert", "min_level": 3}]}"#,
/// )
/// .unwrap();
/// assert_eq!(cfg.webhooks[0].min_level, 3);
/// assert_eq!(cfg.webhooks[0].timeout_secs, 10);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhooks: Vec<WebhookTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookTarget {
    pub name: String,
    pub url: String,
    /// Lowest alert level delivered to this target.
    #[serde(default)]
    pub min_level: i64,
    /// Restricts the target to these strategies; empty means all.
    #[serde(default)]
    pub strategy_ids: Vec<i64>,
    /// Request body with `{{placeholder}}` substitution. Without one a JSON
    /// document describing the alert is posted.
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}
