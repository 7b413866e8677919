use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;

/// What an incoming event reports about its upstream problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Created,
    Closed,
    Recovery,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Created => "created",
            EventAction::Closed => "closed",
            EventAction::Recovery => "recovery",
        }
    }

    /// `closed` and `recovery` both resolve an earlier `created` event.
    pub fn is_resolution(&self) -> bool {
        matches!(self, EventAction::Closed | EventAction::Recovery)
    }
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(EventAction::Created),
            "closed" => Ok(EventAction::Closed),
            "recovery" => Ok(EventAction::Recovery),
            _ => Err(format!("unknown event action: {s}")),
        }
    }
}

/// An immutable operational event produced by upstream ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    /// Identifier of the problem in the originating system. Used to pair
    /// `created` events with their later `closed`/`recovery` events.
    #[serde(default)]
    pub external_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Severity; larger is more severe.
    pub level: i64,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub item: Option<String>,
    /// Name of the alert source that delivered the event.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub received_at: DateTime<Utc>,
    pub action: EventAction,
}

impl Event {
    /// Looks up a field by its canonical name. Names that are not built-in
    /// columns fall through to `labels`, then `tags`.
    ///
    /// # Examples
    ///
    /// ```
    /// use alarmd_common::types::{Event, EventAction};
    /// use chrono::Utc;
    /// use std::collections::HashMap;
    ///
    /// let mut labels = HashMap::new();
    /// labels.insert("cluster".to_string(), "prod-1".to_string());
    /// let event = Event {
    ///     event_id: "e-1".into(),
    ///     external_id: None,
    ///     title: "disk full".into(),
    ///     description: String::new(),
    ///     level: 2,
    ///     service: Some("db".into()),
    ///     location: None,
    ///     resource_id: None,
    ///     resource_name: None,
    ///     resource_type: None,
    ///     event_type: None,
    ///     item: None,
    ///     source: None,
    ///     labels,
    ///     tags: HashMap::new(),
    ///     received_at: Utc::now(),
    ///     action: EventAction::Created,
    /// };
    /// assert_eq!(event.field("level").as_deref(), Some("2"));
    /// assert_eq!(event.field("service").as_deref(), Some("db"));
    /// assert_eq!(event.field("cluster").as_deref(), Some("prod-1"));
    /// assert_eq!(event.field("location"), None);
    /// ```
    pub fn field(&self, name: &str) -> Option<Cow<'_, str>> {
        fn borrowed(v: &Option<String>) -> Option<Cow<'_, str>> {
            v.as_deref().map(Cow::Borrowed)
        }
        match name {
            "event_id" => Some(Cow::Borrowed(self.event_id.as_str())),
            "external_id" => borrowed(&self.external_id),
            "title" => Some(Cow::Borrowed(self.title.as_str())),
            "description" => Some(Cow::Borrowed(self.description.as_str())),
            "level" => Some(Cow::Owned(self.level.to_string())),
            "service" => borrowed(&self.service),
            "location" => borrowed(&self.location),
            "resource_id" => borrowed(&self.resource_id),
            "resource_name" => borrowed(&self.resource_name),
            "resource_type" => borrowed(&self.resource_type),
            "event_type" => borrowed(&self.event_type),
            "item" => borrowed(&self.item),
            "source" => borrowed(&self.source),
            "action" => Some(Cow::Borrowed(self.action.as_str())),
            other => self
                .labels
                .get(other)
                .or_else(|| self.tags.get(other))
                .map(|v| Cow::Borrowed(v.as_str())),
        }
    }
}

/// How events are gathered before aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    Fixed,
    Sliding,
    Session,
}

impl WindowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowType::Fixed => "fixed",
            WindowType::Sliding => "sliding",
            WindowType::Session => "session",
        }
    }
}

impl std::fmt::Display for WindowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One untyped match condition as operators configure it
/// (`{"key": "level", "operator": "eq", "value": 2}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawCondition {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl RawCondition {
    pub fn new(key: &str, operator: &str, value: serde_json::Value) -> Self {
        Self {
            key: Some(key.to_string()),
            operator: Some(operator.to_string()),
            value,
        }
    }
}

/// Aggregation parameters of a strategy (`params` column).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Ordered grouping dimensions, e.g. `["service"]`.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Window size in minutes.
    #[serde(default)]
    pub window_size: Option<i64>,
    #[serde(default)]
    pub window_type: Option<WindowType>,
    /// Session windows: extend the session end time on new activity.
    #[serde(default)]
    pub time_out: bool,
    /// Session windows: inactivity timeout in minutes.
    #[serde(default)]
    pub time_minutes: i64,
    /// Session windows: hard cap on session length (`"2h"`, `"90min"`).
    #[serde(default)]
    pub session_max_duration: Option<String>,
    /// Session windows: hard cap on the number of events in one session.
    #[serde(default)]
    pub session_max_events: Option<u32>,
}

/// Operator-owned aggregation strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmStrategy {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// OR of AND-groups.
    #[serde(default)]
    pub match_rules: Vec<Vec<RawCondition>>,
    #[serde(default)]
    pub params: StrategyParams,
    #[serde(default)]
    pub auto_close: bool,
    #[serde(default)]
    pub close_minutes: i64,
    /// Teams that own alerts raised by this strategy.
    #[serde(default)]
    pub dispatch_team: Vec<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Alert lifecycle status.
///
/// # Examples
///
/// ```
/// use alarmd_common::types::AlertStatus;
///
/// let status: AlertStatus = "auto_close".parse().unwrap();
/// assert_eq!(status, AlertStatus::AutoClose);
/// assert!(!status.is_active());
/// assert!(AlertStatus::Unassigned.is_active());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Unassigned,
    Pending,
    Acknowledged,
    Processing,
    Resolved,
    Closed,
    AutoClose,
    AutoRecovery,
}

impl AlertStatus {
    /// Statuses that count as "not yet resolved".
    pub const ACTIVE: [AlertStatus; 4] = [
        AlertStatus::Unassigned,
        AlertStatus::Pending,
        AlertStatus::Acknowledged,
        AlertStatus::Processing,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Unassigned => "unassigned",
            AlertStatus::Pending => "pending",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Processing => "processing",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Closed => "closed",
            AlertStatus::AutoClose => "auto_close",
            AlertStatus::AutoRecovery => "auto_recovery",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unassigned" => Ok(AlertStatus::Unassigned),
            "pending" => Ok(AlertStatus::Pending),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "processing" => Ok(AlertStatus::Processing),
            "resolved" => Ok(AlertStatus::Resolved),
            "closed" => Ok(AlertStatus::Closed),
            "auto_close" => Ok(AlertStatus::AutoClose),
            "auto_recovery" => Ok(AlertStatus::AutoRecovery),
            _ => Err(format!("unknown alert status: {s}")),
        }
    }
}

/// Observation state of a session alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Observing,
    Confirmed,
    Recovered,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Observing => "observing",
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::Recovered => "recovered",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observing" => Ok(SessionStatus::Observing),
            "confirmed" => Ok(SessionStatus::Confirmed),
            "recovered" => Ok(SessionStatus::Recovered),
            _ => Err(format!("unknown session status: {s}")),
        }
    }
}

/// Last operation applied to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertOperate {
    Acknowledge,
    Close,
    Reassign,
    Assign,
}

impl AlertOperate {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertOperate::Acknowledge => "acknowledge",
            AlertOperate::Close => "close",
            AlertOperate::Reassign => "reassign",
            AlertOperate::Assign => "assign",
        }
    }
}

impl std::str::FromStr for AlertOperate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acknowledge" => Ok(AlertOperate::Acknowledge),
            "close" => Ok(AlertOperate::Close),
            "reassign" => Ok(AlertOperate::Reassign),
            "assign" => Ok(AlertOperate::Assign),
            _ => Err(format!("unknown alert operate: {s}")),
        }
    }
}

/// Operator-facing alert: one ongoing problem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub fingerprint: String,
    /// Soft link to the strategy that raised the alert.
    pub rule_id: Option<i64>,
    pub level: i64,
    pub title: String,
    pub content: String,
    pub status: AlertStatus,
    pub operate: Option<AlertOperate>,
    pub first_event_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    /// Number of `created` events aggregated into this alert.
    pub event_count: i64,
    /// Comma-joined grouping dimensions.
    pub group_by_field: String,
    pub is_session_alert: bool,
    pub session_status: Option<SessionStatus>,
    pub session_end_time: Option<DateTime<Utc>>,
    pub team: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable alert columns, used to write back only what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertField {
    Level,
    LastEventTime,
    EventCount,
    Status,
    Operate,
    SessionStatus,
    SessionEndTime,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogAction {
    Add,
    Modify,
    Delete,
    Execute,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Add => "add",
            LogAction::Modify => "modify",
            LogAction::Delete => "delete",
            LogAction::Execute => "execute",
        }
    }
}

impl std::str::FromStr for LogAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(LogAction::Add),
            "modify" => Ok(LogAction::Modify),
            "delete" => Ok(LogAction::Delete),
            "execute" => Ok(LogAction::Execute),
            _ => Err(format!("unknown log action: {s}")),
        }
    }
}

/// Append-only audit record of a system-performed transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorLog {
    pub id: String,
    pub action: LogAction,
    pub target_type: String,
    pub operator: String,
    pub operator_object: String,
    pub target_id: String,
    pub overview: String,
    pub created_at: DateTime<Utc>,
}

impl OperatorLog {
    /// Audit entry for a transition the engine applied to `alert_id`.
    pub fn system(operator_object: &str, alert_id: &str, overview: String) -> Self {
        Self {
            id: crate::id::next_id(),
            action: LogAction::Modify,
            target_type: "alert".to_string(),
            operator: "system".to_string(),
            operator_object: operator_object.to_string(),
            target_id: alert_id.to_string(),
            overview,
            created_at: Utc::now(),
        }
    }
}

/// Format labels map into a human-readable string.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use alarmd_common::types::format_labels;
///
/// let mut labels = HashMap::new();
/// labels.insert("mount".to_string(), "/data".to_string());
/// labels.insert("device".to_string(), "sda1".to_string());
/// assert_eq!(format_labels(&labels), "device=sda1, mount=/data");
/// ```
pub fn format_labels(labels: &HashMap<String, String>) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event {
            event_id: "e-1".into(),
            external_id: Some("ext-1".into()),
            title: "disk full".into(),
            description: String::new(),
            level: 4,
            service: Some("db".into()),
            location: None,
            resource_id: Some("pg-1".into()),
            resource_name: None,
            resource_type: None,
            event_type: None,
            item: None,
            source: Some("zabbix".into()),
            labels: HashMap::from([("cluster".to_string(), "prod-1".to_string())]),
            tags: HashMap::from([
                ("cluster".to_string(), "ignored".to_string()),
                ("rack".to_string(), "r7".to_string()),
            ]),
            received_at: Utc::now(),
            action: EventAction::Created,
        }
    }

    #[test]
    fn test_field_borrows_optional_columns() {
        let event = event();
        assert!(matches!(event.field("external_id"), Some(Cow::Borrowed("ext-1"))));
        assert!(matches!(event.field("resource_id"), Some(Cow::Borrowed("pg-1"))));
        assert!(matches!(event.field("source"), Some(Cow::Borrowed("zabbix"))));
        assert_eq!(event.field("item"), None);
        assert!(matches!(event.field("level"), Some(Cow::Owned(ref s)) if s == "4"));
    }

    #[test]
    fn test_field_prefers_labels_over_tags() {
        let event = event();
        assert_eq!(event.field("cluster").as_deref(), Some("prod-1"));
        assert_eq!(event.field("rack").as_deref(), Some("r7"));
        assert_eq!(event.field("missing"), None);
    }
}
