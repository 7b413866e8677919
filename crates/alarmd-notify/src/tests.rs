use crate::channels::WebhookChannel;
use crate::config::{NotificationConfig, WebhookTarget};
use crate::manager::{DeliveryReport, NotificationManager};
use crate::routing::ChannelRoute;
use crate::NotificationChannel;
use alarmd_common::types::{AlarmStrategy, Alert, AlertStatus, StrategyParams};
use alarmd_engine::AlertNotifier;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn make_alert(level: i64) -> Alert {
    let now = Utc::now();
    Alert {
        alert_id: "ALERT-1".into(),
        fingerprint: "0f3c".into(),
        rule_id: Some(7),
        level,
        title: "api latency high".into(),
        content: "p99 above 2s".into(),
        status: AlertStatus::Unassigned,
        operate: None,
        first_event_time: now,
        last_event_time: now,
        event_count: 4,
        group_by_field: "service".into(),
        is_session_alert: false,
        session_status: None,
        session_end_time: None,
        team: vec![3, 5],
        created_at: now,
        updated_at: now,
    }
}

fn make_strategy() -> AlarmStrategy {
    AlarmStrategy {
        id: 7,
        name: "latency".into(),
        is_active: true,
        priority: 0,
        match_rules: vec![],
        params: StrategyParams::default(),
        auto_close: false,
        close_minutes: 0,
        dispatch_team: vec![3, 5],
        updated_at: Utc::now(),
    }
}

struct RecordingChannel {
    name: String,
    fail: bool,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    async fn send(&self, alert: &Alert, _strategy: &AlarmStrategy) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, alert.alert_id));
        if self.fail {
            anyhow::bail!("{} is down", self.name);
        }
        Ok(())
    }

    fn channel_name(&self) -> &str {
        &self.name
    }
}

fn recording(name: &str, fail: bool, sent: &Arc<Mutex<Vec<String>>>) -> Box<dyn NotificationChannel> {
    Box::new(RecordingChannel {
        name: name.into(),
        fail,
        sent: sent.clone(),
    })
}

#[test]
fn routing_level_filter() {
    let route = ChannelRoute {
        min_level: 3,
        strategy_ids: vec![],
        channel_index: 0,
    };
    assert!(!route.should_send(2, 1));
    assert!(route.should_send(3, 1));
    assert!(route.should_send(5, 99));
}

#[test]
fn routing_strategy_filter() {
    let route = ChannelRoute {
        min_level: 0,
        strategy_ids: vec![7],
        channel_index: 0,
    };
    assert!(route.should_send(1, 7));
    assert!(!route.should_send(1, 8));
}

#[tokio::test]
async fn manager_routes_by_level() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let manager = NotificationManager::new(
        vec![recording("pager", false, &sent), recording("chat", false, &sent)],
        vec![
            ChannelRoute {
                min_level: 4,
                strategy_ids: vec![],
                channel_index: 0,
            },
            ChannelRoute {
                min_level: 1,
                strategy_ids: vec![],
                channel_index: 1,
            },
        ],
    );

    let report = manager.send_to_channels(&make_alert(2), &make_strategy()).await;
    assert_eq!(report, DeliveryReport { sent: 1, failed: 0 });
    assert_eq!(*sent.lock().unwrap(), vec!["chat:ALERT-1"]);

    manager.notify(&make_alert(5), &make_strategy()).await.unwrap();
    assert_eq!(sent.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn failing_channel_does_not_block_others() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let routes = (0..2)
        .map(|i| ChannelRoute {
            min_level: 0,
            strategy_ids: vec![],
            channel_index: i,
        })
        .collect();
    let manager = NotificationManager::new(
        vec![recording("broken", true, &sent), recording("chat", false, &sent)],
        routes,
    );

    let err = manager
        .notify(&make_alert(3), &make_strategy())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1 of 2"), "{err}");
    assert_eq!(
        *sent.lock().unwrap(),
        vec!["broken:ALERT-1", "chat:ALERT-1"]
    );
}

#[test]
fn webhook_default_body_is_json() {
    let channel = WebhookChannel::new(
        "ops",
        "http://127.0.0.1:9/hook",
        None,
        Duration::from_secs(1),
    )
    .unwrap();
    let body = channel.render_body(&make_alert(3), &make_strategy()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["alert_id"], "ALERT-1");
    assert_eq!(value["level"], 3);
    assert_eq!(value["status"], "unassigned");
    assert_eq!(value["rule_name"], "latency");
    assert_eq!(value["team"], serde_json::json!([3, 5]));
}

#[test]
fn webhook_template_placeholders() {
    let channel = WebhookChannel::new(
        "ops",
        "http://127.0.0.1:9/hook",
        Some(r#"{"text": "[L{{level}}] {{title}} x{{event_count}} ({{rule_name}}/{{team}})"}"#.into()),
        Duration::from_secs(1),
    )
    .unwrap();
    let body = channel.render_body(&make_alert(4), &make_strategy()).unwrap();
    assert_eq!(
        body,
        r#"{"text": "[L4] api latency high x4 (latency/3,5)"}"#
    );
}

#[test]
fn webhook_rejects_empty_url() {
    assert!(WebhookChannel::new("ops", " ", None, Duration::from_secs(1)).is_err());
}

#[tokio::test]
async fn webhook_gives_up_after_retries() {
    // nothing listens on the discard port
    let channel = WebhookChannel::new(
        "ops",
        "http://127.0.0.1:9/hook",
        None,
        Duration::from_secs(1),
    )
    .unwrap()
    .with_backoff(Duration::from_millis(1));
    let result = channel.send(&make_alert(3), &make_strategy()).await;
    assert!(result.is_err());
}

#[test]
fn manager_from_config_builds_one_channel_per_target() {
    let config = NotificationConfig {
        webhooks: vec![
            WebhookTarget {
                name: "ops".into(),
                url: "http://hooks.local/ops".into(),
                min_level: 3,
                strategy_ids: vec![],
                body_template: None,
                timeout_secs: 5,
            },
            WebhookTarget {
                name: "dba".into(),
                url: "http://hooks.local/dba".into(),
                min_level: 1,
                strategy_ids: vec![7],
                body_template: Some("{{title}}".into()),
                timeout_secs: 5,
            },
        ],
    };
    let manager = NotificationManager::from_config(&config).unwrap();
    let names: Vec<&str> = manager.channels().iter().map(|c| c.channel_name()).collect();
    assert_eq!(names, vec!["ops", "dba"]);

    let bad = NotificationConfig {
        webhooks: vec![WebhookTarget {
            name: "empty".into(),
            url: String::new(),
            min_level: 0,
            strategy_ids: vec![],
            body_template: None,
            timeout_secs: 5,
        }],
    };
    assert!(NotificationManager::from_config(&bad).is_err());
}
