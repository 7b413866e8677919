use alarmd_common::types::{AlertStatus, Event, EventAction, SessionStatus};
use alarmd_engine::{AlertStore, StrategySource};
use alarmd_server::config::ServerConfig;
use alarmd_server::daemon::Daemon;
use alarmd_server::seed::{self, StrategiesSeedFile};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tempfile::TempDir;

async fn setup() -> (TempDir, Daemon) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("alarmd.db").display());
    let config = ServerConfig::parse(&format!(
        "[database]\nurl = \"{url}\"\nmax_connections = 1\n"
    ))
    .unwrap();
    let daemon = Daemon::connect(&config).await.unwrap();
    (dir, daemon)
}

fn seed_file(json: &str) -> StrategiesSeedFile {
    serde_json::from_str(json).unwrap()
}

fn db_event(id: &str, mins_ago: i64) -> Event {
    Event {
        event_id: id.to_string(),
        external_id: Some(format!("ext-{id}")),
        title: "replication lag".to_string(),
        description: String::new(),
        level: 3,
        service: Some("orders-db".to_string()),
        location: None,
        resource_id: Some("pg-1".to_string()),
        resource_name: None,
        resource_type: None,
        event_type: None,
        item: None,
        source: Some("zabbix".to_string()),
        labels: HashMap::new(),
        tags: HashMap::new(),
        received_at: Utc::now() - Duration::minutes(mins_ago),
        action: EventAction::Created,
    }
}

const SESSION_SEED: &str = r#"{
  "strategies": [{
    "id": 2,
    "name": "db sessions",
    "match_rules": [[{"key": "service", "operator": "contains", "value": "db"}]],
    "params": {"group_by": ["service"], "window_type": "session", "time_out": true, "time_minutes": 15}
  }]
}"#;

#[test]
fn seed_entries_default_to_active() {
    let seed = seed_file(r#"{"strategies": [{"id": 9, "name": "minimal"}]}"#);
    let strategy = seed.strategies[0].clone().into_strategy(Utc::now());
    assert!(strategy.is_active);
    assert!(!strategy.auto_close);
    assert!(strategy.match_rules.is_empty());
    assert!(!seed.strategies[0].deleted);
}

#[test]
fn bundled_seed_file_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/strategies.seed.json");
    let seed = seed::load_seed_file(path).unwrap();
    assert_eq!(seed.strategies.len(), 2);
    assert!(seed.strategies.iter().all(|s| s.is_active));
}

#[tokio::test]
async fn seeding_creates_then_updates() {
    let (_dir, daemon) = setup().await;

    let summary = seed::init_strategies(daemon.store(), daemon.sessions(), seed_file(SESSION_SEED))
        .await
        .unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.updated, 0);

    let again = seed::init_strategies(daemon.store(), daemon.sessions(), seed_file(SESSION_SEED))
        .await
        .unwrap();
    assert_eq!(again.created, 0);
    assert_eq!(again.updated, 1);
    assert_eq!(again.sessions_confirmed, 0);

    let active = daemon.store().list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].name, "db sessions");
}

#[tokio::test]
async fn changed_params_confirm_observing_sessions() {
    let (_dir, daemon) = setup().await;
    seed::init_strategies(daemon.store(), daemon.sessions(), seed_file(SESSION_SEED))
        .await
        .unwrap();
    daemon.store().insert_event(&db_event("e1", 2)).await.unwrap();

    let summary = daemon.scan_once().await.unwrap();
    assert_eq!(summary.success, 1);
    let observing = daemon.store().list_observing_session_alerts(Some(2), None, 100).await.unwrap();
    assert_eq!(observing.len(), 1);

    let changed = SESSION_SEED.replace("\"time_minutes\": 15", "\"time_minutes\": 30");
    let report = seed::init_strategies(daemon.store(), daemon.sessions(), seed_file(&changed))
        .await
        .unwrap();
    assert_eq!(report.sessions_confirmed, 1);

    let alert = daemon
        .store()
        .get_alert(&observing[0].alert_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.session_status, Some(SessionStatus::Confirmed));
    assert!(alert.status.is_active());
}

#[tokio::test]
async fn deleted_strategy_closes_observing_sessions() {
    let (_dir, daemon) = setup().await;
    seed::init_strategies(daemon.store(), daemon.sessions(), seed_file(SESSION_SEED))
        .await
        .unwrap();
    daemon.store().insert_event(&db_event("e1", 1)).await.unwrap();
    daemon.scan_once().await.unwrap();
    let observing = daemon.store().list_observing_session_alerts(Some(2), None, 100).await.unwrap();
    assert_eq!(observing.len(), 1);

    let report = seed::init_strategies(
        daemon.store(),
        daemon.sessions(),
        seed_file(r#"{"strategies": [{"id": 2, "name": "db sessions", "deleted": true}]}"#),
    )
    .await
    .unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.sessions_closed, 1);
    assert!(daemon.store().list_strategies().await.unwrap().is_empty());

    let alert = daemon
        .store()
        .get_alert(&observing[0].alert_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.status, AlertStatus::Closed);
    assert_eq!(alert.session_status, Some(SessionStatus::Recovered));
}

#[tokio::test]
async fn single_sweeps_report_their_counts() {
    let (_dir, daemon) = setup().await;
    seed::init_strategies(daemon.store(), daemon.sessions(), seed_file(SESSION_SEED))
        .await
        .unwrap();
    daemon.store().insert_event(&db_event("e1", 1)).await.unwrap();
    daemon.scan_once().await.unwrap();

    let sessions = daemon.session_sweep_once().await.unwrap();
    assert_eq!(sessions.checked, 1);
    assert_eq!(sessions.transitioned, 0);
    assert_eq!(sessions.failed, 0);

    let closed = daemon.auto_close_once().await.unwrap();
    assert_eq!(closed.transitioned, 0);
    assert_eq!(closed.failed, 0);
}
