use crate::AlarmStore;
use alarmd_common::types::{
    AlarmStrategy, Alert, AlertField, AlertStatus, Event, EventAction, OperatorLog, RawCondition,
    SessionStatus, StrategyParams, WindowType,
};
use alarmd_engine::builder::{AlertBuilder, LinkCache};
use alarmd_engine::config::EngineConfig;
use alarmd_engine::lock::FingerprintLocks;
use alarmd_engine::scheduler::ScanScheduler;
use alarmd_engine::window::WindowConfig;
use alarmd_engine::{aggregation, AlertStore, EventSource, StrategySource};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

async fn setup() -> (TempDir, AlarmStore) {
    setup_with_pool(1).await
}

async fn setup_with_pool(max_connections: u32) -> (TempDir, AlarmStore) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("alarmd.db").display());
    let store = AlarmStore::connect(&url, max_connections).await.unwrap();
    store.ensure_schema().await.unwrap();
    (dir, store)
}

fn make_event(id: &str, service: &str, level: i64, mins_ago: i64) -> Event {
    let mut labels = HashMap::new();
    labels.insert("cluster".to_string(), "prod".to_string());
    Event {
        event_id: id.to_string(),
        external_id: Some(format!("ext-{id}")),
        title: format!("{service} latency high"),
        description: "p99 above 2s".to_string(),
        level,
        service: Some(service.to_string()),
        location: None,
        resource_id: None,
        resource_name: Some("node-1".to_string()),
        resource_type: None,
        event_type: None,
        item: None,
        source: Some("zabbix".to_string()),
        labels,
        tags: HashMap::new(),
        received_at: Utc::now() - Duration::minutes(mins_ago),
        action: EventAction::Created,
    }
}

fn make_strategy(id: i64) -> AlarmStrategy {
    AlarmStrategy {
        id,
        name: format!("latency-{id}"),
        is_active: true,
        priority: 5,
        match_rules: vec![vec![RawCondition::new(
            "level",
            "gte",
            serde_json::json!(1),
        )]],
        params: StrategyParams {
            group_by: vec!["service".to_string()],
            window_size: Some(10),
            window_type: Some(WindowType::Fixed),
            ..Default::default()
        },
        auto_close: true,
        close_minutes: 30,
        dispatch_team: vec![7, 8],
        updated_at: Utc::now(),
    }
}

fn make_alert(id: &str, fingerprint: &str) -> Alert {
    let now = Utc::now();
    Alert {
        alert_id: id.to_string(),
        fingerprint: fingerprint.to_string(),
        rule_id: Some(1),
        level: 2,
        title: "api latency high".to_string(),
        content: String::new(),
        status: AlertStatus::Unassigned,
        operate: None,
        first_event_time: now - Duration::minutes(5),
        last_event_time: now,
        event_count: 0,
        group_by_field: "service".to_string(),
        is_session_alert: true,
        session_status: Some(SessionStatus::Observing),
        session_end_time: Some(now + Duration::minutes(10)),
        team: vec![1],
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn ensure_schema_is_idempotent() {
    let (_dir, store) = setup().await;
    store.ensure_schema().await.unwrap();
    assert!(store.list_strategies().await.unwrap().is_empty());
}

#[tokio::test]
async fn events_round_trip_and_filter_by_action() {
    let (_dir, store) = setup().await;
    let created = make_event("e1", "api", 3, 5);
    let old = make_event("e0", "api", 1, 120);
    let mut resolved = make_event("r1", "api", 3, 1);
    resolved.action = EventAction::Recovery;
    resolved.external_id = created.external_id.clone();

    let written = store
        .insert_events(&[created.clone(), old, resolved])
        .await
        .unwrap();
    assert_eq!(written, 3);
    // duplicates are ignored
    assert!(!store.insert_event(&created).await.unwrap());

    let loaded = store.get_event("e1").await.unwrap().unwrap();
    assert_eq!(loaded.labels.get("cluster").map(String::as_str), Some("prod"));
    assert_eq!(loaded.action, EventAction::Created);
    assert_eq!(loaded.resource_name.as_deref(), Some("node-1"));

    let cutoff = Utc::now() - Duration::minutes(30);
    let recent = store.created_events_since(cutoff).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].event_id, "e1");

    let resolutions = store.resolution_events_since(cutoff).await.unwrap();
    assert_eq!(resolutions.len(), 1);
    assert_eq!(resolutions[0].event_id, "r1");

    assert_eq!(store.count_created_since(cutoff).await.unwrap(), 1);
    assert_eq!(store.count_created_since(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn strategy_upsert_overwrites_and_filters_inactive() {
    let (_dir, store) = setup().await;
    let mut s = make_strategy(1);
    store.upsert_strategy(&s).await.unwrap();
    store.upsert_strategy(&make_strategy(2)).await.unwrap();

    let loaded = store.get(1).await.unwrap().unwrap();
    assert_eq!(loaded.params.group_by, vec!["service"]);
    assert_eq!(loaded.params.window_type, Some(WindowType::Fixed));
    assert_eq!(loaded.match_rules[0][0].operator.as_deref(), Some("gte"));
    assert_eq!(loaded.dispatch_team, vec![7, 8]);

    s.is_active = false;
    s.name = "renamed".into();
    store.upsert_strategy(&s).await.unwrap();
    assert_eq!(store.get(1).await.unwrap().unwrap().name, "renamed");

    let active = store.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, 2);

    assert!(store.delete_strategy(2).await.unwrap());
    assert!(!store.delete_strategy(2).await.unwrap());
    assert!(store.get(2).await.unwrap().is_none());
}

#[tokio::test]
async fn transaction_commit_and_rollback() {
    let (_dir, store) = setup().await;
    store.insert_event(&make_event("e1", "api", 2, 1)).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.insert_alert(&make_alert("ALERT-1", "fp-a")).await.unwrap();
    assert_eq!(
        tx.link_events("ALERT-1", &["e1".to_string()]).await.unwrap(),
        1
    );
    drop(tx);
    assert!(store.get_alert("ALERT-1").await.unwrap().is_none());

    let mut tx = store.begin().await.unwrap();
    tx.insert_alert(&make_alert("ALERT-1", "fp-a")).await.unwrap();
    tx.link_events("ALERT-1", &["e1".to_string()]).await.unwrap();
    tx.commit().await.unwrap();

    let alert = store.get_alert("ALERT-1").await.unwrap().unwrap();
    assert_eq!(alert.session_status, Some(SessionStatus::Observing));
    assert_eq!(alert.team, vec![1]);
    assert_eq!(store.linked_event_ids("ALERT-1").await.unwrap(), vec!["e1"]);
}

#[tokio::test]
async fn link_events_skips_unknown_and_already_linked() {
    let (_dir, store) = setup().await;
    for id in ["e1", "e2", "e3"] {
        store.insert_event(&make_event(id, "api", 2, 1)).await.unwrap();
    }
    let mut tx = store.begin().await.unwrap();
    tx.insert_alert(&make_alert("ALERT-1", "fp-a")).await.unwrap();

    let ids = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    assert_eq!(tx.link_events("ALERT-1", &ids(&["e1", "e2"])).await.unwrap(), 2);
    assert_eq!(
        tx.link_events("ALERT-1", &ids(&["e2", "e3", "e3", "missing"]))
            .await
            .unwrap(),
        1
    );
    assert_eq!(tx.linked_event_ids("ALERT-1").await.unwrap().len(), 3);
    assert_eq!(tx.linked_events("ALERT-1").await.unwrap().len(), 3);
    assert!(tx.link_events("ALERT-404", &ids(&["e1"])).await.is_err());
}

#[tokio::test]
async fn update_alert_writes_only_listed_fields() {
    let (_dir, store) = setup().await;
    let mut tx = store.begin().await.unwrap();
    tx.insert_alert(&make_alert("ALERT-1", "fp-a")).await.unwrap();
    tx.commit().await.unwrap();

    let mut changed = make_alert("ALERT-1", "fp-a");
    changed.level = 9;
    changed.title = "ignored".into();
    changed.status = AlertStatus::AutoClose;
    let mut tx = store.begin().await.unwrap();
    tx.update_alert(&changed, &[AlertField::Level, AlertField::Status])
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let stored = store.get_alert("ALERT-1").await.unwrap().unwrap();
    assert_eq!(stored.level, 9);
    assert_eq!(stored.status, AlertStatus::AutoClose);
    assert_eq!(stored.title, "api latency high");

    let mut tx = store.begin().await.unwrap();
    assert!(tx.select_active_for_update("fp-a").await.unwrap().is_empty());
    assert!(tx.get_for_update("ALERT-1").await.unwrap().is_some());
}

#[tokio::test]
async fn active_listing_pages_and_session_filter() {
    let (_dir, store) = setup().await;
    let mut tx = store.begin().await.unwrap();
    for i in 0..5 {
        let mut a = make_alert(&format!("ALERT-{i}"), &format!("fp-{i}"));
        if i == 4 {
            a.status = AlertStatus::Closed;
        }
        if i == 3 {
            a.session_status = Some(SessionStatus::Confirmed);
        }
        tx.insert_alert(&a).await.unwrap();
    }
    tx.commit().await.unwrap();

    let first = store.list_active_alerts(None, 2).await.unwrap();
    assert_eq!(first.len(), 2);
    let rest = store
        .list_active_alerts(Some(&first[1].alert_id), 10)
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert!(rest.iter().all(|a| a.alert_id > first[1].alert_id));

    let observing = store.list_observing_session_alerts(None, None, 10).await.unwrap();
    assert_eq!(observing.len(), 3);
    let page = store.list_observing_session_alerts(None, None, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    let tail = store
        .list_observing_session_alerts(None, Some(&page[1].alert_id), 2)
        .await
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].alert_id, observing[2].alert_id);
    assert!(store
        .list_observing_session_alerts(Some(99), None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn external_ids_resolve_to_active_alerts() {
    let (_dir, store) = setup().await;
    let e1 = make_event("e1", "api", 2, 3);
    let e2 = make_event("e2", "api", 2, 2);
    store.insert_events(&[e1.clone(), e2.clone()]).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.insert_alert(&make_alert("ALERT-1", "fp-a")).await.unwrap();
    tx.link_events("ALERT-1", &["e1".to_string(), "e2".to_string()])
        .await
        .unwrap();
    let mut closed = make_alert("ALERT-2", "fp-b");
    closed.status = AlertStatus::Closed;
    tx.insert_alert(&closed).await.unwrap();
    tx.link_events("ALERT-2", &["e2".to_string()]).await.unwrap();
    tx.commit().await.unwrap();

    let pairs = store
        .active_alerts_by_external_ids(&["ext-e1".to_string(), "ext-e2".to_string()])
        .await
        .unwrap();
    let mut found: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(ext, a)| (ext, a.alert_id))
        .collect();
    found.sort();
    assert_eq!(
        found,
        vec![
            ("ext-e1".to_string(), "ALERT-1".to_string()),
            ("ext-e2".to_string(), "ALERT-1".to_string()),
        ]
    );
}

#[tokio::test]
async fn operator_logs_are_appended() {
    let (_dir, store) = setup().await;
    let logs = vec![
        OperatorLog::system("Alert processing-auto close", "ALERT-1", "closed".into()),
        OperatorLog::system("Alert processing-auto recovery", "ALERT-2", "recovered".into()),
    ];
    store.append_operator_logs(&logs).await.unwrap();
    let stored = store.operator_logs_for("ALERT-1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].operator, "system");
    assert_eq!(stored[0].overview, "closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_upserts_share_one_alert() {
    let (_dir, store) = setup().await;
    let store = Arc::new(store);
    let locks = Arc::new(FingerprintLocks::new());
    let strategy = make_strategy(1);
    let window = WindowConfig::resolve(&strategy, &EngineConfig::default());

    let mut results = Vec::new();
    for i in 0..8 {
        let event = make_event(&format!("c{i}"), "api", 2, 1);
        store.insert_event(&event).await.unwrap();
        results.extend(aggregation::aggregate(&[&event], &strategy.params.group_by, &window, 1).unwrap());
    }

    let mut handles = Vec::new();
    for result in results {
        let builder = AlertBuilder::new(store.clone(), locks.clone());
        let strategy = strategy.clone();
        let window = window.clone();
        handles.push(tokio::spawn(async move {
            let mut cache = LinkCache::new();
            builder
                .upsert(&result, &strategy, &window, "service", &mut cache)
                .await
                .unwrap()
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let fp = aggregation::fingerprint(1, &[("service".to_string(), "api".to_string())]);
    let alerts = store.list_alerts_by_fingerprint(&fp).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].event_count, 8);
    assert_eq!(store.linked_event_ids(&alerts[0].alert_id).await.unwrap().len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pooled_writers_on_distinct_fingerprints_all_commit() {
    let (_dir, store) = setup_with_pool(5).await;
    let store = Arc::new(store);
    let locks = Arc::new(FingerprintLocks::new());
    let strategy = make_strategy(1);
    let window = WindowConfig::resolve(&strategy, &EngineConfig::default());

    for round in 0..5 {
        let mut results = Vec::new();
        for i in 0..16 {
            let event = make_event(&format!("r{round}-{i}"), &format!("svc-{i}"), 2, 1);
            store.insert_event(&event).await.unwrap();
            results.extend(
                aggregation::aggregate(&[&event], &strategy.params.group_by, &window, 1).unwrap(),
            );
        }

        let mut handles = Vec::new();
        for result in results {
            let builder = AlertBuilder::new(store.clone(), locks.clone());
            let strategy = strategy.clone();
            let window = window.clone();
            handles.push(tokio::spawn(async move {
                let mut cache = LinkCache::new();
                builder
                    .upsert(&result, &strategy, &window, "service", &mut cache)
                    .await
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            }));
        }
        let logger = store.clone();
        handles.push(tokio::spawn(async move {
            let log = OperatorLog::system("Alert processing-auto close", "ALERT-x", "noop".into());
            logger.append_operator_logs(&[log]).await
        }));

        let mut failures = 0;
        for h in handles {
            if let Err(e) = h.await.unwrap() {
                failures += 1;
                eprintln!("write failed: {e:#}");
            }
        }
        assert_eq!(failures, 0, "round {round}");
    }

    let active = store.list_active_alerts(None, 100).await.unwrap();
    assert_eq!(active.len(), 16);
    assert!(active.iter().all(|a| a.event_count == 5));
    assert_eq!(store.operator_logs_for("ALERT-x").await.unwrap().len(), 5);
}

#[tokio::test]
async fn scheduler_runs_against_the_database() {
    let (_dir, store) = setup().await;
    let store = Arc::new(store);
    store.upsert_strategy(&make_strategy(1)).await.unwrap();
    for (id, service, level) in [("a1", "A", 1), ("a2", "A", 3), ("a3", "A", 2), ("b1", "B", 1)] {
        store.insert_event(&make_event(id, service, level, 2)).await.unwrap();
    }

    let scheduler = ScanScheduler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(FingerprintLocks::new()),
        Arc::new(EngineConfig::default()),
    );
    let summary = scheduler.run_all().await.unwrap();
    assert_eq!(summary.success, 1);

    let a = aggregation::fingerprint(1, &[("service".to_string(), "A".to_string())]);
    let alerts = store.list_alerts_by_fingerprint(&a).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].level, 3);
    assert_eq!(alerts[0].event_count, 3);
    assert_eq!(alerts[0].team, vec![7, 8]);

    let b = aggregation::fingerprint(1, &[("service".to_string(), "B".to_string())]);
    assert_eq!(store.list_alerts_by_fingerprint(&b).await.unwrap().len(), 1);
}
