//! End-to-end behaviour of live selects against the in-memory stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use live_select::testing::{MemoryExecutor, MemorySource, MemoryTable, MEMORY_LOG};
use live_select::{
    ConnectionError, ConnectionEvent, ConnectionEvents, LiveConfig, LiveSync, SelectError,
    SelectEvent, StreamState, Subscription,
};
use serde_json::json;
use sync_core::values::row;
use sync_core::{Diff, FieldChange, KeySelector, Snapshot, StreamPosition, Trigger};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BY_ID: &str = "SELECT * FROM players WHERE id = ?";

fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "live_select=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

struct Harness {
    live: LiveSync,
    events: ConnectionEvents,
    source: MemorySource,
    executor: Arc<MemoryExecutor>,
    players: MemoryTable,
}

fn harness(source: MemorySource, config: LiveConfig, latency: Option<Duration>) -> Harness {
    init_logging();
    let players = MemoryTable::new("app", "players", "id");
    let table = players.clone();
    let mut executor = MemoryExecutor::new(move |_query, params| {
        let rows = table.rows();
        Ok(match params.first() {
            Some(id) => rows.into_iter().filter(|r| r.get("id") == Some(id)).collect(),
            None => rows,
        })
    });
    if let Some(latency) = latency {
        executor = executor.with_latency(latency);
    }
    let executor = Arc::new(executor);
    let (live, events) = LiveSync::start(config, Arc::new(source.clone()), executor.clone());
    Harness {
        live,
        events,
        source,
        executor,
        players,
    }
}

fn default_harness() -> Harness {
    harness(MemorySource::auto_ready(), app_config(), None)
}

fn app_config() -> LiveConfig {
    LiveConfig::new(1).with_default_schema("app")
}

fn select_player(h: &Harness, id: i64, min_interval: Option<Duration>) -> Subscription {
    h.live
        .select(
            BY_ID,
            vec![json!(id)],
            KeySelector::columns(["id"]),
            vec![Trigger::new("players")],
            min_interval,
        )
        .unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn next(sub: &mut Subscription) -> SelectEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for live select event")
        .expect("subscription closed")
}

async fn next_update(sub: &mut Subscription) -> (Arc<Diff>, Arc<Snapshot>) {
    match next(sub).await {
        SelectEvent::Update { diff, data } => (diff, data),
        SelectEvent::Error(err) => panic!("unexpected error: {err:#}"),
    }
}

async fn next_connection_event(events: &mut ConnectionEvents) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("timed out waiting for connection event")
        .expect("connection event channel closed")
}

#[tokio::test(start_paused = true)]
async fn test_visits_increment_then_delete() {
    let h = default_harness();
    h.players.insert(row([("id", json!(1)), ("visits", json!(10))]));

    let mut sub = select_player(&h, 1, None);
    let (diff, data) = next_update(&mut sub).await;
    assert_eq!(
        diff.added,
        Some(Snapshot::from([(
            "1".to_string(),
            row([("id", json!(1)), ("visits", json!(10))])
        )]))
    );
    assert_eq!(diff.changed, Some(Default::default()));
    assert_eq!(diff.removed, Some(Default::default()));
    assert_eq!(data.len(), 1);

    let ev = h
        .players
        .update(&json!(1), |r| {
            r.insert("visits".into(), json!(15));
        })
        .unwrap();
    assert!(h.source.push(ev));
    let (diff, data) = next_update(&mut sub).await;
    let changed = diff.changed.as_ref().unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed["1"].len(), 1);
    assert_eq!(changed["1"]["visits"], FieldChange::Set(json!(15)));
    assert_eq!(data["1"]["visits"], json!(15));
    assert_eq!(sub.data()["1"]["visits"], json!(15));

    let ev = h.players.delete(&json!(1)).unwrap();
    assert!(h.source.push(ev));
    let (diff, data) = next_update(&mut sub).await;
    assert_eq!(
        diff.removed,
        Some([("1".to_string(), true)].into_iter().collect())
    );
    assert!(data.is_empty());
    assert_eq!(h.executor.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_initial_empty_result_is_announced() {
    let h = default_harness();
    let mut sub = select_player(&h, 42, None);

    let (diff, data) = next_update(&mut sub).await;
    assert_eq!(*diff, Diff::initial(Snapshot::new()));
    assert!(data.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_receives_catch_up() {
    let h = default_harness();
    h.players.insert(row([("id", json!(1)), ("score", json!(3))]));

    let mut first = select_player(&h, 1, None);
    let (_, data) = next_update(&mut first).await;

    let mut second = select_player(&h, 1, None);
    let (diff, caught_up) = next_update(&mut second).await;
    assert_eq!(diff.added.as_ref(), Some(&*data));
    assert_eq!(diff.changed, None);
    assert_eq!(diff.removed, None);
    assert!(Arc::ptr_eq(&data, &caught_up));

    assert_eq!(h.executor.calls(), 1);
    assert_eq!(h.live.query_count(), 1);
    assert!(first.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shared_entry_refreshes_once() {
    let h = default_harness();
    h.players.insert(row([("id", json!(1)), ("score", json!(3))]));

    let mut a = select_player(&h, 1, None);
    next_update(&mut a).await;
    let mut b = select_player(&h, 1, None);
    next_update(&mut b).await;
    assert_eq!(h.executor.calls(), 1);

    let ev = h
        .players
        .update(&json!(1), |r| {
            r.insert("score".into(), json!(4));
        })
        .unwrap();
    h.source.push(ev);
    let (_, da) = next_update(&mut a).await;
    let (_, db) = next_update(&mut b).await;
    assert!(Arc::ptr_eq(&da, &db));
    assert_eq!(h.executor.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_last_subscription_drops_entry() {
    let h = default_harness();
    let a = select_player(&h, 1, None);
    let b = select_player(&h, 1, None);
    let other = select_player(&h, 2, None);
    assert_eq!(h.live.query_count(), 2);

    assert!(a.stop());
    assert!(!a.stop());
    assert!(!a.active());
    assert_eq!(h.live.query_count(), 2);

    assert!(b.active());
    drop(b);
    assert_eq!(h.live.query_count(), 1);
    assert!(other.active());
}

#[tokio::test(start_paused = true)]
async fn test_throttle_coalesces_bursts() {
    let h = default_harness();
    h.players.insert(row([("id", json!(1)), ("score", json!(0))]));

    let mut sub = select_player(&h, 1, Some(Duration::from_millis(500)));
    next_update(&mut sub).await;
    assert_eq!(h.executor.calls(), 1);

    for score in 1..=5 {
        let ev = h
            .players
            .update(&json!(1), |r| {
                r.insert("score".into(), json!(score));
            })
            .unwrap();
        h.source.push(ev);
        settle().await;
    }
    assert_eq!(h.executor.calls(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.executor.calls(), 2);
    let (diff, data) = next_update(&mut sub).await;
    assert_eq!(data["1"]["score"], json!(5));
    assert_eq!(
        diff.changed.as_ref().unwrap()["1"]["score"],
        FieldChange::Set(json!(5))
    );
    assert!(sub.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_while_executing() {
    let h = harness(
        MemorySource::auto_ready(),
        app_config(),
        Some(Duration::from_millis(100)),
    );
    h.players.insert(row([("id", json!(1)), ("score", json!(0))]));

    let mut sub = select_player(&h, 1, None);
    settle().await;
    assert_eq!(h.executor.calls(), 1);

    for score in 1..=3 {
        let ev = h
            .players
            .update(&json!(1), |r| {
                r.insert("score".into(), json!(score));
            })
            .unwrap();
        h.source.push(ev);
        settle().await;
    }
    assert_eq!(h.executor.calls(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.executor.calls(), 2);

    let (_, first) = next_update(&mut sub).await;
    let (_, second) = next_update(&mut sub).await;
    assert_eq!(first["1"]["score"], json!(0));
    assert_eq!(second["1"]["score"], json!(3));
    assert!(sub.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_trigger_condition_gates_refresh() {
    let h = default_harness();
    h.players.insert(row([("id", json!(1)), ("score", json!(0))]));

    let mut sub = h
        .live
        .select(
            BY_ID,
            vec![json!(1)],
            KeySelector::columns(["id"]),
            vec![Trigger::new("players").when(|ev| ev.current()["score"].as_i64() >= Some(10))],
            None,
        )
        .unwrap();
    next_update(&mut sub).await;

    for score in [5, 12] {
        let ev = h
            .players
            .update(&json!(1), |r| {
                r.insert("score".into(), json!(score));
            })
            .unwrap();
        h.source.push(ev);
        settle().await;
    }
    assert_eq!(h.executor.calls(), 2);
    let (_, data) = next_update(&mut sub).await;
    assert_eq!(data["1"]["score"], json!(12));

    h.source.push(sync_core::ChangeEvent::insert(
        "app",
        "teams",
        vec![row([("id", json!(1))])],
    ));
    settle().await;
    assert_eq!(h.executor.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_execution_error_keeps_snapshot() {
    init_logging();
    let failing = Arc::new(AtomicBool::new(false));
    let flag = failing.clone();
    let executor = Arc::new(MemoryExecutor::new(move |_, _| {
        if flag.load(Ordering::SeqCst) {
            anyhow::bail!("Lost connection to MySQL server during query");
        }
        Ok(vec![row([("id", json!(1))])])
    }));
    let source = MemorySource::auto_ready();
    let (live, _events) = LiveSync::start(app_config(), Arc::new(source.clone()), executor.clone());

    let mut sub = live
        .select(
            "SELECT id FROM players",
            vec![],
            KeySelector::index(),
            vec![Trigger::new("players")],
            None,
        )
        .unwrap();
    next_update(&mut sub).await;

    failing.store(true, Ordering::SeqCst);
    sub.invalidate();
    match next(&mut sub).await {
        SelectEvent::Error(err) => assert!(err.to_string().contains("Lost connection")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(sub.data().len(), 1);

    settle().await;
    assert_eq!(executor.calls(), 2);
    assert!(sub.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_key_selector_failure_is_reported() {
    let h = default_harness();
    h.players.insert(row([("id", json!(1)), ("score", json!(0))]));

    let mut sub = h
        .live
        .select(
            "SELECT score FROM players",
            vec![],
            KeySelector::columns(["player_id"]),
            vec![Trigger::new("players")],
            None,
        )
        .unwrap();
    match next(&mut sub).await {
        SelectEvent::Error(err) => assert!(err.to_string().contains("player_id")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_select_validation() {
    let h = default_harness();
    let triggers = || vec![Trigger::new("players")];

    let err = h
        .live
        .select("  ", vec![], KeySelector::index(), triggers(), None)
        .unwrap_err();
    assert_eq!(err, SelectError::EmptyQuery);

    let err = h
        .live
        .select(
            BY_ID,
            vec![json!(1), json!([1, 2])],
            KeySelector::index(),
            triggers(),
            None,
        )
        .unwrap_err();
    assert_eq!(err, SelectError::InvalidParam { index: 1 });

    let err = h
        .live
        .select(
            BY_ID,
            vec![json!(1)],
            KeySelector::columns(Vec::<String>::new()),
            triggers(),
            None,
        )
        .unwrap_err();
    assert_eq!(err, SelectError::EmptyKeyColumns);

    let err = h
        .live
        .select(BY_ID, vec![json!(1)], KeySelector::index(), vec![], None)
        .unwrap_err();
    assert_eq!(err, SelectError::MissingTriggers);

    let no_default = harness(MemorySource::auto_ready(), LiveConfig::new(1), None);
    let err = no_default
        .live
        .select(BY_ID, vec![json!(1)], KeySelector::index(), triggers(), None)
        .unwrap_err();
    assert_eq!(
        err,
        SelectError::NoSchema {
            table: "players".into()
        }
    );
    assert!(no_default
        .live
        .select(
            BY_ID,
            vec![json!(1)],
            KeySelector::index(),
            vec![Trigger::new("players").schema("app")],
            None
        )
        .is_ok());
    assert_eq!(h.live.query_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_filter_grows_without_reconnect() {
    let h = default_harness();
    let _players = select_player(&h, 1, None);
    settle().await;
    assert!(h.source.filter().includes("app", "players"));
    assert!(!h.source.filter().includes("app", "teams"));

    let _teams = h
        .live
        .select(
            "SELECT * FROM teams",
            vec![],
            KeySelector::columns(["id"]),
            vec![Trigger::new("teams"), Trigger::new("audit").schema("ops")],
            None,
        )
        .unwrap();
    let filter = h.source.filter();
    assert!(filter.includes("app", "teams"));
    assert!(filter.includes("ops", "audit"));
    assert!(filter.includes("app", "players"));
    assert_eq!(h.source.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_refreshes() {
    let mut h = default_harness();
    h.players.insert(row([("id", json!(1)), ("score", json!(1))]));
    assert_eq!(
        next_connection_event(&mut h.events).await,
        ConnectionEvent::Ready
    );

    let mut sub = select_player(&h, 1, None);
    next_update(&mut sub).await;

    h.live.pause();
    assert!(h.live.is_paused());
    assert!(h.source.filter().is_empty());

    let ev = h
        .players
        .update(&json!(1), |r| {
            r.insert("score".into(), json!(99));
        })
        .unwrap();
    assert!(!h.source.push(ev));
    settle().await;
    assert_eq!(h.executor.calls(), 1);

    h.live.resume();
    assert!(h.source.filter().includes("app", "players"));
    let (diff, _) = next_update(&mut sub).await;
    assert_eq!(
        diff.changed.as_ref().unwrap()["1"]["score"],
        FieldChange::Set(json!(99))
    );
    assert_eq!(h.executor.calls(), 2);
    assert_eq!(h.source.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_from_last_position() {
    let mut h = harness(MemorySource::new(), app_config(), None);
    let _sub = select_player(&h, 1, None);

    assert!(h.source.ready());
    assert_eq!(
        next_connection_event(&mut h.events).await,
        ConnectionEvent::Ready
    );
    let config = h.source.config(0).unwrap();
    assert!(config.start_at_end);
    assert_eq!(config.resume_from, None);

    let ev = h.players.insert(row([("id", json!(1))]));
    h.source.push(ev);
    settle().await;
    assert_eq!(
        h.live.position(),
        Some(StreamPosition::new(MEMORY_LOG, 1))
    );

    assert!(h.source.fail("server has gone away"));
    settle().await;
    assert_eq!(h.source.opened(), 2);
    assert!(h.source.is_stopped(0));
    let config = h.source.config(1).unwrap();
    assert!(!config.start_at_end);
    assert_eq!(config.resume_from, Some(StreamPosition::new(MEMORY_LOG, 1)));
    assert!(config.filter.includes("app", "players"));

    h.source.ready();
    assert_eq!(
        next_connection_event(&mut h.events).await,
        ConnectionEvent::Ready
    );
    assert!(matches!(h.live.state(), StreamState::Streaming { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_failures_become_fatal() {
    let mut h = harness(MemorySource::new(), app_config(), None);

    h.source.fail("connect refused");
    settle().await;
    assert_eq!(h.source.opened(), 2);

    h.source.fail("connect refused");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.source.opened(), 2);
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.source.opened(), 3);

    h.source.fail("connect refused");
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(h.source.opened(), 4);

    h.source.fail("connect refused");
    assert_eq!(
        next_connection_event(&mut h.events).await,
        ConnectionEvent::Error(ConnectionError::ReconnectFailure { attempts: 3 })
    );
    assert_eq!(h.live.state(), StreamState::Failed);
    assert!(h.source.is_stopped(3));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.source.opened(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_position_survives_reconnects_and_fatal_failure() {
    let mut h = harness(MemorySource::new(), app_config(), None);
    let _sub = select_player(&h, 1, None);
    let last = Some(StreamPosition::new(MEMORY_LOG, 1));

    h.source.ready();
    assert_eq!(
        next_connection_event(&mut h.events).await,
        ConnectionEvent::Ready
    );
    h.source.push(h.players.insert(row([("id", json!(1))])));
    settle().await;
    assert_eq!(h.live.position(), last);

    h.source.fail("server has gone away");
    settle().await;
    assert_eq!(h.source.opened(), 2);
    assert_eq!(h.live.position(), last);

    h.source.fail("server has gone away");
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(matches!(h.live.state(), StreamState::Reconnecting { .. }));
    assert_eq!(h.live.position(), last);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(h.source.opened(), 3);

    h.source.fail("server has gone away");
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(h.source.opened(), 4);

    h.source.fail("server has gone away");
    assert_eq!(
        next_connection_event(&mut h.events).await,
        ConnectionEvent::Error(ConnectionError::ReconnectFailure { attempts: 3 })
    );
    assert_eq!(h.live.position(), last);

    h.live.end();
    assert_eq!(h.live.position(), last);
}

#[tokio::test(start_paused = true)]
async fn test_configured_resume_position_reported_before_ready() {
    let resume = StreamPosition::new(MEMORY_LOG, 7);
    let mut config = app_config();
    config.resume_from = Some(resume.clone());
    let h = harness(MemorySource::new(), config, None);

    assert_eq!(h.live.position(), Some(resume.clone()));
    h.source.fail("connect refused");
    settle().await;
    assert_eq!(h.source.config(1).unwrap().resume_from, Some(resume.clone()));
    assert_eq!(h.live.position(), Some(resume));
}

#[tokio::test(start_paused = true)]
async fn test_stream_that_never_becomes_ready_times_out() {
    let mut h = harness(MemorySource::new(), app_config(), None);

    assert_eq!(
        next_connection_event(&mut h.events).await,
        ConnectionEvent::Error(ConnectionError::InitTimeout)
    );
    assert_eq!(h.live.state(), StreamState::Failed);
    assert!(h.source.is_stopped(0));
    assert_eq!(h.source.opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_end_closes_everything() {
    let h = default_harness();
    h.players.insert(row([("id", json!(1))]));
    let mut sub = select_player(&h, 1, None);
    next_update(&mut sub).await;
    let mirror = h.live.create_table_mirror(None, "players", "id").unwrap();
    settle().await;
    assert_eq!(h.live.mirror_count(), 1);

    h.live.end();
    assert_eq!(h.live.mirror_count(), 0);
    assert_eq!(h.live.query_count(), 0);
    assert_eq!(mirror.len(), 1);
    settle().await;
    assert!(h.executor.is_closed());
    assert!(h.source.is_stopped(0));
    assert_eq!(h.live.state(), StreamState::Closed);
    assert!(!sub.active());
    assert!(sub.recv().await.is_none());

    let err = h
        .live
        .select(
            BY_ID,
            vec![json!(1)],
            KeySelector::index(),
            vec![Trigger::new("players")],
            None,
        )
        .unwrap_err();
    assert_eq!(err, SelectError::Closed);
    assert!(matches!(
        h.live.create_table_mirror(None, "players", "id"),
        Err(SelectError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_table_mirror_follows_changes() {
    let h = default_harness();
    for id in 1..=3 {
        h.players
            .insert(row([("id", json!(id)), ("name", json!(format!("p{id}")))]));
    }

    let mirror = h.live.create_table_mirror(None, "players", "id").unwrap();
    settle().await;
    assert!(mirror.is_ready());
    assert_eq!(mirror.snapshot(), h.players.snapshot());
    assert!(h
        .executor
        .queries()
        .contains(&"SELECT * FROM app.players".to_string()));

    let events = vec![
        h.players.insert(row([("id", json!(4)), ("name", json!("p4"))])),
        h.players
            .update(&json!(2), |r| {
                r.insert("id".into(), json!(20));
            })
            .unwrap(),
        h.players.delete(&json!(1)).unwrap(),
    ];
    for ev in events {
        h.source.push(ev);
    }
    settle().await;
    assert_eq!(mirror.snapshot(), h.players.snapshot());
    assert_eq!(mirror.get("20").unwrap()["name"], json!("p2"));
    assert!(mirror.get("2").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_mirror_rejects_unsafe_identifiers() {
    let h = default_harness();
    assert!(matches!(
        h.live.create_table_mirror(None, "players; DROP TABLE x", "id"),
        Err(SelectError::InvalidIdentifier(_))
    ));
    let no_default = harness(MemorySource::auto_ready(), LiveConfig::new(1), None);
    assert!(matches!(
        no_default.live.create_table_mirror(None, "players", "id"),
        Err(SelectError::NoSchema { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_resume_rescans_mirrors() {
    let mut h = default_harness();
    h.players.insert(row([("id", json!(1)), ("name", json!("p1"))]));
    assert_eq!(
        next_connection_event(&mut h.events).await,
        ConnectionEvent::Ready
    );

    let mirror = h.live.create_table_mirror(None, "players", "id").unwrap();
    settle().await;
    assert_eq!(mirror.len(), 1);

    h.live.pause();
    let ev = h.players.insert(row([("id", json!(2)), ("name", json!("p2"))]));
    assert!(!h.source.push(ev));
    let ev = h
        .players
        .update(&json!(1), |r| {
            r.insert("name".into(), json!("renamed"));
        })
        .unwrap();
    assert!(!h.source.push(ev));
    settle().await;
    assert_eq!(mirror.len(), 1);

    h.live.resume();
    assert!(mirror.is_ready());
    settle().await;
    assert_eq!(mirror.snapshot(), h.players.snapshot());
    assert_eq!(mirror.get("1").unwrap()["name"], json!("renamed"));
    assert_eq!(
        h.executor
            .queries()
            .iter()
            .filter(|q| q.as_str() == "SELECT * FROM app.players")
            .count(),
        2
    );
}
