//! Sync engine behavior against an in-memory council.

mod common;

use std::time::Duration;

use common::{Fault, FakeCouncil, QUIET};
use council_client::{spawn_engine, EngineConfig, SyncError, SyncPhase};
use council_types::{Event, StatusResponse};

const SESSION: &str = "brave-blue-fox";

fn quiet() -> EngineConfig {
    EngineConfig { poll_interval: QUIET }
}

#[tokio::test]
async fn test_empty_session_initial_load() {
    common::init_tracing();
    let fake = FakeCouncil::new(SESSION);
    let engine = spawn_engine(fake.remote(), SESSION, quiet());

    let snap = engine.wait_settled().await.unwrap();

    assert_eq!(snap.phase, SyncPhase::Settled);
    assert_eq!(snap.cursor, 1);
    assert_eq!(snap.event_count, 1);
    assert!(snap.participants.is_empty());
    assert_eq!(fake.fetches(), vec![0], "initial fetch omits the cursor");
    engine.shutdown();
}

#[tokio::test]
async fn test_refetch_merges_new_events() {
    let fake = FakeCouncil::new(SESSION);
    fake.join("Alice");
    let engine = spawn_engine(fake.remote(), SESSION, quiet());
    engine.wait_settled().await.unwrap();

    fake.join("Bob");
    fake.say("Alice", "hi Bob", Some("Bob"));
    let snap = engine.refetch().await.unwrap();

    assert_eq!(snap.cursor, 4);
    assert_eq!(snap.participants, vec!["Alice", "Bob"]);
    assert_eq!(snap.latest_next_hint(), Some("Bob"));
    assert_eq!(fake.fetches(), vec![0, 2]);
    engine.shutdown();
}

#[tokio::test]
async fn test_empty_polls_refresh_aggregates() {
    let fake = FakeCouncil::new(SESSION);
    fake.join("Alice");
    let engine = spawn_engine(fake.remote(), SESSION, quiet());
    let before = engine.wait_settled().await.unwrap();

    for participants in [vec!["Alice", "Bob"], vec!["Bob"]] {
        fake.inject(Fault::Response(StatusResponse {
            session_id: SESSION.into(),
            participants: participants.iter().map(|p| p.to_string()).collect(),
            event_count: 2,
            events: vec![],
        }));
        let snap = engine.refetch().await.unwrap();
        assert_eq!(snap.participants, participants);
        assert_eq!(snap.event_count, 2);
        assert_eq!(snap.events, before.events, "log unchanged");
    }
    engine.shutdown();
}

#[tokio::test]
async fn test_join_then_leave() {
    let fake = FakeCouncil::new(SESSION);
    let engine = spawn_engine(fake.remote(), SESSION, quiet());
    engine.wait_settled().await.unwrap();

    fake.join("Alice");
    fake.join("Bob");
    assert_eq!(engine.refetch().await.unwrap().participants, vec!["Alice", "Bob"]);

    fake.leave("Bob");
    fake.leave("Nobody");
    let snap = engine.refetch().await.unwrap();
    assert_eq!(snap.participants, vec!["Alice"]);
    assert_eq!(snap.cursor, 5);
    assert!(snap.last_error.is_none());
    engine.shutdown();
}

#[tokio::test]
async fn test_load_failure_then_refetch() {
    let fake = FakeCouncil::new(SESSION);
    fake.inject(Fault::Error(SyncError::transport("connection refused")));
    let engine = spawn_engine(fake.remote(), SESSION, quiet());

    let err = engine.wait_settled().await.unwrap_err();
    assert!(matches!(err, SyncError::Network { status: None, .. }));
    assert_eq!(engine.snapshot().phase, SyncPhase::LoadFailed);

    let snap = engine.refetch().await.unwrap();
    assert_eq!(snap.phase, SyncPhase::Settled);
    assert!(snap.last_error.is_none());
    engine.shutdown();
}

#[tokio::test]
async fn test_unknown_session_is_terminal() {
    let fake = FakeCouncil::new(SESSION);
    let engine = spawn_engine(fake.remote(), "no-such-session", quiet());

    let err = engine.wait_settled().await.unwrap_err();
    assert_eq!(err, SyncError::SessionNotFound { session_id: "no-such-session".into() });

    let err = engine.refetch().await.unwrap_err();
    assert!(matches!(err, SyncError::SessionNotFound { .. }));
    assert_eq!(fake.fetches().len(), 1, "no fetch after not-found");
    engine.shutdown();
}

#[tokio::test]
async fn test_gap_rejected_whole() {
    let fake = FakeCouncil::new(SESSION);
    fake.join("Alice");
    let engine = spawn_engine(fake.remote(), SESSION, quiet());
    engine.wait_settled().await.unwrap();

    fake.inject(Fault::Response(StatusResponse {
        session_id: SESSION.into(),
        participants: vec!["Alice".into()],
        event_count: 4,
        events: vec![Event::joined(4, "Carol")],
    }));
    let err = engine.refetch().await.unwrap_err();
    assert!(matches!(err, SyncError::ProtocolViolation(_)));

    let snap = engine.snapshot();
    assert_eq!(snap.cursor, 2);
    assert_eq!(snap.phase, SyncPhase::Settled);
    assert!(matches!(snap.last_error, Some(SyncError::ProtocolViolation(_))));

    // The next fetch resumes from the unchanged cursor and clears the error.
    fake.join("Bob");
    let snap = engine.refetch().await.unwrap();
    assert_eq!(snap.cursor, 3);
    assert!(snap.last_error.is_none());
    engine.shutdown();
}

#[tokio::test]
async fn test_refetch_queued_behind_in_flight() {
    let fake = FakeCouncil::new(SESSION);
    fake.set_gated(true);
    let engine = spawn_engine(fake.remote(), SESSION, quiet());

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.refetch().await })
    };
    tokio::task::yield_now().await;

    fake.release();
    fake.release();
    let snap = waiter.await.unwrap().unwrap();

    assert_eq!(snap.cursor, 1);
    assert_eq!(fake.fetches(), vec![0, 1], "second fetch ran after the first");
    engine.shutdown();
}

#[tokio::test]
async fn test_shutdown_drops_in_flight_result() {
    let fake = FakeCouncil::new(SESSION);
    fake.join("Alice");
    fake.set_gated(true);
    let engine = spawn_engine(fake.remote(), SESSION, quiet());

    engine.shutdown();
    fake.release();

    let mut rx = engine.subscribe();
    let snap = rx
        .wait_for(|s| s.phase == SyncPhase::TornDown)
        .await
        .map(|s| s.clone())
        .unwrap_or_else(|_| engine.snapshot());
    assert_eq!(snap.phase, SyncPhase::TornDown);
    assert!(snap.events.is_empty());
    assert_eq!(engine.wait_settled().await.unwrap_err(), SyncError::TornDown);
}

#[tokio::test]
async fn test_engine_stops_when_handles_dropped() {
    let fake = FakeCouncil::new(SESSION);
    let engine = spawn_engine(fake.remote(), SESSION, quiet());
    engine.wait_settled().await.unwrap();

    let mut rx = engine.subscribe();
    drop(engine);

    // The receiver sees the final TornDown state, then the channel closes.
    let _ = rx.wait_for(|s| s.phase == SyncPhase::TornDown).await;
    assert_eq!(rx.borrow().phase, SyncPhase::TornDown);
}

#[tokio::test]
async fn test_switch_session_resets_replica() {
    let fake = FakeCouncil::new(SESSION);
    fake.join("Alice");
    let engine = spawn_engine(fake.remote(), SESSION, quiet());
    engine.wait_settled().await.unwrap();

    engine.switch_session("other-session").await.unwrap();
    let snap = engine.snapshot();
    assert_eq!(snap.session_id, "other-session");
    assert_eq!(snap.cursor, 0);
    assert!(snap.participants.is_empty());

    let err = engine.wait_settled().await.unwrap_err();
    assert!(matches!(err, SyncError::SessionNotFound { .. }));

    // Switching back loads from scratch.
    engine.switch_session(SESSION).await.unwrap();
    let snap = engine.wait_settled().await.unwrap();
    assert_eq!(snap.cursor, 2);
    assert_eq!(fake.fetches(), vec![0, 0, 0]);
    engine.shutdown();
}

#[tokio::test]
async fn test_switch_discards_in_flight_fetch() {
    let fake = FakeCouncil::new(SESSION);
    let engine = spawn_engine(fake.remote(), SESSION, quiet());
    engine.wait_settled().await.unwrap();

    fake.set_gated(true);
    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.refetch().await })
    };
    tokio::task::yield_now().await;

    engine.switch_session(SESSION).await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap_err(), SyncError::TornDown);

    fake.set_gated(false);
    fake.release();
    let snap = engine.wait_settled().await.unwrap();
    assert_eq!(snap.cursor, 1);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_polling_picks_up_events() {
    let fake = FakeCouncil::new(SESSION);
    let engine = spawn_engine(fake.remote(), SESSION, EngineConfig::default());
    engine.wait_settled().await.unwrap();

    fake.join("Alice");
    let mut rx = engine.subscribe();
    let snap = rx.wait_for(|s| s.cursor == 2).await.unwrap().clone();

    assert_eq!(snap.participants, vec!["Alice"]);
    assert!(fake.fetches().len() >= 2);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_turn() {
    let fake = FakeCouncil::new(SESSION);
    fake.join("Alice");
    fake.join("Bob");
    let engine = spawn_engine(fake.remote(), SESSION, EngineConfig::default());
    let after = engine.wait_settled().await.unwrap().cursor;

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .wait_for_turn("Alice", after, Duration::from_secs(300))
                .await
        })
    };

    fake.say("Bob", "over to Moderator", Some("Moderator"));
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!waiter.is_finished());

    fake.say("Moderator", "Alice, your thoughts?", Some("Alice"));
    let snap = waiter.await.unwrap().unwrap().expect("turn reached");
    assert_eq!(snap.cursor, 5);
    assert_eq!(snap.events_after(after).len(), 2);
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_turn_times_out() {
    let fake = FakeCouncil::new(SESSION);
    fake.join("Alice");
    let engine = spawn_engine(fake.remote(), SESSION, EngineConfig::default());
    engine.wait_settled().await.unwrap();

    let result = engine
        .wait_for_turn("Alice", 2, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.is_none());
    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_ticks_never_overlap_a_slow_fetch() {
    let fake = FakeCouncil::new(SESSION);
    let engine = spawn_engine(fake.remote(), SESSION, EngineConfig::default());
    engine.wait_settled().await.unwrap();

    fake.set_gated(true);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fake.fetches(), vec![0, 1], "later ticks skipped while one is outstanding");

    fake.set_gated(false);
    fake.release();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(fake.fetches().len() > 2, "polling resumes once the fetch completes");
    assert_eq!(engine.snapshot().phase, SyncPhase::Settled);
    engine.shutdown();
}
