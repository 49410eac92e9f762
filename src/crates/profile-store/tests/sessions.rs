mod common;

use common::{config, options, template, Cluster, KEY};
use futures::future::join_all;
use parking_lot::Mutex;
use profile_store::{
    InMemoryBackend, LastSaveReason, ProfileStoreError, SessionStart, SessionState,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_handoff_timeout_then_steal() {
    let cluster = Cluster::new(config());
    let a = cluster.process("a");
    let b = cluster.process("b");

    let held = a
        .store("players", template())
        .start_session(KEY, options())
        .await
        .unwrap()
        .profile()
        .unwrap();
    assert_eq!(held.session_load_count(), 1);
    held.data()["coins"] = json!(10);

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    held.on_last_save()
        .connect(move |reason: &LastSaveReason| sink.lock().push(*reason));
    let ended = Arc::new(AtomicBool::new(false));
    let flag = ended.clone();
    held.on_session_end().connect(move |_| flag.store(true, Ordering::SeqCst));

    let players_b = b.store("players", template());
    let started = Instant::now();
    let outcome = players_b
        .start_session(KEY, options().timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(matches!(outcome, SessionStart::TimedOut));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(held.is_active());

    let started = Instant::now();
    let stolen = players_b
        .start_session(KEY, options().steal(true))
        .await
        .unwrap()
        .profile()
        .unwrap();

    // The owner released on request, so no need to wait out the grace
    assert!(started.elapsed() < cluster.config.session_steal);
    assert_eq!(stolen.session_load_count(), 2);
    assert_eq!(stolen.data()["coins"], json!(10));
    assert_eq!(*reasons.lock(), vec![LastSaveReason::External]);
    assert_eq!(held.state(), SessionState::Ended);
    assert!(ended.load(Ordering::SeqCst));
    assert_eq!(a.active_session_count(), 0);
    assert_eq!(b.active_session_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unnotified_owner_loses_lock_on_next_write() {
    let cluster = Cluster::new(config());
    let a = cluster.deaf_process("a");
    let b = cluster.process("b");

    let held = a
        .store("players", template())
        .start_session(KEY, options())
        .await
        .unwrap()
        .profile()
        .unwrap();

    // Nobody tells the owner, so the stealer waits out the grace
    let started = Instant::now();
    let stolen = b
        .store("players", template())
        .start_session(KEY, options().steal(true))
        .await
        .unwrap();
    assert!(stolen.is_started());
    assert!(started.elapsed() >= cluster.config.session_steal);

    // The next heartbeat write finds the new owner
    tokio::time::sleep(cluster.config.heartbeat_refresh()).await;
    assert_eq!(held.state(), SessionState::Stolen);
    assert_eq!(a.active_session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_only_one_concurrent_acquirer_wins() {
    let backend_clock = profile_store::Clock::tokio();
    let backend = InMemoryBackend::with_clock(backend_clock).with_latency(Duration::from_millis(10));
    let cluster = Cluster::with_backend(config(), backend, backend_clock);

    let processes: Vec<_> = (0..6).map(|n| cluster.process(&format!("p{}", n))).collect();
    let stores: Vec<_> = processes
        .iter()
        .map(|process| process.store("players", template()))
        .collect();

    let outcomes = join_all(stores.iter().map(|store| {
        store.start_session(KEY, options().timeout(Duration::from_secs(1)))
    }))
    .await;

    let started = outcomes
        .into_iter()
        .map(Result::unwrap)
        .filter(SessionStart::is_started)
        .count();
    assert_eq!(started, 1);
    assert_eq!(cluster.stored(KEY).await.metadata.session_load_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_steal_waits_for_grace_when_owner_is_unresponsive() {
    let cluster = Cluster::new(config());
    cluster
        .write_phantom_owner(KEY, "frozen", cluster.clock.now())
        .await;
    let b = cluster.process("b");

    let started = Instant::now();
    let profile = b
        .store("players", template())
        .start_session(KEY, options().steal(true))
        .await
        .unwrap()
        .profile()
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= cluster.config.session_steal);
    assert!(elapsed < cluster.config.assume_dead);
    assert_eq!(profile.session_load_count(), 4);
    assert_eq!(profile.data()["coins"], json!(99));

    let stored = cluster.stored(KEY).await;
    assert_eq!(stored.metadata.active_session.as_ref(), Some(b.marker()));
    assert!(stored.metadata.release_request.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_competing_stealers_do_not_reset_each_other() {
    let cluster = Cluster::new(config());
    cluster
        .write_phantom_owner(KEY, "frozen", cluster.clock.now())
        .await;
    let b = cluster.deaf_process("b");
    let c = cluster.deaf_process("c");

    for process in [&b, &c] {
        let players = process.store("players", template());
        tokio::spawn(async move { players.start_session(KEY, options().steal(true)).await });
    }

    // Well inside the acquisition timeout and far from ASSUME_DEAD
    tokio::time::sleep(Duration::from_secs(100)).await;

    let owner = cluster.stored(KEY).await.metadata.active_session;
    assert!(owner.as_ref() == Some(b.marker()) || owner.as_ref() == Some(c.marker()));
}

#[tokio::test(start_paused = true)]
async fn test_dead_owner_claimed_after_assume_dead() {
    let cluster = Cluster::new(
        config()
            .with_assume_dead(Duration::from_secs(60))
            .with_start_session_timeout(Duration::from_secs(120)),
    );
    cluster
        .write_phantom_owner(KEY, "crashed", cluster.clock.now())
        .await;
    let b = cluster.process("b");

    let started = Instant::now();
    let outcome = b
        .store("players", template())
        .start_session(KEY, options())
        .await
        .unwrap();

    assert!(outcome.is_started());
    assert!(started.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_stale_lock_claimed_immediately() {
    let cluster = Cluster::new(config());
    let long_ago = cluster.clock.now() - chrono::Duration::seconds(3_600);
    cluster.write_phantom_owner(KEY, "crashed", long_ago).await;
    let b = cluster.process("b");

    let started = Instant::now();
    let outcome = b
        .store("players", template())
        .start_session(KEY, options())
        .await
        .unwrap();

    assert!(outcome.is_started());
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_idle_session_alive() {
    let cluster = Cluster::new(config());
    let a = cluster.process("a");
    let b = cluster.process("b");

    let held = a
        .store("players", template())
        .start_session(KEY, options())
        .await
        .unwrap()
        .profile()
        .unwrap();

    // Well past the dead threshold with no data changes
    tokio::time::sleep(cluster.config.assume_dead * 2).await;

    let outcome = b
        .store("players", template())
        .start_session(KEY, options().timeout(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(matches!(outcome, SessionStart::TimedOut));
    assert!(held.is_active());

    let stored = cluster.stored(KEY).await;
    assert!(cluster.clock.since(stored.metadata.last_update) < cluster.config.assume_dead);
}

#[tokio::test(start_paused = true)]
async fn test_lost_lock_detected_on_next_save() {
    let cluster = Cluster::new(config());
    let a = cluster.process("a");

    let held = a
        .store("players", template())
        .start_session(KEY, options())
        .await
        .unwrap()
        .profile()
        .unwrap();
    let ended = Arc::new(AtomicUsize::new(0));
    let counter = ended.clone();
    held.on_session_end().connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    cluster
        .write_phantom_owner(KEY, "intruder", cluster.clock.now())
        .await;
    held.data()["coins"] = json!(1);
    held.save_now().await.unwrap();

    assert_eq!(held.state(), SessionState::Stolen);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(a.active_session_count(), 0);
    // The intruder's data was not overwritten
    assert_eq!(cluster.stored(KEY).await.data["coins"], json!(99));
}

#[tokio::test(start_paused = true)]
async fn test_second_local_session_rejected() {
    let cluster = Cluster::new(config());
    let a = cluster.process("a");
    let players = a.store("players", template());

    let first = players.start_session(KEY, options()).await.unwrap();
    assert!(first.is_started());

    let second = players.start_session(KEY, options()).await;
    assert!(matches!(second, Err(ProfileStoreError::InvalidOperation(_))));

    // Other keys and other stores are independent
    assert!(players.start_session("player-2", options()).await.unwrap().is_started());
    assert!(a
        .store("settings", json!({}))
        .start_session(KEY, options())
        .await
        .unwrap()
        .is_started());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_predicate_aborts_polling() {
    let cluster = Cluster::new(config());
    let a = cluster.process("a");
    let b = cluster.process("b");
    a.store("players", template())
        .start_session(KEY, options())
        .await
        .unwrap();

    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let players_b = b.store("players", template());
    let attempt = tokio::spawn(async move {
        players_b
            .start_session(KEY, options().cancel(move || flag.load(Ordering::SeqCst)))
            .await
    });

    tokio::time::sleep(Duration::from_secs(12)).await;
    cancelled.store(true, Ordering::SeqCst);

    let outcome = attempt.await.unwrap().unwrap();
    assert!(matches!(outcome, SessionStart::Cancelled));
    assert_eq!(b.active_session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_end_session_releases_lock() {
    let cluster = Cluster::new(config());
    let a = cluster.process("a");
    let players = a.store("players", template());

    let profile = players.start_session(KEY, options()).await.unwrap().profile().unwrap();
    profile.data()["coins"] = json!(25);
    profile.end_session().await;

    assert_eq!(profile.state(), SessionState::Ended);
    let stored = cluster.stored(KEY).await;
    assert!(stored.metadata.active_session.is_none());
    assert_eq!(stored.data["coins"], json!(25));

    // Ending twice is a no-op, and the key can be loaded again right away
    profile.end_session().await;
    let again = players.start_session(KEY, options()).await.unwrap().profile().unwrap();
    assert_eq!(again.session_load_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_auto_save_after_session_ends() {
    let cluster = Cluster::new(config());
    let a = cluster.process("a");
    let players = a.store("players", template());

    let profile = players.start_session(KEY, options()).await.unwrap().profile().unwrap();
    profile.end_session().await;
    let writes = cluster.backend.write_count();

    profile.data()["coins"] = json!(1);
    profile.save();
    tokio::time::sleep(cluster.config.auto_save_period * 3).await;

    assert_eq!(cluster.backend.write_count(), writes);
    assert_eq!(cluster.stored(KEY).await.data["coins"], json!(0));
}

#[tokio::test(start_paused = true)]
async fn test_close_ends_every_session() {
    let cluster = Cluster::new(config());
    let a = cluster.process("a");
    let players = a.store("players", template());

    let reasons = Arc::new(Mutex::new(Vec::new()));
    for key in ["p1", "p2", "p3"] {
        let profile = players.start_session(key, options()).await.unwrap().profile().unwrap();
        let sink = reasons.clone();
        profile
            .on_last_save()
            .connect(move |reason: &LastSaveReason| sink.lock().push(*reason));
    }
    assert_eq!(a.active_session_count(), 3);

    a.close().await;

    assert_eq!(a.active_session_count(), 0);
    assert_eq!(*reasons.lock(), vec![LastSaveReason::Shutdown; 3]);
    for key in ["p1", "p2", "p3"] {
        assert!(cluster.stored(key).await.metadata.active_session.is_none());
    }
    assert!(matches!(
        players.start_session("p4", options()).await.unwrap(),
        SessionStart::Closing
    ));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_during_acquisition_keep_polling() {
    let cluster = Cluster::new(config());
    cluster
        .backend
        .fail_next(5, profile_store::FailureKind::Transient);
    let a = cluster.process("a");

    let outcome = a
        .store("players", template())
        .start_session(KEY, options())
        .await
        .unwrap();
    assert!(outcome.is_started());
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_surfaces_from_start_session() {
    let cluster = Cluster::new(config());
    cluster
        .backend
        .fail_next(1, profile_store::FailureKind::Permanent);
    let a = cluster.process("a");
    let players = a.store("players", template());

    let result = players.start_session(KEY, options()).await;
    assert!(matches!(result, Err(ProfileStoreError::Permanent(_))));
    // The registry slot was freed
    assert!(players.start_session(KEY, options()).await.unwrap().is_started());
}
