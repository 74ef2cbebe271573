//! Postgres-backed checks for the replay queue and liveness store.
//!
//! These tests are ignored by default. To run them locally:
//! - Start Postgres and export `DATABASE_URL` pointing at it
//! - Run: `cargo test -p beach-relay -- --ignored postgres_`

use std::sync::Arc;
use std::time::Duration;

use beach_relay::liveness::PostgresLivenessStore;
use beach_relay::queue::{run_migrations, PostgresReplayQueue};
use beach_relay::{LivenessEvent, LivenessMonitor, OfflineReason, ReplayQueue, Scope};
use bytes::Bytes;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

async fn pool() -> PgPool {
    let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .expect("connect to postgres");
    run_migrations(&pool).await.expect("apply migrations");
    pool
}

fn fresh_scope() -> Scope {
    Scope::new(format!("itest-{}", Uuid::new_v4()))
}

#[ignore]
#[test_timeout::tokio_timeout_test(120)]
async fn postgres_queue_replays_pending_suffix() {
    let queue = PostgresReplayQueue::new(pool().await);
    let hub = fresh_scope();

    let mut ids = Vec::new();
    for body in ["one", "two", "three"] {
        let record = queue
            .enqueue(&hub, "message", Bytes::from(body))
            .await
            .expect("enqueue");
        ids.push(record.id);
    }
    assert!(queue.acknowledge(ids[0]).await.expect("ack"));
    assert!(!queue.acknowledge(ids[0]).await.expect("second ack"));

    let pending = queue.replay(&hub, 0).await.expect("replay");
    let sequences: Vec<_> = pending.iter().map(|record| record.sequence).collect();
    assert_eq!(sequences, vec![Some(2), Some(3)]);
    assert_eq!(pending[0].payload, Bytes::from_static(b"two"));
    assert_eq!(queue.pending_count(&hub).await.expect("count"), 2);

    let stored = queue.get(ids[0]).await.expect("get").expect("present");
    assert!(!stored.is_pending());
    assert!(stored.acknowledged_at.is_some());
}

#[ignore]
#[test_timeout::tokio_timeout_test(120)]
async fn postgres_concurrent_enqueues_allocate_unique_sequences() {
    let queue = Arc::new(PostgresReplayQueue::new(pool().await));
    let hub = fresh_scope();

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let queue = Arc::clone(&queue);
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            let mut sequences = Vec::new();
            for index in 0..10 {
                let record = queue
                    .enqueue(&hub, "message", Bytes::from(format!("{worker}-{index}")))
                    .await
                    .expect("enqueue");
                sequences.push(record.sequence.expect("sequenced"));
            }
            sequences
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.expect("worker"));
    }
    all.sort_unstable();
    assert_eq!(all, (1..=80).collect::<Vec<u64>>());
}

#[ignore]
#[test_timeout::tokio_timeout_test(120)]
async fn postgres_feed_records_stay_out_of_replay() {
    let queue = PostgresReplayQueue::new(pool().await);
    let hub = fresh_scope();
    let topic = format!("webhooks-{}", Uuid::new_v4());

    let feed = queue
        .enqueue_unsequenced(&hub, &topic, "webhook", Bytes::from_static(b"{}"))
        .await
        .expect("feed enqueue");
    assert_eq!(feed.sequence, None);
    assert!(queue.replay(&hub, 0).await.expect("replay").is_empty());

    let pending = queue.pending_feed(&topic).await.expect("feed");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, feed.id);
}

#[ignore]
#[test_timeout::tokio_timeout_test(120)]
async fn postgres_liveness_heartbeat_and_sweep() {
    let store = Arc::new(PostgresLivenessStore::new(pool().await));
    let monitor = LivenessMonitor::new(store, Duration::from_secs(120));
    let mut events = monitor.subscribe();
    let hub = fresh_scope();

    let start = Utc::now();
    monitor.heartbeat_at(&hub, start).await.expect("heartbeat");
    assert_eq!(events.recv().await.expect("event"), LivenessEvent::Online(hub.clone()));
    monitor
        .heartbeat_at(&hub, start + chrono::Duration::seconds(60))
        .await
        .expect("heartbeat");
    assert!(events.try_recv().is_err());

    // Other scopes in a shared database may also go stale here.
    let swept = monitor
        .sweep_at(start + chrono::Duration::seconds(150))
        .await
        .expect("sweep");
    assert!(!swept.contains(&hub));

    let swept = monitor
        .sweep_at(start + chrono::Duration::seconds(181))
        .await
        .expect("sweep");
    assert!(swept.contains(&hub));
    assert!(!monitor.is_alive(&hub).await.expect("alive"));
    loop {
        match events.recv().await.expect("event") {
            LivenessEvent::Offline { scope, reason } if scope == hub => {
                assert_eq!(reason, OfflineReason::Stale);
                break;
            }
            _ => continue,
        }
    }
}

#[ignore]
#[test_timeout::tokio_timeout_test(120)]
async fn postgres_concurrent_first_heartbeats_report_one_transition() {
    let store = Arc::new(PostgresLivenessStore::new(pool().await));
    let monitor = LivenessMonitor::new(store, Duration::from_secs(120));
    let mut events = monitor.subscribe();
    let hub = fresh_scope();
    let now = Utc::now();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let monitor = monitor.clone();
        let hub = hub.clone();
        tasks.push(tokio::spawn(async move {
            monitor.heartbeat_at(&hub, now).await.expect("heartbeat");
        }));
    }
    for task in tasks {
        task.await.expect("heartbeat task");
    }

    let mut online = 0;
    while let Ok(event) = events.try_recv() {
        if event == LivenessEvent::Online(hub.clone()) {
            online += 1;
        }
    }
    assert_eq!(online, 1);
    assert!(monitor.is_alive(&hub).await.expect("alive"));
}
