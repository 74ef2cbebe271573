//! Coordinator behaviour around the streams: heartbeats, hostile input and
//! storage failures.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beach_relay::metrics::ENVELOPES_REJECTED;
use beach_relay::queue::DurableRecord;
use beach_relay::{
    CoordinatorError, LivenessEvent, QueueError, RecipientId, ReliableConfig, ReplayQueue, Scope,
    Sequence, Viewer,
};
use bytes::Bytes;
use common::{coordinator, coordinator_with_queue, delivered, link_pair, transport};
use transport_bus::Transport;
use uuid::Uuid;

#[test_timeout::tokio_timeout_test(start_paused)]
async fn heartbeat_brings_scope_online() {
    let harness = coordinator();
    let hub = Scope::new("hub-beat");
    let mut liveness = harness.coordinator.liveness().subscribe();
    let (host, viewer_link) = link_pair();
    harness.coordinator.attach(transport(&host));
    let viewer = Viewer::connect(transport(&viewer_link), ReliableConfig::default());

    viewer.heartbeat(&hub).expect("link up");
    assert_eq!(
        liveness.recv().await.expect("liveness event"),
        LivenessEvent::Online(hub.clone())
    );
    assert!(harness.coordinator.liveness().is_alive(&hub).await.expect("store"));

    // Further heartbeats refresh without announcing again.
    viewer.heartbeat(&hub).expect("link up");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(liveness.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn malformed_frames_are_dropped_without_disturbing_streams() {
    let mut harness = coordinator();
    let hub = Scope::new("hub-garbage");
    let (host, viewer_link) = link_pair();
    harness.coordinator.attach(transport(&host));
    let viewer = Viewer::connect(transport(&viewer_link), ReliableConfig::default());

    let mut viewer_side = viewer
        .subscribe(hub.clone(), Some(RecipientId::new("a")))
        .into_subscription()
        .expect("new stream");
    let mut host_side = harness.incoming.recv().await.expect("accepted");

    let unknown_before = ENVELOPES_REJECTED.with_label_values(&["unknown_type"]).get();
    let malformed_before = ENVELOPES_REJECTED.with_label_values(&["not_an_object"]).get();
    let zero_before = ENVELOPES_REJECTED.with_label_values(&["zero_sequence"]).get();

    viewer_link
        .send(Bytes::from_static(b"\x00\x01 not json"))
        .expect("link up");
    viewer_link
        .send(Bytes::from_static(br#"{"type":"teleport","scope":"hub-garbage"}"#))
        .expect("link up");
    let zero = format!(
        r#"{{"type":"data","subscription_id":"{}","sequence":0,"payload":""}}"#,
        viewer_side.handle.subscription_id()
    );
    viewer_link.send(Bytes::from(zero)).expect("link up");

    viewer_side
        .handle
        .send(Bytes::from_static(b"still fine"))
        .await
        .expect("stream open");
    harness
        .coordinator
        .send(&hub, Some(&RecipientId::new("a")), Bytes::from_static(b"and back"))
        .await
        .expect("routed");

    assert_eq!(
        delivered(&mut host_side.events, 1).await,
        vec![(1, Bytes::from_static(b"still fine"))]
    );
    assert_eq!(
        delivered(&mut viewer_side.events, 1).await,
        vec![(1, Bytes::from_static(b"and back"))]
    );
    assert!(ENVELOPES_REJECTED.with_label_values(&["unknown_type"]).get() > unknown_before);
    assert!(ENVELOPES_REJECTED.with_label_values(&["not_an_object"]).get() > malformed_before);
    assert!(ENVELOPES_REJECTED.with_label_values(&["zero_sequence"]).get() > zero_before);
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn frames_for_unknown_subscriptions_are_ignored() {
    let mut harness = coordinator();
    let hub = Scope::new("hub-stray");
    let (host, viewer_link) = link_pair();
    harness.coordinator.attach(transport(&host));

    let stray = br#"{"type":"data","subscription_id":"nobody","sequence":1,"payload":"AA=="}"#;
    viewer_link.send(Bytes::from_static(stray)).expect("link up");
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(harness.incoming.try_recv().is_err());
    assert_eq!(harness.coordinator.router().stream_count(), 0);
    assert!(harness.coordinator.router().streams_for_scope(&hub).is_empty());
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn detach_closes_streams_of_that_transport_only() {
    let mut harness = coordinator();
    let hub = Scope::new("hub-detach");
    let (host_a, viewer_a_link) = link_pair();
    let (host_b, viewer_b_link) = link_pair();
    let a_id = harness.coordinator.attach(transport(&host_a));
    harness.coordinator.attach(transport(&host_b));
    let viewer_a = Viewer::connect(transport(&viewer_a_link), ReliableConfig::default());
    let viewer_b = Viewer::connect(transport(&viewer_b_link), ReliableConfig::default());

    let _a = viewer_a.subscribe(hub.clone(), Some(RecipientId::new("a")));
    let _b = viewer_b.subscribe(hub.clone(), Some(RecipientId::new("b")));
    harness.incoming.recv().await.expect("accepted");
    harness.incoming.recv().await.expect("accepted");
    assert_eq!(harness.coordinator.router().viewer_stream_count(), 2);

    assert_eq!(harness.coordinator.detach(a_id), 1);
    assert!(harness
        .coordinator
        .router()
        .resolve(&hub, Some(&RecipientId::new("a")))
        .is_err());
    assert!(harness
        .coordinator
        .router()
        .resolve(&hub, Some(&RecipientId::new("b")))
        .is_ok());
}

struct UnavailableQueue;

#[async_trait]
impl ReplayQueue for UnavailableQueue {
    async fn enqueue(
        &self,
        _scope: &Scope,
        _event_type: &str,
        _payload: Bytes,
    ) -> Result<DurableRecord, QueueError> {
        Err(QueueError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn enqueue_unsequenced(
        &self,
        _scope: &Scope,
        _topic: &str,
        _event_type: &str,
        _payload: Bytes,
    ) -> Result<DurableRecord, QueueError> {
        Err(QueueError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn replay(
        &self,
        _scope: &Scope,
        _start_from: Sequence,
    ) -> Result<Vec<DurableRecord>, QueueError> {
        Err(QueueError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn pending_feed(&self, _topic: &str) -> Result<Vec<DurableRecord>, QueueError> {
        Ok(Vec::new())
    }

    async fn acknowledge(&self, _id: Uuid) -> Result<bool, QueueError> {
        Err(QueueError::Database(sqlx::Error::PoolTimedOut))
    }

    async fn pending_count(&self, _scope: &Scope) -> Result<u64, QueueError> {
        Ok(0)
    }

    async fn get(&self, _id: Uuid) -> Result<Option<DurableRecord>, QueueError> {
        Ok(None)
    }

    fn backend(&self) -> &'static str {
        "unavailable"
    }
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn failed_durable_write_is_reported_and_nothing_is_sent() {
    let mut harness = coordinator_with_queue(Arc::new(UnavailableQueue));
    let hub = Scope::new("hub-down");
    let (host, viewer_link) = link_pair();
    harness.coordinator.attach(transport(&host));
    let viewer = Viewer::connect(transport(&viewer_link), ReliableConfig::default());

    // Replay fails too, but the stream still opens for live traffic.
    let mut stream = viewer
        .subscribe(hub.clone(), None)
        .into_subscription()
        .expect("new stream");
    harness.incoming.recv().await.expect("accepted");

    let err = harness
        .coordinator
        .publish_durable(&hub, "message", Bytes::from_static(b"lost?"))
        .await
        .expect_err("write failed");
    assert!(matches!(
        err,
        CoordinatorError::Queue(QueueError::Database(sqlx::Error::PoolTimedOut))
    ));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(stream.events.try_recv().is_err());

    harness
        .coordinator
        .send(&hub, None, Bytes::from_static(b"live"))
        .await
        .expect("live path unaffected");
    assert_eq!(
        delivered(&mut stream.events, 1).await,
        vec![(1, Bytes::from_static(b"live"))]
    );
}
