//! End-to-end delivery over impaired in-process links. Every test runs on a
//! paused clock, so retransmit backoff costs no wall time.

mod common;

use std::time::Duration;

use beach_relay::{ReliableConfig, Scope, StreamEvent, Viewer};
use bytes::Bytes;
use common::{coordinator, delivered, link_pair, next_event, transport};
use transport_bus::{FaultPlan, Transport};

const MESSAGES: usize = 50;

fn payload(side: &str, index: usize) -> Bytes {
    Bytes::from(format!("{side}-{index}"))
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn lossy_link_delivers_each_message_once_in_order() {
    for seed in [7u64, 42, 1337] {
        let mut harness = coordinator();
        let hub = Scope::new(format!("hub-{seed}"));
        let (host, viewer_link) = link_pair();
        harness.coordinator.attach(transport(&host));
        let viewer = Viewer::connect(transport(&viewer_link), ReliableConfig::default());

        let mut viewer_side = viewer
            .subscribe(hub.clone(), None)
            .into_subscription()
            .expect("new stream");
        let mut host_side = harness.incoming.recv().await.expect("accepted");

        host.set_fault_plan(FaultPlan::lossy(seed));
        viewer_link.set_fault_plan(FaultPlan::lossy(seed.wrapping_add(1)));

        for index in 0..MESSAGES {
            harness
                .coordinator
                .send(&hub, None, payload("down", index))
                .await
                .expect("stream open");
            viewer_side
                .handle
                .send(payload("up", index))
                .await
                .expect("stream open");
        }

        let at_viewer = delivered(&mut viewer_side.events, MESSAGES).await;
        let at_host = delivered(&mut host_side.events, MESSAGES).await;
        for (index, (sequence, body)) in at_viewer.iter().enumerate() {
            assert_eq!(*sequence, index as u64 + 1, "seed {seed}");
            assert_eq!(body, &payload("down", index), "seed {seed}");
        }
        for (index, (sequence, body)) in at_host.iter().enumerate() {
            assert_eq!(*sequence, index as u64 + 1, "seed {seed}");
            assert_eq!(body, &payload("up", index), "seed {seed}");
        }

        // Late duplicates and retransmits must not surface again.
        tokio::time::sleep(Duration::from_secs(120)).await;
        for events in [&mut viewer_side.events, &mut host_side.events] {
            while let Ok(event) = events.try_recv() {
                assert!(
                    !matches!(event, StreamEvent::Delivered { .. } | StreamEvent::Reset),
                    "unexpected {event:?} for seed {seed}"
                );
            }
        }
        assert_eq!(
            viewer_side.handle.send(Bytes::from_static(b"tail")).await,
            Ok(MESSAGES as u64 + 1)
        );
    }
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn outage_pauses_retransmission_and_flushes_on_reconnect() {
    let mut harness = coordinator();
    let hub = Scope::new("hub-outage");
    let (host, viewer_link) = link_pair();
    harness.coordinator.attach(transport(&host));
    let viewer = Viewer::connect(transport(&viewer_link), ReliableConfig::default());

    let mut viewer_side = viewer
        .subscribe(hub.clone(), None)
        .into_subscription()
        .expect("new stream");
    let _host_side = harness.incoming.recv().await.expect("accepted");

    host.set_connected(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    for index in 0..5 {
        harness
            .coordinator
            .send(&hub, None, payload("queued", index))
            .await
            .expect("stream open while disconnected");
    }

    // Far longer than the full retransmit schedule; nothing may be given up.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(viewer_side.events.try_recv().is_err());

    host.set_connected(true);
    let got = delivered(&mut viewer_side.events, 5).await;
    let expected: Vec<_> = (0..5)
        .map(|index| (index as u64 + 1, payload("queued", index)))
        .collect();
    assert_eq!(got, expected);
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn unreachable_peer_fails_message_once() {
    let mut harness = coordinator();
    let hub = Scope::new("hub-silent");
    let (host, viewer_link) = link_pair();
    harness.coordinator.attach(transport(&host));
    let viewer = Viewer::connect(transport(&viewer_link), ReliableConfig::default());

    let _viewer_side = viewer
        .subscribe(hub.clone(), None)
        .into_subscription()
        .expect("new stream");
    let mut host_side = harness.incoming.recv().await.expect("accepted");

    // Connected but every frame is lost, so no ack ever comes back.
    host.set_fault_plan(FaultPlan {
        drop_rate: 1.0,
        ..FaultPlan::reliable()
    });
    let sequence = host_side
        .handle
        .send(Bytes::from_static(b"into the void"))
        .await
        .expect("stream open");

    assert_eq!(
        next_event(&mut host_side.events).await,
        StreamEvent::PermanentlyFailed(sequence)
    );
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(host_side.events.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn coordinator_restart_resets_viewer_stream() {
    let hub = Scope::new("hub-restart");
    let (host, viewer_link) = link_pair();
    let viewer = Viewer::connect(transport(&viewer_link), ReliableConfig::default());

    let mut first = coordinator();
    first.coordinator.attach(transport(&host));
    let mut viewer_side = viewer
        .subscribe(hub.clone(), None)
        .into_subscription()
        .expect("new stream");
    first.incoming.recv().await.expect("accepted");

    for index in 0..3 {
        first
            .coordinator
            .send(&hub, None, payload("before", index))
            .await
            .expect("stream open");
    }
    assert_eq!(delivered(&mut viewer_side.events, 3).await.len(), 3);

    first.coordinator.detach(host.id());
    drop(first);

    let mut second = coordinator();
    second.coordinator.attach(transport(&host));
    // The viewer re-announces its subscription when the transport comes back.
    viewer_link.set_connected(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    viewer_link.set_connected(true);
    second.incoming.recv().await.expect("re-accepted");

    second
        .coordinator
        .send(&hub, None, Bytes::from_static(b"after restart"))
        .await
        .expect("stream open");

    assert_eq!(next_event(&mut viewer_side.events).await, StreamEvent::Reset);
    assert_eq!(
        next_event(&mut viewer_side.events).await,
        StreamEvent::Delivered {
            sequence: 1,
            payload: Bytes::from_static(b"after restart"),
        }
    );
}

#[test_timeout::tokio_timeout_test(start_paused)]
async fn restarted_coordinator_frames_may_overtake_each_other() {
    let hub = Scope::new("hub-restart-reorder");
    let (host, viewer_link) = link_pair();
    let viewer = Viewer::connect(transport(&viewer_link), ReliableConfig::default());

    let mut first = coordinator();
    first.coordinator.attach(transport(&host));
    let mut viewer_side = viewer
        .subscribe(hub.clone(), None)
        .into_subscription()
        .expect("new stream");
    first.incoming.recv().await.expect("accepted");
    for index in 0..5 {
        first
            .coordinator
            .send(&hub, None, payload("before", index))
            .await
            .expect("stream open");
    }
    assert_eq!(delivered(&mut viewer_side.events, 5).await.len(), 5);
    first.coordinator.detach(host.id());
    drop(first);

    let mut second = coordinator();
    second.coordinator.attach(transport(&host));
    viewer_link.set_connected(false);
    tokio::time::sleep(Duration::from_millis(10)).await;
    viewer_link.set_connected(true);
    let mut host_side = second.incoming.recv().await.expect("re-accepted");

    // Every frame is held back and released behind its successor, so the
    // new sequence 2 reaches the viewer before sequence 1.
    host.set_fault_plan(FaultPlan {
        reorder_rate: 1.0,
        ..FaultPlan::reliable()
    });
    for index in 0..2 {
        second
            .coordinator
            .send(&hub, None, payload("after", index))
            .await
            .expect("stream open");
    }

    assert_eq!(next_event(&mut viewer_side.events).await, StreamEvent::Reset);
    assert_eq!(
        delivered(&mut viewer_side.events, 2).await,
        vec![(1, payload("after", 0)), (2, payload("after", 1))]
    );

    // Nothing is left pending, so nothing can fail later either.
    tokio::time::sleep(Duration::from_secs(600)).await;
    while let Ok(event) = host_side.events.try_recv() {
        assert!(
            !matches!(event, StreamEvent::PermanentlyFailed(_)),
            "unexpected {event:?}"
        );
    }
}
