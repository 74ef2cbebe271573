//! The relay's WebSocket front door on a loopback socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use beach_relay::{server, ReliableConfig, Scope, Viewer};
use bytes::Bytes;
use common::{coordinator, delivered};
use tokio::net::TcpListener;
use transport_bus::{Transport, WebSocketLink};

#[test_timeout::tokio_timeout_test(30)]
async fn viewer_over_a_socket_exchanges_messages_until_it_leaves() {
    let mut harness = coordinator();
    let hub = Scope::new("hub-socket");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let serving = tokio::spawn(server::serve(listener, harness.coordinator.clone()));

    let link = WebSocketLink::connect(&format!("ws://{addr}"))
        .await
        .expect("handshake");
    let viewer_link: Arc<dyn Transport> = Arc::new(link);
    let viewer = Viewer::connect(Arc::clone(&viewer_link), ReliableConfig::default());
    let mut viewer_side = viewer
        .subscribe(hub.clone(), None)
        .into_subscription()
        .expect("new stream");
    let mut host_side = harness.incoming.recv().await.expect("accepted");

    viewer_side
        .handle
        .send(Bytes::from_static(b"up"))
        .await
        .expect("stream open");
    harness
        .coordinator
        .send(&hub, None, Bytes::from_static(b"down"))
        .await
        .expect("stream open");
    assert_eq!(
        delivered(&mut host_side.events, 1).await,
        vec![(1, Bytes::from_static(b"up"))]
    );
    assert_eq!(
        delivered(&mut viewer_side.events, 1).await,
        vec![(1, Bytes::from_static(b"down"))]
    );

    drop(viewer_side);
    drop(viewer);
    drop(viewer_link);
    while harness.coordinator.router().resolve(&hub, None).is_ok() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    serving.abort();
}
