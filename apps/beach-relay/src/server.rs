//! WebSocket front door: every accepted connection becomes a transport
//! attached to the coordinator, and is detached again when it drops.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use transport_bus::{Transport, WebSocketLink};

use crate::Coordinator;

/// Accepts viewers on `listener` until accepting fails. Each connection is
/// handshaken on its own task so a slow client cannot stall the loop.
pub async fn serve(listener: TcpListener, coordinator: Coordinator) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(target = "relay.server", %addr, "accepting viewers");
    }
    loop {
        let (stream, peer) = listener.accept().await?;
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let link = match WebSocketLink::accept(stream).await {
                Ok(link) => Arc::new(link),
                Err(err) => {
                    warn!(target = "relay.server", %peer, error = %err, "handshake failed");
                    return;
                }
            };
            let mut connected = link.watch_connected();
            let id = coordinator.attach(link);
            debug!(target = "relay.server", %peer, transport = %id, "viewer connected");
            while *connected.borrow_and_update() {
                if connected.changed().await.is_err() {
                    break;
                }
            }
            let closed = coordinator.detach(id);
            debug!(target = "relay.server", %peer, transport = %id, closed, "viewer disconnected");
        });
    }
}
