use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;
use transport_bus::Transport;

use crate::metrics::{ENVELOPES_RECEIVED, ENVELOPES_REJECTED};
use crate::protocol::Envelope;

/// Receives every well-formed envelope read from one transport, in arrival
/// order.
#[async_trait]
pub trait InboundDispatch: Send + Sync + 'static {
    async fn dispatch(&self, link: &Arc<dyn Transport>, envelope: Envelope);
}

/// Reads frames from `link`, decodes them and hands them to `dispatcher`.
/// Malformed frames are logged, counted and dropped here so they never reach
/// a stream.
pub fn spawn_inbound_pump<D>(link: Arc<dyn Transport>, dispatcher: Arc<D>) -> JoinHandle<()>
where
    D: InboundDispatch + ?Sized,
{
    let mut frames = link.subscribe();
    tokio::spawn(async move {
        loop {
            let frame = match frames.recv().await {
                Ok(frame) => frame,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        target = "relay.router",
                        transport = %link.id(),
                        skipped,
                        "inbound pump lagged; frames lost"
                    );
                    ENVELOPES_REJECTED
                        .with_label_values(&["lagged"])
                        .inc_by(skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match Envelope::decode(&frame) {
                Ok(envelope) => {
                    ENVELOPES_RECEIVED
                        .with_label_values(&[envelope.kind()])
                        .inc();
                    dispatcher.dispatch(&link, envelope).await;
                }
                Err(err) => {
                    warn!(
                        target = "relay.router",
                        transport = %link.id(),
                        error = %err,
                        bytes = frame.len(),
                        "dropping malformed envelope"
                    );
                    ENVELOPES_REJECTED
                        .with_label_values(&[err.reason()])
                        .inc();
                }
            }
        }
    })
}
