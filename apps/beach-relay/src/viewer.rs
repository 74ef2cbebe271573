//! Viewer side of the relay: opens streams towards a coordinator over one
//! transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use transport_bus::{BusError, Transport};

use crate::metrics::ENVELOPES_REJECTED;
use crate::protocol::{Envelope, EnvelopeError, RecipientId, Scope};
use crate::reliable::ReliableConfig;
use crate::router::{
    spawn_inbound_pump, InboundDispatch, StreamFrame, StreamHandle, StreamRouter, Subscribed,
};

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct Viewer {
    router: StreamRouter,
    link: Arc<dyn Transport>,
    pump: JoinHandle<()>,
}

struct ViewerDispatch {
    router: StreamRouter,
}

impl Viewer {
    pub fn connect(link: Arc<dyn Transport>, config: ReliableConfig) -> Self {
        let router = StreamRouter::new(config);
        let pump = spawn_inbound_pump(
            Arc::clone(&link),
            Arc::new(ViewerDispatch {
                router: router.clone(),
            }),
        );
        Self { router, link, pump }
    }

    pub fn router(&self) -> &StreamRouter {
        &self.router
    }

    /// Subscribes to `scope`. Without a recipient this is the scope's default
    /// stream, which also carries durable replay.
    pub fn subscribe(&self, scope: Scope, recipient: Option<RecipientId>) -> Subscribed {
        self.router.subscribe(&self.link, scope, recipient)
    }

    pub fn unsubscribe(&self, handle: &StreamHandle) -> bool {
        self.router.unsubscribe(handle)
    }

    pub fn heartbeat(&self, scope: &Scope) -> Result<(), ViewerError> {
        let frame = Envelope::Heartbeat {
            scope: scope.clone(),
        }
        .encode()?;
        self.link.send(frame)?;
        Ok(())
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.pump.abort();
        self.router.detach_transport(self.link.id());
    }
}

#[async_trait]
impl InboundDispatch for ViewerDispatch {
    async fn dispatch(&self, link: &Arc<dyn Transport>, envelope: Envelope) {
        let (subscription_id, frame) = match StreamFrame::from_envelope(envelope) {
            Ok(routed) => routed,
            Err(unexpected) => {
                warn!(
                    target = "relay.router",
                    transport = %link.id(),
                    kind = unexpected.kind(),
                    "viewer received a coordinator-bound envelope"
                );
                ENVELOPES_REJECTED.with_label_values(&["unexpected"]).inc();
                return;
            }
        };
        if let Err(err) = self.router.deliver(link.id(), &subscription_id, frame) {
            debug!(target = "relay.router", error = %err, "frame not routed");
            ENVELOPES_REJECTED
                .with_label_values(&["unknown_subscription"])
                .inc();
        }
    }
}
