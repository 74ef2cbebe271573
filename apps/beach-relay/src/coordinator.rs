//! Coordinator side of the relay: accepts viewer subscriptions, serves
//! durable replay and feeds heartbeats to the liveness monitor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use transport_bus::{Transport, TransportId};
use uuid::Uuid;

use crate::liveness::{LivenessError, LivenessMonitor};
use crate::metrics::ENVELOPES_REJECTED;
use crate::protocol::{
    CipherError, Envelope, PayloadCipher, RecipientId, Scope, Sequence, StreamKey,
    SubscriptionId,
};
use crate::queue::{DurableRecord, QueueError, QueueHandle};
use crate::router::{
    spawn_inbound_pump, InboundDispatch, RouteError, StreamFrame, StreamHandle, StreamRouter,
    Subscribed, Subscription,
};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
}

struct Inner {
    router: StreamRouter,
    queue: QueueHandle,
    liveness: LivenessMonitor,
    cipher: Arc<dyn PayloadCipher>,
    incoming: mpsc::UnboundedSender<Subscription>,
    pumps: Mutex<HashMap<TransportId, JoinHandle<()>>>,
    /// Serialises enqueue and live forward per scope so live records reach
    /// the stream in scope-sequence order.
    publishing: Mutex<HashMap<Scope, Arc<AsyncMutex<()>>>>,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Returns the coordinator and the receiver of newly accepted streams.
    /// Each accepted stream has already had its pending durable records
    /// queued ahead of any live traffic.
    pub fn new(
        router: StreamRouter,
        queue: QueueHandle,
        liveness: LivenessMonitor,
        cipher: Arc<dyn PayloadCipher>,
    ) -> (Self, mpsc::UnboundedReceiver<Subscription>) {
        let (incoming, incoming_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            inner: Arc::new(Inner {
                router,
                queue,
                liveness,
                cipher,
                incoming,
                pumps: Mutex::new(HashMap::new()),
                publishing: Mutex::new(HashMap::new()),
            }),
        };
        (coordinator, incoming_rx)
    }

    pub fn router(&self) -> &StreamRouter {
        &self.inner.router
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.inner.queue
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.inner.liveness
    }

    /// Starts reading envelopes from a viewer's transport.
    pub fn attach(&self, link: Arc<dyn Transport>) -> TransportId {
        let id = link.id();
        let pump = spawn_inbound_pump(link, Arc::clone(&self.inner));
        if let Some(previous) = self.inner.pumps.lock().insert(id, pump) {
            previous.abort();
        }
        debug!(target = "relay.router", transport = %id, "transport attached");
        id
    }

    /// Stops reading from `transport` and closes its streams. Durable records
    /// already enqueued are unaffected.
    pub fn detach(&self, transport: TransportId) -> usize {
        if let Some(pump) = self.inner.pumps.lock().remove(&transport) {
            pump.abort();
        }
        let closed = self.inner.router.detach_transport(transport);
        debug!(target = "relay.router", transport = %transport, closed, "transport detached");
        closed
    }

    /// Encrypts and sends one live message to the stream the addressing
    /// resolves to.
    pub async fn send(
        &self,
        scope: &Scope,
        recipient: Option<&RecipientId>,
        plaintext: Bytes,
    ) -> Result<Sequence, CoordinatorError> {
        let handle = self.inner.router.resolve(scope, recipient)?;
        let ciphertext = self.inner.cipher.encrypt(scope, plaintext)?;
        Ok(handle.send(ciphertext).await?)
    }

    /// Persists a message for `scope`, then forwards it live to the scope's
    /// default stream if one is open. The write must succeed before anything
    /// is sent.
    pub async fn publish_durable(
        &self,
        scope: &Scope,
        event_type: &str,
        plaintext: Bytes,
    ) -> Result<DurableRecord, CoordinatorError> {
        let ciphertext = self.inner.cipher.encrypt(scope, plaintext)?;
        let lock = self.inner.publish_lock(scope);
        let _publishing = lock.lock().await;
        let record = self.inner.queue.enqueue(scope, event_type, ciphertext).await?;
        if let Some(handle) = self
            .inner
            .router
            .handle(&StreamKey::coordinator(scope.clone()))
        {
            if let Err(err) = handle.push_record(&record) {
                debug!(
                    target = "relay.queue",
                    scope = %scope,
                    error = %err,
                    "live forward skipped; record waits for replay"
                );
            }
        }
        Ok(record)
    }

    /// Appends to an unsequenced feed such as inbound webhooks.
    pub async fn publish_feed(
        &self,
        scope: &Scope,
        topic: &str,
        event_type: &str,
        plaintext: Bytes,
    ) -> Result<DurableRecord, CoordinatorError> {
        let ciphertext = self.inner.cipher.encrypt(scope, plaintext)?;
        Ok(self
            .inner
            .queue
            .enqueue_unsequenced(scope, topic, event_type, ciphertext)
            .await?)
    }

    pub async fn acknowledge(&self, record_id: Uuid) -> Result<bool, CoordinatorError> {
        Ok(self.inner.queue.acknowledge(record_id).await?)
    }

    /// Decrypts a payload delivered on one of this coordinator's streams.
    pub fn open(&self, scope: &Scope, ciphertext: Bytes) -> Result<Bytes, CoordinatorError> {
        Ok(self.inner.cipher.decrypt(scope, ciphertext)?)
    }
}

impl Inner {
    async fn on_subscribe(
        &self,
        link: &Arc<dyn Transport>,
        subscription_id: SubscriptionId,
        scope: Scope,
        recipient: Option<RecipientId>,
        replay_from: Option<Sequence>,
    ) {
        let default_stream = recipient.is_none();
        let subscribed = match self
            .router
            .accept(link, subscription_id, scope.clone(), recipient)
        {
            Ok(subscribed) => subscribed,
            Err(err) => {
                warn!(target = "relay.router", transport = %link.id(), error = %err, "subscribe rejected");
                ENVELOPES_REJECTED
                    .with_label_values(&["subscription_conflict"])
                    .inc();
                return;
            }
        };

        // Durable records are scope-addressed, so only the default stream
        // carries them; named viewer streams never see another's backlog.
        if default_stream {
            self.replay(subscribed.handle(), &scope, replay_from.unwrap_or(0))
                .await;
        }

        match subscribed {
            Subscribed::Opened(subscription) => {
                if self.incoming.send(subscription).is_err() {
                    debug!(target = "relay.router", scope = %scope, "no consumer for accepted streams");
                }
            }
            Subscribed::Existing(handle) => {
                debug!(
                    target = "relay.router",
                    stream = %handle.key(),
                    "repeated subscribe for live stream"
                );
            }
        }
    }

    /// Queues the scope's pending backlog on `handle`. A failed read still
    /// releases the stream's held live records; the backlog then waits for
    /// the next subscribe.
    async fn replay(&self, handle: &StreamHandle, scope: &Scope, start_from: Sequence) {
        let records = match self.queue.replay(scope, start_from).await {
            Ok(records) => records,
            Err(err) => {
                warn!(target = "relay.queue", scope = %scope, error = %err, "replay failed");
                Vec::new()
            }
        };
        if handle.replay(&records).is_err() {
            return;
        }
        if !records.is_empty() {
            debug!(
                target = "relay.queue",
                scope = %scope,
                count = records.len(),
                start_from,
                "replayed pending records"
            );
        }
    }

    fn publish_lock(&self, scope: &Scope) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.publishing.lock().entry(scope.clone()).or_default())
    }

    fn deliver(&self, link: &Arc<dyn Transport>, subscription_id: &SubscriptionId, frame: StreamFrame) {
        if let Err(err) = self.router.deliver(link.id(), subscription_id, frame) {
            debug!(target = "relay.router", transport = %link.id(), error = %err, "frame not routed");
            ENVELOPES_REJECTED
                .with_label_values(&["unknown_subscription"])
                .inc();
        }
    }
}

#[async_trait]
impl InboundDispatch for Inner {
    async fn dispatch(&self, link: &Arc<dyn Transport>, envelope: Envelope) {
        match envelope {
            Envelope::Subscribe {
                subscription_id,
                scope,
                recipient,
                replay_from,
            } => {
                self.on_subscribe(link, subscription_id, scope, recipient, replay_from)
                    .await
            }
            Envelope::Unsubscribe { subscription_id } => {
                self.router.close_remote(link.id(), &subscription_id);
            }
            routed @ (Envelope::Data { .. } | Envelope::Ack { .. } | Envelope::Record { .. }) => {
                if let Ok((subscription_id, frame)) = StreamFrame::from_envelope(routed) {
                    self.deliver(link, &subscription_id, frame);
                }
            }
            Envelope::RecordAck { record_id } => {
                if let Err(err) = self.queue.acknowledge(record_id).await {
                    warn!(target = "relay.queue", record_id = %record_id, error = %err, "acknowledge failed");
                }
            }
            Envelope::Heartbeat { scope } => {
                if let Err(err) = self.liveness.heartbeat(&scope).await {
                    warn!(target = "relay.liveness", scope = %scope, error = %err, "heartbeat not recorded");
                }
            }
        }
    }
}
