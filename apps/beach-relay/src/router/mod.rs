//! Maps subscriptions and addressed sends onto isolated reliable streams.
//!
//! The router is the only owner of the stream registry; consumers hold
//! [`StreamHandle`]s. Registry mutations happen under one lock so that two
//! concurrent subscribes for the same key can never both open a stream.

mod pump;
mod registry;
mod stream;

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use transport_bus::{Transport, TransportId};
use uuid::Uuid;

pub use pump::{spawn_inbound_pump, InboundDispatch};
pub use stream::{ReplayedRecord, StreamEvent, StreamFrame, StreamHandle};

use crate::metrics::ACTIVE_STREAMS;
use crate::protocol::{RecipientId, Role, Scope, Sequence, StreamKey, SubscriptionId};
use crate::reliable::ReliableConfig;
use registry::{Registry, StreamEntry};
use stream::{Origin, StreamTask};

const LIFECYCLE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("no live stream for {0}")]
    NoStream(StreamKey),
    #[error("scope {0} has viewer streams; a recipient is required")]
    RecipientRequired(Scope),
    #[error("stream {0} is closed")]
    StreamClosed(StreamKey),
    #[error("unknown subscription {subscription_id} on {transport}")]
    UnknownSubscription {
        transport: TransportId,
        subscription_id: SubscriptionId,
    },
    #[error("subscription {subscription_id} is already bound to {existing}")]
    SubscriptionConflict {
        subscription_id: SubscriptionId,
        existing: StreamKey,
    },
}

/// At-most-once notifications about streams opening and closing. Not part of
/// any delivery guarantee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLifecycle {
    Opened {
        key: StreamKey,
        subscription_id: SubscriptionId,
    },
    Closed {
        key: StreamKey,
        subscription_id: SubscriptionId,
    },
}

/// A freshly opened stream and the only receiver of its events.
#[derive(Debug)]
pub struct Subscription {
    pub handle: StreamHandle,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

#[derive(Debug)]
pub enum Subscribed {
    Opened(Subscription),
    /// The key already had a live stream; its events go to the original
    /// subscriber.
    Existing(StreamHandle),
}

impl Subscribed {
    pub fn handle(&self) -> &StreamHandle {
        match self {
            Subscribed::Opened(subscription) => &subscription.handle,
            Subscribed::Existing(handle) => handle,
        }
    }

    pub fn into_subscription(self) -> Option<Subscription> {
        match self {
            Subscribed::Opened(subscription) => Some(subscription),
            Subscribed::Existing(_) => None,
        }
    }
}

struct RouterInner {
    config: ReliableConfig,
    registry: Mutex<Registry>,
    lifecycle: broadcast::Sender<StreamLifecycle>,
}

#[derive(Clone)]
pub struct StreamRouter {
    inner: Arc<RouterInner>,
}

impl StreamRouter {
    pub fn new(config: ReliableConfig) -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            inner: Arc::new(RouterInner {
                config,
                registry: Mutex::new(Registry::default()),
                lifecycle,
            }),
        }
    }

    pub fn config(&self) -> ReliableConfig {
        self.inner.config
    }

    pub fn lifecycle(&self) -> broadcast::Receiver<StreamLifecycle> {
        self.inner.lifecycle.subscribe()
    }

    /// Opens a stream from this side and announces it to the peer on `link`.
    pub fn subscribe(
        &self,
        link: &Arc<dyn Transport>,
        scope: Scope,
        recipient: Option<RecipientId>,
    ) -> Subscribed {
        let key = StreamKey::from_addressing(scope, recipient);
        let mut registry = self.inner.registry.lock();
        if let Some(existing) = registry.get(&key) {
            if !existing.handle.is_closed() {
                return Subscribed::Existing(existing.handle.clone());
            }
        }
        let subscription_id = SubscriptionId::new(Uuid::new_v4().to_string());
        Subscribed::Opened(self.open(&mut registry, link, key, subscription_id, Origin::Local))
    }

    /// Handles a peer's subscribe. Repeats of the same subscription are
    /// no-ops; a new subscription for a live key supersedes the old stream.
    ///
    /// A newly opened default stream holds live durable records until
    /// [`StreamHandle::replay`] has queued its backlog.
    pub fn accept(
        &self,
        link: &Arc<dyn Transport>,
        subscription_id: SubscriptionId,
        scope: Scope,
        recipient: Option<RecipientId>,
    ) -> Result<Subscribed, RouteError> {
        let key = StreamKey::from_addressing(scope, recipient);
        let mut registry = self.inner.registry.lock();
        if let Some(existing) = registry.lookup(link.id(), &subscription_id) {
            if existing.handle.key() == &key {
                return Ok(Subscribed::Existing(existing.handle.clone()));
            }
            return Err(RouteError::SubscriptionConflict {
                subscription_id,
                existing: existing.handle.key().clone(),
            });
        }
        Ok(Subscribed::Opened(self.open(
            &mut registry,
            link,
            key,
            subscription_id,
            Origin::Remote,
        )))
    }

    /// Closes the stream behind `handle`, telling the peer when this side
    /// opened it. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, handle: &StreamHandle) -> bool {
        let removed = {
            let mut registry = self.inner.registry.lock();
            match registry.get(handle.key()) {
                Some(entry)
                    if entry.handle.subscription_id() == handle.subscription_id()
                        && entry.handle.transport_id() == handle.transport_id() =>
                {
                    registry.remove(handle.key())
                }
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                self.close(entry);
                true
            }
            None => false,
        }
    }

    /// Handles a peer's unsubscribe.
    pub fn close_remote(&self, transport: TransportId, subscription_id: &SubscriptionId) -> bool {
        let removed = self
            .inner
            .registry
            .lock()
            .remove_subscription(transport, subscription_id);
        match removed {
            Some(entry) => {
                entry.handle.close(false);
                self.closed(&entry.handle);
                true
            }
            None => false,
        }
    }

    /// Tears down every stream bound to `transport`.
    pub fn detach_transport(&self, transport: TransportId) -> usize {
        let removed = self.inner.registry.lock().remove_transport(transport);
        let count = removed.len();
        for entry in removed {
            entry.handle.close(false);
            self.closed(&entry.handle);
        }
        count
    }

    /// Routes a stream-addressed inbound frame by the subscription it
    /// arrived on.
    pub fn deliver(
        &self,
        transport: TransportId,
        subscription_id: &SubscriptionId,
        frame: StreamFrame,
    ) -> Result<(), RouteError> {
        let handle = self
            .inner
            .registry
            .lock()
            .lookup(transport, subscription_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| RouteError::UnknownSubscription {
                transport,
                subscription_id: subscription_id.clone(),
            })?;
        handle.inbound(frame)
    }

    /// Sends on the single stream the addressing fields resolve to.
    pub async fn send(
        &self,
        scope: &Scope,
        recipient: Option<&RecipientId>,
        payload: Bytes,
    ) -> Result<Sequence, RouteError> {
        let handle = self.resolve(scope, recipient)?;
        handle.send(payload).await
    }

    pub fn resolve(
        &self,
        scope: &Scope,
        recipient: Option<&RecipientId>,
    ) -> Result<StreamHandle, RouteError> {
        self.inner
            .registry
            .lock()
            .resolve(scope, recipient)
            .map(|entry| entry.handle.clone())
    }

    pub fn handle(&self, key: &StreamKey) -> Option<StreamHandle> {
        self.inner
            .registry
            .lock()
            .get(key)
            .map(|entry| entry.handle.clone())
    }

    pub fn streams_for_scope(&self, scope: &Scope) -> Vec<StreamKey> {
        self.inner.registry.lock().keys_for_scope(scope)
    }

    pub fn stream_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    pub fn viewer_stream_count(&self) -> usize {
        self.inner.registry.lock().count_role(Role::Viewer)
    }

    fn open(
        &self,
        registry: &mut Registry,
        link: &Arc<dyn Transport>,
        key: StreamKey,
        subscription_id: SubscriptionId,
        origin: Origin,
    ) -> Subscription {
        let await_replay = origin == Origin::Remote && key.role == Role::Coordinator;
        let (task, handle, events) = StreamTask::new(
            key.clone(),
            subscription_id.clone(),
            origin,
            Arc::clone(link),
            self.inner.config,
            await_replay,
        );
        let superseded = registry.insert(StreamEntry {
            handle: handle.clone(),
            origin,
        });
        if let Some(previous) = superseded {
            info!(
                target = "relay.router",
                stream = %key,
                previous = %previous.handle.subscription_id(),
                "stream superseded"
            );
            previous.handle.close(false);
            self.closed(&previous.handle);
        }
        tokio::spawn(task.run());

        ACTIVE_STREAMS.with_label_values(&[key.role.as_str()]).inc();
        info!(
            target = "relay.router",
            stream = %key,
            subscription = %subscription_id,
            transport = %link.id(),
            "stream opened"
        );
        self.notify(StreamLifecycle::Opened {
            key,
            subscription_id,
        });
        Subscription { handle, events }
    }

    fn close(&self, entry: StreamEntry) {
        entry.handle.close(entry.origin == Origin::Local);
        self.closed(&entry.handle);
    }

    fn closed(&self, handle: &StreamHandle) {
        ACTIVE_STREAMS
            .with_label_values(&[handle.key().role.as_str()])
            .dec();
        info!(
            target = "relay.router",
            stream = %handle.key(),
            subscription = %handle.subscription_id(),
            "stream closed"
        );
        self.notify(StreamLifecycle::Closed {
            key: handle.key().clone(),
            subscription_id: handle.subscription_id().clone(),
        });
    }

    fn notify(&self, event: StreamLifecycle) {
        let _ = self.inner.lifecycle.send(event);
    }
}
