#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use beach_relay::protocol::PlaintextCipher;
use beach_relay::queue::{MemoryReplayQueue, QueueHandle};
use beach_relay::router::ReplayedRecord;
use beach_relay::{
    Coordinator, DurableRecord, LivenessMonitor, QueueError, ReliableConfig, ReplayQueue, Scope,
    Sequence, StreamEvent, StreamRouter, Subscription,
};
use bytes::Bytes;
use tokio::sync::mpsc;
use transport_bus::{LocalLink, Transport};
use uuid::Uuid;

pub struct Harness {
    pub coordinator: Coordinator,
    pub incoming: mpsc::UnboundedReceiver<Subscription>,
}

pub fn coordinator() -> Harness {
    coordinator_with_queue(Arc::new(MemoryReplayQueue::new()))
}

pub fn coordinator_with_queue(queue: QueueHandle) -> Harness {
    let (coordinator, incoming) = Coordinator::new(
        StreamRouter::new(ReliableConfig::default()),
        queue,
        LivenessMonitor::in_memory(),
        Arc::new(PlaintextCipher),
    );
    Harness {
        coordinator,
        incoming,
    }
}

/// Returns (coordinator end, viewer end).
pub fn link_pair() -> (Arc<LocalLink>, Arc<LocalLink>) {
    let (host, viewer) = LocalLink::pair();
    (Arc::new(host), Arc::new(viewer))
}

pub fn transport(link: &Arc<LocalLink>) -> Arc<dyn Transport> {
    link.clone()
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
    events.recv().await.expect("stream still open")
}

/// Waits for `count` deliveries, skipping other events.
pub async fn delivered(
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    count: usize,
) -> Vec<(Sequence, Bytes)> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        if let StreamEvent::Delivered { sequence, payload } = next_event(events).await {
            out.push((sequence, payload));
        }
    }
    out
}

/// Waits for `count` durable records, skipping other events.
pub async fn replayed(
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    count: usize,
) -> Vec<ReplayedRecord> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        if let StreamEvent::Replayed(record) = next_event(events).await {
            out.push(record);
        }
    }
    out
}

/// Memory queue that reports every acknowledgement it applies.
pub struct SignallingQueue {
    inner: MemoryReplayQueue,
    acknowledged: mpsc::UnboundedSender<Uuid>,
}

pub fn signalling_queue() -> (QueueHandle, mpsc::UnboundedReceiver<Uuid>) {
    let (acknowledged, rx) = mpsc::unbounded_channel();
    let queue = SignallingQueue {
        inner: MemoryReplayQueue::new(),
        acknowledged,
    };
    (Arc::new(queue), rx)
}

#[async_trait]
impl ReplayQueue for SignallingQueue {
    async fn enqueue(
        &self,
        scope: &Scope,
        event_type: &str,
        payload: Bytes,
    ) -> Result<DurableRecord, QueueError> {
        self.inner.enqueue(scope, event_type, payload).await
    }

    async fn enqueue_unsequenced(
        &self,
        scope: &Scope,
        topic: &str,
        event_type: &str,
        payload: Bytes,
    ) -> Result<DurableRecord, QueueError> {
        self.inner
            .enqueue_unsequenced(scope, topic, event_type, payload)
            .await
    }

    async fn replay(
        &self,
        scope: &Scope,
        start_from: Sequence,
    ) -> Result<Vec<DurableRecord>, QueueError> {
        self.inner.replay(scope, start_from).await
    }

    async fn pending_feed(&self, topic: &str) -> Result<Vec<DurableRecord>, QueueError> {
        self.inner.pending_feed(topic).await
    }

    async fn acknowledge(&self, id: Uuid) -> Result<bool, QueueError> {
        let changed = self.inner.acknowledge(id).await?;
        let _ = self.acknowledged.send(id);
        Ok(changed)
    }

    async fn pending_count(&self, scope: &Scope) -> Result<u64, QueueError> {
        self.inner.pending_count(scope).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<DurableRecord>, QueueError> {
        self.inner.get(id).await
    }

    fn backend(&self) -> &'static str {
        self.inner.backend()
    }
}
