use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{DurableRecord, QueueError, RecordStatus, ReplayQueue};
use crate::metrics::QUEUE_OPERATIONS;
use crate::protocol::{Scope, Sequence};

const BACKEND: &str = "memory";

#[derive(Default)]
struct Inner {
    /// Append order.
    records: Vec<DurableRecord>,
    index: HashMap<Uuid, usize>,
    last_sequence: HashMap<Scope, Sequence>,
}

impl Inner {
    fn append(&mut self, record: DurableRecord) -> DurableRecord {
        self.index.insert(record.id, self.records.len());
        self.records.push(record.clone());
        record
    }
}

/// Process-local queue. Survives disconnects, not restarts.
#[derive(Default)]
pub struct MemoryReplayQueue {
    inner: Mutex<Inner>,
}

impl MemoryReplayQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_record(
    scope: &Scope,
    topic: Option<&str>,
    sequence: Option<Sequence>,
    event_type: &str,
    payload: Bytes,
) -> DurableRecord {
    DurableRecord {
        id: Uuid::new_v4(),
        scope: scope.clone(),
        topic: topic.map(str::to_string),
        sequence,
        event_type: event_type.to_string(),
        payload,
        status: RecordStatus::Pending,
        created_at: Utc::now(),
        acknowledged_at: None,
    }
}

#[async_trait]
impl ReplayQueue for MemoryReplayQueue {
    async fn enqueue(
        &self,
        scope: &Scope,
        event_type: &str,
        payload: Bytes,
    ) -> Result<DurableRecord, QueueError> {
        let mut inner = self.inner.lock();
        let last = inner.last_sequence.get(scope).copied().unwrap_or(0);
        let sequence = last
            .checked_add(1)
            .ok_or_else(|| QueueError::SequenceOverflow(scope.clone()))?;
        inner.last_sequence.insert(scope.clone(), sequence);
        let record = inner.append(new_record(scope, None, Some(sequence), event_type, payload));
        QUEUE_OPERATIONS.with_label_values(&[BACKEND, "enqueue"]).inc();
        debug!(target = "relay.queue", scope = %scope, sequence, "enqueued");
        Ok(record)
    }

    async fn enqueue_unsequenced(
        &self,
        scope: &Scope,
        topic: &str,
        event_type: &str,
        payload: Bytes,
    ) -> Result<DurableRecord, QueueError> {
        let record = self
            .inner
            .lock()
            .append(new_record(scope, Some(topic), None, event_type, payload));
        QUEUE_OPERATIONS.with_label_values(&[BACKEND, "enqueue"]).inc();
        Ok(record)
    }

    async fn replay(
        &self,
        scope: &Scope,
        start_from: Sequence,
    ) -> Result<Vec<DurableRecord>, QueueError> {
        let inner = self.inner.lock();
        let mut records: Vec<DurableRecord> = inner
            .records
            .iter()
            .filter(|record| {
                record.is_pending()
                    && &record.scope == scope
                    && record.sequence.is_some_and(|sequence| sequence > start_from)
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| record.sequence);
        QUEUE_OPERATIONS.with_label_values(&[BACKEND, "replay"]).inc();
        Ok(records)
    }

    async fn pending_feed(&self, topic: &str) -> Result<Vec<DurableRecord>, QueueError> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .filter(|record| {
                record.is_pending()
                    && record.sequence.is_none()
                    && record.topic.as_deref() == Some(topic)
            })
            .cloned()
            .collect())
    }

    async fn acknowledge(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        let Some(&position) = inner.index.get(&id) else {
            return Ok(false);
        };
        let record = &mut inner.records[position];
        if !record.is_pending() {
            return Ok(false);
        }
        record.status = RecordStatus::Acknowledged;
        record.acknowledged_at = Some(Utc::now());
        QUEUE_OPERATIONS.with_label_values(&[BACKEND, "acknowledge"]).inc();
        Ok(true)
    }

    async fn pending_count(&self, scope: &Scope) -> Result<u64, QueueError> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .iter()
            .filter(|record| record.is_pending() && &record.scope == scope)
            .count() as u64)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DurableRecord>, QueueError> {
        let inner = self.inner.lock();
        Ok(inner
            .index
            .get(&id)
            .map(|&position| inner.records[position].clone()))
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
