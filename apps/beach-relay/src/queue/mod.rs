//! Durable per-scope replay queue.
//!
//! Bridges disconnects longer than a receiver's reorder buffer can cover.
//! Records are never deleted; acknowledgement only stops them replaying.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

pub use memory::MemoryReplayQueue;
pub use postgres::{run_migrations, PostgresReplayQueue};

use crate::protocol::{Scope, Sequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Acknowledged,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RecordStatus::Pending),
            "acknowledged" => Some(RecordStatus::Acknowledged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableRecord {
    pub id: Uuid,
    pub scope: Scope,
    /// Feed key for unsequenced records.
    pub topic: Option<String>,
    /// `None` for unsequenced feed records.
    pub sequence: Option<Sequence>,
    pub event_type: String,
    pub payload: Bytes,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl DurableRecord {
    pub fn is_pending(&self) -> bool {
        self.status == RecordStatus::Pending
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
    #[error("sequence space exhausted for scope {0}")]
    SequenceOverflow(Scope),
}

#[async_trait]
pub trait ReplayQueue: Send + Sync {
    /// Appends a record with the next sequence of `scope`. Allocation is
    /// atomic across concurrent producers; a failed write allocates nothing
    /// visible and is returned to the caller.
    async fn enqueue(
        &self,
        scope: &Scope,
        event_type: &str,
        payload: Bytes,
    ) -> Result<DurableRecord, QueueError>;

    /// Appends a record to an unsequenced feed keyed by `topic`.
    async fn enqueue_unsequenced(
        &self,
        scope: &Scope,
        topic: &str,
        event_type: &str,
        payload: Bytes,
    ) -> Result<DurableRecord, QueueError>;

    /// Pending sequenced records of `scope` with sequence above `start_from`,
    /// ascending.
    async fn replay(
        &self,
        scope: &Scope,
        start_from: Sequence,
    ) -> Result<Vec<DurableRecord>, QueueError>;

    /// Pending unsequenced records of `topic`, oldest first.
    async fn pending_feed(&self, topic: &str) -> Result<Vec<DurableRecord>, QueueError>;

    /// Marks a record acknowledged. Returns `false` for unknown or already
    /// acknowledged ids.
    async fn acknowledge(&self, id: Uuid) -> Result<bool, QueueError>;

    async fn pending_count(&self, scope: &Scope) -> Result<u64, QueueError>;

    async fn get(&self, id: Uuid) -> Result<Option<DurableRecord>, QueueError>;

    fn backend(&self) -> &'static str;
}

pub type QueueHandle = Arc<dyn ReplayQueue>;

/// Postgres when a pool is available, memory otherwise.
pub fn build_queue(pool: Option<PgPool>) -> QueueHandle {
    match pool {
        Some(pool) => Arc::new(PostgresReplayQueue::new(pool)),
        None => Arc::new(MemoryReplayQueue::new()),
    }
}
