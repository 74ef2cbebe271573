use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::{DurableRecord, QueueError, RecordStatus, ReplayQueue};
use crate::metrics::QUEUE_OPERATIONS;
use crate::protocol::{Scope, Sequence};

const BACKEND: &str = "postgres";

const RECORD_COLUMNS: &str = "id, scope, topic, sequence, event_type, payload, status, created_at, acknowledged_at";

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    scope: String,
    topic: Option<String>,
    sequence: Option<i64>,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    created_at: DateTime<Utc>,
    acknowledged_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRow> for DurableRecord {
    type Error = QueueError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let status = RecordStatus::parse(&row.status).ok_or_else(|| QueueError::Corrupt {
            id: row.id,
            reason: format!("unknown status {}", row.status),
        })?;
        let sequence = row
            .sequence
            .map(|value| {
                Sequence::try_from(value).map_err(|_| QueueError::Corrupt {
                    id: row.id,
                    reason: format!("negative sequence {value}"),
                })
            })
            .transpose()?;
        Ok(DurableRecord {
            id: row.id,
            scope: Scope::new(row.scope),
            topic: row.topic,
            sequence,
            event_type: row.event_type,
            payload: Bytes::from(row.payload),
            status,
            created_at: row.created_at,
            acknowledged_at: row.acknowledged_at,
        })
    }
}

fn into_records(rows: Vec<MessageRow>) -> Result<Vec<DurableRecord>, QueueError> {
    rows.into_iter().map(DurableRecord::try_from).collect()
}

/// Replay queue backed by the `relay_message` table.
///
/// Sequence allocation and the insert share one transaction, so a failed
/// insert rolls the counter back and concurrent producers serialize on the
/// scope's counter row.
pub struct PostgresReplayQueue {
    pool: PgPool,
}

impl PostgresReplayQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let pool = PgPool::connect(url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), QueueError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| QueueError::Database(err.into()))
}

#[async_trait]
impl ReplayQueue for PostgresReplayQueue {
    async fn enqueue(
        &self,
        scope: &Scope,
        event_type: &str,
        payload: Bytes,
    ) -> Result<DurableRecord, QueueError> {
        let mut tx = self.pool.begin().await?;
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO relay_scope_sequence (scope, last_sequence)
            VALUES ($1, 1)
            ON CONFLICT (scope)
            DO UPDATE SET last_sequence = relay_scope_sequence.last_sequence + 1
            RETURNING last_sequence
            "#,
        )
        .bind(scope.as_str())
        .fetch_one(tx.as_mut())
        .await?;

        let row: MessageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO relay_message (id, scope, sequence, event_type, payload, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(scope.as_str())
        .bind(sequence)
        .bind(event_type)
        .bind(payload.as_ref())
        .fetch_one(tx.as_mut())
        .await?;
        tx.commit().await?;

        QUEUE_OPERATIONS.with_label_values(&[BACKEND, "enqueue"]).inc();
        debug!(target = "relay.queue", scope = %scope, sequence, "enqueued");
        row.try_into()
    }

    async fn enqueue_unsequenced(
        &self,
        scope: &Scope,
        topic: &str,
        event_type: &str,
        payload: Bytes,
    ) -> Result<DurableRecord, QueueError> {
        let row: MessageRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO relay_message (id, scope, topic, sequence, event_type, payload, status)
            VALUES ($1, $2, $3, NULL, $4, $5, 'pending')
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(scope.as_str())
        .bind(topic)
        .bind(event_type)
        .bind(payload.as_ref())
        .fetch_one(&self.pool)
        .await?;
        QUEUE_OPERATIONS.with_label_values(&[BACKEND, "enqueue"]).inc();
        row.try_into()
    }

    async fn replay(
        &self,
        scope: &Scope,
        start_from: Sequence,
    ) -> Result<Vec<DurableRecord>, QueueError> {
        let start_from = i64::try_from(start_from).unwrap_or(i64::MAX);
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM relay_message
            WHERE scope = $1 AND status = 'pending' AND sequence > $2
            ORDER BY sequence ASC
            "#
        ))
        .bind(scope.as_str())
        .bind(start_from)
        .fetch_all(&self.pool)
        .await?;
        QUEUE_OPERATIONS.with_label_values(&[BACKEND, "replay"]).inc();
        into_records(rows)
    }

    async fn pending_feed(&self, topic: &str) -> Result<Vec<DurableRecord>, QueueError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM relay_message
            WHERE topic = $1 AND sequence IS NULL AND status = 'pending'
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    async fn acknowledge(&self, id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE relay_message
            SET status = 'acknowledged', acknowledged_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        let updated = result.rows_affected() > 0;
        if updated {
            QUEUE_OPERATIONS.with_label_values(&[BACKEND, "acknowledge"]).inc();
        }
        Ok(updated)
    }

    async fn pending_count(&self, scope: &Scope) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM relay_message WHERE scope = $1 AND status = 'pending'"#,
        )
        .bind(scope.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DurableRecord>, QueueError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM relay_message WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(DurableRecord::try_from).transpose()
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}
