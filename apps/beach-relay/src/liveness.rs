//! Heartbeat-driven online/offline tracking per scope.
//!
//! Events fire only on transitions. The staleness sweep decides on the
//! freshest `last_seen_at` available at flip time, never on a snapshot taken
//! at the start of the sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::LIVENESS_TRANSITIONS;
use crate::protocol::Scope;

pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(120);
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    Stale,
    Disconnected,
}

impl OfflineReason {
    fn as_str(self) -> &'static str {
        match self {
            OfflineReason::Stale => "stale",
            OfflineReason::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    Online(Scope),
    Offline { scope: Scope, reason: OfflineReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    pub scope: Scope,
    pub alive: bool,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait LivenessStore: Send + Sync {
    /// Records a heartbeat. Returns `true` when the scope was not alive before.
    async fn heartbeat(&self, scope: &Scope, now: DateTime<Utc>) -> Result<bool, LivenessError>;

    /// Marks every alive scope last seen before `cutoff` as offline and
    /// returns them.
    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Vec<Scope>, LivenessError>;

    /// Returns `true` when the scope was alive.
    async fn disconnect(&self, scope: &Scope) -> Result<bool, LivenessError>;

    async fn get(&self, scope: &Scope) -> Result<Option<LivenessRecord>, LivenessError>;
}

#[derive(Default)]
pub struct MemoryLivenessStore {
    scopes: RwLock<HashMap<Scope, LivenessRecord>>,
}

impl MemoryLivenessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LivenessStore for MemoryLivenessStore {
    async fn heartbeat(&self, scope: &Scope, now: DateTime<Utc>) -> Result<bool, LivenessError> {
        let mut scopes = self.scopes.write();
        let record = scopes
            .entry(scope.clone())
            .or_insert_with(|| LivenessRecord {
                scope: scope.clone(),
                alive: false,
                last_seen_at: now,
            });
        let was_alive = record.alive;
        record.alive = true;
        record.last_seen_at = record.last_seen_at.max(now);
        Ok(!was_alive)
    }

    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Vec<Scope>, LivenessError> {
        let candidates: Vec<Scope> = self
            .scopes
            .read()
            .values()
            .filter(|record| record.alive && record.last_seen_at < cutoff)
            .map(|record| record.scope.clone())
            .collect();

        let mut flipped = Vec::new();
        for scope in candidates {
            let mut scopes = self.scopes.write();
            let Some(record) = scopes.get_mut(&scope) else {
                continue;
            };
            // A heartbeat may have landed since the candidate scan.
            if record.alive && record.last_seen_at < cutoff {
                record.alive = false;
                flipped.push(scope);
            }
        }
        Ok(flipped)
    }

    async fn disconnect(&self, scope: &Scope) -> Result<bool, LivenessError> {
        let mut scopes = self.scopes.write();
        Ok(match scopes.get_mut(scope) {
            Some(record) if record.alive => {
                record.alive = false;
                true
            }
            _ => false,
        })
    }

    async fn get(&self, scope: &Scope) -> Result<Option<LivenessRecord>, LivenessError> {
        Ok(self.scopes.read().get(scope).cloned())
    }
}

pub struct PostgresLivenessStore {
    pool: PgPool,
}

impl PostgresLivenessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LivenessStore for PostgresLivenessStore {
    async fn heartbeat(&self, scope: &Scope, now: DateTime<Utc>) -> Result<bool, LivenessError> {
        let mut tx = self.pool.begin().await?;

        // A concurrent first heartbeat blocks on the primary key until the
        // winner commits, then inserts nothing.
        let inserted = sqlx::query(
            r#"
            INSERT INTO relay_scope_liveness (scope, alive, last_seen_at)
            VALUES ($1, TRUE, $2)
            ON CONFLICT (scope) DO NOTHING
            "#,
        )
        .bind(scope.as_str())
        .bind(now)
        .execute(tx.as_mut())
        .await?
        .rows_affected()
            == 1;
        if inserted {
            tx.commit().await?;
            return Ok(true);
        }

        let was_alive: bool = sqlx::query_scalar(
            r#"SELECT alive FROM relay_scope_liveness WHERE scope = $1 FOR UPDATE"#,
        )
        .bind(scope.as_str())
        .fetch_one(tx.as_mut())
        .await?;
        sqlx::query(
            r#"
            UPDATE relay_scope_liveness
            SET alive = TRUE,
                last_seen_at = GREATEST(last_seen_at, $2)
            WHERE scope = $1
            "#,
        )
        .bind(scope.as_str())
        .bind(now)
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        Ok(!was_alive)
    }

    async fn sweep(&self, cutoff: DateTime<Utc>) -> Result<Vec<Scope>, LivenessError> {
        // Under READ COMMITTED the WHERE clause is re-checked against the
        // latest row version, so a racing heartbeat keeps its scope alive.
        let scopes: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE relay_scope_liveness
            SET alive = FALSE
            WHERE alive AND last_seen_at < $1
            RETURNING scope
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(scopes.into_iter().map(Scope::new).collect())
    }

    async fn disconnect(&self, scope: &Scope) -> Result<bool, LivenessError> {
        let result = sqlx::query(
            r#"UPDATE relay_scope_liveness SET alive = FALSE WHERE scope = $1 AND alive"#,
        )
        .bind(scope.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, scope: &Scope) -> Result<Option<LivenessRecord>, LivenessError> {
        let row: Option<(String, bool, DateTime<Utc>)> = sqlx::query_as(
            r#"SELECT scope, alive, last_seen_at FROM relay_scope_liveness WHERE scope = $1"#,
        )
        .bind(scope.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(scope, alive, last_seen_at)| LivenessRecord {
            scope: Scope::new(scope),
            alive,
            last_seen_at,
        }))
    }
}

#[derive(Clone)]
pub struct LivenessMonitor {
    store: Arc<dyn LivenessStore>,
    events: broadcast::Sender<LivenessEvent>,
    threshold: Duration,
}

impl LivenessMonitor {
    pub fn new(store: Arc<dyn LivenessStore>, threshold: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            events,
            threshold,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLivenessStore::new()), DEFAULT_STALE_THRESHOLD)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub async fn heartbeat(&self, scope: &Scope) -> Result<(), LivenessError> {
        self.heartbeat_at(scope, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, scope: &Scope, now: DateTime<Utc>) -> Result<(), LivenessError> {
        if self.store.heartbeat(scope, now).await? {
            info!(target = "relay.liveness", scope = %scope, "scope online");
            LIVENESS_TRANSITIONS
                .with_label_values(&["online", "heartbeat"])
                .inc();
            self.publish(LivenessEvent::Online(scope.clone()));
        }
        Ok(())
    }

    pub async fn sweep(&self) -> Result<Vec<Scope>, LivenessError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<Scope>, LivenessError> {
        let threshold =
            chrono::Duration::from_std(self.threshold).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let flipped = self.store.sweep(cutoff).await?;
        for scope in &flipped {
            self.offline(scope.clone(), OfflineReason::Stale);
        }
        if !flipped.is_empty() {
            debug!(target = "relay.liveness", count = flipped.len(), "staleness sweep flipped scopes");
        }
        Ok(flipped)
    }

    /// Graceful shutdown path; skips the staleness wait.
    pub async fn explicit_disconnect(&self, scope: &Scope) -> Result<bool, LivenessError> {
        let flipped = self.store.disconnect(scope).await?;
        if flipped {
            self.offline(scope.clone(), OfflineReason::Disconnected);
        }
        Ok(flipped)
    }

    pub async fn is_alive(&self, scope: &Scope) -> Result<bool, LivenessError> {
        Ok(self
            .store
            .get(scope)
            .await?
            .map(|record| record.alive)
            .unwrap_or(false))
    }

    pub async fn record(&self, scope: &Scope) -> Result<Option<LivenessRecord>, LivenessError> {
        self.store.get(scope).await
    }

    /// Runs `sweep` every `interval` until the returned task is aborted.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = monitor.sweep().await {
                    warn!(target = "relay.liveness", error = %err, "staleness sweep failed");
                }
            }
        })
    }

    fn offline(&self, scope: Scope, reason: OfflineReason) {
        info!(
            target = "relay.liveness",
            scope = %scope,
            reason = reason.as_str(),
            "scope offline"
        );
        LIVENESS_TRANSITIONS
            .with_label_values(&["offline", reason.as_str()])
            .inc();
        self.publish(LivenessEvent::Offline { scope, reason });
    }

    fn publish(&self, event: LivenessEvent) {
        // No listeners is fine; transitions are also persisted in the store.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
    }

    #[test_timeout::tokio_timeout_test]
    async fn online_is_broadcast_only_on_transition() {
        let monitor = LivenessMonitor::in_memory();
        let mut events = monitor.subscribe();
        let hub = Scope::new("hub");

        monitor.heartbeat_at(&hub, at(0)).await.unwrap();
        monitor.heartbeat_at(&hub, at(10)).await.unwrap();
        assert_eq!(events.try_recv().unwrap(), LivenessEvent::Online(hub.clone()));
        assert!(events.try_recv().is_err());
        assert!(monitor.is_alive(&hub).await.unwrap());
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweep_flips_only_stale_scopes() {
        let monitor = LivenessMonitor::in_memory();
        let mut events = monitor.subscribe();
        let quiet = Scope::new("quiet");
        let chatty = Scope::new("chatty");
        monitor.heartbeat_at(&quiet, at(0)).await.unwrap();
        monitor.heartbeat_at(&chatty, at(100)).await.unwrap();
        let _ = events.try_recv();
        let _ = events.try_recv();

        let flipped = monitor.sweep_at(at(121)).await.unwrap();
        assert_eq!(flipped, vec![quiet.clone()]);
        assert_eq!(
            events.try_recv().unwrap(),
            LivenessEvent::Offline {
                scope: quiet.clone(),
                reason: OfflineReason::Stale
            }
        );
        assert!(monitor.sweep_at(at(122)).await.unwrap().is_empty());

        monitor.heartbeat_at(&quiet, at(130)).await.unwrap();
        assert_eq!(events.try_recv().unwrap(), LivenessEvent::Online(quiet));
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweep_rechecks_freshest_heartbeat() {
        let store = MemoryLivenessStore::new();
        let hub = Scope::new("hub");
        store.heartbeat(&hub, at(0)).await.unwrap();

        let candidates: Vec<Scope> = store
            .scopes
            .read()
            .values()
            .filter(|record| record.alive && record.last_seen_at < at(5))
            .map(|record| record.scope.clone())
            .collect();
        assert_eq!(candidates, vec![hub.clone()]);

        // Heartbeat races in after the candidate scan.
        store.heartbeat(&hub, at(10)).await.unwrap();
        assert!(store.sweep(at(5)).await.unwrap().is_empty());
        assert!(store.get(&hub).await.unwrap().unwrap().alive);
    }

    #[test_timeout::tokio_timeout_test]
    async fn out_of_order_heartbeat_never_moves_last_seen_backwards() {
        let store = MemoryLivenessStore::new();
        let hub = Scope::new("hub");
        store.heartbeat(&hub, at(50)).await.unwrap();
        store.heartbeat(&hub, at(20)).await.unwrap();
        assert_eq!(store.get(&hub).await.unwrap().unwrap().last_seen_at, at(50));
    }

    #[test_timeout::tokio_timeout_test]
    async fn explicit_disconnect_bypasses_threshold() {
        let monitor = LivenessMonitor::in_memory();
        let hub = Scope::new("hub");
        monitor.heartbeat_at(&hub, at(0)).await.unwrap();
        let mut events = monitor.subscribe();

        assert!(monitor.explicit_disconnect(&hub).await.unwrap());
        assert!(!monitor.explicit_disconnect(&hub).await.unwrap());
        assert_eq!(
            events.try_recv().unwrap(),
            LivenessEvent::Offline {
                scope: hub.clone(),
                reason: OfflineReason::Disconnected
            }
        );
        assert!(events.try_recv().is_err());
        assert!(!monitor.is_alive(&hub).await.unwrap());
    }
}
