use std::fs::OpenOptions;
use std::sync::Arc;

use beach_relay::config::RelayConfig;
use beach_relay::liveness::{LivenessStore, MemoryLivenessStore, PostgresLivenessStore};
use beach_relay::protocol::PlaintextCipher;
use beach_relay::queue::{self, build_queue};
use beach_relay::router::{StreamEvent, Subscription};
use beach_relay::server;
use beach_relay::{metrics, Coordinator, LivenessEvent, LivenessMonitor, StreamRouter};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = RelayConfig::from_env();
    let _guard = init_tracing(&cfg)?;

    let pool = connect_database(&cfg).await;
    let queue = build_queue(pool.clone());
    let liveness_store: Arc<dyn LivenessStore> = match &pool {
        Some(pool) => Arc::new(PostgresLivenessStore::new(pool.clone())),
        None => Arc::new(MemoryLivenessStore::new()),
    };
    let liveness = LivenessMonitor::new(liveness_store, cfg.stale_threshold());
    let router = StreamRouter::new(cfg.reliable());
    let (coordinator, mut incoming) = Coordinator::new(
        router,
        queue,
        liveness.clone(),
        Arc::new(PlaintextCipher),
    );
    info!(
        backend = coordinator.queue().backend(),
        stale_threshold_secs = cfg.relay_stale_threshold_secs,
        "beach-relay coordinator ready"
    );

    let listener = TcpListener::bind(cfg.relay_listen_addr.as_str()).await?;
    let mut server = tokio::spawn(server::serve(listener, coordinator.clone()));
    let sweeper = liveness.spawn_sweeper(cfg.sweep_interval());
    let mut liveness_events = liveness.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
                break;
            }
            result = &mut server => {
                match result {
                    Ok(Err(err)) => warn!(error = %err, "listener failed"),
                    Err(err) => warn!(error = %err, "listener task ended"),
                    Ok(Ok(())) => {}
                }
                break;
            }
            Some(subscription) = incoming.recv() => {
                tokio::spawn(log_stream(subscription));
            }
            event = liveness_events.recv() => match event {
                Ok(LivenessEvent::Online(scope)) => info!(scope = %scope, "scope online"),
                Ok(LivenessEvent::Offline { scope, reason }) => {
                    info!(scope = %scope, ?reason, "scope offline")
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "liveness events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    server.abort();
    sweeper.abort();
    debug!(metrics = %metrics::render(), "final metrics");
    info!("beach-relay shutting down");
    Ok(())
}

/// Default consumer for accepted streams when no application is embedded.
async fn log_stream(mut subscription: Subscription) {
    let key = subscription.handle.key().clone();
    while let Some(event) = subscription.events.recv().await {
        match event {
            StreamEvent::Delivered { sequence, payload } => {
                debug!(stream = %key, sequence, bytes = payload.len(), "delivered")
            }
            StreamEvent::Replayed(record) => {
                debug!(stream = %key, record_id = %record.record_id, "record replayed")
            }
            StreamEvent::Reset => info!(stream = %key, "peer reset; resyncing"),
            StreamEvent::PermanentlyFailed(sequence) => {
                warn!(stream = %key, sequence, "message did not take effect")
            }
        }
    }
}

async fn connect_database(cfg: &RelayConfig) -> Option<PgPool> {
    let Some(db_url) = &cfg.database_url else {
        info!("DATABASE_URL not set; running in in-memory mode");
        return None;
    };
    match PgPoolOptions::new()
        .max_connections(cfg.database_max_connections)
        .connect(db_url)
        .await
    {
        Ok(pool) => match queue::run_migrations(&pool).await {
            Ok(()) => {
                info!("database migrations applied");
                Some(pool)
            }
            Err(err) => {
                warn!(error = %err, "failed to run database migrations; continuing in memory");
                None
            }
        },
        Err(err) => {
            warn!(error = %err, "failed to connect to database, continuing with in-memory state");
            None
        }
    }
}

fn init_tracing(cfg: &RelayConfig) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard) = match &cfg.log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(cfg.log_path.is_none())
        .with_writer(writer)
        .init();
    Ok(guard)
}
