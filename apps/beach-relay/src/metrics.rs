use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|err| panic!("invalid metric definition {name}: {err}"));
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static RETRANSMITS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_retransmits_total",
        "Reliable frames retransmitted after a backoff timeout",
        &["role"],
    )
});

pub static PERMANENT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_permanent_failures_total",
        "Reliable messages dropped after exhausting retransmits",
        &["role"],
    )
});

pub static DUPLICATES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_duplicates_dropped_total",
        "Inbound reliable frames discarded as duplicates",
        &["role"],
    )
});

pub static STALE_FRAMES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_stale_frames_total",
        "Inbound reliable frames from a sender epoch the peer already replaced",
        &["role"],
    )
});

pub static SESSION_RESETS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_session_resets_total",
        "Peer sequence restarts detected by a receiver",
        &["role"],
    )
});

pub static BUFFER_EVICTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_buffer_evictions_total",
        "Out-of-order arrivals evicted from a reorder buffer",
        &["role"],
    )
});

pub static ENVELOPES_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_envelopes_received_total",
        "Decoded inbound envelopes by type",
        &["kind"],
    )
});

pub static ENVELOPES_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_envelopes_rejected_total",
        "Inbound frames dropped at the boundary",
        &["reason"],
    )
});

pub static QUEUE_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_queue_operations_total",
        "Durable replay queue operations",
        &["backend", "op"],
    )
});

pub static LIVENESS_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter(
        "relay_liveness_transitions_total",
        "Scope online/offline transitions",
        &["state", "reason"],
    )
});

pub static ACTIVE_STREAMS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("relay_active_streams", "Live routed streams"),
        &["role"],
    )
    .unwrap_or_else(|err| panic!("invalid metric definition relay_active_streams: {err}"));
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Prometheus text exposition of every relay metric.
pub fn render() -> String {
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buf) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}
