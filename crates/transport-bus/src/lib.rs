//! Byte-level transport seam shared by the relay and its tests.
//!
//! A [`Transport`] is one peer-to-peer link (a WebRTC data channel, a socket,
//! an in-process pipe). It may drop, duplicate or reorder frames and may
//! disconnect at any time; everything above this crate assumes nothing more.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

mod local;
mod websocket;

pub use local::{FaultPlan, LocalLink};
pub use websocket::WebSocketLink;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

fn next_transport_id() -> TransportId {
    TransportId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("transport disconnected")]
    Disconnected,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Hands one frame to the link. `Ok` only means the frame was accepted,
    /// not that the peer will see it.
    fn send(&self, frame: Bytes) -> BusResult<()>;

    /// Inbound frames from the peer. Frames sent before subscribing are not
    /// replayed, and a lagging receiver loses frames like any other drop.
    fn subscribe(&self) -> broadcast::Receiver<Bytes>;

    fn is_connected(&self) -> bool;

    fn watch_connected(&self) -> watch::Receiver<bool>;
}
