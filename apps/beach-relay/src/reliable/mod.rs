//! Sequenced, acknowledged delivery over a lossy link.
//!
//! Everything here is sans-IO: callers pass the current [`Instant`] and act
//! on the returned frames and events. The router owns the clock and the
//! transport.

mod channel;
mod receiver;
mod sender;

use std::time::Duration;

pub use channel::{ChannelEvent, ChannelOutput, Outgoing, ReliableChannel};
pub use receiver::{Delivery, ReceiveOutcome, ReliableReceiver};
pub use sender::{calculate_timeout, PendingMessage, ReliableSender, TickOutcome, Transmit};

pub use tokio::time::Instant;

pub const MAX_RETRANSMIT_ATTEMPTS: u32 = 10;
pub const MAX_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_RETRANSMIT_BASE: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BUFFER_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReliableConfig {
    pub retransmit_base: Duration,
    pub max_retransmit_attempts: u32,
    pub max_timeout: Duration,
    /// Out-of-order arrivals older than this are evicted from the reorder buffer.
    pub buffer_ttl: Duration,
    pub tick_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            retransmit_base: DEFAULT_RETRANSMIT_BASE,
            max_retransmit_attempts: MAX_RETRANSMIT_ATTEMPTS,
            max_timeout: MAX_RETRANSMIT_TIMEOUT,
            buffer_ttl: DEFAULT_BUFFER_TTL,
            tick_interval: DEFAULT_TICK_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl ReliableConfig {
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        calculate_timeout(self.retransmit_base, self.max_timeout, attempt)
    }
}
