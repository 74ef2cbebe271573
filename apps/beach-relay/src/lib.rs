//! Reliable delivery, stream routing and durable replay between a beach
//! coordinator and its viewers.
//!
//! Payloads are opaque ciphertext throughout; transports are anything that
//! implements [`transport_bus::Transport`].

pub mod config;
pub mod coordinator;
pub mod liveness;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod reliable;
pub mod router;
pub mod server;
pub mod viewer;

pub use coordinator::{Coordinator, CoordinatorError};
pub use liveness::{LivenessEvent, LivenessMonitor, OfflineReason};
pub use protocol::{Envelope, Epoch, RecipientId, Role, Scope, Sequence, StreamKey, SubscriptionId};
pub use queue::{DurableRecord, QueueError, QueueHandle, ReplayQueue};
pub use reliable::ReliableConfig;
pub use router::{RouteError, StreamEvent, StreamHandle, StreamRouter, Subscribed, Subscription};
pub use viewer::{Viewer, ViewerError};
