//! Addressing types and the wire envelope shared by every relay component.

mod cipher;
mod envelope;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use cipher::{CipherError, PayloadCipher, PlaintextCipher};
pub use envelope::{Envelope, EnvelopeError};

/// Per-(scope, direction) reliable sequence number. Valid values start at 1.
pub type Sequence = u64;

/// Names one incarnation of a reliable sender and travels on every data and
/// ack frame.
///
/// `instance` is drawn once per channel, so a new value means the peer lost
/// all state. `generation` advances on every sender reset within the same
/// instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    pub instance: u64,
    pub generation: u32,
}

impl Epoch {
    pub fn fresh() -> Self {
        Self {
            instance: rand::random(),
            generation: 0,
        }
    }

    pub fn next_generation(self) -> Self {
        Self {
            instance: self.instance,
            generation: self.generation.wrapping_add(1),
        }
    }
}

/// Tenancy boundary of one sequenced stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientId(String);

impl RecipientId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecipientId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Peer-chosen identifier carried on every frame of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The scope's default stream, addressed when no recipient is named.
    Coordinator,
    /// A stream dedicated to one named viewer.
    Viewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Viewer => "viewer",
        }
    }
}

/// Identity of exactly one live stream.
///
/// Derived purely from addressing fields: a named recipient always maps to a
/// viewer stream, no recipient maps to the scope's coordinator stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub scope: Scope,
    pub role: Role,
    pub recipient: Option<RecipientId>,
}

impl StreamKey {
    pub fn from_addressing(scope: Scope, recipient: Option<RecipientId>) -> Self {
        match recipient {
            Some(recipient) => Self::viewer(scope, recipient),
            None => Self::coordinator(scope),
        }
    }

    pub fn coordinator(scope: Scope) -> Self {
        Self {
            scope,
            role: Role::Coordinator,
            recipient: None,
        }
    }

    pub fn viewer(scope: Scope, recipient: RecipientId) -> Self {
        Self {
            scope,
            role: Role::Viewer,
            recipient: Some(recipient),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.recipient {
            Some(recipient) => write!(f, "{}/{}/{}", self.scope, self.role.as_str(), recipient),
            None => write!(f, "{}/{}", self.scope, self.role.as_str()),
        }
    }
}
