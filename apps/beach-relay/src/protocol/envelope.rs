use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Epoch, RecipientId, Scope, Sequence, SubscriptionId};

const KNOWN_TYPES: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "data",
    "ack",
    "record",
    "record_ack",
    "heartbeat",
];

/// One frame on the wire, tagged by its `type` field.
///
/// Payloads are opaque ciphertext and travel base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Subscribe {
        subscription_id: SubscriptionId,
        scope: Scope,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<RecipientId>,
        /// Highest durable sequence the subscriber already holds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replay_from: Option<Sequence>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    Data {
        subscription_id: SubscriptionId,
        epoch: Epoch,
        sequence: Sequence,
        #[serde(with = "payload_base64")]
        payload: Bytes,
    },
    /// Acknowledges a `data` or `record` frame, echoing its epoch.
    Ack {
        subscription_id: SubscriptionId,
        epoch: Epoch,
        sequence: Sequence,
    },
    /// A durable record carried on the stream's reliable channel. `sequence`
    /// is the channel sequence; `record_sequence` is the record's position in
    /// its scope, absent for feed records.
    Record {
        subscription_id: SubscriptionId,
        epoch: Epoch,
        sequence: Sequence,
        record_id: Uuid,
        #[serde(default)]
        record_sequence: Option<Sequence>,
        event_type: String,
        #[serde(with = "payload_base64")]
        payload: Bytes,
    },
    RecordAck {
        record_id: Uuid,
    },
    Heartbeat {
        scope: Scope,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("envelope is not a JSON object: {0}")]
    NotAnObject(#[source] serde_json::Error),
    #[error("envelope has no type field")]
    MissingType,
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} envelope: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} envelope carries sequence 0")]
    ZeroSequence { kind: &'static str },
    #[error("{kind} envelope has an empty {field}")]
    EmptyField {
        kind: &'static str,
        field: &'static str,
    },
}

impl EnvelopeError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EnvelopeError::Encode(_) => "encode",
            EnvelopeError::NotAnObject(_) => "not_an_object",
            EnvelopeError::MissingType => "missing_type",
            EnvelopeError::UnknownType(_) => "unknown_type",
            EnvelopeError::Malformed { .. } => "malformed",
            EnvelopeError::ZeroSequence { .. } => "zero_sequence",
            EnvelopeError::EmptyField { .. } => "empty_field",
        }
    }
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Subscribe { .. } => "subscribe",
            Envelope::Unsubscribe { .. } => "unsubscribe",
            Envelope::Data { .. } => "data",
            Envelope::Ack { .. } => "ack",
            Envelope::Record { .. } => "record",
            Envelope::RecordAck { .. } => "record_ack",
            Envelope::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        match self {
            Envelope::Subscribe {
                subscription_id, ..
            }
            | Envelope::Unsubscribe { subscription_id }
            | Envelope::Data {
                subscription_id, ..
            }
            | Envelope::Ack {
                subscription_id, ..
            }
            | Envelope::Record {
                subscription_id, ..
            } => Some(subscription_id),
            Envelope::RecordAck { .. } | Envelope::Heartbeat { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(EnvelopeError::Encode)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value =
            serde_json::from_slice(frame).map_err(EnvelopeError::NotAnObject)?;
        let kind = value
            .get("type")
            .and_then(|ty| ty.as_str())
            .ok_or(EnvelopeError::MissingType)?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(EnvelopeError::UnknownType(kind.to_string()));
        }
        let kind = kind.to_string();
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|source| EnvelopeError::Malformed { kind, source })?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        let kind = self.kind();
        if let Some(id) = self.subscription_id() {
            if id.as_str().is_empty() {
                return Err(EnvelopeError::EmptyField {
                    kind,
                    field: "subscription_id",
                });
            }
        }
        match self {
            Envelope::Data { sequence, .. }
            | Envelope::Ack { sequence, .. }
            | Envelope::Record { sequence, .. }
                if *sequence == 0 =>
            {
                Err(EnvelopeError::ZeroSequence { kind })
            }
            Envelope::Record {
                record_sequence: Some(0),
                ..
            } => Err(EnvelopeError::ZeroSequence { kind }),
            Envelope::Subscribe { scope, .. } | Envelope::Heartbeat { scope }
                if scope.as_str().is_empty() =>
            {
                Err(EnvelopeError::EmptyField {
                    kind,
                    field: "scope",
                })
            }
            Envelope::Subscribe {
                recipient: Some(recipient),
                ..
            } if recipient.as_str().is_empty() => Err(EnvelopeError::EmptyField {
                kind,
                field: "recipient",
            }),
            _ => Ok(()),
        }
    }
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
