//! Wire envelopes multiplexed over the shared connection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, MuxResult};

/// Identifier tying responses and completions to the subscription that
/// issued the matching request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Create from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SubscriptionId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// One application-level message on the shared connection.
///
/// ```text
/// Request   {"id": 0, "request": "givemewaves"}
/// Response  {"id": 0, "response": "🌊"}
/// Complete  {"complete": 0}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Opens a subscription.
    Request { id: SubscriptionId, request: String },
    /// Payload for an open subscription.
    Response { id: SubscriptionId, response: String },
    /// Ends a subscription; sent by either side.
    Complete { complete: SubscriptionId },
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(id: SubscriptionId, payload: impl Into<String>) -> Self {
        Self::Request {
            id,
            request: payload.into(),
        }
    }

    /// Build a response envelope.
    pub fn response(id: SubscriptionId, payload: impl Into<String>) -> Self {
        Self::Response {
            id,
            response: payload.into(),
        }
    }

    /// Build a completion envelope.
    pub fn complete(id: SubscriptionId) -> Self {
        Self::Complete { complete: id }
    }

    /// The subscription this envelope is addressed to.
    pub fn id(&self) -> SubscriptionId {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => *id,
            Self::Complete { complete } => *complete,
        }
    }

    /// Encode as JSON text.
    pub fn encode(&self) -> MuxResult<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Decode from JSON text.
    pub fn decode(text: &str) -> MuxResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| MuxError::protocol(format!("invalid envelope {text:?}: {e}")))
    }
}
