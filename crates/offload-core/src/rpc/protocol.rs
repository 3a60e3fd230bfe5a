//! RPC messages exchanged over the worker channel.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::codec::Encoded;

/// Who a call is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    /// A reference registered by the receiver when it passed a callable.
    Reference(u64),
    /// A capability the receiver exposed by name.
    Named(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Reference(id) => write!(f, "reference #{}", id),
            Target::Named(name) => write!(f, "'{}'", name),
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Handshake: the capabilities this side exposes.
    Methods { capabilities: Vec<String> },

    /// Invoke a capability or reference on the receiver.
    Call {
        id: u64,
        capability: Target,
        args: Vec<Encoded>,
    },

    /// Successful completion of call `id`.
    Return { id: u64, result: Encoded },

    /// The handler of call `id` rejected.
    Error { id: u64, error: Encoded },

    /// Call `id` could not be dispatched at all.
    Fault { id: u64, reason: String },
}

impl Message {
    /// Correlation id of call-related messages.
    pub fn id(&self) -> Option<u64> {
        match self {
            Message::Methods { .. } => None,
            Message::Call { id, .. }
            | Message::Return { id, .. }
            | Message::Error { id, .. }
            | Message::Fault { id, .. } => Some(*id),
        }
    }
}
