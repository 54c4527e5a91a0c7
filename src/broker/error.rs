//! Error types for broker operations.

use thiserror::Error;

/// Failures talking to the message broker.
///
/// The three variants follow the phase in which the failure happened:
/// establishing the connection or queue, consuming, or publishing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Connecting to the broker or declaring a queue failed.
    #[error("cannot connect to broker: {reason}")]
    Connecting { reason: String },

    /// Receiving, acknowledging or handling a delivery failed.
    #[error("failed consuming from '{topic}': {reason}")]
    Consuming { topic: String, reason: String },

    /// Publishing a message failed.
    #[error("failed publishing to '{topic}': {reason}")]
    Publishing { topic: String, reason: String },
}

impl BrokerError {
    #[must_use]
    pub fn connecting(reason: impl Into<String>) -> Self {
        Self::Connecting {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn consuming(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Consuming {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn publishing(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Publishing {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}
