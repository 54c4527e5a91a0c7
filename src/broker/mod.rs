//! Publish/subscribe transport.
//!
//! A [`BrokerClient`] routes published payloads to every queue bound to the
//! topic (fan-out). Queues come in two flavours, see [`SubscriptionMode`].
//! Deliveries stay invisible to other consumers until acknowledged or
//! requeued; a consumer that disappears without doing either gives its
//! deliveries back to the queue.
//!
//! Two implementations exist:
//! - [`InMemoryBroker`] - process-local, used by tests and single-process runs
//! - [`SqliteBroker`] - durable, shared between processes through one database file

mod error;
mod memory;
mod sqlite;

use async_trait::async_trait;

pub use error::BrokerError;
pub use memory::InMemoryBroker;
pub use sqlite::{SqliteBroker, SqliteBrokerSettings};

/// How a subscriber attaches to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Named queue that outlives its consumers. Messages published while no
    /// consumer is attached are retained; several consumers of the same
    /// queue compete for messages.
    Durable { queue: String },
    /// Private, broker-named queue that exists only while the subscriber is
    /// attached. Messages published while it is absent are never seen.
    Exclusive,
}

impl SubscriptionMode {
    #[must_use]
    pub fn durable(queue: impl Into<String>) -> Self {
        Self::Durable {
            queue: queue.into(),
        }
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Handle used to acknowledge or requeue this delivery.
    pub tag: u64,
    pub payload: Vec<u8>,
    /// The message was handed out before and not acknowledged.
    pub redelivered: bool,
}

/// Connection to a broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publishes `payload` to every queue bound to `topic`.
    ///
    /// Publishing to a topic with no bound queue succeeds and drops the message.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Declares (or reattaches to) a queue bound to `topic` and starts consuming.
    async fn subscribe(
        &self,
        topic: &str,
        mode: &SubscriptionMode,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// A live consumer on one queue.
#[async_trait]
pub trait Subscription: Send {
    fn queue_name(&self) -> &str;

    /// Waits for the next delivery.
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError>;

    /// Removes the delivery from the queue for good.
    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError>;

    /// Hands the delivery back to the queue for another attempt.
    async fn requeue(&mut self, tag: u64) -> Result<(), BrokerError>;

    /// Detaches the consumer. Unacknowledged deliveries go back to the queue;
    /// exclusive queues are deleted.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
