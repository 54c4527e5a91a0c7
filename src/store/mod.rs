//! Persistence of commands, events and the video catalogue.
//!
//! Writes are idempotent in the sense that a record whose identity already
//! exists is rejected with [`StoreError::Duplicate`] rather than stored
//! twice; every other failure is [`StoreError::Persistence`]. Handlers rely
//! on the distinction to tell a harmless redelivery from a real fault.

mod error;
mod messages;
mod videos;

use async_trait::async_trait;

pub use error::{DbErrorKind, StoreError, classify_database_failure};
pub use messages::{SqliteMessageStore, StoreTable};
pub use videos::VideoRepository;

use crate::message::Message;

/// Append-only log of one message family.
#[async_trait]
pub trait MessageStore<M: Message>: Send + Sync {
    /// Stores `record` under its `(topic, created_at, variant)` key.
    async fn save(&self, record: &M) -> Result<(), StoreError<M>>;

    /// Every stored record of `topic`, oldest first. Records whose variant
    /// has no registered decoder are left out.
    async fn get_by_topic(&self, topic: &str) -> Result<Vec<M>, StoreError<M>>;
}
