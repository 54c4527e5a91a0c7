//! SQLite-backed command and event logs.
//!
//! Rows are keyed by `(topic, created_at, variant)`; saving the same
//! message twice leaves a single row and reports [`StoreError::Duplicate`].
//! Reads decode through the [`DecoderRegistry`] of the log's message family.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{DbErrorKind, MessageStore, StoreError};
use crate::db::Database;
use crate::message::{Command, DecoderRegistry, Event, Message};

/// Table backing a message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTable {
    Commands,
    Events,
}

impl StoreTable {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Events => "events",
        }
    }
}

/// SQLite log of one message family, decoding rows through a registry.
#[derive(Debug)]
pub struct SqliteMessageStore<M> {
    db: Database,
    table: StoreTable,
    registry: DecoderRegistry<M>,
}

impl<M: Message> SqliteMessageStore<M> {
    #[must_use]
    pub fn new(db: Database, table: StoreTable, registry: DecoderRegistry<M>) -> Self {
        Self {
            db,
            table,
            registry,
        }
    }
}

impl SqliteMessageStore<Command> {
    /// Command log with decoders for every command variant.
    #[must_use]
    pub fn commands(db: Database) -> Self {
        Self::new(db, StoreTable::Commands, Command::registry())
    }
}

impl SqliteMessageStore<Event> {
    /// Event log with decoders for every event variant.
    #[must_use]
    pub fn events(db: Database) -> Self {
        Self::new(db, StoreTable::Events, Event::registry())
    }
}

#[async_trait]
impl<M: Message> MessageStore<M> for SqliteMessageStore<M> {
    #[instrument(skip(self, record), fields(table = self.table.as_str(), topic = record.topic()))]
    async fn save(&self, record: &M) -> Result<(), StoreError<M>> {
        let key = record.store_key();
        let payload = record
            .to_value()
            .map_err(|e| StoreError::persistence(DbErrorKind::Decode, e.to_string()))?;

        let sql = format!(
            "INSERT INTO {} (topic, created_at, variant, payload) VALUES (?, ?, ?, ?)",
            self.table.as_str()
        );
        sqlx::query(&sql)
            .bind(key.topic)
            .bind(&key.created_at)
            .bind(key.variant)
            .bind(payload.to_string())
            .execute(self.db.pool())
            .await
            .map_err(|e| StoreError::from_save(&e, key.to_string(), record.clone()))?;

        debug!(key = %key, "record stored");
        Ok(())
    }

    #[instrument(skip(self), fields(table = self.table.as_str()))]
    async fn get_by_topic(&self, topic: &str) -> Result<Vec<M>, StoreError<M>> {
        let sql = format!(
            "SELECT variant, payload FROM {} WHERE topic = ? ORDER BY created_at, rowid",
            self.table.as_str()
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(topic)
            .fetch_all(self.db.pool())
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (variant, payload) in rows {
            let body: Value = match serde_json::from_str(&payload) {
                Ok(body) => body,
                Err(e) => {
                    warn!(%variant, error = %e, "skipping unreadable stored payload");
                    continue;
                }
            };
            match self.registry.decode_value(&variant, body) {
                Some(Ok(record)) => records.push(record),
                Some(Err(e)) => warn!(%variant, error = %e, "skipping undecodable stored record"),
                None => debug!(%variant, "skipping record with unregistered variant"),
            }
        }
        Ok(records)
    }
}
