//! Durable broker shared between processes through one SQLite file.
//!
//! Publishing copies the payload into every queue bound to the topic in a
//! single `INSERT ... SELECT`. Consumers claim the oldest visible message
//! with an atomic `UPDATE ... RETURNING`; a claim that is neither
//! acknowledged nor released becomes visible again once its lease expires,
//! which is how a crashed consumer's deliveries come back.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{BrokerClient, BrokerError, Delivery, Subscription, SubscriptionMode};
use crate::db::{Database, DatabaseOptions};

/// Timing knobs of the SQLite broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteBrokerSettings {
    /// Pause between two empty polls.
    pub poll_interval: Duration,
    /// How long a claimed, unacknowledged message stays invisible.
    pub visibility_timeout: Duration,
    /// How long an exclusive queue survives without its consumer polling.
    pub exclusive_lease: Duration,
}

impl Default for SqliteBrokerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(6 * 60 * 60),
            exclusive_lease: Duration::from_secs(30),
        }
    }
}

/// Broker backed by the `broker_*` tables.
#[derive(Debug, Clone)]
pub struct SqliteBroker {
    db: Database,
    settings: SqliteBrokerSettings,
}

impl SqliteBroker {
    /// Opens the broker database at `path`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connecting`] if the database cannot be opened
    /// or migrated in time.
    #[instrument(skip(path, options, settings), fields(path = %path.display()))]
    pub async fn connect(
        path: &Path,
        options: &DatabaseOptions,
        timeout: Duration,
        settings: SqliteBrokerSettings,
    ) -> Result<Self, BrokerError> {
        let db = tokio::time::timeout(timeout, Database::new(path, options))
            .await
            .map_err(|_| {
                BrokerError::connecting(format!("timed out after {}s", timeout.as_secs_f32()))
            })?
            .map_err(|e| BrokerError::connecting(e.to_string()))?;

        info!("connected to broker");
        Ok(Self::with_database(db, settings))
    }

    /// Uses an already opened database.
    #[must_use]
    pub fn with_database(db: Database, settings: SqliteBrokerSettings) -> Self {
        Self { db, settings }
    }

    /// Number of messages (claimed or not) stored for `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consuming`] if the query fails.
    pub async fn queue_depth(&self, queue: &str) -> Result<u64, BrokerError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM broker_messages WHERE queue_name = ?")
                .bind(queue)
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| BrokerError::consuming(queue, e.to_string()))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn purge_expired_exclusive_queues(&self, now: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.db.pool().begin().await?;
        let expired: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM broker_queues WHERE exclusive = 1 AND lease_expires_at < ?",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        for (name,) in &expired {
            delete_queue(&mut tx, name).await?;
        }
        tx.commit().await?;

        if !expired.is_empty() {
            debug!(count = expired.len(), "purged abandoned exclusive queues");
        }
        Ok(())
    }
}

async fn delete_queue(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM broker_messages WHERE queue_name = ?")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM broker_bindings WHERE queue_name = ?")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM broker_queues WHERE name = ?")
        .bind(name)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl BrokerClient for SqliteBroker {
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let now = now_millis();
        let result = sqlx::query(
            r"INSERT INTO broker_messages (queue_name, payload, published_at)
              SELECT b.queue_name, ?, ?
              FROM broker_bindings b
              JOIN broker_queues q ON q.name = b.queue_name
              WHERE b.topic = ?
                AND (q.exclusive = 0 OR q.lease_expires_at >= ?)",
        )
        .bind(payload)
        .bind(now)
        .bind(topic)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(|e| BrokerError::publishing(topic, e.to_string()))?;

        if result.rows_affected() == 0 {
            debug!("no queue bound to topic, message dropped");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe(
        &self,
        topic: &str,
        mode: &SubscriptionMode,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let now = now_millis();
        if let Err(e) = self.purge_expired_exclusive_queues(now).await {
            warn!(error = %e, "failed to purge abandoned exclusive queues");
        }

        let (name, exclusive) = match mode {
            SubscriptionMode::Durable { queue } => (queue.clone(), false),
            SubscriptionMode::Exclusive => {
                (format!("{topic}.exclusive.{}", Uuid::new_v4().simple()), true)
            }
        };
        let lease = exclusive.then(|| now + millis(self.settings.exclusive_lease));

        let declare = async {
            let mut tx = self.db.pool().begin().await?;
            sqlx::query(
                "INSERT INTO broker_queues (name, exclusive, lease_expires_at) VALUES (?, ?, ?) \
                 ON CONFLICT(name) DO NOTHING",
            )
            .bind(&name)
            .bind(exclusive)
            .bind(lease)
            .execute(&mut *tx)
            .await?;
            sqlx::query("INSERT OR IGNORE INTO broker_bindings (queue_name, topic) VALUES (?, ?)")
                .bind(&name)
                .bind(topic)
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        };
        declare
            .await
            .map_err(|e: sqlx::Error| BrokerError::connecting(format!("declaring queue {name}: {e}")))?;

        debug!(queue = %name, exclusive, "queue declared");
        Ok(Box::new(SqliteSubscription {
            db: self.db.clone(),
            settings: self.settings,
            consumer: Uuid::new_v4().to_string(),
            name,
            topic: topic.to_string(),
            exclusive,
            closed: false,
        }))
    }
}

struct SqliteSubscription {
    db: Database,
    settings: SqliteBrokerSettings,
    consumer: String,
    name: String,
    topic: String,
    exclusive: bool,
    closed: bool,
}

impl SqliteSubscription {
    fn consuming_error(&self, error: &sqlx::Error) -> BrokerError {
        BrokerError::consuming(&self.topic, error.to_string())
    }

    async fn refresh_lease(&self, now: i64) -> Result<(), sqlx::Error> {
        let result = sqlx::query("UPDATE broker_queues SET lease_expires_at = ? WHERE name = ?")
            .bind(now + millis(self.settings.exclusive_lease))
            .bind(&self.name)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn claim(&self, now: i64) -> Result<Option<(i64, Vec<u8>, i64)>, sqlx::Error> {
        sqlx::query_as(
            r"UPDATE broker_messages
              SET claimed_by = ?, claim_expires_at = ?, delivery_count = delivery_count + 1
              WHERE id = (
                  SELECT id FROM broker_messages
                  WHERE queue_name = ?
                    AND (claimed_by IS NULL OR claim_expires_at < ?)
                  ORDER BY id
                  LIMIT 1
              )
              RETURNING id, payload, delivery_count",
        )
        .bind(&self.consumer)
        .bind(now + millis(self.settings.visibility_timeout))
        .bind(&self.name)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await
    }
}

#[async_trait]
impl Subscription for SqliteSubscription {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        loop {
            if self.closed {
                return Err(BrokerError::consuming(&self.topic, "subscription closed"));
            }
            let now = now_millis();

            if self.exclusive {
                self.refresh_lease(now).await.map_err(|e| match e {
                    sqlx::Error::RowNotFound => {
                        BrokerError::consuming(&self.topic, "exclusive queue expired")
                    }
                    other => self.consuming_error(&other),
                })?;
            }

            if let Some((id, payload, delivery_count)) =
                self.claim(now).await.map_err(|e| self.consuming_error(&e))?
            {
                return Ok(Delivery {
                    tag: u64::try_from(id).unwrap_or_default(),
                    payload,
                    redelivered: delivery_count > 1,
                });
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        let result = sqlx::query("DELETE FROM broker_messages WHERE id = ? AND claimed_by = ?")
            .bind(i64::try_from(tag).unwrap_or(i64::MAX))
            .bind(&self.consumer)
            .execute(self.db.pool())
            .await
            .map_err(|e| self.consuming_error(&e))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::consuming(
                &self.topic,
                format!("delivery {tag} is no longer held by this consumer"),
            ));
        }
        Ok(())
    }

    async fn requeue(&mut self, tag: u64) -> Result<(), BrokerError> {
        sqlx::query(
            "UPDATE broker_messages SET claimed_by = NULL, claim_expires_at = NULL \
             WHERE id = ? AND claimed_by = ?",
        )
        .bind(i64::try_from(tag).unwrap_or(i64::MAX))
        .bind(&self.consumer)
        .execute(self.db.pool())
        .await
        .map_err(|e| self.consuming_error(&e))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let release = async {
            let mut tx = self.db.pool().begin().await?;
            sqlx::query(
                "UPDATE broker_messages SET claimed_by = NULL, claim_expires_at = NULL \
                 WHERE claimed_by = ?",
            )
            .bind(&self.consumer)
            .execute(&mut *tx)
            .await?;
            if self.exclusive {
                delete_queue(&mut tx, &self.name).await?;
            }
            tx.commit().await
        };
        release
            .await
            .map_err(|e: sqlx::Error| self.consuming_error(&e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TOPIC: &str = "DownloadVideoFromUrlCommand";

    fn fast_settings() -> SqliteBrokerSettings {
        SqliteBrokerSettings {
            poll_interval: Duration::from_millis(10),
            visibility_timeout: Duration::from_millis(100),
            exclusive_lease: Duration::from_secs(30),
        }
    }

    async fn broker() -> SqliteBroker {
        let db = Database::new_in_memory().await.unwrap();
        SqliteBroker::with_database(db, fast_settings())
    }

    async fn next_within(subscription: &mut Box<dyn Subscription>) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(300), subscription.next_delivery())
            .await
            .ok()
            .map(Result::unwrap)
    }

    // ==================== Routing ====================

    #[tokio::test]
    async fn test_durable_queue_keeps_messages_until_consumed() {
        let broker = broker().await;
        let mut sub = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("q"))
            .await
            .unwrap();
        sub.close().await.unwrap();

        broker.publish(TOPIC, b"stored").await.unwrap();
        assert_eq!(broker.queue_depth("q").await.unwrap(), 1);

        let mut again = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("q"))
            .await
            .unwrap();
        let delivery = next_within(&mut again).await.unwrap();
        assert_eq!(delivery.payload, b"stored");
        again.ack(delivery.tag).await.unwrap();
        assert_eq!(broker.queue_depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_all_bound_queues() {
        let broker = broker().await;
        let mut a = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("a"))
            .await
            .unwrap();
        let mut b = broker
            .subscribe(TOPIC, &SubscriptionMode::Exclusive)
            .await
            .unwrap();

        broker.publish(TOPIC, b"both").await.unwrap();

        assert_eq!(next_within(&mut a).await.unwrap().payload, b"both");
        assert_eq!(next_within(&mut b).await.unwrap().payload, b"both");
    }

    #[tokio::test]
    async fn test_exclusive_queue_removed_on_close() {
        let broker = broker().await;
        let mut sub = broker
            .subscribe(TOPIC, &SubscriptionMode::Exclusive)
            .await
            .unwrap();
        let name = sub.queue_name().to_string();
        sub.close().await.unwrap();

        broker.publish(TOPIC, b"nobody").await.unwrap();
        assert_eq!(broker.queue_depth(&name).await.unwrap(), 0);
    }

    // ==================== Claims ====================

    #[tokio::test]
    async fn test_claimed_message_invisible_to_competing_consumer() {
        let broker = broker().await;
        let mut a = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("shared"))
            .await
            .unwrap();
        let mut b = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("shared"))
            .await
            .unwrap();
        broker.publish(TOPIC, b"only-one").await.unwrap();

        let claimed = next_within(&mut a).await.unwrap();
        assert_eq!(claimed.payload, b"only-one");
        let stolen = tokio::time::timeout(Duration::from_millis(50), b.next_delivery()).await;
        assert!(stolen.is_err(), "second consumer must not see a held claim");
    }

    #[tokio::test]
    async fn test_expired_claim_is_redelivered() {
        let broker = broker().await;
        let mut a = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("shared"))
            .await
            .unwrap();
        broker.publish(TOPIC, b"crashy").await.unwrap();
        let first = next_within(&mut a).await.unwrap();
        // Simulate a crashed consumer: no ack, no close.
        drop(a);

        let mut b = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("shared"))
            .await
            .unwrap();
        let second = next_within(&mut b).await.unwrap();

        assert_eq!(second.payload, b"crashy");
        assert_eq!(second.tag, first.tag);
        assert!(second.redelivered);
    }

    #[tokio::test]
    async fn test_requeue_makes_message_visible_immediately() {
        let broker = broker().await;
        let mut sub = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("q"))
            .await
            .unwrap();
        broker.publish(TOPIC, b"again").await.unwrap();

        let first = next_within(&mut sub).await.unwrap();
        sub.requeue(first.tag).await.unwrap();
        let second = next_within(&mut sub).await.unwrap();

        assert_eq!(second.tag, first.tag);
        assert!(second.redelivered);
    }

    #[tokio::test]
    async fn test_ack_after_losing_claim_fails() {
        let broker = broker().await;
        let mut sub = broker
            .subscribe(TOPIC, &SubscriptionMode::durable("q"))
            .await
            .unwrap();
        broker.publish(TOPIC, b"x").await.unwrap();
        let delivery = next_within(&mut sub).await.unwrap();
        sub.requeue(delivery.tag).await.unwrap();

        let error = sub.ack(delivery.tag).await.unwrap_err();
        assert!(matches!(error, BrokerError::Consuming { .. }));
    }

    #[tokio::test]
    async fn test_connect_creates_database_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broker.db");

        let broker = SqliteBroker::connect(
            &path,
            &DatabaseOptions::default(),
            Duration::from_secs(5),
            fast_settings(),
        )
        .await
        .unwrap();
        broker.publish(TOPIC, b"x").await.unwrap();

        assert!(path.exists());
    }
}
