//! Typed publish/subscribe on top of a [`BrokerClient`].
//!
//! [`MessagePipeline::subscribe`] acknowledges a delivery only after the
//! callback has returned successfully. A failing callback puts the delivery
//! back on its queue and ends the subscription with
//! [`BrokerError::Consuming`], leaving reconnection to the caller. Payloads
//! that cannot be decoded are acknowledged and logged, since no amount of
//! redelivery would make them decodable.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::broker::{BrokerClient, BrokerError, Subscription, SubscriptionMode};
use crate::message::{DecoderRegistry, Message};

/// Cheap to clone; clones share the broker connection.
#[derive(Clone)]
pub struct MessagePipeline {
    broker: Arc<dyn BrokerClient>,
}

impl std::fmt::Debug for MessagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePipeline").finish_non_exhaustive()
    }
}

impl MessagePipeline {
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self { broker }
    }

    /// Publishes raw bytes to every queue bound to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Publishing`] (or `Connecting`) when the broker
    /// rejects the message.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.broker.publish(topic, payload).await?;
        debug!("published");
        Ok(())
    }

    /// Encodes `message` and publishes it on its own topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Publishing`] if encoding or publishing fails.
    pub async fn publish_message<M: Message>(&self, message: &M) -> Result<(), BrokerError> {
        let topic = message.topic();
        let payload = message
            .encode()
            .map_err(|e| BrokerError::publishing(topic, format!("encoding failed: {e}")))?;
        self.publish(topic, &payload).await
    }

    /// Consumes `topic` through `mode`, handing every decoded message to
    /// `on_message`.
    ///
    /// With `consume_forever == false` the call returns after the first
    /// successfully handled message; otherwise it only returns on error.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Connecting`] if the queue cannot be declared,
    /// and [`BrokerError::Consuming`] if the connection drops or
    /// `on_message` fails. In the latter case the message has been requeued.
    #[instrument(skip(self, deserialize, on_message, mode), fields(mode = ?mode))]
    pub async fn subscribe<T, D, DE, F, Fut, E>(
        &self,
        topic: &str,
        deserialize: D,
        mut on_message: F,
        mode: &SubscriptionMode,
        consume_forever: bool,
    ) -> Result<(), BrokerError>
    where
        D: Fn(&[u8]) -> Result<T, DE>,
        DE: Display,
        F: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut subscription = self.broker.subscribe(topic, mode).await?;
        info!(queue = subscription.queue_name(), "waiting for messages");

        let outcome = consume(
            subscription.as_mut(),
            topic,
            &deserialize,
            &mut on_message,
            consume_forever,
        )
        .await;

        if let Err(e) = subscription.close().await {
            warn!(error = %e, "failed to close subscription cleanly");
        }
        outcome
    }

    /// [`MessagePipeline::subscribe`] decoding with the variant registry of `M`.
    ///
    /// # Errors
    ///
    /// See [`MessagePipeline::subscribe`].
    pub async fn subscribe_messages<M, F, Fut, E>(
        &self,
        topic: &str,
        registry: &DecoderRegistry<M>,
        on_message: F,
        mode: &SubscriptionMode,
        consume_forever: bool,
    ) -> Result<(), BrokerError>
    where
        M: Message,
        F: FnMut(M) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if !registry.contains(topic) {
            return Err(BrokerError::connecting(format!(
                "no decoder registered for topic '{topic}'"
            )));
        }
        let deserialize = |bytes: &[u8]| match registry.decode_bytes(topic, bytes) {
            Some(decoded) => decoded.map_err(|e| e.to_string()),
            None => Err(format!("no decoder registered for topic '{topic}'")),
        };
        self.subscribe(topic, deserialize, on_message, mode, consume_forever)
            .await
    }
}

async fn consume<T, D, DE, F, Fut, E>(
    subscription: &mut dyn Subscription,
    topic: &str,
    deserialize: &D,
    on_message: &mut F,
    consume_forever: bool,
) -> Result<(), BrokerError>
where
    D: Fn(&[u8]) -> Result<T, DE>,
    DE: Display,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    loop {
        let delivery = subscription.next_delivery().await?;
        debug!(
            tag = delivery.tag,
            redelivered = delivery.redelivered,
            "message received"
        );

        let message = match deserialize(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "discarding undecodable message");
                subscription.ack(delivery.tag).await?;
                continue;
            }
        };

        if let Err(e) = on_message(message).await {
            warn!(tag = delivery.tag, error = %e, "message handler failed, requeueing");
            if let Err(requeue_error) = subscription.requeue(delivery.tag).await {
                warn!(error = %requeue_error, "failed to requeue message");
            }
            return Err(BrokerError::consuming(
                topic,
                format!("message handler failed: {e}"),
            ));
        }

        subscription.ack(delivery.tag).await?;
        debug!(tag = delivery.tag, "message acknowledged");

        if !consume_forever {
            return Ok(());
        }
    }
}
