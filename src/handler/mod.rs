//! Long-running consumers of commands and events.
//!
//! Each handler consumes one or more topics through its own durable queue
//! (`<topic>.<consumer>`), runs under a [`Supervisor`] that reconnects
//! after failures, and is hosted with its siblings by a [`HandlerHost`].

mod commands;
mod events;
mod host;
mod log;
mod supervisor;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use commands::{DownloadCommandHandler, DownloadSettings, command_subscriptions};
pub use events::{VideoPersistHandler, event_subscriptions};
pub use host::HandlerHost;
pub use log::MessageLogHandler;
pub use supervisor::{HandlerState, StateHandle, Supervisor, SupervisorError, SupervisorSettings};

use crate::broker::{BrokerError, SubscriptionMode};
use crate::message::Message;
use crate::pipeline::MessagePipeline;

/// Why a handler could not finish with a message. The message is requeued.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Publish(#[from] BrokerError),

    #[error("failed to persist {what}: {reason}")]
    Persist { what: String, reason: String },
}

/// Handles messages of family `M`.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Name of the consumer; suffix of its durable queues.
    fn consumer(&self) -> &'static str;

    async fn handle(&self, message: M, state: &StateHandle) -> Result<(), HandlerError>;
}

/// Future of one subscription attempt.
pub type SubscriptionFuture = Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send>>;

/// Starts a fresh subscription attempt each time it is called.
pub type SubscriptionFactory = Arc<dyn Fn(StateHandle) -> SubscriptionFuture + Send + Sync>;

/// A handler bound to one topic, ready to be supervised.
#[derive(Clone)]
pub struct TopicSubscription {
    /// Durable queue name, also used in logs.
    pub name: String,
    pub topic: &'static str,
    pub run: SubscriptionFactory,
}

impl std::fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("name", &self.name)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Consumes `topic` forever through the durable queue `<topic>.<consumer>`.
pub fn durable_subscription<M, H>(
    pipeline: &MessagePipeline,
    topic: &'static str,
    handler: Arc<H>,
) -> TopicSubscription
where
    M: Message,
    H: MessageHandler<M>,
{
    let queue = format!("{topic}.{}", handler.consumer());
    let name = queue.clone();
    let pipeline = pipeline.clone();

    let run: SubscriptionFactory = Arc::new(move |state: StateHandle| -> SubscriptionFuture {
        let pipeline = pipeline.clone();
        let handler = Arc::clone(&handler);
        let mode = SubscriptionMode::durable(queue.clone());

        Box::pin(async move {
            let registry = M::registry();
            pipeline
                .subscribe_messages(
                    topic,
                    &registry,
                    |message: M| {
                        let handler = Arc::clone(&handler);
                        let state = state.clone();
                        async move { handler.handle(message, &state).await }
                    },
                    &mode,
                    true,
                )
                .await
        })
    });

    TopicSubscription { name, topic, run }
}
