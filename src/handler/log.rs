use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{HandlerError, HandlerState, MessageHandler, StateHandle};
use crate::message::Message;
use crate::store::{MessageStore, StoreError};

/// Appends every message of family `M` to its store.
///
/// A message that is already stored (a redelivery) is acknowledged without
/// a second write; any other store failure sends it back to the queue.
pub struct MessageLogHandler<M: Message> {
    consumer: &'static str,
    store: Arc<dyn MessageStore<M>>,
    _family: PhantomData<fn() -> M>,
}

impl<M: Message> MessageLogHandler<M> {
    #[must_use]
    pub fn new(consumer: &'static str, store: Arc<dyn MessageStore<M>>) -> Self {
        Self {
            consumer,
            store,
            _family: PhantomData,
        }
    }
}

#[async_trait]
impl<M: Message> MessageHandler<M> for MessageLogHandler<M> {
    fn consumer(&self) -> &'static str {
        self.consumer
    }

    #[instrument(skip(self, message, state), fields(consumer = self.consumer, topic = message.topic()))]
    async fn handle(&self, message: M, state: &StateHandle) -> Result<(), HandlerError> {
        state.enter(HandlerState::Processing);
        let outcome = match self.store.save(&message).await {
            Ok(()) => {
                info!("message logged");
                Ok(())
            }
            Err(StoreError::Duplicate { key, .. }) => {
                info!(%key, "message already logged");
                Ok(())
            }
            Err(StoreError::Persistence { kind, reason }) => Err(HandlerError::Persist {
                what: format!("{} message", message.topic()),
                reason: format!("({kind}) {reason}"),
            }),
        };
        state.enter(HandlerState::Subscribed);
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::message::{Command, DownloadVideoFromUrlCommand};
    use crate::store::SqliteMessageStore;

    async fn handler() -> (MessageLogHandler<Command>, Arc<SqliteMessageStore<Command>>, Database) {
        let db = Database::new_in_memory().await.unwrap();
        let store = Arc::new(SqliteMessageStore::commands(db.clone()));
        (MessageLogHandler::new("command-log", store.clone()), store, db)
    }

    #[tokio::test]
    async fn test_logs_new_command() {
        let (handler, store, _db) = handler().await;
        let command: Command = DownloadVideoFromUrlCommand::new("u", 1080, "/m").into();

        handler
            .handle(command.clone(), &StateHandle::new("t"))
            .await
            .unwrap();

        assert_eq!(store.get_by_topic(command.topic()).await.unwrap(), vec![command]);
    }

    #[tokio::test]
    async fn test_redelivered_command_is_accepted_once() {
        let (handler, store, _db) = handler().await;
        let command: Command = DownloadVideoFromUrlCommand::new("u", 1080, "/m").into();
        let state = StateHandle::new("t");

        handler.handle(command.clone(), &state).await.unwrap();
        handler.handle(command.clone(), &state).await.unwrap();

        assert_eq!(store.get_by_topic(command.topic()).await.unwrap().len(), 1);
        assert_eq!(state.get(), HandlerState::Subscribed);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_handler_error() {
        let (handler, _store, db) = handler().await;
        db.close().await;
        let command: Command = DownloadVideoFromUrlCommand::new("u", 1080, "/m").into();

        let error = handler
            .handle(command, &StateHandle::new("t"))
            .await
            .unwrap_err();

        assert!(matches!(error, HandlerError::Persist { .. }));
    }
}
