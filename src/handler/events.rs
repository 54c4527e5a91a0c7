//! Event side: catalogues downloaded videos and keeps the event log.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::{
    HandlerError, HandlerState, MessageHandler, MessageLogHandler, StateHandle, TopicSubscription,
    durable_subscription,
};
use crate::message::{DownloadedVideoEvent, Event, Message, PersistedVideoEvent};
use crate::pipeline::MessagePipeline;
use crate::store::{MessageStore, StoreError, VideoRepository};

/// Catalogues every downloaded video and publishes a [`PersistedVideoEvent`].
///
/// A video already in the catalogue is acknowledged without a new event,
/// which keeps the event chain finite under redelivery.
#[derive(Debug)]
pub struct VideoPersistHandler {
    pipeline: MessagePipeline,
    videos: VideoRepository,
}

impl VideoPersistHandler {
    pub const CONSUMER: &'static str = "video-persist";

    #[must_use]
    pub fn new(pipeline: MessagePipeline, videos: VideoRepository) -> Self {
        Self { pipeline, videos }
    }
}

#[async_trait]
impl MessageHandler<Event> for VideoPersistHandler {
    fn consumer(&self) -> &'static str {
        Self::CONSUMER
    }

    #[instrument(skip(self, event, state), fields(topic = event.topic()))]
    async fn handle(&self, event: Event, state: &StateHandle) -> Result<(), HandlerError> {
        let Event::DownloadedVideo(downloaded) = event else {
            debug!("not a download event, ignoring");
            return Ok(());
        };
        state.enter(HandlerState::Processing);

        let record = match self.videos.save_video(&downloaded.video).await {
            Ok(record) => record,
            Err(StoreError::Duplicate { key, .. }) => {
                info!(url = %key, "video already catalogued");
                state.enter(HandlerState::Subscribed);
                return Ok(());
            }
            Err(StoreError::Persistence { kind, reason }) => {
                return Err(HandlerError::Persist {
                    what: format!("video {}", downloaded.video.url()),
                    reason: format!("({kind}) {reason}"),
                });
            }
        };
        info!(id = %record.id(), title = %record.video().title(), "video catalogued");

        state.enter(HandlerState::Publishing);
        self.pipeline
            .publish_message(&Event::from(PersistedVideoEvent::new(record)))
            .await?;

        state.enter(HandlerState::Subscribed);
        Ok(())
    }
}

/// Subscriptions of the event process: the event log on every event topic
/// and the catalogue on [`DownloadedVideoEvent`].
#[must_use]
pub fn event_subscriptions(
    pipeline: &MessagePipeline,
    store: Arc<dyn MessageStore<Event>>,
    videos: VideoRepository,
) -> Vec<TopicSubscription> {
    let log = Arc::new(MessageLogHandler::new("event-log", store));
    let persist = Arc::new(VideoPersistHandler::new(pipeline.clone(), videos));

    let mut subscriptions: Vec<TopicSubscription> = Event::topics()
        .iter()
        .copied()
        .map(|topic| durable_subscription::<Event, _>(pipeline, topic, Arc::clone(&log)))
        .collect();
    subscriptions.push(durable_subscription::<Event, _>(
        pipeline,
        DownloadedVideoEvent::TOPIC,
        persist,
    ));
    subscriptions
}
