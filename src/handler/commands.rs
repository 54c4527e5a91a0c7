//! Command side: downloads requested videos and announces them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{
    HandlerError, HandlerState, MessageHandler, MessageLogHandler, StateHandle, TopicSubscription,
    durable_subscription,
};
use crate::message::{Command, DownloadedVideoEvent, Event, Message, Video};
use crate::pipeline::MessagePipeline;
use crate::store::MessageStore;
use crate::video::{
    BatchOutcome, DEFAULT_CONCURRENCY, DestinationPolicy, DownloadService, RetryPolicy,
    ShardOverrides, VideoError,
};

/// How the download handler drives the [`DownloadService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub shard_overrides: ShardOverrides,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            shard_overrides: ShardOverrides::default(),
        }
    }
}

/// Executes download commands and publishes a [`DownloadedVideoEvent`]
/// for every video that made it to disk.
///
/// Individual download failures are logged and end the command; only a
/// failure to publish makes the command go back to the queue.
#[derive(Debug)]
pub struct DownloadCommandHandler {
    pipeline: MessagePipeline,
    downloads: DownloadService,
    settings: DownloadSettings,
}

impl DownloadCommandHandler {
    pub const CONSUMER: &'static str = "download";

    #[must_use]
    pub fn new(
        pipeline: MessagePipeline,
        downloads: DownloadService,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            pipeline,
            downloads,
            settings,
        }
    }

    async fn execute(&self, command: &Command) -> Vec<Video> {
        let retry = self.settings.retry;
        match command {
            Command::DownloadVideoFromUrl(c) => single(
                self.downloads
                    .download_one(&c.url, c.resolution, &c.destination, retry)
                    .await,
            ),
            Command::DownloadVideoFromUrlToChannelDir(c) => single(
                self.downloads
                    .download_to_channel_sharded_dir(
                        &c.url,
                        c.resolution,
                        &c.destination,
                        &self.settings.shard_overrides,
                        retry,
                    )
                    .await,
            ),
            Command::DownloadVideosFromUrlsFile(c) => {
                let policy = DestinationPolicy::Flat {
                    destination: c.destination.clone(),
                };
                report(
                    self.downloads
                        .batch(&c.urls_file, c.resolution, &policy, self.settings.concurrency, retry)
                        .await,
                )
            }
            Command::DownloadVideosFromUrlsFileToChannelDir(c) => {
                let policy = DestinationPolicy::ChannelSharded {
                    root: c.destination.clone(),
                    overrides: self.settings.shard_overrides.clone(),
                };
                report(
                    self.downloads
                        .batch(&c.urls_file, c.resolution, &policy, self.settings.concurrency, retry)
                        .await,
                )
            }
        }
    }
}

fn single(result: Result<Video, VideoError>) -> Vec<Video> {
    match result {
        Ok(video) => vec![video],
        Err(e) => {
            warn!(error = %e, "download failed");
            Vec::new()
        }
    }
}

fn report(outcome: BatchOutcome) -> Vec<Video> {
    for error in &outcome.errors {
        warn!(error = %error, "batch entry failed");
    }
    info!(
        downloaded = outcome.videos.len(),
        failed = outcome.errors.len(),
        "batch command finished"
    );
    outcome.videos
}

#[async_trait]
impl MessageHandler<Command> for DownloadCommandHandler {
    fn consumer(&self) -> &'static str {
        Self::CONSUMER
    }

    #[instrument(skip(self, command, state), fields(topic = command.topic()))]
    async fn handle(&self, command: Command, state: &StateHandle) -> Result<(), HandlerError> {
        state.enter(HandlerState::Processing);
        info!(destination = %command.destination().display(), "executing command");

        let videos = self.execute(&command).await;

        if !videos.is_empty() {
            state.enter(HandlerState::Publishing);
        }
        for video in videos {
            let event = Event::from(DownloadedVideoEvent::new(video));
            self.pipeline.publish_message(&event).await?;
        }

        state.enter(HandlerState::Subscribed);
        Ok(())
    }
}

/// Subscriptions of the command process: the download handler and the
/// command log, one durable queue per command topic each.
#[must_use]
pub fn command_subscriptions(
    pipeline: &MessagePipeline,
    downloads: DownloadService,
    settings: DownloadSettings,
    store: Arc<dyn MessageStore<Command>>,
) -> Vec<TopicSubscription> {
    let download = Arc::new(DownloadCommandHandler::new(
        pipeline.clone(),
        downloads,
        settings,
    ));
    let log = Arc::new(MessageLogHandler::new("command-log", store));

    Command::topics()
        .iter()
        .copied()
        .flat_map(|topic| {
            [
                durable_subscription::<Command, _>(pipeline, topic, Arc::clone(&download)),
                durable_subscription::<Command, _>(pipeline, topic, Arc::clone(&log)),
            ]
        })
        .collect()
}
