//! Wiring of the `tubeflow` processes from an [`AppConfig`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use crate::broker::{BrokerError, SqliteBroker};
use crate::config::AppConfig;
use crate::db::{Database, DbError};
use crate::handler::{HandlerHost, SupervisorError, command_subscriptions, event_subscriptions};
use crate::message::{Command, Message, VideoInfo};
use crate::pipeline::MessagePipeline;
use crate::store::{SqliteMessageStore, VideoRepository};
use crate::video::{DownloadService, TracingProgress, VideoError, YtDlpCapability};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("store database unavailable: {0}")]
    Database(#[from] DbError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Video(#[from] VideoError),
}

/// Connects to the configured broker.
///
/// # Errors
///
/// Returns [`BrokerError::Connecting`] if the broker cannot be opened within
/// the configured connection timeout.
pub async fn connect_pipeline(config: &AppConfig) -> Result<MessagePipeline, BrokerError> {
    let broker = SqliteBroker::connect(
        &config.broker.path,
        &config.database_options(),
        config.broker.connection_timeout,
        config.broker_settings(),
    )
    .await?;
    Ok(MessagePipeline::new(Arc::new(broker)))
}

async fn open_store(config: &AppConfig) -> Result<Database, DbError> {
    Database::new(&config.database.path, &config.database_options()).await
}

fn download_service(config: &AppConfig) -> DownloadService {
    let capability = YtDlpCapability::new(config.download.ytdlp_program.clone());
    DownloadService::new(Arc::new(capability))
        .with_progress(Arc::new(TracingProgress))
        .with_cookies(config.download.cookies_file.clone())
}

/// Runs the download and command-log handlers until one of them exhausts
/// its retry budget.
///
/// # Errors
///
/// Returns [`RuntimeError`] if the stores cannot be opened or a handler
/// gives up.
#[instrument(skip_all)]
pub async fn run_command_handlers(config: &AppConfig) -> Result<(), RuntimeError> {
    let db = open_store(config).await?;
    let pipeline = connect_pipeline(config).await?;
    let store = Arc::new(SqliteMessageStore::<Command>::commands(db));

    let subscriptions = command_subscriptions(
        &pipeline,
        download_service(config),
        config.download_settings(),
        store,
    );
    info!(subscriptions = subscriptions.len(), "command handlers starting");
    HandlerHost::new(config.supervisor_settings())
        .run(subscriptions)
        .await?;
    Ok(())
}

/// Runs the event-log and video-persist handlers until one of them exhausts
/// its retry budget.
///
/// # Errors
///
/// Returns [`RuntimeError`] if the stores cannot be opened or a handler
/// gives up.
#[instrument(skip_all)]
pub async fn run_event_handlers(config: &AppConfig) -> Result<(), RuntimeError> {
    let db = open_store(config).await?;
    let pipeline = connect_pipeline(config).await?;
    let store = Arc::new(SqliteMessageStore::events(db.clone()));

    let subscriptions = event_subscriptions(&pipeline, store, VideoRepository::new(db));
    info!(subscriptions = subscriptions.len(), "event handlers starting");
    HandlerHost::new(config.supervisor_settings())
        .run(subscriptions)
        .await?;
    Ok(())
}

/// Publishes one command on its topic.
///
/// # Errors
///
/// Returns [`RuntimeError::Broker`] if the broker is unreachable or rejects
/// the message.
#[instrument(skip_all, fields(topic = command.topic()))]
pub async fn publish_command(config: &AppConfig, command: &Command) -> Result<(), RuntimeError> {
    let pipeline = connect_pipeline(config).await?;
    pipeline.publish_message(command).await?;
    info!(key = %command.store_key(), "command published");
    Ok(())
}

/// Fetches metadata for `url` without downloading it.
///
/// # Errors
///
/// Returns [`RuntimeError::Video`] if the metadata cannot be fetched.
pub async fn inspect(config: &AppConfig, url: &str) -> Result<VideoInfo, RuntimeError> {
    Ok(download_service(config).fetch_info(url).await?)
}

/// Metadata of the `limit` most recent uploads of `channel`.
///
/// # Errors
///
/// Returns [`RuntimeError::Video`] if the channel listing cannot be fetched.
pub async fn latest_from_channel(
    config: &AppConfig,
    channel: &str,
    limit: usize,
) -> Result<Vec<VideoInfo>, RuntimeError> {
    Ok(download_service(config)
        .fetch_latest_from_channel(channel, limit)
        .await?)
}
