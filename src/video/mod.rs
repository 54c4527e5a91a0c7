//! Fetching videos and placing them on disk.
//!
//! - [`VideoCapability`] - trait over the actual downloader, with the
//!   [`YtDlpCapability`] implementation
//! - [`DownloadService`] - retries, channel-sharded placement and bounded batches
//! - [`shard`] - directory layout helpers

mod capability;
mod error;
mod orchestrator;
pub mod shard;
mod ytdlp;

pub use capability::{
    DownloadComplete, DownloadProgress, DownloadRequest, ProgressReporter, SilentProgress,
    TracingProgress, VideoCapability,
};
pub use error::{DownloadErrorKind, VideoError, classify_capability_failure};
pub use orchestrator::{
    BatchOutcome, DEFAULT_CONCURRENCY, DestinationPolicy, DownloadService, RetryPolicy,
    STAGING_DIR_NAME,
};
pub use shard::ShardOverrides;
pub use ytdlp::{YtDlpCapability, channel_videos_url, parse_channel_entries, parse_progress_line};
