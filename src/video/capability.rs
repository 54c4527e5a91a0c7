//! The seam between orchestration and whatever actually fetches videos.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use super::VideoError;
use crate::message::{Video, VideoInfo};

/// One download to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    /// Upper bound on the vertical resolution.
    pub resolution: u32,
    /// Existing, absolute directory receiving the file.
    pub destination: PathBuf,
    /// Netscape-format cookie jar handed to the downloader, if any.
    pub cookies: Option<PathBuf>,
}

impl DownloadRequest {
    #[must_use]
    pub fn new(url: impl Into<String>, resolution: u32, destination: impl AsRef<Path>) -> Self {
        Self {
            url: url.into(),
            resolution,
            destination: destination.as_ref().to_path_buf(),
            cookies: None,
        }
    }

    #[must_use]
    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }
}

/// Intermediate progress reported while a download runs.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgress {
    pub url: String,
    pub percent: Option<f32>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

/// Final notification for a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadComplete {
    pub url: String,
    pub title: String,
    pub output_path: PathBuf,
}

/// Receives progress notifications from a capability.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, progress: &DownloadProgress);
    fn on_complete(&self, complete: &DownloadComplete);
}

/// Reports progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn on_progress(&self, progress: &DownloadProgress) {
        debug!(
            url = %progress.url,
            percent = progress.percent,
            speed = progress.speed.as_deref(),
            eta = progress.eta.as_deref(),
            "downloading"
        );
    }

    fn on_complete(&self, complete: &DownloadComplete) {
        info!(
            url = %complete.url,
            title = %complete.title,
            path = %complete.output_path.display(),
            "download finished"
        );
    }
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn on_progress(&self, _progress: &DownloadProgress) {}
    fn on_complete(&self, _complete: &DownloadComplete) {}
}

/// Something that can look up and download remote videos.
#[async_trait]
pub trait VideoCapability: Send + Sync {
    /// Fetches metadata without downloading anything.
    async fn fetch_info(&self, url: &str) -> Result<VideoInfo, VideoError>;

    /// Metadata of the `limit` most recent uploads of `channel`, newest first.
    async fn fetch_latest_from_channel(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<VideoInfo>, VideoError>;

    /// Downloads one video into `request.destination`.
    ///
    /// Failures are reported as [`VideoError::Download`] with a
    /// [`super::DownloadErrorKind`] describing the cause.
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<Video, VideoError>;
}
