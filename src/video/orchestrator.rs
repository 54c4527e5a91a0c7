//! Download orchestration: retries, channel-sharded placement and batches.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::capability::{DownloadRequest, ProgressReporter, SilentProgress, VideoCapability};
use super::shard::{ShardOverrides, channel_dir_name};
use super::{DownloadErrorKind, VideoError};
use crate::message::Video;

/// Default number of simultaneous downloads in a batch.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Minimum allowed concurrency.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency.
const MAX_CONCURRENCY: usize = 100;

/// Hidden directory under the sharded root where downloads land first.
pub const STAGING_DIR_NAME: &str = ".tubeflow-staging";

/// Numbered variants tried before giving up on a taken file name.
const MAX_NAME_VARIANTS: u32 = 999;

/// Fixed-delay retry budget for a single download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero means one attempt in total.
    pub budget: u32,
    /// Pause before every retry.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            budget: 3,
            delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(budget: u32, delay: Duration) -> Self {
        Self { budget, delay }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            budget: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Where the files of a batch end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationPolicy {
    /// Straight into one directory.
    Flat { destination: PathBuf },
    /// Under `root/<shard>/<channel>`.
    ChannelSharded {
        root: PathBuf,
        overrides: ShardOverrides,
    },
}

/// Outcome of a batch: one entry per non-blank input line, in either list.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub errors: Vec<VideoError>,
    pub videos: Vec<Video>,
}

impl BatchOutcome {
    #[must_use]
    pub fn total(&self) -> usize {
        self.errors.len() + self.videos.len()
    }
}

/// Downloads videos through a [`VideoCapability`].
///
/// Cheap to clone; clones share the capability and the progress reporter.
#[derive(Clone)]
pub struct DownloadService {
    capability: Arc<dyn VideoCapability>,
    progress: Arc<dyn ProgressReporter>,
    cookies: Option<PathBuf>,
}

impl std::fmt::Debug for DownloadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadService")
            .field("cookies", &self.cookies)
            .finish_non_exhaustive()
    }
}

impl DownloadService {
    #[must_use]
    pub fn new(capability: Arc<dyn VideoCapability>) -> Self {
        Self {
            capability,
            progress: Arc::new(SilentProgress),
            cookies: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_cookies(mut self, cookies: Option<PathBuf>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Looks up metadata of `url` without downloading.
    ///
    /// # Errors
    ///
    /// Returns the capability's [`VideoError`].
    pub async fn fetch_info(&self, url: &str) -> Result<crate::message::VideoInfo, VideoError> {
        self.capability.fetch_info(url).await
    }

    /// Looks up the `limit` most recent uploads of `channel`.
    ///
    /// # Errors
    ///
    /// Returns the capability's [`VideoError`].
    pub async fn fetch_latest_from_channel(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<crate::message::VideoInfo>, VideoError> {
        self.capability.fetch_latest_from_channel(channel, limit).await
    }

    /// Downloads `url` into the existing directory `destination`.
    ///
    /// Every failure of the capability is retried after `retry.delay`
    /// until `retry.budget` is spent; the last failure is then returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// - [`VideoError::PathNotFound`] if `destination` does not exist; no
    ///   download is attempted.
    /// - The capability's last [`VideoError::Download`] once retries are exhausted.
    #[instrument(skip(self, destination, retry), fields(destination = %destination.display()))]
    pub async fn download_one(
        &self,
        url: &str,
        resolution: u32,
        destination: &Path,
        retry: RetryPolicy,
    ) -> Result<Video, VideoError> {
        if !destination.is_dir() {
            return Err(VideoError::PathNotFound {
                path: destination.to_path_buf(),
            });
        }
        let destination = std::path::absolute(destination)
            .map_err(|e| VideoError::filesystem(url, destination, &e))?;
        let request = DownloadRequest::new(url, resolution, &destination)
            .with_cookies(self.cookies.clone());

        let mut remaining = retry.budget;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(attempt, "attempting download");

            let error = match self.capability.download(&request, self.progress.as_ref()).await {
                Ok(video) if video.is_well_formed() => return Ok(video),
                Ok(video) => VideoError::download(
                    url,
                    &destination,
                    DownloadErrorKind::Unclassified,
                    format!(
                        "downloader reported {} outside an existing {}",
                        video.output_path.display(),
                        video.download_dir.display()
                    ),
                ),
                Err(e) => e,
            };

            if remaining == 0 {
                warn!(attempt, error = %error, "download failed after all attempts");
                return Err(error);
            }
            remaining -= 1;
            info!(
                attempt = attempt + 1,
                max_attempts = retry.budget + 1,
                delay_ms = retry.delay.as_millis(),
                error = %error,
                "retrying download"
            );
            tokio::time::sleep(retry.delay).await;
        }
    }

    /// Downloads `url` into `root/<shard>/<channel>`.
    ///
    /// The file is first downloaded into a private directory inside
    /// `root/`[`STAGING_DIR_NAME`], then moved once the channel is known.
    /// The private directory is removed whatever the outcome; the staging
    /// parent is shared with concurrent downloads and stays. A file of the same name
    /// already in the channel directory is kept, and the new one is stored
    /// as `name (1).ext`, `name (2).ext` and so on.
    ///
    /// # Errors
    ///
    /// - [`VideoError::PathNotFound`] if `root` does not exist.
    /// - The last download failure once retries are exhausted.
    /// - [`VideoError::Download`] of kind `Filesystem` if the channel
    ///   directory cannot be created or the file cannot be moved; the staged
    ///   file is deleted in that case.
    #[instrument(skip(self, root, overrides, retry), fields(root = %root.display()))]
    pub async fn download_to_channel_sharded_dir(
        &self,
        url: &str,
        resolution: u32,
        root: &Path,
        overrides: &ShardOverrides,
        retry: RetryPolicy,
    ) -> Result<Video, VideoError> {
        if !root.is_dir() {
            return Err(VideoError::PathNotFound {
                path: root.to_path_buf(),
            });
        }
        let root = std::path::absolute(root).map_err(|e| VideoError::filesystem(url, root, &e))?;
        let staging = root
            .join(STAGING_DIR_NAME)
            .join(Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| VideoError::filesystem(url, &staging, &e))?;

        let result = match self.download_one(url, resolution, &staging, retry).await {
            Ok(staged) => place_in_channel_dir(staged, &root, overrides).await,
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!(staging = %staging.display(), error = %e, "failed to remove staging directory");
        }

        result
    }

    /// Downloads every URL listed in `urls_file` (one per line, blank lines
    /// skipped), at most `concurrency` at a time.
    ///
    /// Never fails as a whole: every URL contributes exactly one entry to
    /// either list of the outcome. An unreadable `urls_file` yields a single
    /// error.
    #[instrument(skip(self, urls_file, policy, retry), fields(urls_file = %urls_file.display()))]
    pub async fn batch(
        &self,
        urls_file: &Path,
        resolution: u32,
        policy: &DestinationPolicy,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let contents = match tokio::fs::read_to_string(urls_file).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                outcome.errors.push(VideoError::PathNotFound {
                    path: urls_file.to_path_buf(),
                });
                return outcome;
            }
            Err(e) => {
                outcome
                    .errors
                    .push(VideoError::filesystem("", urls_file, &e));
                return outcome;
            }
        };

        let urls: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToOwned::to_owned)
            .collect();

        let concurrency = concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        info!(urls = urls.len(), concurrency, "starting batch");

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(urls.len());

        for url in urls {
            let semaphore = Arc::clone(&semaphore);
            let service = self.clone();
            let policy = policy.clone();
            let task_url = url.clone();

            handles.push((
                url,
                tokio::spawn(async move {
                    // Permit is dropped when this block exits (RAII)
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return Err(VideoError::download(
                            &task_url,
                            PathBuf::new(),
                            DownloadErrorKind::Unclassified,
                            "batch cancelled",
                        ));
                    };
                    match &policy {
                        DestinationPolicy::Flat { destination } => {
                            service
                                .download_one(&task_url, resolution, destination, retry)
                                .await
                        }
                        DestinationPolicy::ChannelSharded { root, overrides } => {
                            service
                                .download_to_channel_sharded_dir(
                                    &task_url, resolution, root, overrides, retry,
                                )
                                .await
                        }
                    }
                }),
            ));
        }

        debug!(task_count = handles.len(), "waiting for downloads to complete");

        for (url, handle) in handles {
            match handle.await {
                Ok(Ok(video)) => outcome.videos.push(video),
                Ok(Err(e)) => outcome.errors.push(e),
                Err(join_error) => {
                    warn!(%url, error = %join_error, "download task panicked");
                    outcome.errors.push(VideoError::download(
                        url,
                        PathBuf::new(),
                        DownloadErrorKind::Unclassified,
                        format!("download task failed: {join_error}"),
                    ));
                }
            }
        }

        info!(
            downloaded = outcome.videos.len(),
            failed = outcome.errors.len(),
            "batch finished"
        );
        outcome
    }
}

async fn place_in_channel_dir(
    staged: Video,
    root: &Path,
    overrides: &ShardOverrides,
) -> Result<Video, VideoError> {
    let channel = staged.channel_name().to_string();
    let target_dir = root
        .join(overrides.shard_for(&channel))
        .join(channel_dir_name(&channel));

    let placed = async {
        tokio::fs::create_dir_all(&target_dir).await?;
        let file_name = staged
            .output_path
            .file_name()
            .ok_or_else(|| std::io::Error::other("downloaded file has no name"))?;
        let target = reserve_file_name(&target_dir, Path::new(file_name)).await?;
        if let Err(e) = tokio::fs::rename(&staged.output_path, &target).await {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(e);
        }
        Ok(target)
    }
    .await;

    match placed {
        Ok(target) => {
            debug!(path = %target.display(), "moved into channel directory");
            let mut video = staged.relocated(&target_dir);
            video.output_path = target;
            Ok(video)
        }
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&staged.output_path).await {
                debug!(error = %cleanup, "staged file already gone");
            }
            Err(VideoError::filesystem(staged.url(), &target_dir, &e))
        }
    }
}

/// Creates an empty placeholder for the first free variant of `file_name`
/// in `dir` and returns its path.
///
/// The placeholder is created with `create_new`, so two downloads never
/// claim the same name.
async fn reserve_file_name(dir: &Path, file_name: &Path) -> std::io::Result<PathBuf> {
    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()));

    for n in 0..=MAX_NAME_VARIANTS {
        let candidate = if n == 0 {
            dir.join(file_name)
        } else {
            dir.join(format!("{stem} ({n}){}", extension.as_deref().unwrap_or("")))
        };
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", file_name.display(), dir.display()),
    ))
}
