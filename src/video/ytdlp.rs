//! [`VideoCapability`] backed by the `yt-dlp` executable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::DateTime;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument, trace};

use super::capability::{
    DownloadComplete, DownloadProgress, DownloadRequest, ProgressReporter, VideoCapability,
};
use super::error::classify_capability_failure;
use super::{DownloadErrorKind, VideoError};
use crate::message::{Channel, Video, VideoInfo};

/// Marker our progress template prefixes every progress line with.
const PROGRESS_PREFIX: &str = "[progress]";

const PROGRESS_TEMPLATE: &str = "download:[progress] %(progress._percent_str)s %(progress._speed_str)s %(progress._eta_str)s";

#[allow(clippy::expect_used)]
static PROGRESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[progress\]\s+(?P<percent>\S+)\s+(?P<speed>\S+)\s+(?P<eta>\S+)")
        .expect("progress regex is valid") // Static pattern, safe to panic
});

/// Parses one line written with our progress template.
#[must_use]
pub fn parse_progress_line(url: &str, line: &str) -> Option<DownloadProgress> {
    let line = line.trim();
    if !line.starts_with(PROGRESS_PREFIX) {
        return None;
    }
    let captures = PROGRESS_PATTERN.captures(line)?;
    let field = |name: &str| {
        captures
            .name(name)
            .map(|m| m.as_str())
            .filter(|value| !matches!(*value, "NA" | "N/A" | "Unknown"))
            .map(ToOwned::to_owned)
    };

    Some(DownloadProgress {
        url: url.to_string(),
        percent: field("percent").and_then(|p| p.trim_end_matches('%').parse().ok()),
        speed: field("speed"),
        eta: field("eta"),
    })
}

#[derive(Debug, Deserialize)]
struct RequestedDownload {
    filepath: Option<PathBuf>,
}

/// The subset of yt-dlp's info JSON we use.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    #[serde(default)]
    title: String,
    duration_string: Option<String>,
    timestamp: Option<i64>,
    average_rating: Option<f64>,
    thumbnail: Option<String>,
    tags: Option<Vec<String>>,
    channel_id: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    channel_url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    ext: Option<String>,
    filepath: Option<PathBuf>,
    #[serde(default)]
    requested_downloads: Vec<RequestedDownload>,
}

impl YtDlpInfo {
    fn to_info(&self, url: &str) -> VideoInfo {
        VideoInfo {
            url: url.to_string(),
            title: self.title.clone(),
            duration: self.duration_string.clone(),
            published_at: self
                .timestamp
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            average_rating: self.average_rating,
            thumbnail: self.thumbnail.clone(),
            tags: self.tags.clone().unwrap_or_default(),
            channel: Channel {
                id: self.channel_id.clone().unwrap_or_default(),
                name: self
                    .channel
                    .clone()
                    .or_else(|| self.uploader.clone())
                    .unwrap_or_default(),
                url: self.channel_url.clone().unwrap_or_default(),
            },
        }
    }

    fn output_path(&self, destination: &Path) -> PathBuf {
        let reported = self
            .requested_downloads
            .iter()
            .find_map(|d| d.filepath.clone())
            .or_else(|| self.filepath.clone());

        match reported {
            Some(path) if path.is_absolute() => path,
            Some(path) => destination.join(path),
            None => destination.join(format!(
                "{}.{}",
                self.title,
                self.ext.as_deref().unwrap_or("mkv")
            )),
        }
    }
}

/// A channel's video tab as dumped by yt-dlp.
#[derive(Debug, Deserialize)]
struct ChannelListing {
    #[serde(default)]
    entries: Vec<YtDlpInfo>,
}

/// Watch URL for a YouTube video id.
fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

/// The videos tab of a YouTube channel.
#[must_use]
pub fn channel_videos_url(channel: &str) -> String {
    format!("https://www.youtube.com/c/{channel}/videos")
}

/// Maps the `entries` of a channel listing to [`VideoInfo`]s, keeping
/// yt-dlp's order. Entries without an id are skipped.
///
/// # Errors
///
/// Returns the JSON error when `json` is not a listing.
pub fn parse_channel_entries(json: &[u8]) -> Result<Vec<VideoInfo>, serde_json::Error> {
    let listing: ChannelListing = serde_json::from_slice(json)?;
    Ok(listing
        .entries
        .iter()
        .filter_map(|entry| {
            let id = entry.id.as_deref().filter(|id| !id.is_empty())?;
            Some(entry.to_info(&watch_url(id)))
        })
        .collect())
}

/// Runs `yt-dlp` as a child process.
#[derive(Debug, Clone)]
pub struct YtDlpCapability {
    program: PathBuf,
}

impl Default for YtDlpCapability {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlpCapability {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for a download of `request`, URL last.
    #[must_use]
    pub fn download_args(request: &DownloadRequest) -> Vec<String> {
        let height = request.resolution;
        let mut args = vec![
            "--format".to_string(),
            format!("bv*[height<={height}]+ba/b[height<={height}]"),
            "--merge-output-format".to_string(),
            "mkv".to_string(),
            "--paths".to_string(),
            request.destination.display().to_string(),
            "--output".to_string(),
            "%(title)s.%(ext)s".to_string(),
            "--no-playlist".to_string(),
            "--newline".to_string(),
            "--no-simulate".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--print".to_string(),
            "after_move:%()j".to_string(),
        ];
        if let Some(cookies) = &request.cookies {
            args.push("--cookies".to_string());
            args.push(cookies.display().to_string());
        }
        args.push("--".to_string());
        args.push(request.url.clone());
        args
    }

    /// Runs yt-dlp with `args` followed by `url` and returns its stdout.
    async fn dump_json(&self, url: &str, args: &[&str]) -> Result<Vec<u8>, VideoError> {
        let output = Command::new(&self.program)
            .args(args)
            .args(["--", url])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(url, Path::new(""), &e))?;

        if !output.status.success() {
            let diagnostics = String::from_utf8_lossy(&output.stderr);
            return Err(VideoError::download(
                url,
                PathBuf::new(),
                classify_capability_failure(&diagnostics),
                failure_reason(&diagnostics, output.status),
            ));
        }
        Ok(output.stdout)
    }

    fn spawn_error(&self, url: &str, destination: &Path, error: &std::io::Error) -> VideoError {
        VideoError::download(
            url,
            destination,
            DownloadErrorKind::Unclassified,
            format!("failed to run {}: {error}", self.program.display()),
        )
    }
}

fn unreadable_metadata(url: &str, error: &serde_json::Error) -> VideoError {
    VideoError::download(
        url,
        PathBuf::new(),
        DownloadErrorKind::Unclassified,
        format!("unreadable metadata: {error}"),
    )
}

/// Last `ERROR:` line of the diagnostics, or the whole text when there is none.
fn failure_reason(diagnostics: &str, status: std::process::ExitStatus) -> String {
    diagnostics
        .lines()
        .rev()
        .find(|line| line.starts_with("ERROR"))
        .map_or_else(
            || {
                let trimmed = diagnostics.trim();
                if trimmed.is_empty() {
                    format!("yt-dlp exited with {status}")
                } else {
                    trimmed.to_string()
                }
            },
            ToOwned::to_owned,
        )
}

#[async_trait]
impl VideoCapability for YtDlpCapability {
    #[instrument(skip(self))]
    async fn fetch_info(&self, url: &str) -> Result<VideoInfo, VideoError> {
        let stdout = self
            .dump_json(url, &["--dump-single-json", "--skip-download", "--no-playlist"])
            .await?;

        let info: YtDlpInfo = serde_json::from_slice(&stdout)
            .map_err(|e| unreadable_metadata(url, &e))?;
        Ok(info.to_info(url))
    }

    #[instrument(skip(self))]
    async fn fetch_latest_from_channel(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<VideoInfo>, VideoError> {
        let url = channel_videos_url(channel);
        let playlist_end = limit.to_string();
        let stdout = self
            .dump_json(
                &url,
                &["--dump-single-json", "--skip-download", "--playlist-end", playlist_end.as_str()],
            )
            .await?;

        let entries = parse_channel_entries(&stdout).map_err(|e| unreadable_metadata(&url, &e))?;
        debug!(channel, found = entries.len(), "channel listing read");
        Ok(entries)
    }

    #[instrument(skip(self, request, progress), fields(url = %request.url, resolution = request.resolution))]
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<Video, VideoError> {
        let url = request.url.as_str();
        let destination = request.destination.as_path();

        let mut child = Command::new(&self.program)
            .args(Self::download_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(url, destination, &e))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(VideoError::download(
                url,
                destination,
                DownloadErrorKind::Unclassified,
                "child process has no output pipes",
            ));
        };

        let read_stdout = async {
            let mut info = None;
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(update) = parse_progress_line(url, &line) {
                    progress.on_progress(&update);
                } else if line.trim_start().starts_with('{') {
                    match serde_json::from_str::<YtDlpInfo>(&line) {
                        Ok(parsed) => info = Some(parsed),
                        Err(e) => debug!(error = %e, "ignoring unparsable JSON line"),
                    }
                } else {
                    trace!(%line, "yt-dlp");
                }
            }
            Ok::<_, std::io::Error>(info)
        };

        let read_stderr = async {
            let mut diagnostics = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(update) = parse_progress_line(url, &line) {
                    progress.on_progress(&update);
                } else {
                    trace!(%line, "yt-dlp stderr");
                    diagnostics.push(line);
                }
            }
            Ok::<_, std::io::Error>(diagnostics.join("\n"))
        };

        let (info, diagnostics) = tokio::join!(read_stdout, read_stderr);
        let status = child
            .wait()
            .await
            .map_err(|e| self.spawn_error(url, destination, &e))?;
        let diagnostics = diagnostics.unwrap_or_default();

        if !status.success() {
            return Err(VideoError::download(
                url,
                destination,
                classify_capability_failure(&diagnostics),
                failure_reason(&diagnostics, status),
            ));
        }

        let info = info
            .map_err(|e| VideoError::download(url, destination, DownloadErrorKind::Unclassified, e.to_string()))?
            .ok_or_else(|| {
                VideoError::download(
                    url,
                    destination,
                    DownloadErrorKind::Unclassified,
                    "yt-dlp finished without reporting the downloaded file",
                )
            })?;

        let video = Video {
            info: info.to_info(url),
            resolution: request.resolution,
            width: info.width,
            height: info.height,
            download_dir: destination.to_path_buf(),
            output_path: info.output_path(destination),
        };
        progress.on_complete(&DownloadComplete {
            url: url.to_string(),
            title: video.title().to_string(),
            output_path: video.output_path.clone(),
        });
        Ok(video)
    }
}
