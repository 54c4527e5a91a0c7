//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tubeflow_core::message::{Channel, Video, VideoInfo};
use tubeflow_core::video::{
    DownloadErrorKind, DownloadRequest, ProgressReporter, VideoCapability, VideoError,
};

/// Capability that "downloads" by writing a small file named after the URL.
///
/// URLs registered with [`FakeCapability::failing`] always fail with
/// `NotFound`; every other URL succeeds after `flaky_failures` connectivity
/// failures.
#[derive(Debug, Default)]
pub struct FakeCapability {
    channel: String,
    failing: HashSet<String>,
    flaky_failures: u32,
    calls: AtomicU32,
    requests: Mutex<Vec<DownloadRequest>>,
}

impl FakeCapability {
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            ..Self::default()
        }
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }

    pub fn flaky(mut self, failures: u32) -> Self {
        self.flaky_failures = failures;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<DownloadRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn video_info(url: &str, channel: &str) -> VideoInfo {
    VideoInfo {
        url: url.to_string(),
        title: title_for(url),
        duration: Some("PT1M".to_string()),
        published_at: None,
        average_rating: Some(4.5),
        thumbnail: None,
        tags: vec!["test".to_string()],
        channel: Channel {
            id: format!("id-{channel}"),
            name: channel.to_string(),
            url: format!("https://example.com/{channel}"),
        },
    }
}

fn title_for(url: &str) -> String {
    url.rsplit('/').next().unwrap_or("video").to_string()
}

#[async_trait]
impl VideoCapability for FakeCapability {
    async fn fetch_info(&self, url: &str) -> Result<VideoInfo, VideoError> {
        Ok(video_info(url, &self.channel))
    }

    async fn fetch_latest_from_channel(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<VideoInfo>, VideoError> {
        Ok((0..limit)
            .map(|i| video_info(&format!("https://youtu.be/{channel}-{i}"), channel))
            .collect())
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        _progress: &dyn ProgressReporter,
    ) -> Result<Video, VideoError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());

        if self.failing.contains(&request.url) {
            return Err(VideoError::download(
                &request.url,
                &request.destination,
                DownloadErrorKind::NotFound,
                "Video unavailable",
            ));
        }
        if call <= self.flaky_failures {
            return Err(VideoError::download(
                &request.url,
                &request.destination,
                DownloadErrorKind::NoConnectivity,
                "Failed to extract any player response",
            ));
        }

        let output_path = request
            .destination
            .join(format!("{}.mkv", title_for(&request.url)));
        std::fs::write(&output_path, b"video").unwrap();
        Ok(Video {
            info: video_info(&request.url, &self.channel),
            resolution: request.resolution,
            width: None,
            height: Some(request.resolution),
            download_dir: request.destination.clone(),
            output_path,
        })
    }
}

/// Writes one URL per line into `dir/urls.txt`.
pub fn write_urls_file(dir: &Path, urls: &[&str]) -> std::path::PathBuf {
    let path = dir.join("urls.txt");
    std::fs::write(&path, urls.join("\n")).unwrap();
    path
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
