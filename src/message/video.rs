use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel that published a video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Metadata of a remote video, without any local file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub average_rating: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub channel: Channel,
}

/// A video that has been downloaded to the local filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    #[serde(flatten)]
    pub info: VideoInfo,
    pub resolution: u32,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Absolute directory holding the file.
    pub download_dir: PathBuf,
    pub output_path: PathBuf,
}

impl Video {
    #[must_use]
    pub fn url(&self) -> &str {
        &self.info.url
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.info.title
    }

    #[must_use]
    pub fn channel_name(&self) -> &str {
        &self.info.channel.name
    }

    /// The download directory exists and the output path lies inside it.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.download_dir.is_absolute()
            && self.download_dir.is_dir()
            && self.output_path.starts_with(&self.download_dir)
    }

    /// Same video, relocated to `dir`, keeping the file name.
    #[must_use]
    pub fn relocated(mut self, dir: &Path) -> Self {
        let file_name = self.output_path.file_name().map(ToOwned::to_owned);
        self.output_path = match file_name {
            Some(name) => dir.join(name),
            None => dir.to_path_buf(),
        };
        self.download_dir = dir.to_path_buf();
        self
    }
}

/// A video as catalogued by the repository. Identity fields are assigned
/// once at creation and never change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryVideoRecord {
    id: Uuid,
    created_at: DateTime<Utc>,
    video: Video,
}

impl RepositoryVideoRecord {
    /// Wraps a freshly downloaded video with a new identity.
    #[must_use]
    pub fn new(video: Video) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            video,
        }
    }

    pub(crate) fn restore(id: Uuid, created_at: DateTime<Utc>, video: Video) -> Self {
        Self {
            id,
            created_at,
            video,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn video(&self) -> &Video {
        &self.video
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn video_in(dir: &Path) -> Video {
        Video {
            info: VideoInfo {
                url: "https://youtu.be/abc".to_string(),
                title: "Clip".to_string(),
                duration: Some("1:02".to_string()),
                published_at: None,
                average_rating: None,
                thumbnail: None,
                tags: vec!["music".to_string()],
                channel: Channel {
                    id: "UC1".to_string(),
                    name: "Zephyr".to_string(),
                    url: "https://youtube.com/@zephyr".to_string(),
                },
            },
            resolution: 1080,
            width: Some(1920),
            height: Some(1080),
            download_dir: dir.to_path_buf(),
            output_path: dir.join("Clip.mkv"),
        }
    }

    #[test]
    fn test_video_well_formed_inside_existing_dir() {
        let temp = tempfile::tempdir().unwrap();
        assert!(video_in(temp.path()).is_well_formed());
    }

    #[test]
    fn test_video_not_well_formed_when_dir_missing() {
        let temp = tempfile::tempdir().unwrap();
        let video = video_in(&temp.path().join("missing"));
        assert!(!video.is_well_formed());
    }

    #[test]
    fn test_video_not_well_formed_when_output_outside_dir() {
        let temp = tempfile::tempdir().unwrap();
        let mut video = video_in(temp.path());
        video.output_path = PathBuf::from("/elsewhere/Clip.mkv");
        assert!(!video.is_well_formed());
    }

    #[test]
    fn test_relocated_moves_dir_and_keeps_file_name() {
        let video = video_in(Path::new("/staging"));
        let moved = video.relocated(Path::new("/media/z/Zephyr"));

        assert_eq!(moved.download_dir, Path::new("/media/z/Zephyr"));
        assert_eq!(moved.output_path, Path::new("/media/z/Zephyr/Clip.mkv"));
    }

    #[test]
    fn test_video_json_flattens_info() {
        let value = serde_json::to_value(video_in(Path::new("/d"))).unwrap();
        assert_eq!(value["title"], "Clip");
        assert_eq!(value["channel"]["name"], "Zephyr");
        assert_eq!(value["resolution"], 1080);
    }

    #[test]
    fn test_record_identity_is_fresh_per_record() {
        let video = video_in(Path::new("/d"));
        let a = RepositoryVideoRecord::new(video.clone());
        let b = RepositoryVideoRecord::new(video);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.video(), b.video());
    }
}
