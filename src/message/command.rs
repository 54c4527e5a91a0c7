use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DecoderRegistry, Message, decode_into};

/// Vertical resolution requested when a command does not name one.
pub const DEFAULT_RESOLUTION: u32 = 1080;

fn default_resolution() -> u32 {
    DEFAULT_RESOLUTION
}

/// Download a single video into `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadVideoFromUrlCommand {
    pub created_at: DateTime<Utc>,
    pub url: String,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    pub destination: PathBuf,
}

impl DownloadVideoFromUrlCommand {
    pub const TOPIC: &'static str = "DownloadVideoFromUrlCommand";

    #[must_use]
    pub fn new(url: impl Into<String>, resolution: u32, destination: impl AsRef<Path>) -> Self {
        Self {
            created_at: Utc::now(),
            url: url.into(),
            resolution,
            destination: destination.as_ref().to_path_buf(),
        }
    }
}

/// Download a single video under `destination/<shard>/<channel>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadVideoFromUrlToChannelDirCommand {
    pub created_at: DateTime<Utc>,
    pub url: String,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    pub destination: PathBuf,
}

impl DownloadVideoFromUrlToChannelDirCommand {
    pub const TOPIC: &'static str = "DownloadVideoFromUrlToChannelDirCommand";

    #[must_use]
    pub fn new(url: impl Into<String>, resolution: u32, destination: impl AsRef<Path>) -> Self {
        Self {
            created_at: Utc::now(),
            url: url.into(),
            resolution,
            destination: destination.as_ref().to_path_buf(),
        }
    }
}

/// Download every URL listed (one per line) in `urls_file` into `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadVideosFromUrlsFileCommand {
    pub created_at: DateTime<Utc>,
    pub urls_file: PathBuf,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    pub destination: PathBuf,
}

impl DownloadVideosFromUrlsFileCommand {
    pub const TOPIC: &'static str = "DownloadVideosFromUrlsFileCommand";

    #[must_use]
    pub fn new(urls_file: impl AsRef<Path>, resolution: u32, destination: impl AsRef<Path>) -> Self {
        Self {
            created_at: Utc::now(),
            urls_file: urls_file.as_ref().to_path_buf(),
            resolution,
            destination: destination.as_ref().to_path_buf(),
        }
    }
}

/// Batch variant of [`DownloadVideoFromUrlToChannelDirCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadVideosFromUrlsFileToChannelDirCommand {
    pub created_at: DateTime<Utc>,
    pub urls_file: PathBuf,
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    pub destination: PathBuf,
}

impl DownloadVideosFromUrlsFileToChannelDirCommand {
    pub const TOPIC: &'static str = "DownloadVideosFromUrlsFileToChannelDirCommand";

    #[must_use]
    pub fn new(urls_file: impl AsRef<Path>, resolution: u32, destination: impl AsRef<Path>) -> Self {
        Self {
            created_at: Utc::now(),
            urls_file: urls_file.as_ref().to_path_buf(),
            resolution,
            destination: destination.as_ref().to_path_buf(),
        }
    }
}

/// Every command the pipeline understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    DownloadVideoFromUrl(DownloadVideoFromUrlCommand),
    DownloadVideoFromUrlToChannelDir(DownloadVideoFromUrlToChannelDirCommand),
    DownloadVideosFromUrlsFile(DownloadVideosFromUrlsFileCommand),
    DownloadVideosFromUrlsFileToChannelDir(DownloadVideosFromUrlsFileToChannelDirCommand),
}

const COMMAND_TOPICS: &[&str] = &[
    DownloadVideoFromUrlCommand::TOPIC,
    DownloadVideoFromUrlToChannelDirCommand::TOPIC,
    DownloadVideosFromUrlsFileCommand::TOPIC,
    DownloadVideosFromUrlsFileToChannelDirCommand::TOPIC,
];

impl Command {
    /// Requested vertical resolution, whichever the variant.
    #[must_use]
    pub fn resolution(&self) -> u32 {
        match self {
            Self::DownloadVideoFromUrl(c) => c.resolution,
            Self::DownloadVideoFromUrlToChannelDir(c) => c.resolution,
            Self::DownloadVideosFromUrlsFile(c) => c.resolution,
            Self::DownloadVideosFromUrlsFileToChannelDir(c) => c.resolution,
        }
    }

    #[must_use]
    pub fn destination(&self) -> &Path {
        match self {
            Self::DownloadVideoFromUrl(c) => &c.destination,
            Self::DownloadVideoFromUrlToChannelDir(c) => &c.destination,
            Self::DownloadVideosFromUrlsFile(c) => &c.destination,
            Self::DownloadVideosFromUrlsFileToChannelDir(c) => &c.destination,
        }
    }
}

impl Message for Command {
    fn topic(&self) -> &'static str {
        match self {
            Self::DownloadVideoFromUrl(_) => DownloadVideoFromUrlCommand::TOPIC,
            Self::DownloadVideoFromUrlToChannelDir(_) => DownloadVideoFromUrlToChannelDirCommand::TOPIC,
            Self::DownloadVideosFromUrlsFile(_) => DownloadVideosFromUrlsFileCommand::TOPIC,
            Self::DownloadVideosFromUrlsFileToChannelDir(_) => {
                DownloadVideosFromUrlsFileToChannelDirCommand::TOPIC
            }
        }
    }

    fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::DownloadVideoFromUrl(c) => c.created_at,
            Self::DownloadVideoFromUrlToChannelDir(c) => c.created_at,
            Self::DownloadVideosFromUrlsFile(c) => c.created_at,
            Self::DownloadVideosFromUrlsFileToChannelDir(c) => c.created_at,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::DownloadVideoFromUrl(c) => serde_json::to_value(c),
            Self::DownloadVideoFromUrlToChannelDir(c) => serde_json::to_value(c),
            Self::DownloadVideosFromUrlsFile(c) => serde_json::to_value(c),
            Self::DownloadVideosFromUrlsFileToChannelDir(c) => serde_json::to_value(c),
        }
    }

    fn topics() -> &'static [&'static str] {
        COMMAND_TOPICS
    }

    fn registry() -> DecoderRegistry<Self> {
        DecoderRegistry::new()
            .with(
                DownloadVideoFromUrlCommand::TOPIC,
                decode_into::<DownloadVideoFromUrlCommand, Self>,
            )
            .with(
                DownloadVideoFromUrlToChannelDirCommand::TOPIC,
                decode_into::<DownloadVideoFromUrlToChannelDirCommand, Self>,
            )
            .with(
                DownloadVideosFromUrlsFileCommand::TOPIC,
                decode_into::<DownloadVideosFromUrlsFileCommand, Self>,
            )
            .with(
                DownloadVideosFromUrlsFileToChannelDirCommand::TOPIC,
                decode_into::<DownloadVideosFromUrlsFileToChannelDirCommand, Self>,
            )
    }
}

impl From<DownloadVideoFromUrlCommand> for Command {
    fn from(command: DownloadVideoFromUrlCommand) -> Self {
        Self::DownloadVideoFromUrl(command)
    }
}

impl From<DownloadVideoFromUrlToChannelDirCommand> for Command {
    fn from(command: DownloadVideoFromUrlToChannelDirCommand) -> Self {
        Self::DownloadVideoFromUrlToChannelDir(command)
    }
}

impl From<DownloadVideosFromUrlsFileCommand> for Command {
    fn from(command: DownloadVideosFromUrlsFileCommand) -> Self {
        Self::DownloadVideosFromUrlsFile(command)
    }
}

impl From<DownloadVideosFromUrlsFileToChannelDirCommand> for Command {
    fn from(command: DownloadVideosFromUrlsFileToChannelDirCommand) -> Self {
        Self::DownloadVideosFromUrlsFileToChannelDir(command)
    }
}
