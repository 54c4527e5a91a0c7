//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use tubeflow_core::message::{
    Command, DEFAULT_RESOLUTION, DownloadVideoFromUrlCommand,
    DownloadVideoFromUrlToChannelDirCommand, DownloadVideosFromUrlsFileCommand,
    DownloadVideosFromUrlsFileToChannelDirCommand,
};

/// Event-driven video download pipeline.
///
/// Commands and events travel through a shared broker; `commands` and
/// `events` run the long-lived handler processes, `publish` injects work.
#[derive(Parser, Debug)]
#[command(name = "tubeflow")]
#[command(author, version, about)]
pub struct Cli {
    /// Configuration file (`key = value` lines)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Run the download and command-log handlers
    Commands,

    /// Run the event-log and video-persist handlers
    Events,

    /// Publish one download command
    #[command(subcommand)]
    Publish(PublishKind),

    /// Print metadata as JSON without downloading anything
    Inspect(InspectArgs),
}

/// Default number of uploads listed by `inspect --channel`.
pub const DEFAULT_CHANNEL_LIMIT: usize = 3;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Video URL
    #[arg(required_unless_present = "channel", conflicts_with = "channel")]
    pub url: Option<String>,

    /// List the most recent uploads of this channel instead
    #[arg(long)]
    pub channel: Option<String>,

    /// Number of uploads listed with --channel
    #[arg(
        long,
        requires = "channel",
        default_value_t = DEFAULT_CHANNEL_LIMIT,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub limit: usize,
}

/// What `inspect` looks up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectTarget {
    Video(String),
    Channel { name: String, limit: usize },
}

impl InspectArgs {
    #[must_use]
    pub fn into_target(self) -> InspectTarget {
        // clap guarantees exactly one of url and --channel
        match self.channel {
            Some(name) => InspectTarget::Channel {
                name,
                limit: self.limit,
            },
            None => InspectTarget::Video(self.url.unwrap_or_default()),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum PublishKind {
    /// Download a single video
    Url {
        /// Video URL
        url: String,

        #[command(flatten)]
        target: Target,
    },

    /// Download every URL listed in a file, one per line
    UrlsFile {
        /// File with one URL per line
        urls_file: PathBuf,

        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args, Debug)]
pub struct Target {
    /// Maximum video height in pixels
    #[arg(short, long, default_value_t = DEFAULT_RESOLUTION)]
    pub resolution: u32,

    /// Directory the download lands in (the root of the channel tree with --channel-dir)
    #[arg(short, long)]
    pub destination: PathBuf,

    /// Sort downloads into <destination>/<letter>/<channel>/
    #[arg(long)]
    pub channel_dir: bool,
}

impl PublishKind {
    /// The command to publish, stamped with the current time.
    #[must_use]
    pub fn into_command(self) -> Command {
        match self {
            Self::Url { url, target } if target.channel_dir => {
                DownloadVideoFromUrlToChannelDirCommand::new(url, target.resolution, target.destination)
                    .into()
            }
            Self::Url { url, target } => {
                DownloadVideoFromUrlCommand::new(url, target.resolution, target.destination).into()
            }
            Self::UrlsFile { urls_file, target } if target.channel_dir => {
                DownloadVideosFromUrlsFileToChannelDirCommand::new(
                    urls_file,
                    target.resolution,
                    target.destination,
                )
                .into()
            }
            Self::UrlsFile { urls_file, target } => {
                DownloadVideosFromUrlsFileCommand::new(urls_file, target.resolution, target.destination)
                    .into()
            }
        }
    }
}
