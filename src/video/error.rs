//! Error types for video retrieval.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// What went wrong while fetching or placing a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadErrorKind {
    /// The video does not exist, is private, or the URL is not a video.
    NotFound,
    /// The remote side could not be reached.
    NoConnectivity,
    /// No stream matches the requested resolution.
    UnsupportedResolution,
    /// Local filesystem failure while creating, moving or cleaning files.
    Filesystem,
    /// Anything the classifier does not recognise.
    Unclassified,
}

impl fmt::Display for DownloadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotFound => "not_found",
            Self::NoConnectivity => "no_connectivity",
            Self::UnsupportedResolution => "unsupported_resolution",
            Self::Filesystem => "filesystem",
            Self::Unclassified => "unclassified",
        };
        write!(f, "{label}")
    }
}

/// Errors raised by [`crate::video::DownloadService`] and video capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VideoError {
    /// A local path that must already exist does not.
    #[error("path does not exist: {}", path.display())]
    PathNotFound { path: PathBuf },

    /// Fetching, downloading or placing the video failed.
    #[error("[{kind}] {url}: {reason}")]
    Download {
        url: String,
        destination: PathBuf,
        kind: DownloadErrorKind,
        reason: String,
    },
}

impl VideoError {
    #[must_use]
    pub fn download(
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        kind: DownloadErrorKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::Download {
            url: url.into(),
            destination: destination.into(),
            kind,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn filesystem(
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        error: &std::io::Error,
    ) -> Self {
        Self::download(url, destination, DownloadErrorKind::Filesystem, error.to_string())
    }

    /// The download sub-kind, when this is a download failure.
    #[must_use]
    pub fn kind(&self) -> Option<DownloadErrorKind> {
        match self {
            Self::Download { kind, .. } => Some(*kind),
            Self::PathNotFound { .. } => None,
        }
    }
}

/// Maps the diagnostic output of a failed fetch to a [`DownloadErrorKind`].
///
/// Connectivity markers are checked first: "Unable to download webpage"
/// followed by a resolver error is a network problem, not a missing video.
#[must_use]
pub fn classify_capability_failure(diagnostics: &str) -> DownloadErrorKind {
    const NO_CONNECTIVITY: &[&str] = &[
        "Failed to extract any player response",
        "Temporary failure in name resolution",
        "Name or service not known",
        "getaddrinfo failed",
        "Network is unreachable",
        "Connection refused",
        "Connection reset by peer",
        "timed out",
    ];
    const NOT_FOUND: &[&str] = &[
        "Video unavailable",
        "is not a valid URL",
        "Unable to download",
        "Private video",
        "HTTP Error 404",
        "Unsupported URL",
    ];
    const UNSUPPORTED_RESOLUTION: &[&str] = &["Requested format is not available"];

    let contains_any = |markers: &[&str]| markers.iter().any(|m| diagnostics.contains(m));

    if contains_any(NO_CONNECTIVITY) {
        DownloadErrorKind::NoConnectivity
    } else if contains_any(UNSUPPORTED_RESOLUTION) {
        DownloadErrorKind::UnsupportedResolution
    } else if contains_any(NOT_FOUND) {
        DownloadErrorKind::NotFound
    } else {
        DownloadErrorKind::Unclassified
    }
}
