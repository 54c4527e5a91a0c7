use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DecoderRegistry, Message, RepositoryVideoRecord, Video, decode_into};

/// A video finished downloading and sits at its final location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedVideoEvent {
    pub created_at: DateTime<Utc>,
    pub video: Video,
}

impl DownloadedVideoEvent {
    pub const TOPIC: &'static str = "DownloadedVideoEvent";

    #[must_use]
    pub fn new(video: Video) -> Self {
        Self {
            created_at: Utc::now(),
            video,
        }
    }
}

/// A downloaded video has been catalogued by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedVideoEvent {
    pub created_at: DateTime<Utc>,
    pub record: RepositoryVideoRecord,
}

impl PersistedVideoEvent {
    pub const TOPIC: &'static str = "PersistedVideoEvent";

    #[must_use]
    pub fn new(record: RepositoryVideoRecord) -> Self {
        Self {
            created_at: Utc::now(),
            record,
        }
    }
}

/// Every event the pipeline emits.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DownloadedVideo(DownloadedVideoEvent),
    PersistedVideo(PersistedVideoEvent),
}

const EVENT_TOPICS: &[&str] = &[DownloadedVideoEvent::TOPIC, PersistedVideoEvent::TOPIC];

impl Message for Event {
    fn topic(&self) -> &'static str {
        match self {
            Self::DownloadedVideo(_) => DownloadedVideoEvent::TOPIC,
            Self::PersistedVideo(_) => PersistedVideoEvent::TOPIC,
        }
    }

    fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::DownloadedVideo(e) => e.created_at,
            Self::PersistedVideo(e) => e.created_at,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::DownloadedVideo(e) => serde_json::to_value(e),
            Self::PersistedVideo(e) => serde_json::to_value(e),
        }
    }

    fn topics() -> &'static [&'static str] {
        EVENT_TOPICS
    }

    fn registry() -> DecoderRegistry<Self> {
        DecoderRegistry::new()
            .with(
                DownloadedVideoEvent::TOPIC,
                decode_into::<DownloadedVideoEvent, Self>,
            )
            .with(
                PersistedVideoEvent::TOPIC,
                decode_into::<PersistedVideoEvent, Self>,
            )
    }
}

impl From<DownloadedVideoEvent> for Event {
    fn from(event: DownloadedVideoEvent) -> Self {
        Self::DownloadedVideo(event)
    }
}

impl From<PersistedVideoEvent> for Event {
    fn from(event: PersistedVideoEvent) -> Self {
        Self::PersistedVideo(event)
    }
}
