//! Commands and events exchanged over the broker and kept in the logs.
//!
//! Every message variant owns a topic named after the variant. On the wire a
//! message is the JSON body of its variant; the topic (or the stored variant
//! tag) decides how to decode it again, via a [`DecoderRegistry`].

mod command;
mod event;
mod video;

use std::collections::HashMap;
use std::fmt::{self, Debug};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use command::{
    Command, DEFAULT_RESOLUTION, DownloadVideoFromUrlCommand, DownloadVideoFromUrlToChannelDirCommand,
    DownloadVideosFromUrlsFileCommand, DownloadVideosFromUrlsFileToChannelDirCommand,
};
pub use event::{DownloadedVideoEvent, Event, PersistedVideoEvent};
pub use video::{Channel, RepositoryVideoRecord, Video, VideoInfo};

/// A routable, storable message family (all commands, or all events).
pub trait Message: Debug + Clone + Send + Sync + 'static {
    /// Topic the message is published on. Equal to the variant tag.
    fn topic(&self) -> &'static str;

    /// Creation instant; part of the store identity.
    fn created_at(&self) -> DateTime<Utc>;

    /// JSON body of the concrete variant.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the body cannot be represented as JSON.
    fn to_value(&self) -> Result<Value, serde_json::Error>;

    /// Every topic of the family, in declaration order.
    fn topics() -> &'static [&'static str];

    /// Decoders for every variant of the family, keyed by variant tag.
    fn registry() -> DecoderRegistry<Self>;

    /// Variant tag persisted next to the body. Topics and tags coincide.
    fn variant(&self) -> &'static str {
        self.topic()
    }

    /// Wire encoding of the message.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the body cannot be encoded.
    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_value()?)
    }

    /// Identity under which the store deduplicates: `(topic, created_at, variant)`.
    fn store_key(&self) -> StoreKey {
        StoreKey {
            topic: self.topic(),
            created_at: format_timestamp(self.created_at()),
            variant: self.variant(),
        }
    }
}

/// Composite identity of a stored command or event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub topic: &'static str,
    pub created_at: String,
    pub variant: &'static str,
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.topic, self.created_at, self.variant)
    }
}

/// Canonical text form of a timestamp as stored in key columns.
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Decodes one variant body into the message family `M`.
pub type Decoder<M> = fn(Value) -> Result<M, serde_json::Error>;

/// Closed map from variant tag to decoder, assembled at startup.
///
/// Unknown tags decode to `None`; callers decide whether that is an error.
pub struct DecoderRegistry<M> {
    decoders: HashMap<&'static str, Decoder<M>>,
}

impl<M> DecoderRegistry<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Adds a decoder for `tag`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, tag: &'static str, decoder: Decoder<M>) -> Self {
        self.decoders.insert(tag, decoder);
        self
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes an already parsed JSON body.
    pub fn decode_value(&self, tag: &str, body: Value) -> Option<Result<M, serde_json::Error>> {
        self.decoders.get(tag).map(|decode| decode(body))
    }

    /// Decodes raw wire bytes.
    pub fn decode_bytes(&self, tag: &str, bytes: &[u8]) -> Option<Result<M, serde_json::Error>> {
        let decode = self.decoders.get(tag)?;
        Some(serde_json::from_slice::<Value>(bytes).and_then(decode))
    }
}

impl<M> Default for DecoderRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Debug for DecoderRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("DecoderRegistry").field("tags", &tags).finish()
    }
}

/// Decodes a variant body of type `T` and wraps it into the family `M`.
pub(crate) fn decode_into<T, M>(body: Value) -> Result<M, serde_json::Error>
where
    T: DeserializeOwned + Into<M>,
{
    serde_json::from_value::<T>(body).map(Into::into)
}
