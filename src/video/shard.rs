//! Channel-sharded directory layout: `<root>/<shard>/<channel>`.

use std::collections::HashMap;

/// Shard key of a channel: its first alphabetic character, lowercased.
/// Empty when the name has no alphabetic character at all.
#[must_use]
pub fn shard_key(channel_name: &str) -> String {
    channel_name
        .chars()
        .find(|c| c.is_alphabetic())
        .map(|c| c.to_lowercase().collect())
        .unwrap_or_default()
}

/// Directory name used for a channel inside its shard. Path separators
/// are replaced so a channel name can never escape the shard.
#[must_use]
pub fn channel_dir_name(channel_name: &str) -> String {
    let sanitized: String = channel_name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match sanitized.as_str() {
        "" => "unknown".to_string(),
        "." | ".." => sanitized.replace('.', "_"),
        _ => sanitized,
    }
}

/// Rewrites shard keys before they become directory names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardOverrides {
    map: HashMap<String, String>,
}

impl Default for ShardOverrides {
    /// Nameless channels go to `unknown`; hamza-on-alif folds into plain alif.
    fn default() -> Self {
        Self::empty().with("", "unknown").with("أ", "ا")
    }
}

impl ShardOverrides {
    /// No overrides at all, not even for the empty key.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, shard: impl Into<String>) -> Self {
        self.map.insert(key.into(), shard.into());
        self
    }

    /// The directory name for `key`.
    #[must_use]
    pub fn resolve(&self, key: &str) -> String {
        self.map
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    /// Shard directory name for a channel.
    #[must_use]
    pub fn shard_for(&self, channel_name: &str) -> String {
        self.resolve(&shard_key(channel_name))
    }
}
