use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque identifier of one conversation endpoint.
///
/// Derived from the owning [`StreamKey`]; hex of a SHA-256 digest so ids are
/// filesystem- and key-safe on every platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Wrap a pre-computed id (e.g. read back from the KV store).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The components that identify a conversation before hashing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub platform: String,
    pub raw_id: String,
    pub is_private: bool,
}

impl StreamKey {
    pub fn group(platform: impl Into<String>, raw_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            raw_id: raw_id.into(),
            is_private: false,
        }
    }

    pub fn private(platform: impl Into<String>, raw_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            raw_id: raw_id.into(),
            is_private: true,
        }
    }

    /// Hash `platform_rawid[_private]` into the stable stream id.
    pub fn stream_id(&self) -> StreamId {
        let mut hasher = Sha256::new();
        hasher.update(self.platform.as_bytes());
        hasher.update(b"_");
        hasher.update(self.raw_id.as_bytes());
        if self.is_private {
            hasher.update(b"_private");
        }
        StreamId(format!("{:x}", hasher.finalize()))
    }
}
