use std::borrow::Cow;

use super::CacheError;
use crate::clock::Timestamp;

/// The current version of the serialized entry format.
pub const ENTRY_FORMAT: u32 = 1;

/// The value part of a [`CacheEntry`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Raw bytes, for example a fetched record.
    Bytes(Vec<u8>),
    /// A structured value.
    Value(serde_json::Value),
    /// A tombstone: the remote side reported the object as not found.
    Missing,
}

/// One record of a [`Store`](super::Store).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: Payload,
    /// When the value was produced.
    pub mtime: Timestamp,
    /// When the value goes stale. Never, if unset.
    pub expires: Option<Timestamp>,
    /// The release the value was produced under.
    pub release: Option<String>,
}

impl CacheEntry {
    pub fn new(payload: Payload, mtime: Timestamp) -> Self {
        Self {
            payload,
            mtime,
            expires: None,
            release: None,
        }
    }

    pub fn with_expires(mut self, expires: Option<Timestamp>) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_release(mut self, release: Option<String>) -> Self {
        self.release = release;
        self
    }

    /// An entry is stale once its expiry passed. Entries expiring no later than they were
    /// written are stale from the start.
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.expires
            .is_some_and(|expires| expires <= now || expires <= self.mtime)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self.payload, Payload::Missing)
    }
}

/// The on-disk form of a [`Payload`].
///
/// Bytes are kept as they are and structured values as JSON text, so that both can be moved
/// out of line without re-encoding. The `kind` column distinguishes them.
pub(super) fn encode(
    payload: &Payload,
) -> Result<(&'static str, Option<Cow<'_, [u8]>>), CacheError> {
    Ok(match payload {
        Payload::Bytes(bytes) => ("bytes", Some(Cow::Borrowed(bytes.as_slice()))),
        Payload::Value(value) => ("value", Some(Cow::Owned(serde_json::to_vec(value)?))),
        Payload::Missing => ("missing", None),
    })
}

/// Reads back what [`encode`] produced.
///
/// Unknown formats or kinds are reported as [`CacheError::Corrupt`], which readers treat
/// like a miss.
pub(super) fn decode(
    format: u32,
    kind: &str,
    data: Option<Vec<u8>>,
) -> Result<Payload, CacheError> {
    if format != ENTRY_FORMAT {
        return Err(CacheError::Corrupt(format!("unknown entry format {format}")));
    }
    match (kind, data) {
        ("bytes", Some(bytes)) => Ok(Payload::Bytes(bytes)),
        ("value", Some(json)) => serde_json::from_slice(&json)
            .map(Payload::Value)
            .map_err(|err| CacheError::Corrupt(err.to_string())),
        ("missing", _) => Ok(Payload::Missing),
        (kind, _) => Err(CacheError::Corrupt(format!("invalid entry kind {kind:?}"))),
    }
}
