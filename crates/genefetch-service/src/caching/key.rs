use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::CacheError;

/// The key of a memoized call.
///
/// Keys are human readable and stable: `name(tok1,tok2,...)`, where every token is the
/// compact JSON rendering of one argument. Object keys are sorted, so equal arguments always
/// produce equal keys, independent of locale or insertion order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates the key for calling `name` with `args`.
    ///
    /// Tuples, arrays and sequences contribute one token per element. The unit type
    /// contributes none, every other value exactly one.
    pub fn new<A: Serialize + ?Sized>(name: &str, args: &A) -> Result<Self, CacheError> {
        let mut builder = Self::builder(name);
        match serde_json::to_value(args)? {
            serde_json::Value::Null => {}
            serde_json::Value::Array(items) => {
                for item in &items {
                    builder.arg(item)?;
                }
            }
            other => {
                builder.arg(&other)?;
            }
        }
        Ok(builder.build())
    }

    /// Starts a key for `name`, with arguments to be added one by one.
    pub fn builder(name: &str) -> CacheKeyBuilder {
        let mut key = Self::prefix(name);
        key.reserve(32);
        CacheKeyBuilder { key, args: 0 }
    }

    /// The prefix shared by all keys of `name`.
    pub fn prefix(name: &str) -> String {
        format!("{name}(")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps a key read back from a store.
    pub(crate) fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A builder for [`CacheKey`]s.
pub struct CacheKeyBuilder {
    key: String,
    args: usize,
}

impl CacheKeyBuilder {
    /// Appends one argument token.
    pub fn arg<T: Serialize + ?Sized>(&mut self, arg: &T) -> Result<&mut Self, CacheError> {
        if self.args > 0 {
            self.key.push(',');
        }
        // going through `Value` sorts object keys
        let value = serde_json::to_value(arg)?;
        self.key.push_str(&serde_json::to_string(&value)?);
        self.args += 1;
        Ok(self)
    }

    /// Finalize the [`CacheKey`].
    pub fn build(mut self) -> CacheKey {
        self.key.push(')');
        CacheKey(self.key.into())
    }
}

/// Returns the relative path of a content-addressed blob.
///
/// The path is the sha-256 hash of `contents` hex-formatted like so:
/// `v$version/aa/bbccdd/eeff...`
pub fn blob_path(contents: &[u8], version: u32) -> String {
    let hash = Sha256::digest(contents);
    let mut path = format!("v{version}/{:02x}/", hash[0]);
    for b in &hash[1..4] {
        let _ = write!(path, "{b:02x}");
    }
    path.push('/');
    for b in &hash[4..] {
        let _ = write!(path, "{b:02x}");
    }
    path
}
