//! # Persistent memoization
//!
//! Remote gene database lookups are slow and mostly idempotent, so their results are kept on
//! disk and reused across runs. This module contains the pieces that make this work, and the
//! central [`CacheError`] type shared with the fetch layer.
//!
//! ## Layers
//!
//! - A [`Store`] is a durable key-value map backed by one SQLite database per database cache
//!   (`<cache_dir>/<database>/cache.sqlite3`), with large payloads kept as content-addressed
//!   blob files next to it.
//! - A [`Memoizer`] wraps functions into [`Memoized`] lookups. Each call is identified by a
//!   [`CacheKey`] derived from the function name and its serialized arguments. Results carry
//!   the time they were produced and the release they were produced under, and a [`Validity`]
//!   decides when they may be reused.
//! - The [`UpdateLog`] records when update functions last ran (`<cache_dir>/updates`).
//!
//! ## Not-found results
//!
//! A memoized function reports an absent remote object with [`CacheError::NotFound`]. This is
//! recorded as a tombstone, and the lookup returns [`Lookup::Missing`] both on the first call
//! and on every later hit. All other errors are passed through and record nothing, so the next
//! call tries again.
//!
//! ### Metrics
//!
//! - `store.put`: Entries written, tagged with the payload `kind`.
//! - `memoizer.hit` / `memoizer.miss`: Lookups, tagged with the `function` name.

mod cache_error;
mod entry;
mod key;
mod memoizer;
mod store;
mod updates;


pub use cache_error::CacheError;
pub use entry::{CacheEntry, ENTRY_FORMAT, Payload};
pub use key::{CacheKey, CacheKeyBuilder, blob_path};
pub use memoizer::{Lookup, Memoized, Memoizer, ReleaseTag, Validity};
pub use store::Store;
pub use updates::UpdateLog;
