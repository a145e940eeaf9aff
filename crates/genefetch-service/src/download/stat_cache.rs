use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use genefetch_sources::{EndpointId, RemoteRef};
use moka::sync::Cache;

use super::{Connection, RemoteStat, StatMode};
use crate::caching::CacheError;
use crate::clock::{Clock, Timestamp, parse_listing_line};

/// The metadata of one remote directory (or file), as observed at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub observed_at: Option<Timestamp>,
    pub entries: HashMap<String, RemoteStat>,
}

type SnapshotKey = (EndpointId, String);

/// Caches remote directory listings per `(endpoint, directory)`.
///
/// A directory is listed at most once until it is invalidated; concurrent queries for the
/// same directory wait for the one listing in flight. Transports without listings are cached
/// per file instead, keyed on the full path.
#[derive(Clone)]
pub struct StatCache {
    snapshots: Cache<SnapshotKey, Arc<Snapshot>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for StatCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatCache")
            .field("snapshots", &self.snapshots.entry_count())
            .finish()
    }
}

impl StatCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshots: Cache::builder().build(),
            clock,
        }
    }

    /// Looks up the size and modification time of `remote`.
    ///
    /// Returns [`CacheError::NotFound`] if the file is not part of its directory's listing.
    pub fn stat(
        &self,
        conn: &mut dyn Connection,
        remote: &RemoteRef,
    ) -> Result<RemoteStat, CacheError> {
        let (key, name) = match conn.stat_mode() {
            StatMode::Listing => (remote.directory().to_owned(), remote.file_name()),
            StatMode::PerFile => (remote.path().to_owned(), remote.file_name()),
        };
        let key = (remote.endpoint().clone(), key);

        let snapshot = self
            .snapshots
            .try_get_with_by_ref(&key, || self.observe(conn, remote, &key.1))
            .map_err(|err| CacheError::clone(&err))?;

        snapshot.entries.get(name).copied().ok_or(CacheError::NotFound)
    }

    /// Forgets the listing of `dir` on `endpoint`.
    pub fn invalidate(&self, endpoint: &EndpointId, dir: &str) {
        self.snapshots.invalidate(&(endpoint.clone(), dir.to_owned()));
    }

    /// Forgets everything known about `remote`.
    pub fn invalidate_for(&self, remote: &RemoteRef) {
        self.invalidate(remote.endpoint(), remote.directory());
        self.invalidate(remote.endpoint(), remote.path());
    }

    /// The currently cached snapshot of `dir` on `endpoint`.
    pub fn snapshot(&self, endpoint: &EndpointId, dir: &str) -> Option<Arc<Snapshot>> {
        self.snapshots.get(&(endpoint.clone(), dir.to_owned()))
    }

    fn observe(
        &self,
        conn: &mut dyn Connection,
        remote: &RemoteRef,
        key: &str,
    ) -> Result<Arc<Snapshot>, CacheError> {
        let now = self.clock.now();
        let mut snapshot = Snapshot {
            observed_at: Some(now),
            entries: HashMap::new(),
        };

        match conn.stat_mode() {
            StatMode::Listing => {
                metric!(counter("stat_cache.list") += 1);
                let lines = conn.list(key)?;
                snapshot.entries = parse_listing(&lines, now)?;
                tracing::debug!(
                    endpoint = %remote.endpoint(),
                    dir = key,
                    files = snapshot.entries.len(),
                    "listed remote directory"
                );
            }
            StatMode::PerFile => match conn.head(key) {
                Ok(stat) => {
                    snapshot.entries.insert(remote.file_name().to_owned(), stat);
                }
                Err(CacheError::NotFound) => {}
                Err(err) => return Err(err),
            },
        }

        Ok(Arc::new(snapshot))
    }
}

/// Parses the rows of a `LIST` reply into the regular files they describe.
///
/// Unparseable rows are skipped, unless none of the rows can be parsed at all.
fn parse_listing(
    lines: &[String],
    now: Timestamp,
) -> Result<HashMap<String, RemoteStat>, CacheError> {
    let mut entries = HashMap::new();
    let mut rows = 0;
    let mut malformed = None;

    for line in lines {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("total ") {
            continue;
        }
        rows += 1;
        match parse_listing_line(line, now) {
            Ok(entry) if entry.is_dir => {}
            Ok(entry) => {
                let stat = RemoteStat {
                    size: entry.size,
                    mtime: entry.mtime,
                };
                entries.insert(entry.name, stat);
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping listing row");
                malformed = Some(err);
            }
        }
    }

    match malformed {
        Some(err) if entries.is_empty() && rows > 0 => Err(err.into()),
        _ => Ok(entries),
    }
}
