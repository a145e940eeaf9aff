use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tempfile::NamedTempFile;

use super::entry::{self, CacheEntry, ENTRY_FORMAT};
use super::{CacheError, CacheKey, blob_path};
use crate::clock::Timestamp;
use crate::config::StoreConfig;

const SCHEMA_VERSION: &str = "1";
const BLOB_VERSION: u32 = 1;

const SELECT_ENTRY: &str =
    "SELECT format, kind, payload, blob, mtime, expires, release FROM entries WHERE key = ?1";

/// A persistent key-value store for memoized results.
///
/// Every store is a single SQLite database in WAL mode with one writer connection and a small
/// pool of reader connections. Writes are serialized through the writer and committed in
/// immediate transactions, so a `put` is durable once it returns and concurrent writers to the
/// same key resolve as last-writer-wins.
///
/// Payloads larger than [`StoreConfig::inline_threshold`] live in content-addressed files in
/// the `blobs` directory next to the database. Blob files are written and synced before the
/// row referencing them is committed, and removed once no row references them anymore. Both
/// happen inside the immediate transaction, which also serializes them against other
/// processes sharing the store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db_path: PathBuf,
    blob_dir: PathBuf,
    config: StoreConfig,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("db_path", &self.inner.db_path)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_connection(path: &Path, config: &StoreConfig) -> Result<Connection, CacheError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(config.busy_timeout)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(conn)
}

fn init_schema(conn: &mut Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS entries (
            key TEXT PRIMARY KEY NOT NULL,
            format INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload BLOB,
            blob TEXT,
            mtime INTEGER NOT NULL,
            expires INTEGER,
            release TEXT
        );
        CREATE INDEX IF NOT EXISTS entries_blob ON entries(blob) WHERE blob IS NOT NULL;
        "#,
    )?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT OR IGNORE INTO meta(name, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION],
    )?;
    let version: String = tx.query_row(
        "SELECT value FROM meta WHERE name = 'schema_version'",
        [],
        |row| row.get(0),
    )?;
    tx.commit()?;

    if version != SCHEMA_VERSION {
        tracing::error!(%version, "unsupported store schema version");
        return Err(CacheError::InternalError);
    }
    Ok(())
}

fn to_timestamp(secs: i64) -> Result<Timestamp, CacheError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| CacheError::Corrupt(format!("invalid timestamp {secs}")))
}

struct RawEntry {
    format: u32,
    kind: String,
    payload: Option<Vec<u8>>,
    blob: Option<String>,
    mtime: i64,
    expires: Option<i64>,
    release: Option<String>,
}

impl Store {
    /// Opens the store in `dir`, creating the database if needed.
    pub fn open(dir: &Path, config: StoreConfig) -> Result<Self, CacheError> {
        let db_path = dir.join("cache.sqlite3");
        let blob_dir = dir.join("blobs");
        fs::create_dir_all(&blob_dir)?;

        let mut writer = open_connection(&db_path, &config)?;
        init_schema(&mut writer)?;
        tracing::debug!(path = %db_path.display(), "opened store");

        Ok(Self {
            inner: Arc::new(StoreInner {
                db_path,
                blob_dir,
                config,
                writer: Mutex::new(writer),
                readers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The path of the database file.
    pub fn path(&self) -> &Path {
        &self.inner.db_path
    }

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let pooled = lock(&self.inner.readers).pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => open_connection(&self.inner.db_path, &self.inner.config)?,
        };
        let result = f(&conn);

        let mut readers = lock(&self.inner.readers);
        if readers.len() < self.inner.config.readers {
            readers.push(conn);
        }
        result
    }

    /// Reads the entry for `key`.
    ///
    /// Fails with [`CacheError::NotFound`] if there is none, and with
    /// [`CacheError::Corrupt`] if it cannot be decoded.
    pub fn get(&self, key: &CacheKey) -> Result<CacheEntry, CacheError> {
        let raw = self.with_reader(|conn| {
            let raw = conn
                .query_row(SELECT_ENTRY, [key.as_str()], |row| {
                    Ok(RawEntry {
                        format: row.get(0)?,
                        kind: row.get(1)?,
                        payload: row.get(2)?,
                        blob: row.get(3)?,
                        mtime: row.get(4)?,
                        expires: row.get(5)?,
                        release: row.get(6)?,
                    })
                })
                .optional()?;
            Ok(raw)
        })?;
        let raw = raw.ok_or(CacheError::NotFound)?;

        let data = match raw.blob {
            Some(blob) => Some(self.read_blob(&blob)?),
            None => raw.payload,
        };
        let payload = entry::decode(raw.format, &raw.kind, data)?;

        Ok(CacheEntry {
            payload,
            mtime: to_timestamp(raw.mtime)?,
            expires: raw.expires.map(to_timestamp).transpose()?,
            release: raw.release,
        })
    }

    /// Writes the entry for `key`, replacing any previous one.
    ///
    /// Timestamps are stored with second resolution. An entry that expires before it was
    /// written is rejected.
    pub fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<(), CacheError> {
        if entry.expires.is_some_and(|expires| expires < entry.mtime) {
            return Err(CacheError::InvalidRequest(format!(
                "entry for {key} expires before it was written"
            )));
        }
        let (kind, data) = entry::encode(&entry.payload)?;

        let mut writer = lock(&self.inner.writer);
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (inline, blob) = match data {
            Some(data) if data.len() > self.inner.config.inline_threshold => {
                (None, Some(self.write_blob(&data)?))
            }
            data => (data, None),
        };
        let previous_blob = previous_blob(&tx, key)?;
        tx.execute(
            "INSERT INTO entries (key, format, kind, payload, blob, mtime, expires, release)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(key) DO UPDATE SET
                format = excluded.format,
                kind = excluded.kind,
                payload = excluded.payload,
                blob = excluded.blob,
                mtime = excluded.mtime,
                expires = excluded.expires,
                release = excluded.release",
            params![
                key.as_str(),
                ENTRY_FORMAT,
                kind,
                inline.as_deref(),
                blob.as_deref(),
                entry.mtime.timestamp(),
                entry.expires.map(|e| e.timestamp()),
                entry.release.as_deref(),
            ],
        )?;
        if let Some(previous) = previous_blob {
            if blob.as_ref() != Some(&previous) {
                self.release_blob(&tx, &previous)?;
            }
        }
        tx.commit()?;

        crate::metric!(counter("store.put") += 1, "kind" => kind);
        Ok(())
    }

    /// Removes the entry for `key`. Returns whether there was one.
    pub fn delete(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let mut writer = lock(&self.inner.writer);
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let previous_blob = previous_blob(&tx, key)?;
        let deleted = tx.execute("DELETE FROM entries WHERE key = ?1", [key.as_str()])?;
        if let Some(previous) = previous_blob {
            self.release_blob(&tx, &previous)?;
        }
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// All keys, in ascending order.
    pub fn keys(&self) -> Result<Vec<CacheKey>, CacheError> {
        self.keys_with_prefix("")
    }

    /// All keys starting with `prefix`, in ascending order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<CacheKey>, CacheError> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM entries WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map([prefix], |row| row.get::<_, String>(0))?
                .map(|key| key.map(CacheKey::from_raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }

    /// The number of entries.
    pub fn len(&self) -> Result<usize, CacheError> {
        self.with_reader(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Removes all entries that are stale at `now`, and all blob files no entry refers to.
    ///
    /// Returns the number of removed entries.
    pub fn purge_stale(&self, now: Timestamp) -> Result<usize, CacheError> {
        let mut writer = lock(&self.inner.writer);
        let tx = writer.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let purged = tx.execute(
            "DELETE FROM entries
             WHERE expires IS NOT NULL AND (expires <= ?1 OR expires <= mtime)",
            [now.timestamp()],
        )?;
        let removed_blobs = self.sweep_blobs(&tx)?;
        tx.commit()?;

        tracing::info!(purged, removed_blobs, path = %self.path().display(), "purged store");
        Ok(purged)
    }

    /// Makes sure the blob file for `data` exists.
    ///
    /// Must be called inside an immediate transaction. Blob files are only ever removed
    /// inside one, so an existing file stays in place until the caller commits.
    fn write_blob(&self, data: &[u8]) -> Result<String, CacheError> {
        let relative = blob_path(data, BLOB_VERSION);
        let path = self.inner.blob_dir.join(&relative);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() == data.len() as u64 => return Ok(relative),
            Ok(_) => tracing::warn!(blob = %relative, "rewriting truncated blob"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let parent = path.parent().unwrap_or(&self.inner.blob_dir);
        fs::create_dir_all(parent)?;
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|err| CacheError::from(err.error))?;
        Ok(relative)
    }

    fn read_blob(&self, relative: &str) -> Result<Vec<u8>, CacheError> {
        match fs::read(self.inner.blob_dir.join(relative)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(CacheError::Corrupt(format!("missing blob {relative}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Deletes a blob file unless some entry still refers to it.
    ///
    /// Must be called inside an immediate transaction.
    fn release_blob(&self, writer: &Connection, relative: &str) -> Result<(), CacheError> {
        let references: i64 = writer.query_row(
            "SELECT COUNT(*) FROM entries WHERE blob = ?1",
            [relative],
            |row| row.get(0),
        )?;
        if references == 0 {
            catch_not_found(fs::remove_file(self.inner.blob_dir.join(relative)))?;
        }
        Ok(())
    }

    /// Deletes all files in the blob directory that no entry refers to.
    ///
    /// Must be called inside an immediate transaction.
    fn sweep_blobs(&self, writer: &Connection) -> Result<usize, CacheError> {
        let mut stmt = writer.prepare("SELECT DISTINCT blob FROM entries WHERE blob IS NOT NULL")?;
        let referenced = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;

        let mut removed = 0;
        let mut dirs = vec![self.inner.blob_dir.clone()];
        while let Some(dir) = dirs.pop() {
            for dir_entry in fs::read_dir(&dir)? {
                let path = dir_entry?.path();
                if path.is_dir() {
                    dirs.push(path);
                    continue;
                }
                let relative = path
                    .strip_prefix(&self.inner.blob_dir)
                    .ok()
                    .and_then(|p| p.to_str())
                    .map(|p| p.replace(std::path::MAIN_SEPARATOR, "/"));
                if relative.is_some_and(|r| referenced.contains(&r)) {
                    continue;
                }
                catch_not_found(fs::remove_file(&path))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn previous_blob(
    tx: &rusqlite::Transaction<'_>,
    key: &CacheKey,
) -> Result<Option<String>, CacheError> {
    let blob = tx
        .query_row(
            "SELECT blob FROM entries WHERE key = ?1",
            [key.as_str()],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()?;
    Ok(blob.flatten())
}

/// Maps a `NotFound` I/O error to `Ok(())`.
fn catch_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::Payload;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    fn open(dir: &Path) -> Store {
        let config = StoreConfig {
            inline_threshold: 16,
            ..Default::default()
        };
        Store::open(dir, config).unwrap()
    }

    fn blob_files(dir: &Path) -> usize {
        let mut count = 0;
        let mut dirs = vec![dir.join("blobs")];
        while let Some(dir) = dirs.pop() {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    dirs.push(path);
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn test_put_get_delete() {
        let dir = genefetch_test::tempdir();
        let store = open(dir.path());
        let key = CacheKey::new("info", &("hsa",)).unwrap();

        assert_eq!(store.get(&key), Err(CacheError::NotFound));

        let entry = CacheEntry::new(
            Payload::Value(serde_json::json!(["a", "b"])),
            ts("2024-01-01T00:00:00Z"),
        )
        .with_expires(Some(ts("2024-01-02T00:00:00Z")))
        .with_release(Some("110.0".into()));
        store.put(&key, &entry).unwrap();
        assert_eq!(store.get(&key).unwrap(), entry);
        assert_eq!(store.len().unwrap(), 1);

        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
        assert_eq!(store.get(&key), Err(CacheError::NotFound));
    }

    #[test]
    fn test_reject_expiry_before_mtime() {
        let dir = genefetch_test::tempdir();
        let store = open(dir.path());
        let key = CacheKey::new("info", &()).unwrap();
        let entry = CacheEntry::new(Payload::Missing, ts("2024-01-02T00:00:00Z"))
            .with_expires(Some(ts("2024-01-01T00:00:00Z")));
        assert!(matches!(
            store.put(&key, &entry),
            Err(CacheError::InvalidRequest(_))
        ));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_keys_with_prefix() {
        let dir = genefetch_test::tempdir();
        let store = open(dir.path());
        let now = ts("2024-01-01T00:00:00Z");
        for key in ["b(1)", "a(2)", "a(1)", "ab(1)", "a_(1)", "a%(1)"] {
            let key = CacheKey::from_raw(key);
            store.put(&key, &CacheEntry::new(Payload::Missing, now)).unwrap();
        }

        let keys: Vec<_> = store.keys().unwrap().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["a%(1)", "a(1)", "a(2)", "a_(1)", "ab(1)", "b(1)"]);

        // `_` and `%` are not wildcards
        let keys: Vec<_> = store
            .keys_with_prefix("a(")
            .unwrap()
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(keys, ["a(1)", "a(2)"]);
        assert!(store.keys_with_prefix("c").unwrap().is_empty());
    }

    #[test]
    fn test_blobs() {
        let dir = genefetch_test::tempdir();
        let store = open(dir.path());
        let now = ts("2024-01-01T00:00:00Z");
        let large = Payload::Bytes(vec![7; 1000]);
        let small = Payload::Bytes(b"tiny".to_vec());

        let a = CacheKey::new("a", &()).unwrap();
        let b = CacheKey::new("b", &()).unwrap();
        store.put(&a, &CacheEntry::new(large.clone(), now)).unwrap();
        store.put(&b, &CacheEntry::new(large.clone(), now)).unwrap();
        // identical contents share one file
        assert_eq!(blob_files(dir.path()), 1);
        assert_eq!(store.get(&a).unwrap().payload, large);

        // still referenced by `b`
        store.put(&a, &CacheEntry::new(small.clone(), now)).unwrap();
        assert_eq!(blob_files(dir.path()), 1);
        assert_eq!(store.get(&a).unwrap().payload, small);

        store.delete(&b).unwrap();
        assert_eq!(blob_files(dir.path()), 0);
    }

    #[test]
    fn test_missing_blob_is_corrupt() {
        let dir = genefetch_test::tempdir();
        let store = open(dir.path());
        let key = CacheKey::new("a", &()).unwrap();
        let entry = CacheEntry::new(Payload::Bytes(vec![1; 100]), ts("2024-01-01T00:00:00Z"));
        store.put(&key, &entry).unwrap();

        fs::remove_dir_all(dir.path().join("blobs")).unwrap();
        assert!(matches!(store.get(&key), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_purge_stale() {
        let dir = genefetch_test::tempdir();
        let store = open(dir.path());
        let mtime = ts("2024-01-01T00:00:00Z");

        let fresh = CacheKey::new("fresh", &()).unwrap();
        let stale = CacheKey::new("stale", &()).unwrap();
        let forever = CacheKey::new("forever", &()).unwrap();
        store
            .put(
                &fresh,
                &CacheEntry::new(Payload::Missing, mtime)
                    .with_expires(Some(ts("2024-02-01T00:00:00Z"))),
            )
            .unwrap();
        store
            .put(
                &stale,
                &CacheEntry::new(Payload::Bytes(vec![0; 100]), mtime)
                    .with_expires(Some(ts("2024-01-02T00:00:00Z"))),
            )
            .unwrap();
        store
            .put(&forever, &CacheEntry::new(Payload::Missing, mtime))
            .unwrap();
        fs::write(dir.path().join("blobs/orphan"), b"left behind").unwrap();

        let purged = store.purge_stale(ts("2024-01-15T00:00:00Z")).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.get(&stale), Err(CacheError::NotFound));
        assert!(store.get(&fresh).is_ok());
        assert!(store.get(&forever).is_ok());
        assert_eq!(blob_files(dir.path()), 0);
    }

    #[test]
    fn test_missing_blob_is_rewritten() {
        let dir = genefetch_test::tempdir();
        let store = open(dir.path());
        let now = ts("2024-01-01T00:00:00Z");
        let large = Payload::Bytes(vec![3; 500]);
        let a = CacheKey::new("a", &()).unwrap();
        let b = CacheKey::new("b", &()).unwrap();

        store.put(&a, &CacheEntry::new(large.clone(), now)).unwrap();
        fs::remove_dir_all(dir.path().join("blobs")).unwrap();
        store.put(&b, &CacheEntry::new(large.clone(), now)).unwrap();

        assert_eq!(store.get(&a).unwrap().payload, large);
        assert_eq!(store.get(&b).unwrap().payload, large);
    }

    #[test]
    fn test_shared_blobs_across_stores() {
        let dir = genefetch_test::tempdir();
        let now = ts("2024-01-01T00:00:00Z");
        let large = Payload::Bytes(vec![9; 2000]);

        // two independent handles behave like two processes sharing the directory
        let first = open(dir.path());
        let second = open(dir.path());

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let key = CacheKey::new("churn", &()).unwrap();
                for _ in 0..200 {
                    first.put(&key, &CacheEntry::new(large.clone(), now)).unwrap();
                    first.delete(&key).unwrap();
                    first.purge_stale(now).unwrap();
                }
            });
            scope.spawn(|| {
                for i in 0..200 {
                    let key = CacheKey::new("keep", &(i,)).unwrap();
                    second.put(&key, &CacheEntry::new(large.clone(), now)).unwrap();
                    assert_eq!(second.get(&key).unwrap().payload, large);
                    second.delete(&key).unwrap();
                }
            });
        });

        let key = CacheKey::new("last", &()).unwrap();
        second.put(&key, &CacheEntry::new(large.clone(), now)).unwrap();
        assert_eq!(first.get(&key).unwrap().payload, large);
    }

    #[test]
    fn test_reopen_is_durable() {
        let dir = genefetch_test::tempdir();
        let key = CacheKey::new("a", &(1,)).unwrap();
        let entry = CacheEntry::new(Payload::Bytes(b"x".to_vec()), ts("2024-01-01T00:00:00Z"));
        {
            let store = open(dir.path());
            store.put(&key, &entry).unwrap();
        }
        let store = open(dir.path());
        assert_eq!(store.get(&key).unwrap(), entry);
    }
}
