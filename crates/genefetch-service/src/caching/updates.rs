use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tempfile::NamedTempFile;

use super::{CacheError, CacheKey};
use crate::clock::Timestamp;

type Entries = BTreeMap<String, Timestamp>;

/// Remembers when each update function last ran successfully.
///
/// The log is a JSON object mapping the key of an update call to the instant of its latest
/// successful run. It is rewritten atomically on every change, and re-read before that, so
/// that concurrent updaters do not drop each other's records.
#[derive(Debug)]
pub struct UpdateLog {
    path: PathBuf,
    entries: Mutex<Entries>,
}

fn read_entries(path: &Path) -> Result<Entries, CacheError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Entries::new()),
        Err(err) => return Err(err.into()),
    };
    match serde_json::from_slice(&contents) {
        Ok(entries) => Ok(entries),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "discarding unreadable update log"
            );
            Ok(Entries::new())
        }
    }
}

impl UpdateLog {
    /// Opens the log at `path`. A missing file is an empty log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = read_entries(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a successful run of `key` at `at`.
    pub fn record(&self, key: &CacheKey, at: Timestamp) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut on_disk = read_entries(&self.path)?;
        on_disk.insert(key.to_string(), at);
        self.write(&on_disk)?;
        *entries = on_disk;
        Ok(())
    }

    /// The instant of the latest successful run of `key`.
    pub fn last_update(&self, key: &CacheKey) -> Option<Timestamp> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key.as_str()).copied()
    }

    /// All recorded runs, ordered by key.
    pub fn entries(&self) -> Vec<(String, Timestamp)> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Whether `key` should run again for remote data modified at `remote_time`.
    pub fn is_updatable(&self, key: &CacheKey, remote_time: Timestamp) -> bool {
        self.last_update(key)
            .is_none_or(|last_update| remote_time > last_update)
    }

    fn write(&self, entries: &Entries) -> Result<(), CacheError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        let mut writer = BufWriter::new(temp);
        serde_json::to_writer_pretty(&mut writer, entries)?;
        writer.flush()?;
        let temp = writer.into_inner().map_err(|err| err.into_error())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|err| CacheError::from(err.error))?;
        Ok(())
    }
}
