use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

use filetime::FileTime;
use tempfile::NamedTempFile;

use super::job::JobShared;
use super::{Connection, Connector, FetchJob, FetchOutcome, JobState, Progress, RemoteStat};
use super::{StatCache, UpdatePolicy};
use crate::caching::CacheError;
use crate::clock::from_system_time;
use crate::config::{FetchConfig, RefreshWhen};

/// Serializes jobs writing to the same local path.
///
/// The second of two concurrent jobs for one file waits for the first, and then usually finds
/// the file up to date.
#[derive(Debug, Default)]
pub(super) struct PathLocks {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

pub(super) struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
}

impl PathLocks {
    pub fn lock(&self, path: &Path) -> PathGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(path) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(path.to_owned());
        PathGuard {
            locks: self,
            path: path.to_owned(),
        }
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.path);
        self.locks.released.notify_all();
    }
}

/// Reports non-decreasing percentages, and `100` only once the job succeeded.
struct ProgressReporter {
    callback: Option<Progress>,
    last: Option<u8>,
}

impl ProgressReporter {
    fn new(callback: Option<Progress>) -> Self {
        Self {
            callback,
            last: None,
        }
    }

    fn emit(&mut self, percent: u8) {
        if self.last.is_some_and(|last| percent <= last) {
            return;
        }
        self.last = Some(percent);
        if let Some(ref callback) = self.callback {
            callback(percent);
        }
    }

    fn report(&mut self, percent: u8) {
        self.emit(percent.min(99));
    }

    fn finish(&mut self) {
        self.emit(100);
    }
}

fn percent(received: u64, size: u64) -> u8 {
    match size {
        0 => 0,
        size => (received.saturating_mul(100) / size).min(100) as u8,
    }
}

/// How many retries of each kind a job has left.
struct RetryBudget {
    max_attempts: usize,
    attempts: usize,
    reconnected: bool,
    reauthenticated: bool,
    revalidated: bool,
}

impl RetryBudget {
    fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            attempts: 1,
            reconnected: false,
            reauthenticated: false,
            revalidated: false,
        }
    }

    /// Accounts for `err` and decides whether to try again.
    fn should_retry(&mut self, err: &CacheError) -> bool {
        match err {
            // a connection that broke down since its last use gets one reconnect for free
            CacheError::ConnectionLost(_) if !self.reconnected => {
                self.reconnected = true;
                true
            }
            CacheError::PermissionDenied(_) => !std::mem::replace(&mut self.reauthenticated, true),
            CacheError::Corrupt(_) => !std::mem::replace(&mut self.revalidated, true),
            err if err.is_transient() => {
                self.attempts += 1;
                self.attempts <= self.max_attempts
            }
            _ => false,
        }
    }
}

fn local_stat(path: &Path) -> Result<Option<RemoteStat>, CacheError> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if !metadata.is_file() {
        return Ok(None);
    }
    Ok(Some(RemoteStat {
        size: metadata.len(),
        mtime: from_system_time(metadata.modified()?),
    }))
}

/// Executes fetch jobs one at a time over a connection of its own.
///
/// The connection is opened lazily and kept open between jobs. It is dropped after any error
/// other than [`CacheError::NotFound`], and reopened by the next attempt.
pub struct FetchWorker {
    connector: Arc<dyn Connector>,
    stat_cache: StatCache,
    locks: Arc<PathLocks>,
    config: FetchConfig,
    conn: Option<Box<dyn Connection>>,
}

impl std::fmt::Debug for FetchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchWorker")
            .field("endpoint", self.connector.endpoint())
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl FetchWorker {
    pub fn new(connector: Arc<dyn Connector>, stat_cache: StatCache, config: FetchConfig) -> Self {
        Self::with_locks(connector, stat_cache, Default::default(), config)
    }

    pub(super) fn with_locks(
        connector: Arc<dyn Connector>,
        stat_cache: StatCache,
        locks: Arc<PathLocks>,
        config: FetchConfig,
    ) -> Self {
        Self {
            connector,
            stat_cache,
            locks,
            config,
            conn: None,
        }
    }

    /// Runs `job` to completion on the current thread.
    pub fn run(&mut self, job: &FetchJob) -> Result<FetchOutcome, CacheError> {
        let shared = JobShared::new();
        shared.start();
        let result = self.execute(job, &shared);
        shared.finish(&result);
        result
    }

    /// Runs a job whose state is observed through `shared`.
    #[tracing::instrument(skip_all, fields(remote = %job.remote))]
    pub(super) fn execute(
        &mut self,
        job: &FetchJob,
        shared: &JobShared,
    ) -> Result<FetchOutcome, CacheError> {
        let start = Instant::now();
        let result = self.execute_inner(job, shared);

        let status = match &result {
            Ok(FetchOutcome::Skipped) => "skipped",
            Ok(FetchOutcome::UpToDate) => "uptodate",
            Ok(FetchOutcome::Downloaded { .. }) => "downloaded",
            Err(err) => err.kind(),
        };
        metric!(timer("fetch.retrieve") = start.elapsed(), "status" => status);
        match &result {
            Ok(outcome) => tracing::debug!(?outcome, "fetch job complete"),
            Err(CacheError::NotFound | CacheError::Cancelled) => {}
            Err(err) => tracing::warn!(error = %err, "fetch job failed"),
        }
        result
    }

    fn execute_inner(
        &mut self,
        job: &FetchJob,
        shared: &JobShared,
    ) -> Result<FetchOutcome, CacheError> {
        if job.remote.endpoint() != self.connector.endpoint() {
            return Err(CacheError::InvalidRequest(format!(
                "{} is not served by endpoint {}",
                job.remote,
                self.connector.endpoint()
            )));
        }

        let mut progress = ProgressReporter::new(job.progress.clone());
        progress.report(0);

        let locks = self.locks.clone();
        let _guard = locks.lock(&job.local);

        if job.policy == UpdatePolicy::NeverIfPresent && local_stat(&job.local)?.is_some() {
            progress.finish();
            return Ok(FetchOutcome::Skipped);
        }

        let mut budget = RetryBudget::new(self.config.max_attempts);
        loop {
            if shared.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let err = match self.attempt(job, shared, &mut progress) {
                Ok(outcome) => {
                    progress.finish();
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            if let CacheError::Corrupt(_) = err {
                self.stat_cache.invalidate_for(&job.remote);
            }
            if !budget.should_retry(&err) {
                return Err(err);
            }

            tracing::warn!(error = %err, attempt = budget.attempts, "retrying fetch job");
            metric!(counter("fetch.retry") += 1, "error" => err.kind());
            shared.transition(JobState::Retrying);
            if err.is_transient() {
                std::thread::sleep(self.config.retry_delay);
            }
        }
    }

    fn attempt(
        &mut self,
        job: &FetchJob,
        shared: &JobShared,
        progress: &mut ProgressReporter,
    ) -> Result<FetchOutcome, CacheError> {
        shared.transition(JobState::Connecting);
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.connector.connect()?,
        };

        let result = self.transfer(conn.as_mut(), job, shared, progress);
        if let Ok(_) | Err(CacheError::NotFound) = result {
            self.conn = Some(conn);
        }
        result
    }

    fn is_up_to_date(&self, local: &RemoteStat, remote: &RemoteStat) -> bool {
        let size_differs = local.size != remote.size;
        let remote_is_newer = local.mtime < remote.mtime;
        match self.config.refresh_when {
            RefreshWhen::Any => !(size_differs || remote_is_newer),
            RefreshWhen::All => !(size_differs && remote_is_newer),
        }
    }

    fn transfer(
        &self,
        conn: &mut dyn Connection,
        job: &FetchJob,
        shared: &JobShared,
        progress: &mut ProgressReporter,
    ) -> Result<FetchOutcome, CacheError> {
        shared.transition(JobState::Statting);
        let stat = self.stat_cache.stat(conn, &job.remote)?;

        if job.policy != UpdatePolicy::Force {
            if let Some(local) = local_stat(&job.local)? {
                if self.is_up_to_date(&local, &stat) {
                    return Ok(FetchOutcome::UpToDate);
                }
            }
        }

        shared.transition(JobState::Transferring);
        let parent = match job.local.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let mut writer = BufWriter::new(NamedTempFile::new_in(parent)?);

        let mut received = 0u64;
        let mut sink = |chunk: &[u8]| {
            if shared.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            received += chunk.len() as u64;
            if received > stat.size {
                return Err(CacheError::Corrupt(format!(
                    "received more than the announced {} bytes",
                    stat.size
                )));
            }
            writer.write_all(chunk)?;
            progress.report(percent(received, stat.size));
            Ok(())
        };
        conn.retrieve(job.remote.path(), &mut sink)?;

        if received != stat.size {
            return Err(CacheError::Corrupt(format!(
                "received {received} of {} announced bytes",
                stat.size
            )));
        }
        if shared.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        shared.transition(JobState::Installing);
        let temp = writer.into_inner().map_err(|err| err.into_error())?;
        temp.as_file().sync_all()?;
        let mtime = FileTime::from_unix_time(stat.mtime.timestamp(), 0);
        filetime::set_file_mtime(temp.path(), mtime)?;
        temp.persist(&job.local)
            .map_err(|err| CacheError::from(err.error))?;

        metric!(histogram("fetch.bytes") = received);
        tracing::debug!(local = %job.local.display(), bytes = received, "installed file");
        Ok(FetchOutcome::Downloaded { bytes: received })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_reporter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback = {
            let seen = seen.clone();
            Arc::new(move |p: u8| seen.lock().unwrap().push(p)) as Progress
        };

        let mut progress = ProgressReporter::new(Some(callback));
        progress.report(0);
        progress.report(40);
        progress.report(20);
        progress.report(100);
        progress.report(100);
        progress.finish();
        progress.finish();

        assert_eq!(*seen.lock().unwrap(), vec![0, 40, 99, 100]);
    }

    #[test]
    fn test_retry_budget() {
        let mut budget = RetryBudget::new(3);
        let lost = CacheError::ConnectionLost("reset".into());
        let transient = CacheError::Transient("421".into());

        assert!(budget.should_retry(&lost));
        assert!(budget.should_retry(&transient));
        assert!(budget.should_retry(&lost));
        assert!(!budget.should_retry(&transient));

        let mut budget = RetryBudget::new(3);
        let denied = CacheError::PermissionDenied("550".into());
        assert!(budget.should_retry(&denied));
        assert!(!budget.should_retry(&denied));

        let mut budget = RetryBudget::new(3);
        let corrupt = CacheError::Corrupt("short".into());
        assert!(budget.should_retry(&corrupt));
        assert!(!budget.should_retry(&corrupt));

        assert!(!budget.should_retry(&CacheError::NotFound));
        assert!(!budget.should_retry(&CacheError::Permanent("530".into())));
    }

    #[test]
    fn test_path_locks() {
        let locks = PathLocks::default();
        let path = Path::new("/tmp/a");
        let guard = locks.lock(path);
        assert!(locks.held.lock().unwrap().contains(path));
        drop(guard);
        assert!(locks.held.lock().unwrap().is_empty());
    }
}
