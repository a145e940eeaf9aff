use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use genefetch_sources::RemoteRef;

use crate::caching::CacheError;

/// What to do when the local file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePolicy {
    /// Keep an existing local file without asking the remote.
    NeverIfPresent,
    /// Download only if the remote copy differs from the local one.
    #[default]
    Check,
    /// Always download.
    Force,
}

/// How a successful job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The local file existed and was kept as is.
    Skipped,
    /// The local file matches the remote.
    UpToDate,
    /// The remote file was downloaded and installed.
    Downloaded { bytes: u64 },
}

/// The lifecycle of a job.
///
/// `Queued -> Connecting -> Statting -> Transferring -> Installing -> Done`, with `Retrying`
/// looping back to `Connecting`. `Failed` and `Cancelled` are terminal as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Connecting,
    Statting,
    Transferring,
    Installing,
    Retrying,
    Done(FetchOutcome),
    Failed(CacheError),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_) | Self::Cancelled)
    }
}

/// Receives the completion percentage of a job.
///
/// Percentages never decrease and `100` is reported exactly once, when the job succeeded. The
/// callback runs on the thread that executes the job, which for queued jobs is a pool thread.
pub type Progress = Arc<dyn Fn(u8) + Send + Sync>;

/// A request to mirror one remote file to a local path.
#[derive(Clone)]
pub struct FetchJob {
    pub remote: RemoteRef,
    pub local: PathBuf,
    pub policy: UpdatePolicy,
    pub progress: Option<Progress>,
}

impl FetchJob {
    pub fn new(remote: RemoteRef, local: impl Into<PathBuf>, policy: UpdatePolicy) -> Self {
        Self {
            remote,
            local: local.into(),
            policy,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }
}

impl fmt::Debug for FetchJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchJob")
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// State shared between a job's handle and the worker executing it.
#[derive(Debug)]
pub(super) struct JobShared {
    state: Mutex<JobState>,
    changed: Condvar,
    cancel: AtomicBool,
}

impl JobShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(JobState::Queued),
            changed: Condvar::new(),
            cancel: AtomicBool::new(false),
        })
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> JobState {
        self.lock().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Claims a queued job for execution. Fails if it was cancelled in the meantime.
    pub fn start(&self) -> bool {
        let mut state = self.lock();
        if *state != JobState::Queued || self.is_cancelled() {
            return false;
        }
        *state = JobState::Connecting;
        true
    }

    /// Moves to a non-terminal state. Terminal states are final.
    pub fn transition(&self, next: JobState) {
        let mut state = self.lock();
        if !state.is_terminal() {
            *state = next;
            self.changed.notify_all();
        }
    }

    pub fn finish(&self, result: &Result<FetchOutcome, CacheError>) {
        self.transition(match result {
            Ok(outcome) => JobState::Done(*outcome),
            Err(CacheError::Cancelled) => JobState::Cancelled,
            Err(err) => JobState::Failed(err.clone()),
        });
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        let mut state = self.lock();
        if *state == JobState::Queued {
            *state = JobState::Cancelled;
            self.changed.notify_all();
        }
    }

    fn result(state: &JobState) -> Option<Result<FetchOutcome, CacheError>> {
        match state {
            JobState::Done(outcome) => Some(Ok(*outcome)),
            JobState::Failed(err) => Some(Err(err.clone())),
            JobState::Cancelled => Some(Err(CacheError::Cancelled)),
            _ => None,
        }
    }

    pub fn wait(&self) -> Result<FetchOutcome, CacheError> {
        let mut state = self.lock();
        loop {
            if let Some(result) = Self::result(&state) {
                return result;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<FetchOutcome, CacheError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(result) = Self::result(&state) {
                return Some(result);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// A handle to a queued job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    remote: RemoteRef,
    shared: Arc<JobShared>,
}

impl JobHandle {
    pub(super) fn new(remote: RemoteRef, shared: Arc<JobShared>) -> Self {
        Self { remote, shared }
    }

    pub fn remote(&self) -> &RemoteRef {
        &self.remote
    }

    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    /// Requests cancellation.
    ///
    /// A job that has not started yet is cancelled right away. A running job stops at its next
    /// chunk or attempt, and an already completed job is not affected.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Blocks until the job is complete.
    pub fn wait(&self) -> Result<FetchOutcome, CacheError> {
        self.shared.wait()
    }

    /// Blocks until the job is complete or `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<FetchOutcome, CacheError>> {
        self.shared.wait_timeout(timeout)
    }
}
