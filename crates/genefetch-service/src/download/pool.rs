use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use genefetch_sources::{EndpointId, RemoteRef};

use super::job::JobShared;
use super::worker::PathLocks;
use super::{Connector, FetchJob, FetchOutcome, FetchWorker, JobHandle, JobState, StatCache};
use crate::caching::CacheError;
use crate::config::FetchConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

type Queued = (FetchJob, Arc<JobShared>);

struct PoolInner {
    connector: Arc<dyn Connector>,
    stat_cache: StatCache,
    locks: Arc<PathLocks>,
    config: FetchConfig,
    foreground: Mutex<FetchWorker>,
    pending: Mutex<usize>,
    drained: Condvar,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn new_worker(&self) -> FetchWorker {
        FetchWorker::with_locks(
            self.connector.clone(),
            self.stat_cache.clone(),
            self.locks.clone(),
            self.config.clone(),
        )
    }

    fn pending(&self) -> MutexGuard<'_, usize> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job_done(&self) {
        let mut pending = self.pending();
        *pending = pending.saturating_sub(1);
        self.drained.notify_all();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn work(inner: Arc<PoolInner>, receiver: Receiver<Queued>) {
    let mut worker = inner.new_worker();
    for (job, shared) in receiver.iter() {
        if inner.shutdown.load(Ordering::Relaxed) {
            shared.cancel();
        }
        if shared.start() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| worker.execute(&job, &shared)));
            let result = match result {
                Ok(result) => result,
                Err(panic) => {
                    tracing::error!(
                        remote = %job.remote,
                        panic = panic_message(panic.as_ref()),
                        "fetch worker panicked"
                    );
                    // the worker's connection is in an unknown state
                    worker = inner.new_worker();
                    Err(CacheError::InternalError)
                }
            };
            shared.finish(&result);
        }
        inner.job_done();
    }
}

/// A fixed set of fetch workers for one endpoint.
///
/// Jobs are queued FIFO and picked up by whichever worker is idle. Blocking calls use a
/// separate foreground worker on the calling thread. Errors and panics of a job turn that job
/// into [`JobState::Failed`] and never escape a worker.
pub struct FetchPool {
    inner: Arc<PoolInner>,
    sender: Option<Sender<Queued>>,
    threads: Vec<JoinHandle<()>>,
}

impl fmt::Debug for FetchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchPool")
            .field("endpoint", self.endpoint())
            .field("workers", &self.threads.len())
            .field("pending", &self.pending())
            .finish()
    }
}

impl FetchPool {
    /// Starts `config.workers` threads fetching from `connector`'s endpoint.
    pub fn new(
        connector: Arc<dyn Connector>,
        stat_cache: StatCache,
        config: &FetchConfig,
    ) -> Result<Self, CacheError> {
        let locks = Arc::<PathLocks>::default();
        let foreground = FetchWorker::with_locks(
            connector.clone(),
            stat_cache.clone(),
            locks.clone(),
            config.clone(),
        );
        let inner = Arc::new(PoolInner {
            connector,
            stat_cache,
            locks,
            config: config.clone(),
            foreground: Mutex::new(foreground),
            pending: Mutex::new(0),
            drained: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut threads = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let inner = inner.clone();
            let receiver = receiver.clone();
            let thread = thread::Builder::new()
                .name(format!("genefetch-{}-{index}", inner.connector.endpoint()))
                .spawn(move || work(inner, receiver))?;
            threads.push(thread);
        }

        Ok(Self {
            inner,
            sender: Some(sender),
            threads,
        })
    }

    pub fn endpoint(&self) -> &EndpointId {
        self.inner.connector.endpoint()
    }

    pub fn stat_cache(&self) -> &StatCache {
        &self.inner.stat_cache
    }

    /// The number of queued or running jobs.
    pub fn pending(&self) -> usize {
        *self.inner.pending()
    }

    fn validate(&self, job: &FetchJob) -> Result<(), CacheError> {
        match job.remote.endpoint() == self.endpoint() {
            true => Ok(()),
            false => Err(CacheError::InvalidRequest(format!(
                "{} cannot be fetched from endpoint {}",
                job.remote,
                self.endpoint()
            ))),
        }
    }

    /// Runs `job` on the calling thread and blocks until it is complete.
    pub fn retrieve(&self, job: FetchJob) -> Result<FetchOutcome, CacheError> {
        self.validate(&job)?;
        let mut worker = self
            .inner
            .foreground
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        worker.run(&job)
    }

    /// Queues `job` and returns a handle to observe it.
    pub fn enqueue(&self, job: FetchJob) -> Result<JobHandle, CacheError> {
        self.validate(&job)?;
        Ok(self.push(job))
    }

    fn push(&self, job: FetchJob) -> JobHandle {
        let shared = JobShared::new();
        let handle = JobHandle::new(job.remote.clone(), shared.clone());

        *self.inner.pending() += 1;
        let sent = match self.sender {
            Some(ref sender) => sender.send((job, shared.clone())).is_ok(),
            None => false,
        };
        if !sent {
            shared.cancel();
            self.inner.job_done();
        }
        handle
    }

    /// Queues all `jobs`.
    ///
    /// Either all jobs are queued or, if any of them is invalid, none is.
    pub fn mass_retrieve(&self, jobs: Vec<FetchJob>) -> Result<MassRetrieval, CacheError> {
        for job in &jobs {
            self.validate(job)?;
        }
        let handles = jobs.into_iter().map(|job| self.push(job)).collect();
        Ok(MassRetrieval { handles })
    }

    /// Blocks until the queue is drained.
    ///
    /// `progress` receives `100 × (initial − remaining) / initial`, where `initial` is the
    /// number of pending jobs when the call started.
    pub fn wait(&self, mut progress: impl FnMut(u8)) {
        let mut pending = self.inner.pending();
        let initial = *pending;
        let mut last = None;
        while *pending > 0 {
            let percent = (100 * (initial - (*pending).min(initial)) / initial.max(1)) as u8;
            if last.is_none_or(|last| percent > last) {
                last = Some(percent);
                progress(percent);
            }
            pending = self
                .inner
                .drained
                .wait_timeout(pending, POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(pending);
        progress(100);
    }
}

impl Drop for FetchPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.sender.take();
        for thread in self.threads.drain(..) {
            thread.join().ok();
        }
    }
}

/// The summary of a finished [`MassRetrieval`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MassReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<(RemoteRef, CacheError)>,
    pub cancelled: usize,
}

impl MassReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for MassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} jobs completed with {} failures",
            self.total,
            self.failed.len()
        )?;
        if self.cancelled > 0 {
            write!(f, " ({} cancelled)", self.cancelled)?;
        }
        Ok(())
    }
}

/// A group of jobs queued together.
#[derive(Debug)]
pub struct MassRetrieval {
    handles: Vec<JobHandle>,
}

impl MassRetrieval {
    pub fn handles(&self) -> &[JobHandle] {
        &self.handles
    }

    /// Cancels all jobs. Jobs that have not started yet are dropped right away.
    pub fn cancel(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }

    fn remaining(&self) -> usize {
        self.handles
            .iter()
            .filter(|handle| !handle.state().is_terminal())
            .count()
    }

    /// Blocks until every job is complete.
    ///
    /// `progress` receives the share of completed jobs, and `100` once when all are done. A
    /// failing job does not stop the others.
    pub fn wait(&self, mut progress: impl FnMut(u8)) -> MassReport {
        let total = self.handles.len();
        let mut last = None;
        loop {
            let remaining = self.remaining();
            if remaining == 0 {
                break;
            }
            let percent = ((100 * (total - remaining) / total) as u8).min(99);
            if last.is_none_or(|last| percent > last) {
                last = Some(percent);
                progress(percent);
            }
            if let Some(handle) = self.handles.iter().find(|h| !h.state().is_terminal()) {
                handle.wait_timeout(POLL_INTERVAL);
            }
        }
        progress(100);

        let mut report = MassReport {
            total,
            ..Default::default()
        };
        for handle in &self.handles {
            match handle.state() {
                JobState::Done(_) => report.succeeded += 1,
                JobState::Cancelled => report.cancelled += 1,
                JobState::Failed(err) => report.failed.push((handle.remote().clone(), err)),
                _ => {}
            }
        }
        if !report.is_success() {
            tracing::warn!(%report, "mass retrieval had failures");
        }
        report
    }
}

/// Merges retrievals queued on different pools into one.
impl FromIterator<MassRetrieval> for MassRetrieval {
    fn from_iter<I: IntoIterator<Item = MassRetrieval>>(iter: I) -> Self {
        let handles = iter.into_iter().flat_map(|r| r.handles).collect();
        Self { handles }
    }
}
