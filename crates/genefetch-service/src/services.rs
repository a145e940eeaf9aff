//! Provides the shared genefetch services and a way to initialize them.
//!
//! [`Services`] builds everything a process needs from a [`Config`]: one [`FetchPool`] per
//! configured endpoint, a [`StatCache`] shared between them, the [`UpdateLog`], and a
//! [`DatabaseCache`] for every database that is opened.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use genefetch_sources::{EndpointId, RemoteRef};

use crate::caching::{CacheError, CacheKey, Memoizer, ReleaseTag, Store, UpdateLog};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::download::{
    DownloadTimeouts, FetchJob, FetchOutcome, FetchPool, JobState, MassReport, MassRetrieval,
    StatCache, UpdatePolicy,
};

const STORE_FILE: &str = "cache.sqlite3";

/// The caches of one gene database.
#[derive(Clone, Debug)]
pub struct DatabaseCache {
    name: String,
    files_dir: PathBuf,
    memoizer: Memoizer,
}

impl DatabaseCache {
    fn open(
        config: &Config,
        name: &str,
        clock: Arc<dyn Clock>,
        release: ReleaseTag,
    ) -> Result<Self, CacheError> {
        let dir = config.database_dir(name);
        let store = Store::open(&dir, config.store.clone())?;
        let files_dir = dir.join("files");
        fs::create_dir_all(&files_dir)?;
        Ok(Self {
            name: name.to_owned(),
            files_dir,
            memoizer: Memoizer::new(store, clock, release),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Store {
        self.memoizer.store()
    }

    pub fn memoizer(&self) -> &Memoizer {
        &self.memoizer
    }

    /// The directory retrieved artifacts are installed into.
    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    /// Where `remote` is kept locally, `files/<endpoint>/<path>`.
    pub fn local_path(&self, remote: &RemoteRef) -> PathBuf {
        self.files_dir.join(remote.relative_path())
    }
}

pub struct Services {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub release: ReleaseTag,
    pub stat_cache: StatCache,
    pub updates: UpdateLog,
    pools: BTreeMap<EndpointId, FetchPool>,
    databases: Mutex<BTreeMap<String, DatabaseCache>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("cache_dir", &self.config.cache_dir)
            .field("release", &self.release.get())
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

impl Services {
    pub fn from_config(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`from_config`](Self::from_config), with freshness decided by `clock`.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        fs::create_dir_all(&config.cache_dir).with_context(|| {
            format!("failed to create cache dir {}", config.cache_dir.display())
        })?;
        let updates = UpdateLog::open(config.cache_dir.join("updates"))
            .context("failed to open update log")?;

        let stat_cache = StatCache::new(clock.clone());
        let timeouts = DownloadTimeouts::from_config(&config.fetch);
        let connectors = crate::download::connectors(&config.endpoints, timeouts)
            .context("failed to configure endpoints")?;

        let mut pools = BTreeMap::new();
        for connector in connectors {
            let endpoint = connector.endpoint().clone();
            let pool = FetchPool::new(connector, stat_cache.clone(), &config.fetch)
                .with_context(|| format!("failed to start fetch pool for {endpoint}"))?;
            pools.insert(endpoint, pool);
        }

        let release = ReleaseTag::new(config.release.clone());
        Ok(Self {
            config,
            clock,
            release,
            stat_cache,
            updates,
            pools,
            databases: Mutex::default(),
        })
    }

    /// The fetch pool of `endpoint`.
    pub fn pool(&self, endpoint: &EndpointId) -> Result<&FetchPool, CacheError> {
        self.pools.get(endpoint).ok_or_else(|| {
            CacheError::InvalidRequest(format!("no endpoint `{endpoint}` is configured"))
        })
    }

    pub fn pools(&self) -> impl Iterator<Item = &FetchPool> {
        self.pools.values()
    }

    /// Opens the caches of `name`, creating them on first use.
    pub fn database(&self, name: &str) -> Result<DatabaseCache, CacheError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(CacheError::InvalidRequest(format!(
                "invalid database name `{name}`"
            )));
        }
        let mut databases = self.databases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(database) = databases.get(name) {
            return Ok(database.clone());
        }
        let database =
            DatabaseCache::open(&self.config, name, self.clock.clone(), self.release.clone())?;
        databases.insert(name.to_owned(), database.clone());
        Ok(database)
    }

    /// The names of all databases with a store under the cache dir.
    pub fn databases_on_disk(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.config.cache_dir)? {
            let entry = entry?;
            if !entry.path().join(STORE_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Retrieves `remote` into `database` on the calling thread, and returns its local path.
    pub fn retrieve(
        &self,
        database: &DatabaseCache,
        remote: &RemoteRef,
        policy: UpdatePolicy,
    ) -> Result<PathBuf, CacheError> {
        let pool = self.pool(remote.endpoint())?;
        let local = database.local_path(remote);
        let outcome = pool.retrieve(FetchJob::new(remote.clone(), local.clone(), policy))?;
        self.record_download(remote, outcome);
        Ok(local)
    }

    /// Retrieves all `remotes` into `database` across the pools of their endpoints.
    ///
    /// Nothing is queued if any of them refers to an unknown endpoint.
    pub fn retrieve_all(
        &self,
        database: &DatabaseCache,
        remotes: &[RemoteRef],
        policy: UpdatePolicy,
        progress: impl FnMut(u8),
    ) -> Result<MassReport, CacheError> {
        let mut by_endpoint: BTreeMap<&EndpointId, Vec<FetchJob>> = BTreeMap::new();
        for remote in remotes {
            self.pool(remote.endpoint())?;
            let job = FetchJob::new(remote.clone(), database.local_path(remote), policy);
            by_endpoint.entry(remote.endpoint()).or_default().push(job);
        }

        let mut retrievals = Vec::with_capacity(by_endpoint.len());
        for (endpoint, jobs) in by_endpoint {
            retrievals.push(self.pool(endpoint)?.mass_retrieve(jobs)?);
        }
        let retrieval: MassRetrieval = retrievals.into_iter().collect();
        let report = retrieval.wait(progress);

        for handle in retrieval.handles() {
            if let JobState::Done(outcome) = handle.state() {
                self.record_download(handle.remote(), outcome);
            }
        }
        Ok(report)
    }

    fn record_download(&self, remote: &RemoteRef, outcome: FetchOutcome) {
        if !matches!(outcome, FetchOutcome::Downloaded { .. }) {
            return;
        }
        let result = CacheKey::new("retrieve", &remote.to_string())
            .and_then(|key| self.updates.record(&key, self.clock.now()));
        if let Err(err) = result {
            tracing::warn!(
                %remote,
                error = &err as &dyn std::error::Error,
                "failed to record download"
            );
        }
    }

    /// Purges expired entries from every database on disk.
    pub fn cleanup(&self) -> Result<usize, CacheError> {
        let now = self.clock.now();
        let mut purged = 0;
        for name in self.databases_on_disk()? {
            let database = self.database(&name)?;
            let count = database.store().purge_stale(now)?;
            tracing::info!(database = %name, count, "purged stale entries");
            purged += count;
        }
        Ok(purged)
    }
}
