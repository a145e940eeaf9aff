//! Fetching of remote artifacts from FTP and HTTP endpoints.
//!
//! The remote side is abstracted as a [`Connector`] that opens [`Connection`]s to one
//! endpoint. Everything above only depends on that capability:
//!
//! - the [`StatCache`] answers size and modification time queries from one listing per
//!   remote directory,
//! - a [`FetchWorker`] runs one [`FetchJob`] at a time over its own connection, with retries,
//!   freshness checks and atomic installation of the downloaded file,
//! - a [`FetchPool`] runs a fixed number of workers over a FIFO queue, plus a foreground
//!   worker for blocking calls.
//!
//! Progress callbacks are invoked on the thread running the job, which is a pool thread for
//! enqueued jobs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use genefetch_sources::{EndpointConfig, EndpointId};

use crate::caching::CacheError;
use crate::clock::Timestamp;
use crate::config::FetchConfig;

mod ftp;
mod http;
mod job;
mod pool;
mod stat_cache;
mod worker;


pub use ftp::{FtpConnector, classify_reply};
pub use http::HttpConnector;
pub use job::{FetchJob, FetchOutcome, JobHandle, JobState, Progress, UpdatePolicy};
pub use pool::{FetchPool, MassReport, MassRetrieval};
pub use stat_cache::{Snapshot, StatCache};
pub use worker::FetchWorker;

/// Size and modification time of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: Timestamp,
}

/// How a transport answers metadata queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatMode {
    /// One `LIST` per directory describes all files in it.
    Listing,
    /// Every file is queried on its own, e.g. with `HEAD`.
    PerFile,
}

/// The sink receiving a transfer chunk by chunk.
///
/// Returning an error aborts the transfer with that error.
pub type ChunkSink<'a> = dyn FnMut(&[u8]) -> Result<(), CacheError> + 'a;

/// An open connection to a remote endpoint.
///
/// Operations on one connection are strictly sequential. A connection that returned an error
/// other than [`CacheError::NotFound`] may be unusable and is dropped by its owner.
pub trait Connection: Send {
    fn stat_mode(&self) -> StatMode;

    /// Lists `dir` as `ls -l` rows.
    fn list(&mut self, dir: &str) -> Result<Vec<String>, CacheError>;

    /// Queries the metadata of a single file.
    fn head(&mut self, path: &str) -> Result<RemoteStat, CacheError>;

    /// Transfers the contents of `path` into `sink`. Returns the number of bytes received.
    fn retrieve(&mut self, path: &str, sink: &mut ChunkSink<'_>) -> Result<u64, CacheError>;
}

/// Opens connections to one endpoint.
pub trait Connector: Send + Sync {
    fn endpoint(&self) -> &EndpointId;

    fn connect(&self) -> Result<Box<dyn Connection>, CacheError>;
}

/// Various timeouts for all the transports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for individual socket operations.
    pub socket: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            socket: config.socket_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

/// The transport for a configured endpoint.
#[derive(Clone)]
pub enum TransportConnector {
    Ftp(FtpConnector),
    Http(HttpConnector),
}

impl TransportConnector {
    pub fn from_config(
        config: &EndpointConfig,
        timeouts: DownloadTimeouts,
    ) -> Result<Self, CacheError> {
        Ok(match config {
            EndpointConfig::Ftp(config) => Self::Ftp(FtpConnector::new(config.clone(), timeouts)),
            EndpointConfig::Http(config) => {
                Self::Http(HttpConnector::new(config.clone(), timeouts)?)
            }
        })
    }
}

impl fmt::Debug for TransportConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ftp(c) => f.debug_tuple("Ftp").field(c.endpoint()).finish(),
            Self::Http(c) => f.debug_tuple("Http").field(c.endpoint()).finish(),
        }
    }
}

impl Connector for TransportConnector {
    fn endpoint(&self) -> &EndpointId {
        match self {
            Self::Ftp(c) => c.endpoint(),
            Self::Http(c) => c.endpoint(),
        }
    }

    fn connect(&self) -> Result<Box<dyn Connection>, CacheError> {
        match self {
            Self::Ftp(c) => c.connect(),
            Self::Http(c) => c.connect(),
        }
    }
}

/// Builds a connector for every configured endpoint.
pub fn connectors(
    endpoints: &[EndpointConfig],
    timeouts: DownloadTimeouts,
) -> Result<Vec<Arc<dyn Connector>>, CacheError> {
    endpoints
        .iter()
        .map(|config| {
            let connector = TransportConnector::from_config(config, timeouts)?;
            Ok(Arc::new(connector) as Arc<dyn Connector>)
        })
        .collect()
}
