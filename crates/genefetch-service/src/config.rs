use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use genefetch_sources::{EndpointConfig, EndpointId};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level, overridden by `RUST_LOG`.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "genefetch".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// When a locally present artifact is considered out of date.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshWhen {
    /// Refresh if the size differs *or* the remote copy is newer.
    #[default]
    Any,
    /// Refresh only if the size differs *and* the remote copy is newer.
    All,
}

/// Tuning of the fetch pool and its workers.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    /// Number of background workers per endpoint.
    pub workers: usize,

    /// Attempts per job before a retryable error is surfaced.
    pub max_attempts: usize,

    /// Pause between two attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// The timeout for establishing a control connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout of individual socket reads.
    #[serde(with = "humantime_serde")]
    pub socket_timeout: Duration,

    /// Which differences make a local artifact stale.
    pub refresh_when: RefreshWhen,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_attempts: 3,
            retry_delay: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(30),
            socket_timeout: Duration::from_secs(30),
            refresh_when: RefreshWhen::Any,
        }
    }
}

/// Tuning of the key-value stores.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Serialized payloads larger than this many bytes are kept as blob files.
    pub inline_threshold: usize,

    /// How long a connection waits for a competing writer.
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Number of read-only connections kept open.
    pub readers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 64 * 1024,
            busy_timeout: Duration::from_secs(10),
            readers: 4,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of all per-database caches and the update log.
    pub cache_dir: PathBuf,

    /// The current database release. Entries recorded under another release are
    /// invalidated by release-scoped functions.
    pub release: Option<String>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fetch pool tuning.
    pub fetch: FetchConfig,

    /// Store tuning.
    pub store: StoreConfig,

    /// The remote endpoints artifacts are fetched from.
    pub endpoints: Vec<EndpointConfig>,
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> PathBuf {
    match env::var_os("GENEFETCH_CACHE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => env::temp_dir().join("genefetch"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            release: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            fetch: FetchConfig::default(),
            store: StoreConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.fetch.workers == 0 {
            anyhow::bail!("fetch.workers must be at least 1");
        }
        if self.fetch.max_attempts == 0 {
            anyhow::bail!("fetch.max_attempts must be at least 1");
        }
        let mut seen = std::collections::BTreeSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.id()) {
                anyhow::bail!("duplicate endpoint id `{}`", endpoint.id());
            }
        }
        Ok(())
    }

    /// Returns the directory holding the caches of `database`.
    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.cache_dir.join(database)
    }

    /// Looks up an endpoint by its id.
    pub fn endpoint(&self, id: &EndpointId) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.id() == id)
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
