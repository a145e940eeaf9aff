//! Exposes the command line application.
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use genefetch_service::config::Config;
use genefetch_service::download::UpdatePolicy;
use genefetch_service::metrics;
use genefetch_service::services::Services;
use genefetch_sources::RemoteRef;

use crate::logging;
use crate::updater::{self, UpdateArgs};

/// When `fetch` downloads an artifact that is already present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum Policy {
    /// Keep any local copy.
    NeverIfPresent,
    /// Download if the remote copy changed.
    #[default]
    Check,
    /// Always download.
    Force,
}

impl From<Policy> for UpdatePolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::NeverIfPresent => UpdatePolicy::NeverIfPresent,
            Policy::Check => UpdatePolicy::Check,
            Policy::Force => UpdatePolicy::Force,
        }
    }
}

/// Genefetch commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run database update scripts, mailing the logs of failing ones.
    Update(UpdateArgs),

    /// Retrieve remote artifacts into a database cache.
    Fetch {
        /// The database the artifacts belong to.
        #[arg(long, short)]
        database: String,

        #[arg(long, value_enum, default_value_t)]
        policy: Policy,

        /// Remote references, as `endpoint:/path` or `scheme://host/path`.
        #[arg(required = true)]
        remotes: Vec<RemoteRef>,
    },

    /// Purge expired entries from all database caches.
    Cleanup,

    /// List the keys recorded in a database cache.
    Keys {
        #[arg(long, short)]
        database: String,

        /// Only list keys starting with this prefix.
        prefix: Option<String>,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn init_metrics(config: &Config) -> Result<()> {
    let Some(ref statsd) = config.metrics.statsd else {
        return Ok(());
    };
    let mut tags: BTreeMap<String, String> = config.metrics.custom_tags.clone();
    if let Some(host) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
        tags.entry("host".into()).or_insert(host);
    }
    metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
}

fn fetch(config: Config, database: &str, policy: Policy, remotes: &[RemoteRef]) -> Result<()> {
    let services = Services::from_config(config)?;
    let database = services
        .database(database)
        .context("failed to open database cache")?;

    if let [remote] = remotes {
        let local = services
            .retrieve(&database, remote, policy.into())
            .with_context(|| format!("failed to retrieve {remote}"))?;
        println!("{}", local.display());
        return Ok(());
    }

    let term = console::Term::stderr();
    let show_progress = term.is_term();
    let report = services.retrieve_all(&database, remotes, policy.into(), |percent: u8| {
        if show_progress {
            term.clear_line().ok();
            write!(&term, "{percent:>3}%").ok();
        }
    })?;
    if show_progress {
        term.clear_line().ok();
    }

    for (remote, err) in &report.failed {
        tracing::error!(%remote, error = err as &dyn std::error::Error, "retrieval failed");
    }
    for remote in remotes {
        if !report.failed.iter().any(|(failed, _)| failed == remote) {
            println!("{}", database.local_path(remote).display());
        }
    }
    match report.is_success() {
        true => Ok(()),
        false => anyhow::bail!("{report}"),
    }
}

fn keys(config: Config, database: &str, prefix: Option<&str>) -> Result<()> {
    let services = Services::from_config(config)?;
    let store = services
        .database(database)
        .context("failed to open database cache")?
        .store()
        .clone();
    let keys = match prefix {
        Some(prefix) => store.keys_with_prefix(prefix)?,
        None => store.keys()?,
    };
    for key in keys {
        println!("{key}");
    }
    Ok(())
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config);
    init_metrics(&config).context("failed to configure metrics")?;

    match cli.command {
        Command::Update(ref args) => updater::run(args)?,
        Command::Fetch {
            ref database,
            policy,
            ref remotes,
        } => fetch(config, database, policy, remotes)?,
        Command::Cleanup => {
            let services = Services::from_config(config)?;
            let purged = services.cleanup().context("failed to clean up caches")?;
            tracing::info!(purged, "cleanup finished");
        }
        Command::Keys {
            ref database,
            ref prefix,
        } => keys(config, database, prefix.as_deref())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "genefetch",
            "fetch",
            "--database",
            "kegg",
            "--policy",
            "never-if-present",
            "ftp://ftp.genome.jp/pub/kegg/genes.tab",
            "mirror:/data/ann.tab",
        ])
        .unwrap();
        let Command::Fetch {
            database,
            policy,
            remotes,
        } = cli.command
        else {
            panic!("expected a fetch command");
        };
        assert_eq!(database, "kegg");
        assert_eq!(policy, Policy::NeverIfPresent);
        assert_eq!(remotes[0].endpoint().as_str(), "ftp://ftp.genome.jp");
        assert_eq!(remotes[0].path(), "/pub/kegg/genes.tab");
        assert_eq!(remotes[1].endpoint().as_str(), "mirror");
    }

    #[test]
    fn test_parse_update() {
        let cli = Cli::try_parse_from([
            "genefetch",
            "--config",
            "genefetch.yml",
            "update",
            "-u",
            "updater",
            "-p",
            "secret",
            "--mailto",
            "a@example.com,b@example.com",
            "update_go.sh",
        ])
        .unwrap();
        assert_eq!(cli.config(), Some(Path::new("genefetch.yml")));
        let Command::Update(args) = cli.command else {
            panic!("expected an update command");
        };
        assert_eq!(args.mailto, ["a@example.com", "b@example.com"]);
        assert_eq!(args.scripts, [PathBuf::from("update_go.sh")]);
        assert_eq!(args.log_dir, PathBuf::from("."));

        assert!(Cli::try_parse_from(["genefetch", "update", "-u", "x", "-p", "y"]).is_err());
    }
}
