use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::models::Catalog;
use crate::tally::CommitPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}")]
    InvalidVar { name: &'static str, value: String },
    #[error("failed to read election file {path}: {source}")]
    ReadCatalog {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse election file {path}: {source}")]
    ParseCatalog {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Station settings, read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub election_file: PathBuf,
    pub default_ballot_number: u32,
    pub commit_max_attempts: u32,
    pub commit_backoff: Duration,
    /// `host:port` that must accept TCP connections for the station to
    /// count as online. `None` (the default) trusts the store signal alone.
    pub probe_target: Option<String>,
    pub probe_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let policy = CommitPolicy::default();
        Self {
            database_url: "sqlite:ballot_tally.db".to_string(),
            election_file: PathBuf::from("election.json"),
            default_ballot_number: 0,
            commit_max_attempts: policy.max_attempts,
            commit_backoff: policy.backoff,
            probe_target: None,
            probe_interval: Duration::from_secs(5),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            election_file: lookup("ELECTION_FILE").map(PathBuf::from).unwrap_or(defaults.election_file),
            default_ballot_number: parsed(&lookup, "DEFAULT_BALLOT_NUMBER")?
                .unwrap_or(defaults.default_ballot_number),
            commit_max_attempts: parsed(&lookup, "COMMIT_MAX_ATTEMPTS")?
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.commit_max_attempts),
            commit_backoff: parsed(&lookup, "COMMIT_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.commit_backoff),
            probe_target: lookup("PROBE_TARGET")
                .map(|target| target.trim().to_string())
                .filter(|target| !target.is_empty() && !target.eq_ignore_ascii_case("none"))
                .or(defaults.probe_target),
            probe_interval: parsed(&lookup, "PROBE_INTERVAL_SECS")?
                .filter(|n: &u64| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_interval),
        })
    }

    pub fn commit_policy(&self) -> CommitPolicy {
        CommitPolicy {
            max_attempts: self.commit_max_attempts,
            backoff: self.commit_backoff,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { name, value }),
    }
}

/// Reads the positions and candidates to run the election with.
pub fn load_catalog(path: &Path) -> Result<Catalog, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadCatalog {
        path: path.to_path_buf(),
        source,
    })?;
    let catalog: Catalog = serde_json::from_str(&raw).map_err(|source| ConfigError::ParseCatalog {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Loaded {} position(s) from {}", catalog.positions.len(), path.display());
    Ok(catalog)
}
