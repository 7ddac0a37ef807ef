use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::io::BufReader;

use crate::config::Settings;
use crate::db::Store;
use crate::election;
use crate::handlers::{self, EntryStation};
use crate::models::{AuditKind, Catalog};
use crate::tasks::{self, ConnectivityMonitor};
use crate::voting::results;

pub type CommandResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Paper-ballot tallying station.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (URL, optional) Overrides DATABASE_URL. `memory:` runs without persistence.
    #[clap(long, value_parser)]
    pub database_url: Option<String>,

    /// (file path, optional) Overrides ELECTION_FILE, the JSON list of positions and candidates.
    #[clap(long, value_parser)]
    pub election_file: Option<String>,

    #[clap(subcommand)]
    pub station: Station,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Station {
    /// Create the election from the election file with every tally at zero.
    Init {
        /// Replace an election that is already active.
        #[clap(long, takes_value = false)]
        force: bool,
    },
    /// Zero every tally and the wrong-ballot counter and clear the vote log.
    Reset {
        /// Confirms the reset; without it nothing happens.
        #[clap(long, takes_value = false)]
        yes: bool,
    },
    /// Copy photos and ballot numbers from the election file, keeping tallies.
    Refresh,
    /// Print the current results once.
    Results,
    /// Display station: reprint the results on every change.
    Watch,
    /// Entry station: read ballots from the terminal. Online follows the
    /// store unless PROBE_TARGET names a host:port that must also answer.
    Entry,
    /// Print the vote log.
    Audit,
}

impl Args {
    /// Applies the command-line overrides on top of the environment.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.database_url {
            settings.database_url = url.clone();
        }
        if let Some(path) = &self.election_file {
            settings.election_file = path.into();
        }
    }
}

pub async fn run(station: &Station, store: Arc<dyn Store>, catalog: Catalog, settings: &Settings) -> CommandResult {
    match station {
        Station::Init { force } => {
            election::initialize(store.as_ref(), &catalog, *force).await?;
            println!("Election created with {} position(s).", catalog.positions.len());
        }
        Station::Reset { yes } => {
            if !*yes {
                warn!("Reset requested without --yes");
                println!("This zeroes every tally and clears the vote log. Re-run with --yes to confirm.");
                return Ok(());
            }
            let reset = election::reset_all_votes(store.as_ref()).await?;
            println!("Reset {} tallies.", reset);
        }
        Station::Refresh => {
            let refreshed = election::refresh_display_metadata(store.as_ref(), &catalog).await?;
            println!("Refreshed {} candidate(s).", refreshed);
        }
        Station::Results => {
            let snapshot = election::load_snapshot(store.as_ref(), &catalog, settings.default_ballot_number).await?;
            print!("{}", results::tally(&snapshot).summary());
        }
        Station::Watch => {
            let feed = election::watch_election(store.as_ref(), catalog, settings.default_ballot_number).await?;
            tasks::results_feed_task(feed, tokio::io::stdout()).await;
        }
        Station::Entry => run_entry(store, catalog, settings).await?,
        Station::Audit => {
            for (key, entry) in election::read_audit_log(store.as_ref()).await? {
                let at = Local
                    .timestamp_millis_opt(entry.timestamp)
                    .single()
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                    .unwrap_or_else(|| entry.timestamp.to_string());
                let target = match entry.kind {
                    AuditKind::Wrong => "wrong ballot".to_string(),
                    _ => format!(
                        "{}/{}",
                        entry.position_id.as_deref().unwrap_or("?"),
                        entry.candidate_id.as_deref().unwrap_or("?")
                    ),
                };
                println!("{}  {:<8} {}  [{}]", at, format!("{:?}", entry.kind).to_lowercase(), target, key);
            }
        }
    }
    Ok(())
}

async fn run_entry(store: Arc<dyn Store>, catalog: Catalog, settings: &Settings) -> CommandResult {
    if election::ensure_initialized(store.as_ref(), &catalog).await? {
        info!("No election found, created one from the election file");
    }

    let network = tasks::network_signal(settings.probe_target.clone(), settings.probe_interval);
    let monitor = ConnectivityMonitor::spawn(network, store.connectivity());

    let mut station = EntryStation::open(
        store,
        catalog,
        settings.default_ballot_number,
        settings.commit_policy(),
        monitor.subscribe(),
    )
    .await?;
    println!("{}", handlers::entry::HELP);
    handlers::run_entry_loop(&mut station, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::tally::test_support::club_catalog;
    use crate::tally::{CommitPolicy, VoteCounter};

    #[test]
    fn subcommands_parse() {
        let args = Args::try_parse_from(["ballot-tally", "--database-url", "memory:", "init", "--force"]).unwrap();
        assert_eq!(args.station, Station::Init { force: true });

        let mut settings = Settings::default();
        args.apply(&mut settings);
        assert_eq!(settings.database_url, "memory:");
        assert_eq!(settings.election_file, Settings::default().election_file);

        let args = Args::try_parse_from(["ballot-tally", "reset"]).unwrap();
        assert_eq!(args.station, Station::Reset { yes: false });
        assert!(Args::try_parse_from(["ballot-tally"]).is_err());
    }

    #[tokio::test]
    async fn reset_without_confirmation_changes_nothing() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let settings = Settings::default();
        run(&Station::Init { force: false }, store.clone(), club_catalog(), &settings)
            .await
            .unwrap();
        let counter = VoteCounter::new(store.clone(), CommitPolicy::default());
        counter.increment("head", "head-1").await.unwrap();

        run(&Station::Reset { yes: false }, store.clone(), club_catalog(), &settings)
            .await
            .unwrap();
        assert_eq!(counter.tally("head", "head-1").await.unwrap(), 1);

        run(&Station::Reset { yes: true }, store.clone(), club_catalog(), &settings)
            .await
            .unwrap();
        assert_eq!(counter.tally("head", "head-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_init_without_force_fails() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let settings = Settings::default();
        let init = Station::Init { force: false };
        run(&init, store.clone(), club_catalog(), &settings).await.unwrap();
        assert!(run(&init, store.clone(), club_catalog(), &settings).await.is_err());
        run(&Station::Audit, store, club_catalog(), &settings).await.unwrap();
    }
}
