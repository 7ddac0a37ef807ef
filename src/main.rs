use ballot_tally::commands::{self, Args};
use ballot_tally::config::{self, Settings};
use ballot_tally::db;
use clap::Parser;
use log::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    args.apply(&mut settings);

    let catalog = match config::load_catalog(&settings.election_file) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    // Initialize store
    let store = match db::connect(&settings.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open store {}: {}", settings.database_url, e);
            return;
        }
    };

    info!("Running {:?} station", args.station);
    if let Err(e) = commands::run(&args.station, store, catalog, &settings).await {
        error!("{:?} failed: {}", args.station, e);
        eprintln!("Error: {}", e);
    }
}
