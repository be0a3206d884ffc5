use std::{error::Error, path::Path, thread};

use clap::Parser;
use log::{error, info, warn};
use oomi_sync::{config::Config, db::EnergyArchive, sync::Syncer};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Environment name, e.g., test, prod.  Loads `.env/{env}.env` if it exists.
    #[arg(short, long)]
    env: Option<String>,

    /// Run one sync cycle and exit
    #[arg(long, default_value_t = false)]
    once: bool,
}

/// Sync Oomi consumption/production and spot prices into DuckDB, then
/// again every `SYNC_INTERVAL_HOURS`.  Cycles never overlap.
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Some(env) = &args.env {
        let path = format!(".env/{}.env", env);
        if Path::new(&path).exists() {
            dotenvy::from_path(Path::new(&path))?;
        } else {
            warn!("No env file {}, using the process environment", path);
        }
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Missing configuration. Exiting.");
            return Err(Box::new(e));
        }
    };
    let interval = config.interval;
    let store = EnergyArchive::open(&config.duckdb_path)?;
    let mut syncer = Syncer::new(config, store)?;

    info!(
        "Configuring to run datasyncs every {} hours",
        interval.as_secs() / 3600
    );
    loop {
        match syncer.run_cycle() {
            Ok(report) => {
                info!("Syncs done\n{}", report.summary_table());
                if args.once && report.failures() > 0 {
                    return Err(format!("{} series failed", report.failures()).into());
                }
            }
            Err(e) => {
                error!("Error running syncs: {}", e);
                if args.once {
                    return Err(Box::new(e));
                }
            }
        }
        if args.once {
            break;
        }
        info!("Sleeping for {} hours", interval.as_secs() / 3600);
        thread::sleep(interval);
    }

    Ok(())
}
