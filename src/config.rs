use std::{env, path::PathBuf, time::Duration};

use log::error;

use crate::error::SyncError;

pub const DEFAULT_PORTAL_URL: &str = "https://online.oomi.fi";
pub const DEFAULT_SPOT_PRICE_URL: &str = "https://api.spot-hinta.fi/Today";
pub const DEFAULT_INTERVAL_HOURS: u64 = 6;

const REQUIRED_VARS: [&str; 5] = [
    "OOMI_USERNAME",
    "OOMI_PASSWORD",
    "OOMI_METERINGPOINT_CONSUMPTION",
    "OOMI_METERINGPOINT_PRODUCTION",
    "ENERGY_DUCKDB_PATH",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub password: String,
    pub metering_point_consumption: String,
    pub metering_point_production: String,
    pub duckdb_path: String,
    pub portal_url: String,
    pub spot_price_url: String,
    pub interval: Duration,
    /// If set, the raw dataset of every report is saved here.
    pub archive_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Config, SyncError> {
        Config::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    /// Empty values count as missing.  All missing variables are logged
    /// before failing.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let missing: Vec<&str> = REQUIRED_VARS
            .iter()
            .filter(|&&name| get(name).is_none())
            .copied()
            .collect();
        for name in &missing {
            error!("Missing configuration: {}", name);
        }
        if !missing.is_empty() {
            return Err(SyncError::Config(format!(
                "missing required variables: {}",
                missing.join(", ")
            )));
        }

        let hours = match get("SYNC_INTERVAL_HOURS") {
            Some(s) => match s.trim().parse::<u64>() {
                Ok(h) if h > 0 => h,
                _ => {
                    return Err(SyncError::Config(format!(
                        "SYNC_INTERVAL_HOURS must be a positive integer, got {}",
                        s
                    )))
                }
            },
            None => DEFAULT_INTERVAL_HOURS,
        };

        let required = |name: &str| get(name).unwrap_or_default();
        Ok(Config {
            username: required("OOMI_USERNAME"),
            password: required("OOMI_PASSWORD"),
            metering_point_consumption: required("OOMI_METERINGPOINT_CONSUMPTION"),
            metering_point_production: required("OOMI_METERINGPOINT_PRODUCTION"),
            duckdb_path: required("ENERGY_DUCKDB_PATH"),
            portal_url: get("OOMI_BASE_URL")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_PORTAL_URL.to_string()),
            spot_price_url: get("SPOT_PRICE_URL")
                .unwrap_or_else(|| DEFAULT_SPOT_PRICE_URL.to_string()),
            interval: Duration::from_secs(hours * 3600),
            archive_dir: get("RAW_ARCHIVE_DIR").map(PathBuf::from),
        })
    }
}
