// Command-line / environment configuration. The defaults describe the
// Haferkamp → Bremen Hauptbahnhof board.

use crate::feed_store::{FeedStore, StoreConfig};
use crate::resolver::{DelayPolicy, DepartureQuery};
use chrono_tz::Tz;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const HAFERKAMP: &str = "000009013912";
pub const BREMEN_HBF: &str = "000009013925";

#[derive(Debug, Clone, Parser)]
#[command(name = "vbn-infoboard", about = "Departure board backend for VBN GTFS + realtime data")]
pub struct Config {
    /// Address to bind the HTTP server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(
        long,
        env = "GTFS_STATIC_URL",
        default_value = "https://www.connect-info.net/opendata/gtfs/connect-nds-toplevel/wftdkvbsii"
    )]
    pub static_url: String,

    #[arg(long, env = "GTFS_REALTIME_URL", default_value = "https://gtfsr.vbn.de/gtfsr_connect.json")]
    pub realtime_url: String,

    /// Stop the board departs from; stop_times are reduced to trips serving it
    #[arg(long, env = "ORIGIN_STOP_ID", default_value = HAFERKAMP)]
    pub origin_stop_id: String,

    #[arg(long, env = "ORIGIN_NAME", default_value = "Bremen Haferkamp")]
    pub origin_name: String,

    #[arg(long, env = "DESTINATION_STOP_IDS", value_delimiter = ',', default_value = BREMEN_HBF)]
    pub destination_stop_ids: Vec<String>,

    /// Snapshot cache file (defaults to the user cache directory)
    #[arg(long, env = "GTFS_CACHE_FILE")]
    pub cache_file: Option<PathBuf>,

    #[arg(long, env = "GTFS_NO_CACHE")]
    pub no_cache: bool,

    /// Seconds before the static feed is downloaded again
    #[arg(long, env = "GTFS_MAX_AGE_SECS", default_value_t = 3600)]
    pub static_max_age_secs: u64,

    #[arg(long, env = "GTFS_REFRESH_INTERVAL_SECS", default_value_t = 3600)]
    pub refresh_interval_secs: u64,

    /// Seconds a realtime response is reused; 0 fetches on every request
    #[arg(long, env = "REALTIME_CACHE_SECS", default_value_t = 15)]
    pub realtime_cache_secs: u64,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "DOWNLOAD_TIMEOUT_SECS", default_value_t = 300)]
    pub download_timeout_secs: u64,

    #[arg(long, env = "FEED_TIMEZONE", default_value = "Europe/Berlin")]
    pub timezone: String,

    #[arg(long, env = "DEFAULT_LIMIT", default_value_t = 3)]
    pub default_limit: usize,

    /// Candidates considered before the realtime merge
    #[arg(long, env = "SCAN_LIMIT", default_value_t = 10)]
    pub scan_limit: usize,

    /// Only apply delays reported for the exact trip
    #[arg(long, env = "NO_LINE_FALLBACK")]
    pub no_line_fallback: bool,
}

impl Config {
    pub fn store_config(&self) -> StoreConfig {
        let cache_file = if self.no_cache {
            None
        } else {
            Some(self.cache_file.clone().unwrap_or_else(FeedStore::default_cache_path))
        };

        StoreConfig {
            origin_stop_id: self.origin_stop_id.clone(),
            cache_file,
            max_age: Duration::from_secs(self.static_max_age_secs),
        }
    }

    pub fn query_defaults(&self) -> DepartureQuery {
        DepartureQuery {
            from: self.origin_stop_id.clone(),
            to: self.destination_stop_ids.clone(),
            origin_label: self.origin_name.clone(),
            scan_limit: self.scan_limit.max(self.default_limit),
            limit: self.default_limit,
        }
    }

    pub fn delay_policy(&self) -> DelayPolicy {
        DelayPolicy {
            line_fallback: !self.no_line_fallback,
        }
    }

    pub fn feed_timezone(&self) -> Result<Tz, String> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| format!("Invalid timezone '{}': {}", self.timezone, e))
    }
}
