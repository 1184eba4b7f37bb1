// Feed store: owns the published GTFS snapshot and its on-disk cache.
//
// A refresh builds a complete FeedSnapshot off to the side and swaps it in
// under a short write lock. Readers hold an Arc to whichever snapshot was
// current when they asked, so they never observe a partial build.

use crate::gtfs_static;
use crate::models::{BoardError, FeedSnapshot, FeedStatus, Result};
use bytes::Bytes;
use chrono::Utc;
use reqwest::blocking;
use std::fs;
use std::io::{BufReader, BufWriter, Cursor};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

/// Data this close to `max_age` already counts as stale, so a timer ticking
/// at the max age does not find the last download a few seconds too young.
const REFRESH_SLACK: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub origin_stop_id: String,
    pub cache_file: Option<PathBuf>,
    pub max_age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    StillFresh,
    LoadedFromCache,
    Downloaded,
}

// ============================================================================
// Archive Sources
// ============================================================================

pub trait ArchiveSource: Send + Sync {
    fn download(&self) -> Result<Bytes>;
}

pub struct HttpArchiveSource {
    url: String,
    timeout: Duration,
}

impl HttpArchiveSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        HttpArchiveSource {
            url: url.into(),
            timeout,
        }
    }
}

impl ArchiveSource for HttpArchiveSource {
    fn download(&self) -> Result<Bytes> {
        log::info!("📥 Downloading GTFS data from {}...", self.url);

        let client = blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| BoardError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .get(&self.url)
            .send()
            .map_err(|e| BoardError::NetworkError(format!("Failed to download GTFS: {}", e)))?;

        if !response.status().is_success() {
            return Err(BoardError::NetworkError(format!(
                "GTFS download failed with status: {}",
                response.status()
            )));
        }

        let zip_bytes = response
            .bytes()
            .map_err(|e| BoardError::NetworkError(format!("Failed to read GTFS zip: {}", e)))?;

        log::info!("✓ Downloaded {} KB, extracting...", zip_bytes.len() / 1024);
        Ok(zip_bytes)
    }
}

// ============================================================================
// Feed Store
// ============================================================================

pub struct FeedStore {
    config: StoreConfig,
    source: Arc<dyn ArchiveSource>,
    snapshot: RwLock<Option<Arc<FeedSnapshot>>>,
    refresh_lock: Mutex<()>,
}

impl FeedStore {
    pub fn new(config: StoreConfig, source: Arc<dyn ArchiveSource>) -> Self {
        FeedStore {
            config,
            source,
            snapshot: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// The last published snapshot, if any refresh has succeeded yet.
    pub fn current(&self) -> Option<Arc<FeedSnapshot>> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn status(&self) -> FeedStatus {
        self.current().map(|s| s.status()).unwrap_or_default()
    }

    /// Bring the snapshot up to date.
    ///
    /// Without `force`, a snapshot or cache file younger than the max age is
    /// reused. On error the previously published snapshot stays in place.
    pub fn refresh(&self, force: bool) -> Result<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().unwrap_or_else(|p| p.into_inner());

        if !force {
            if let Some(current) = self.current() {
                let age = (Utc::now() - current.last_updated).to_std().unwrap_or_default();
                if age < self.fresh_for() {
                    log::info!("⏰ GTFS data is still fresh ({} minutes old), skipping download", age.as_secs() / 60);
                    return Ok(RefreshOutcome::StillFresh);
                }
            }

            if let Some(path) = &self.config.cache_file {
                if let Some(age) = Self::file_age(path) {
                    if age < self.fresh_for() {
                        log::info!("📂 Loading GTFS data from cache ({} minutes old)...", age.as_secs() / 60);
                        match Self::load_cache(path) {
                            Ok(snapshot) => {
                                self.publish(snapshot);
                                return Ok(RefreshOutcome::LoadedFromCache);
                            }
                            Err(e) => log::warn!("⚠️  {}, proceeding with download", e),
                        }
                    }
                }
            }
        }

        log::info!("🔄 Downloading GTFS data...");
        let zip_bytes = self.source.download()?;
        let snapshot = gtfs_static::parse_archive(Cursor::new(zip_bytes), &self.config.origin_stop_id)?;

        if let Some(path) = &self.config.cache_file {
            if let Err(e) = Self::save_cache(path, &snapshot) {
                log::warn!("⚠️  Warning: Could not save GTFS cache: {}", e);
            }
        }

        self.publish(snapshot);
        log::info!("✅ GTFS data updated successfully");
        Ok(RefreshOutcome::Downloaded)
    }

    fn fresh_for(&self) -> Duration {
        let slack = REFRESH_SLACK.min(self.config.max_age / 10);
        self.config.max_age.saturating_sub(slack)
    }

    fn publish(&self, snapshot: FeedSnapshot) {
        log::info!(
            "📊 Publishing {} stops, {} trips, {} stop_times",
            snapshot.stops.len(),
            snapshot.trips.len(),
            snapshot.stop_times.len()
        );

        let snapshot = Arc::new(snapshot);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = Some(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Some(snapshot),
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn default_cache_path() -> PathBuf {
        let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("vbn_infoboard");
        path.push("gtfs_cache.json");
        path
    }

    /// Write the snapshot as JSON next to `path`, then rename it into place.
    pub fn save_cache(path: &Path, snapshot: &FeedSnapshot) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| BoardError::FileError(format!("Failed to create cache directory: {}", e)))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let file = fs::File::create(&tmp_path)
            .map_err(|e| BoardError::FileError(format!("Failed to write cache: {}", e)))?;
        serde_json::to_writer(BufWriter::new(file), snapshot)
            .map_err(|e| BoardError::FileError(format!("Failed to serialize cache: {}", e)))?;
        fs::rename(&tmp_path, path)
            .map_err(|e| BoardError::FileError(format!("Failed to write cache: {}", e)))?;

        log::info!("💾 GTFS data saved to cache: {:?}", path);
        Ok(())
    }

    pub fn load_cache(path: &Path) -> Result<FeedSnapshot> {
        let file = fs::File::open(path)
            .map_err(|e| BoardError::FileError(format!("Failed to read cache file: {}", e)))?;
        let snapshot: FeedSnapshot = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| BoardError::FileError(format!("Failed to parse cache file: {}", e)))?;

        log::info!(
            "✅ GTFS data loaded from cache: {} stops, {} trips, {} stop_times",
            snapshot.stops.len(),
            snapshot.trips.len(),
            snapshot.stop_times.len()
        );
        Ok(snapshot)
    }

    fn file_age(path: &Path) -> Option<Duration> {
        let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
        Some(SystemTime::now().duration_since(modified).unwrap_or_default())
    }
}
