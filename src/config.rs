use std::path::PathBuf;
use std::time::Duration;

use crate::cli::VerifyMode;
use crate::flag::FLAG_FILE_NAME;

pub const DEFAULT_CATALOG_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Base URL of the catalog/content server.
    pub server: String,
    /// Private writable storage holding the flag, catalogs and cache.
    pub data_dir: PathBuf,
    pub catalog_ids: Vec<String>,
    /// Watchdog bound for the catalog check.
    pub catalog_timeout: Duration,
    /// Interval between progress samples.
    pub tick_interval: Duration,
    pub concurrency: usize,
    pub rate_limit: Option<u32>,
    pub verify_mode: VerifyMode,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            data_dir: default_data_dir(),
            catalog_ids: vec!["catalog".to_string()],
            catalog_timeout: DEFAULT_CATALOG_TIMEOUT,
            tick_interval: DEFAULT_TICK,
            concurrency: num_cpus::get(),
            rate_limit: None,
            verify_mode: VerifyMode::Auto,
        }
    }
}

impl UpdaterConfig {
    pub fn flag_file(&self) -> PathBuf {
        self.data_dir.join(FLAG_FILE_NAME)
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.data_dir.join("catalogs")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }
}

pub fn default_data_dir() -> PathBuf {
    match dirs::data_local_dir() {
        Some(dir) => dir.join("kvupdate"),
        None => PathBuf::from("kvdata"),
    }
}
