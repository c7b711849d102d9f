mod cli;
mod commands;
mod config;
mod coordinator;
mod downloader;
mod error;
mod flag;
mod hashing;
mod operation;
mod progress;
mod providers;
mod resolver;
mod state;
mod utils;

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::VerifyMode;
use crate::config::{default_data_dir, UpdaterConfig};
use crate::progress::{ConsoleSink, LogSink, ProgressSink};

#[derive(Parser, Debug)]
#[command(author, version, about = "Check remote catalogs and download outstanding content", long_about = None)]
struct Args {
    /// Base URL of the catalog/content server
    #[arg(short = 's', long = "server")]
    server: Option<String>,

    /// Private storage for the download flag, catalogs and cached content
    #[arg(short = 'd', long = "data-dir")]
    data_dir: Option<PathBuf>,

    /// Catalog ids to check (repeatable)
    #[arg(short = 'C', long = "catalog", default_values_t = vec!["catalog".to_string()])]
    catalogs: Vec<String>,

    /// Seconds to wait for the catalog check before giving up on this run
    #[arg(long = "catalog-timeout", default_value_t = 5.0)]
    catalog_timeout: f64,

    /// Milliseconds between progress samples
    #[arg(long = "tick-ms", default_value_t = 100)]
    tick_ms: u64,

    /// Maximum number of concurrent downloads (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Hash verification: auto (only when hash provided), on (require hash), off (skip)
    #[arg(long = "verify-hash", value_enum, default_value = "auto")]
    verify_hash: VerifyMode,

    /// Show the download flag, installed catalogs and cached content
    #[arg(short = 'l', long)]
    list: bool,

    /// Log progress instead of drawing a progress bar
    #[arg(long)]
    no_progress: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<UpdaterConfig> {
        if !self.catalog_timeout.is_finite() || self.catalog_timeout <= 0.0 {
            bail!("--catalog-timeout must be a positive number of seconds");
        }

        let mut data_dir = self.data_dir.unwrap_or_else(default_data_dir);
        // Resolve relative to the launch directory so logs show real paths
        if data_dir.is_relative() {
            if let Ok(cwd) = std::env::current_dir() {
                data_dir = cwd.join(&data_dir);
            }
        }

        let defaults = UpdaterConfig::default();
        Ok(UpdaterConfig {
            server: self.server.unwrap_or_default(),
            data_dir,
            catalog_ids: self.catalogs,
            catalog_timeout: Duration::from_secs_f64(self.catalog_timeout),
            tick_interval: Duration::from_millis(self.tick_ms.max(1)),
            concurrency: self.concurrency.unwrap_or(defaults.concurrency).max(1),
            rate_limit: self.rate_limit,
            verify_mode: self.verify_hash,
        })
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "info,kvupdate=debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    if args.list {
        let config = args.into_config()?;
        return crate::commands::list_status(&config);
    }

    if args.server.is_none() {
        bail!("--server is required unless --list is given");
    }

    let sink: Arc<dyn ProgressSink> = if args.no_progress {
        Arc::new(LogSink)
    } else {
        Arc::new(ConsoleSink::new())
    };
    let config = args.into_config()?;

    // Stages cooperate on a single thread
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let report = rt.block_on(crate::commands::run_update(config, sink))?;

    match report {
        Some(report) if report.success => Ok(()),
        Some(report) => {
            eprintln!("{}", report.message);
            std::process::exit(1);
        }
        None => std::process::exit(130),
    }
}
