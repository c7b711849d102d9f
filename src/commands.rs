use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use indicatif::HumanBytes;
use std::sync::Arc;
use std::time::Duration;

use crate::config::UpdaterConfig;
use crate::coordinator::UpdateCoordinator;
use crate::downloader::Downloader;
use crate::flag::{DownloadFlag, FlagStore};
use crate::progress::ProgressSink;
use crate::providers::catalog::{CatalogStore, HttpCatalogService};
use crate::providers::content::HttpContentService;
use crate::providers::Services;
use crate::state::RunReport;
use crate::utils::server_url;

pub fn http_services(config: &UpdaterConfig) -> Result<Services> {
    let base = server_url(&config.server).context("Failed to parse server url")?;
    let client = reqwest::Client::builder()
        .user_agent(concat!("kvupdate/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let store = CatalogStore::new(config.catalog_dir());
    let catalogs = HttpCatalogService::new(client.clone(), base.clone(), config.catalog_ids.clone(), store.clone());
    let downloader = Downloader::new(client, base, config.cache_dir(), config.rate_limit, config.verify_mode);
    let content = HttpContentService::new(downloader, config.concurrency);

    Ok(Services {
        catalogs: Arc::new(catalogs),
        content: Arc::new(content),
        registry: Arc::new(store),
    })
}

pub fn log_paths(config: &UpdaterConfig) {
    log::info!("server: {}", config.server);
    log::info!("data dir: {:?}", config.data_dir);
    log::info!("catalog dir: {:?}", config.catalog_dir());
    log::info!("cache dir: {:?}", config.cache_dir());
    log::info!("flag file: {:?}", config.flag_file());
}

/// Run one update. Ctrl+C leaves the flag set, so the next run picks the
/// download up again.
pub async fn run_update(config: UpdaterConfig, sink: Arc<dyn ProgressSink>) -> Result<Option<RunReport>> {
    log_paths(&config);
    let services = http_services(&config)?;
    let mut coordinator = UpdateCoordinator::new(&config, services, sink);

    let report = tokio::select! {
        report = coordinator.run() => Some(report),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            log::warn!("interrupted; download will resume on the next run");
            None
        }
    };
    match &report {
        Some(report) => log::debug!(
            "run reached {} from {}: {:?}",
            report.state,
            report.last_stage,
            report.outcome
        ),
        None => log::debug!("coordinator stopped in {}", coordinator.state()),
    }
    Ok(report)
}

pub fn list_status(config: &UpdaterConfig) -> Result<()> {
    let flag = DownloadFlag::new(config.flag_file());
    let flag_state = if flag.path().exists() {
        if flag.read() {
            "download outstanding"
        } else {
            "last download finished"
        }
    } else {
        "no previous run"
    };
    println!("Flag: {:?} ({})", flag.path(), flag_state);
    println!();

    let store = CatalogStore::new(config.catalog_dir());
    let catalogs = store.installed();
    println!("{:<30} {:<40}", "Catalog", "Hash");
    println!("{:-<30} {:-<40}", "", "");
    if catalogs.is_empty() {
        println!("No catalogs installed in {:?}.", store.dir());
    }
    for catalog in &catalogs {
        println!("{:<30} {:<40}", catalog.id, catalog.hash.as_deref().unwrap_or("-"));
    }
    println!();

    let cache_dir = config.cache_dir();
    let mut cached_files = 0;
    let mut partial_files = 0;
    let mut cached_bytes: u64 = 0;
    let mut rows = Vec::new();

    if let Ok(entries) = std::fs::read_dir(&cache_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().to_string();
            let status = if filename.ends_with(".part") {
                partial_files += 1;
                "Partial"
            } else {
                cached_files += 1;
                "Cached"
            };
            cached_bytes += metadata.len();
            let modified = metadata
                .modified()
                .ok()
                .map(|m| DateTime::<Local>::from(m).format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            rows.push((filename, status, metadata.len(), modified));
        }
    }
    rows.sort();

    println!(
        "Summary: Cached: {} | Partial: {} | On disk: {}",
        cached_files,
        partial_files,
        HumanBytes(cached_bytes)
    );
    println!();
    println!("{:<50} {:<10} {:<12} {:<17}", "Content", "Status", "Size", "Modified");
    println!("{:-<50} {:-<10} {:-<12} {:-<17}", "", "", "", "");
    if rows.is_empty() {
        println!("No content cached in {:?}.", cache_dir);
    }
    for (filename, status, size, modified) in rows {
        println!(
            "{:<50} {:<10} {:<12} {:<17}",
            filename,
            status,
            format!("{}", HumanBytes(size)),
            modified
        );
    }

    Ok(())
}
