use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indicatif::HumanBytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{ContentLocation, ContentService};
use crate::downloader::{ByteCounter, Downloader};
use crate::error::{Result, UpdateError};
use crate::operation::Progress;

/// Content size/download over HTTP, backed by the local cache.
pub struct HttpContentService {
    downloader: Arc<Downloader>,
    concurrency: usize,
}

impl HttpContentService {
    pub fn new(downloader: Downloader, concurrency: usize) -> Self {
        Self {
            downloader: Arc::new(downloader),
            concurrency: concurrency.max(1),
        }
    }

    /// Remaining bytes per unique location, skipping the ones that cannot
    /// be fetched at all.
    async fn plan(&self, locations: &[ContentLocation], progress: &Progress) -> Result<Vec<(ContentLocation, u64)>> {
        let unique = dedup(locations);
        let total = unique.len() as u64;
        let checked = Arc::new(AtomicU64::new(0));

        let results: Vec<(ContentLocation, Result<u64>)> = stream::iter(unique)
            .map(|location| {
                let downloader = self.downloader.clone();
                let checked = checked.clone();
                let progress = progress.clone();
                async move {
                    let remaining = downloader.remaining_bytes(&location).await;
                    let done = checked.fetch_add(1, Ordering::Relaxed) + 1;
                    progress.set_ratio(done, total);
                    (location, remaining)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut plan = Vec::with_capacity(results.len());
        for (location, remaining) in results {
            match remaining {
                Ok(0) => {}
                Ok(bytes) => plan.push((location, bytes)),
                Err(UpdateError::UnexpectedAssetShape(reason)) => {
                    log::warn!("skipping {}: {}", location.id, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(plan)
    }
}

#[async_trait]
impl ContentService for HttpContentService {
    async fn download_size(&self, locations: &[ContentLocation], progress: &Progress) -> Result<u64> {
        let plan = self.plan(locations, progress).await?;
        Ok(plan.iter().map(|(_, bytes)| bytes).sum())
    }

    async fn download_dependencies(&self, locations: &[ContentLocation], progress: &Progress) -> Result<()> {
        // Planning reports through a scratch handle so the visible fraction
        // only tracks bytes.
        let plan = self.plan(locations, &Progress::new()).await?;
        let total: u64 = plan.iter().map(|(_, bytes)| bytes).sum();
        let count = plan.len();
        log::info!("downloading {} locations", count);

        let counter = ByteCounter::new(total, progress.clone());
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (location, _) in plan {
            let downloader = self.downloader.clone();
            let semaphore = semaphore.clone();
            let counter = counter.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| UpdateError::Cancelled)?;
                downloader.fetch(&location, &counter).await.map_err(|e| {
                    log::warn!("failed to download {}: {}", location.id, e);
                    e
                })
            });
        }

        let mut failed = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(UpdateError::UnexpectedAssetShape(_))) => {}
                Ok(Err(_)) => failed += 1,
                Err(e) => {
                    log::warn!("download task failed: {}", e);
                    failed += 1;
                }
            }
        }

        log::info!("fetched {} of {}", HumanBytes(counter.done()), HumanBytes(total));
        if failed > 0 {
            return Err(UpdateError::Network(format!(
                "{} of {} locations failed to download",
                failed, count
            )));
        }
        Ok(())
    }
}

/// Keep the first location for every id.
fn dedup(locations: &[ContentLocation]) -> Vec<ContentLocation> {
    let mut seen = HashSet::new();
    locations
        .iter()
        .filter(|location| seen.insert(location.id.as_str()))
        .cloned()
        .collect()
}
