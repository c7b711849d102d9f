use chrono::{DateTime, Local};
use futures::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use indicatif::HumanBytes;
use reqwest::{header, Client, StatusCode};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::cli::VerifyMode;
use crate::error::{Result, UpdateError};
use crate::operation::Progress;
use crate::providers::ContentLocation;
use crate::utils::{cache_file_name, resolve_url};

/// Bytes fetched so far against the bytes a download stage set out to fetch.
#[derive(Clone)]
pub struct ByteCounter {
    done: Arc<AtomicU64>,
    total: u64,
    progress: Progress,
}

impl ByteCounter {
    pub fn new(total: u64, progress: Progress) -> Self {
        Self {
            done: Arc::new(AtomicU64::new(0)),
            total,
            progress,
        }
    }

    pub fn add(&self, n: u64) {
        let done = self.done.fetch_add(n, Ordering::Relaxed) + n;
        self.progress.set_ratio(done.min(self.total), self.total);
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}

/// Fetches single content locations into the local cache, resuming from
/// `.part` files left by an earlier run.
pub struct Downloader {
    client: Client,
    base: Url,
    cache_dir: PathBuf,
    rate_limiter: Option<(Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>, NonZeroU32)>,
    verify_mode: VerifyMode,
}

impl Downloader {
    pub fn new(client: Client, base: Url, cache_dir: PathBuf, rate_limit: Option<u32>, verify_mode: VerifyMode) -> Self {
        let rate_limiter = rate_limit.and_then(NonZeroU32::new).map(|limit| {
            let quota = Quota::per_second(limit);
            (Arc::new(RateLimiter::direct(quota)), limit)
        });

        Self {
            client,
            base,
            cache_dir,
            rate_limiter,
            verify_mode,
        }
    }

    pub fn cache_path(&self, location: &ContentLocation) -> Result<PathBuf> {
        Ok(self.cache_dir.join(cache_file_name(&location.id)?))
    }

    /// Bytes still missing locally for `location`. Complete cached files
    /// count zero, partial downloads count what is left.
    pub async fn remaining_bytes(&self, location: &ContentLocation) -> Result<u64> {
        let filepath = self.cache_path(location)?;

        if let Ok(metadata) = fs::metadata(&filepath).await {
            match location.size {
                Some(size) if size != metadata.len() => {
                    log::debug!("{} is stale ({} != {} bytes)", location.id, metadata.len(), size);
                    return Ok(size);
                }
                _ => return Ok(0),
            }
        }

        let total = match location.size {
            Some(size) => size,
            None => self.probe_size(location).await?,
        };
        let part_filepath = part_path(&filepath);
        let partial = fs::metadata(&part_filepath)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if partial > 0 && partial >= total {
            return self.settle_part(location, &part_filepath, &filepath, partial, total).await;
        }
        Ok(total - partial)
    }

    /// A part file holding exactly `total` bytes only needs verifying and
    /// moving into place. Oversized or corrupt parts are discarded and
    /// count in full.
    async fn settle_part(
        &self,
        location: &ContentLocation,
        part_filepath: &Path,
        filepath: &Path,
        partial: u64,
        total: u64,
    ) -> Result<u64> {
        if partial == total {
            let expected = self.expected_hash(location)?;
            match self.finish(location, part_filepath, filepath, expected).await {
                Ok(()) => return Ok(0),
                Err(UpdateError::Network(reason)) => log::warn!("{}", reason),
                Err(e) => return Err(e),
            }
        } else {
            log::debug!("{} part is oversized ({} > {} bytes)", location.id, partial, total);
        }
        let _ = fs::remove_file(part_filepath).await;
        Ok(total)
    }

    fn expected_hash(&self, location: &ContentLocation) -> Result<Option<String>> {
        match (&location.hash, self.verify_mode) {
            (_, VerifyMode::Off) => Ok(None),
            (Some(hash), _) => Ok(Some(hash.clone())),
            (None, VerifyMode::On) => Err(UpdateError::UnexpectedAssetShape(format!(
                "{} carries no hash",
                location.id
            ))),
            (None, VerifyMode::Auto) => Ok(None),
        }
    }

    /// Verify a fully fetched part file and rename it into place.
    async fn finish(
        &self,
        location: &ContentLocation,
        part_filepath: &Path,
        filepath: &Path,
        expected_hash: Option<String>,
    ) -> Result<()> {
        if let Some(expected) = expected_hash {
            let computed = crate::hashing::calculate_hash(part_filepath)
                .await
                .map_err(|e| UpdateError::storage(part_filepath, e))?;
            if !expected.eq_ignore_ascii_case(&computed) {
                // A corrupt partial file must not be resumed from.
                let _ = fs::remove_file(part_filepath).await;
                return Err(UpdateError::Network(format!(
                    "hash mismatch for {}: expected {}, got {}",
                    location.id, expected, computed
                )));
            }
        }

        fs::rename(part_filepath, filepath)
            .await
            .map_err(|e| UpdateError::storage(filepath, e))?;
        log::debug!("completed {}", location.id);
        Ok(())
    }

    async fn probe_size(&self, location: &ContentLocation) -> Result<u64> {
        let url = resolve_url(&self.base, &location.id)?;
        let resp = self.client.head(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(UpdateError::Network(format!("HEAD {} returned {}", url, resp.status())));
        }
        match resp.content_length() {
            Some(len) if len > 0 => Ok(len),
            _ => Err(UpdateError::UnexpectedAssetShape(format!(
                "{} has no known size",
                location.id
            ))),
        }
    }

    pub async fn fetch(&self, location: &ContentLocation, counter: &ByteCounter) -> Result<()> {
        let filepath = self.cache_path(location)?;

        if let Ok(metadata) = fs::metadata(&filepath).await {
            if location.size.map_or(true, |size| size == metadata.len()) {
                let modified: Option<DateTime<Local>> = metadata.modified().ok().map(Into::into);
                log::debug!(
                    "skipped {} ({}, cached {})",
                    location.id,
                    HumanBytes(metadata.len()),
                    modified
                        .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default()
                );
                return Ok(());
            }
            fs::remove_file(&filepath)
                .await
                .map_err(|e| UpdateError::storage(&filepath, e))?;
        }

        let expected_hash = self.expected_hash(location)?;

        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| UpdateError::storage(&self.cache_dir, e))?;
        let part_filepath = part_path(&filepath);

        let mut downloaded_len = 0;
        if let Ok(metadata) = fs::metadata(&part_filepath).await {
            downloaded_len = metadata.len();
        }
        if location.size.is_some_and(|size| downloaded_len > size) {
            log::debug!("{} part is oversized; restarting", location.id);
            downloaded_len = 0;
        }

        if downloaded_len > 0 && location.size == Some(downloaded_len) {
            log::debug!("{} already fully fetched", location.id);
        } else {
            let url = resolve_url(&self.base, &location.id)?;
            let mut request = self.client.get(url.clone());
            if downloaded_len > 0 {
                request = request.header(header::RANGE, format!("bytes={}-", downloaded_len));
            }

            let response = request.send().await?;
            if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && downloaded_len > 0 {
                // Partial file already holds everything the server has.
                log::debug!("{} already fully fetched", location.id);
            } else {
                if !response.status().is_success() {
                    return Err(UpdateError::Network(format!("GET {} returned {}", url, response.status())));
                }
                // Servers ignoring the range send the whole body again.
                let append = downloaded_len > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
                if downloaded_len > 0 && !append {
                    log::debug!("{} does not support resume; restarting", url);
                }

                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(append)
                    .truncate(!append)
                    .open(&part_filepath)
                    .await
                    .map_err(|e| UpdateError::storage(&part_filepath, e))?;

                let mut stream = response.bytes_stream();
                while let Some(item) = stream.next().await {
                    let chunk = item?;
                    let len = chunk.len();
                    if len == 0 {
                        continue;
                    }
                    self.throttle(len).await;
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| UpdateError::storage(&part_filepath, e))?;
                    counter.add(len as u64);
                }

                file.flush().await.map_err(|e| UpdateError::storage(&part_filepath, e))?;
            }
        }

        self.finish(location, &part_filepath, &filepath, expected_hash).await
    }

    async fn throttle(&self, len: usize) {
        let Some((limiter, burst)) = &self.rate_limiter else {
            return;
        };
        let mut left = u32::try_from(len).unwrap_or(u32::MAX);
        while left > 0 {
            let step = left.min(burst.get());
            if let Some(n) = NonZeroU32::new(step) {
                // `step` never exceeds the burst size, so this cannot fail.
                let _ = limiter.until_n_ready(n).await;
            }
            left -= step;
        }
    }
}

pub fn part_path(filepath: &Path) -> PathBuf {
    let mut name = filepath.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    filepath.with_file_name(name)
}
