use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::UpdaterConfig;
use crate::error::{Result, UpdateError};
use crate::flag::{DownloadFlag, FlagStore};
use crate::operation::{AsyncOperation, Progress};
use crate::progress::ProgressSink;
use crate::providers::Services;
use crate::resolver::resolve_all;
use crate::state::{Outcome, ProgressSample, RunReport, UpdateState};

/// Drives one update run: catalog check, catalog apply, size query and
/// content download, in that order, with at most one stage outstanding.
///
/// The download flag is set when the run starts and only cleared once a
/// download stage settles, so a process killed anywhere in between leaves
/// it set for the next run.
pub struct UpdateCoordinator {
    services: Services,
    flag: Box<dyn FlagStore>,
    sink: Arc<dyn ProgressSink>,
    catalog_timeout: Duration,
    tick_interval: Duration,
    state: UpdateState,
    cancel: CancellationToken,
}

impl UpdateCoordinator {
    pub fn new(config: &UpdaterConfig, services: Services, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            services,
            flag: Box::new(DownloadFlag::in_dir(&config.data_dir)),
            sink,
            catalog_timeout: config.catalog_timeout,
            tick_interval: config.tick_interval,
            state: UpdateState::Idle,
            cancel: CancellationToken::new(),
        }
    }

    /// Keep the download flag somewhere other than `<data>/down.lock`.
    pub fn with_flag(mut self, flag: impl FlagStore + 'static) -> Self {
        self.flag = Box::new(flag);
        self
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Run the whole pipeline. Never fails: every stage error is folded
    /// into the returned report.
    pub async fn run(&mut self) -> RunReport {
        self.cancel = CancellationToken::new();
        self.set_state(UpdateState::Idle);
        self.mark_need_download(true);

        self.sink.on_message("checking for content updates");
        self.sink.on_progress(&ProgressSample::new(self.state, 0.0));

        let outcome = self.run_stages().await;
        self.complete(outcome)
    }

    async fn run_stages(&mut self) -> Outcome {
        self.set_state(UpdateState::CheckingCatalogs);
        let started = Instant::now();
        let catalogs = self.services.catalogs.clone();
        let op = self.spawn_stage(move |progress| async move {
            catalogs.check_for_updates(false, &progress).await
        });

        let updates = match self.await_stage(op, Some(self.catalog_timeout)).await {
            Ok(updates) => updates,
            Err(UpdateError::Timeout(limit)) => {
                self.cancel.cancel();
                self.set_state(UpdateState::CatalogsChecked);
                log::warn!("catalog check did not settle within {:?}; skipping this run", limit);
                return Outcome::Failed(UpdateError::Timeout(limit).to_string());
            }
            Err(e) => {
                log::warn!("catalog check failed: {}", e);
                Vec::new()
            }
        };
        let need_update = !updates.is_empty();
        log::info!(
            "catalog check ({}) took {} ms",
            need_update,
            started.elapsed().as_millis()
        );
        self.set_state(UpdateState::CatalogsChecked);

        if need_update {
            self.apply_catalogs(updates).await;
        }

        // Literal gate: the flag written as "need download" is read back as
        // a proceed switch. Within a run it was set above, so this only
        // skips when the flag could not be persisted as true.
        if !self.flag.read() {
            log::info!("download flag is clear; nothing to update");
            return Outcome::UpToDate;
        }

        self.sink.on_message("checking content for updates");
        self.check_and_download().await
    }

    async fn apply_catalogs(&mut self, updates: Vec<String>) {
        self.set_state(UpdateState::ApplyingCatalogs);
        let started = Instant::now();
        let catalogs = self.services.catalogs.clone();
        let op = self.spawn_stage(move |progress| async move {
            catalogs.update_catalogs(&updates, false, &progress).await
        });

        if let Err(e) = self.await_stage(op, None).await {
            log::warn!("applying catalogs failed: {}", e);
        }
        self.mark_need_download(true);
        log::info!("catalogs applied in {} ms", started.elapsed().as_millis());
    }

    async fn check_and_download(&mut self) -> Outcome {
        self.set_state(UpdateState::CheckingDataSize);
        let locations = Arc::new(resolve_all(self.services.registry.as_ref()));

        let started = Instant::now();
        let content = self.services.content.clone();
        let query = locations.clone();
        let op = self.spawn_stage(move |progress| async move {
            content.download_size(&query, &progress).await
        });
        // No deadline: an unreachable size service stalls the run.
        let size = match self.await_stage(op, None).await {
            Ok(size) => size,
            Err(e) => {
                log::warn!("download size query failed: {}", e);
                return Outcome::Failed(format!("size query failed: {}", e));
            }
        };
        log::info!(
            "download size {} bytes for {} locations, checked in {} ms",
            size,
            locations.len(),
            started.elapsed().as_millis()
        );

        if size == 0 {
            return Outcome::UpToDate;
        }

        self.set_state(UpdateState::DownloadingData);
        self.mark_need_download(true);
        let started = Instant::now();
        let content = self.services.content.clone();
        let op = self.spawn_stage(move |progress| async move {
            content.download_dependencies(&locations, &progress).await
        });
        let result = self.await_stage(op, None).await;
        log::info!("download settled in {} ms", started.elapsed().as_millis());

        // Any settlement clears the flag, failed downloads included.
        self.mark_need_download(false);
        match result {
            Ok(()) => Outcome::Updated { bytes: size },
            Err(e) => {
                log::warn!("download failed: {}", e);
                Outcome::Failed(format!("download failed: {}", e))
            }
        }
    }

    fn complete(&mut self, outcome: Outcome) -> RunReport {
        let last_stage = self.state;
        self.sink.on_progress(&ProgressSample::new(last_stage, 1.0));
        let report = RunReport::new(last_stage, outcome);
        self.set_state(UpdateState::Complete);
        self.sink.on_complete(&report);
        report
    }

    fn spawn_stage<T, F, Fut>(&self, work: F) -> AsyncOperation<T>
    where
        T: Send + 'static,
        F: FnOnce(Progress) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let progress = Progress::new();
        AsyncOperation::spawn(self.cancel.child_token(), progress.clone(), work(progress))
    }

    /// Wait for `op` to settle, sampling its progress every tick. With a
    /// deadline, settles as `UpdateError::Timeout` once it elapses.
    async fn await_stage<T>(&self, mut op: AsyncOperation<T>, deadline: Option<Duration>) -> Result<T> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let watchdog = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                biased;
                result = &mut op => return result,
                _ = &mut watchdog => {
                    op.cancel();
                    return Err(UpdateError::Timeout(deadline.unwrap_or_default()));
                }
                _ = ticker.tick() => {
                    self.sink.on_progress(&ProgressSample::new(self.state, op.percent_complete()));
                }
            }
        }
    }

    fn set_state(&mut self, state: UpdateState) {
        log::debug!("SetState({})", state);
        self.state = state;
    }

    fn mark_need_download(&self, need_download: bool) {
        if let Err(e) = self.flag.write(need_download) {
            log::warn!("could not persist download flag: {}", e);
        }
    }
}
