use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, UpdateError};

/// Shared `[0,1]` completion fraction, written by a stage and polled by the
/// coordinator on every tick.
#[derive(Debug, Clone, Default)]
pub struct Progress(Arc<AtomicU32>);

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, fraction: f32) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.0.store(fraction.to_bits(), Ordering::Relaxed);
    }

    pub fn set_ratio(&self, done: u64, total: u64) {
        if total == 0 {
            self.set(1.0);
        } else {
            self.set(done as f32 / total as f32);
        }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// A spawned stage with a pollable progress value and a cancellation handle.
///
/// Awaiting the operation yields the stage result; cancelling it (directly
/// or through the parent token) settles it as `UpdateError::Cancelled`.
pub struct AsyncOperation<T> {
    progress: Progress,
    cancel: CancellationToken,
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> AsyncOperation<T> {
    pub fn spawn<F>(cancel: CancellationToken, progress: Progress, work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let token = cancel.clone();
        let done = progress.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(UpdateError::Cancelled),
                result = work => {
                    if result.is_ok() {
                        done.set(1.0);
                    }
                    result
                }
            }
        });
        Self {
            progress,
            cancel,
            handle,
        }
    }
}

impl<T> AsyncOperation<T> {
    pub fn percent_complete(&self) -> f32 {
        self.progress.get()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T> Future for AsyncOperation<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(UpdateError::Cancelled),
            Err(e) => Err(UpdateError::Network(format!("stage task failed: {}", e))),
        })
    }
}

impl<T> Drop for AsyncOperation<T> {
    fn drop(&mut self) {
        // An operation nobody awaits any more must not keep running.
        if !self.handle.is_finished() {
            self.cancel.cancel();
        }
    }
}
