use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::state::{ProgressSample, RunReport};

const BAR_LENGTH: u64 = 1000;

/// Receiver of everything the coordinator wants shown to the user.
/// The coordinator never renders on its own.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, sample: &ProgressSample);

    fn on_message(&self, message: &str);

    fn on_complete(&self, report: &RunReport);
}

/// Terminal progress bar.
pub struct ConsoleSink {
    pb: ProgressBar,
}

impl ConsoleSink {
    pub fn new() -> Self {
        let pb = ProgressBar::new(BAR_LENGTH);
        pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { pb }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleSink {
    fn on_progress(&self, sample: &ProgressSample) {
        self.pb.set_position((sample.fraction * BAR_LENGTH as f32) as u64);
        self.pb.set_message(sample.state.to_string());
    }

    fn on_message(&self, message: &str) {
        self.pb.set_message(message.to_string());
    }

    fn on_complete(&self, report: &RunReport) {
        self.pb.set_position(BAR_LENGTH);
        self.pb.finish_with_message(report.message.clone());
    }
}

/// Headless sink that only logs.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_progress(&self, sample: &ProgressSample) {
        log::debug!("{}", sample.message);
    }

    fn on_message(&self, message: &str) {
        log::info!("{}", message);
    }

    fn on_complete(&self, report: &RunReport) {
        if report.success {
            log::info!("{}", report.message);
        } else {
            log::warn!("{}", report.message);
        }
    }
}
