use std::fmt;

/// Pipeline stages, in the order a run moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdateState {
    Idle,
    CheckingCatalogs,
    CatalogsChecked,
    ApplyingCatalogs,
    CheckingDataSize,
    DownloadingData,
    Complete,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One progress report pushed to the UI while a stage is pending.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub state: UpdateState,
    pub fraction: f32,
    pub message: String,
}

impl ProgressSample {
    pub fn new(state: UpdateState, fraction: f32) -> Self {
        let fraction = fraction.clamp(0.0, 1.0);
        Self {
            state,
            fraction,
            message: format!("{}: {:.2}", state, fraction),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Nothing needed fetching.
    UpToDate,
    /// Content was downloaded this run.
    Updated { bytes: u64 },
    Failed(String),
}

/// Terminal result of `UpdateCoordinator::run`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub state: UpdateState,
    /// Last stage the run was in before it completed.
    pub last_stage: UpdateState,
    pub success: bool,
    pub outcome: Outcome,
    pub message: String,
}

impl RunReport {
    pub fn new(last_stage: UpdateState, outcome: Outcome) -> Self {
        let success = !matches!(outcome, Outcome::Failed(_));
        let message = match &outcome {
            Outcome::Failed(reason) => format!(
                "download complete state:{} success:{} ({})",
                last_stage, success, reason
            ),
            _ => format!("download complete state:{} success:{}", last_stage, success),
        };
        Self {
            state: UpdateState::Complete,
            last_stage,
            success,
            outcome,
            message,
        }
    }
}
