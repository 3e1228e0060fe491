//! Typed error hierarchy for the bisection engine.
//!
//! Three top-level enums cover the three subsystem seams:
//! - `DriverError` — container engine failures, split into recoverable
//!   per-commit failures and fatal engine outages
//! - `HealthcheckError` — healthcheck exhaustion vs. checks that could not run
//! - `JobError` — job lifecycle and ad-hoc runner failures

use thiserror::Error;

/// Errors from the container driver.
///
/// `BuildFailed` and `StartFailed` are reproducible, commit-specific failures:
/// the replica marks the commit broken and moves on. `EngineUnavailable` means
/// the container engine itself is unreachable and aborts the replica.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Image build failed: {0}")]
    BuildFailed(String),

    #[error("Container start failed: {0}")]
    StartFailed(String),

    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    /// Whether this failure is specific to the commit under test, as opposed
    /// to the engine or the host being in trouble.
    pub fn is_commit_specific(&self) -> bool {
        matches!(self, DriverError::BuildFailed(_) | DriverError::StartFailed(_))
    }
}

/// Errors from the healthcheck runner.
#[derive(Debug, Error)]
pub enum HealthcheckError {
    #[error("Healthcheck on port {port} still failing after {retries} attempts")]
    Unhealthy { port: u16, retries: u32 },

    #[error("Healthcheck on port {port} could not run: {source}")]
    Failed {
        port: u16,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from the job coordinator and the ad-hoc runner.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Failed to clone {repository}: {source}")]
    CloneFailed {
        repository: String,
        #[source]
        source: git2::Error,
    },

    #[error("Failed to enumerate commits between {good} and {bad}: {source}")]
    EnumerateFailed {
        good: String,
        bad: String,
        #[source]
        source: git2::Error,
    },

    #[error("No commits found between {good} and {bad} (is {bad} a first-parent descendant of {good}?)")]
    NoCommits { good: String, bad: String },

    #[error("Job has not been run yet; no commit index available")]
    NotInitialized,

    #[error("Commit offset {offset} out of range (job has {count} commits)")]
    OffsetOutOfRange { offset: usize, count: usize },

    #[error("{failed} replica(s) failed")]
    ReplicasFailed { failed: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
