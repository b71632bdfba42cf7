//! Asynchronous report jobs
//!
//! Report endpoints follow one protocol: submit a job, poll its status until
//! it reaches a terminal state, then download the artifact it produced.
//!
//! ```text
//! Submitted -> Running -> { Running | Done | Failed | Canceled | NoData }
//! ```

mod artifact;
mod runner;

pub use artifact::{ArtifactError, ArtifactFormat, ArtifactParser, JsonArtifact};
pub use runner::{JobProtocol, JobRunner, StatusMethod};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a provider job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Running,
    Done,
    Failed,
    Canceled,
    /// Finished successfully with nothing to report
    NoData,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Failed | JobState::Canceled | JobState::NoData
        )
    }

    /// Map a provider status word onto a state.
    ///
    /// Returns `None` for words no provider is known to use.
    pub fn from_provider_status(status: &str) -> Option<Self> {
        let state = match status.trim().to_ascii_lowercase().as_str() {
            "new" | "pending" | "queued" | "waiting" | "processing" | "in_progress"
            | "running" => JobState::Running,
            "done" | "success" | "succeeded" | "completed" | "ready" => JobState::Done,
            "failed" | "error" => JobState::Failed,
            "canceled" | "cancelled" => JobState::Canceled,
            "no_data" | "nodata" | "empty" => JobState::NoData,
            _ => return None,
        };
        Some(state)
    }
}

/// A submitted provider job.
///
/// Created by [`JobRunner::submit`] and changed only by [`JobRunner::poll`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncJob {
    pub job_id: String,
    state: JobState,
    artifact_ref: Option<String>,
    error: Option<String>,
}

impl AsyncJob {
    fn submitted(job_id: String) -> Self {
        Self {
            job_id,
            state: JobState::Submitted,
            artifact_ref: None,
            error: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Download location; only set once the job is [`JobState::Done`]
    pub fn artifact_ref(&self) -> Option<&str> {
        self.artifact_ref.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn transition(&mut self, state: JobState, artifact_ref: Option<String>, error: Option<String>) {
        self.state = state;
        self.artifact_ref = if state == JobState::Done {
            artifact_ref
        } else {
            None
        };
        self.error = error;
    }
}
