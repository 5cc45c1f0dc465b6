//! Job handles and their lifecycle.
//!
//! ```text
//! Queued ──> Running ──> Completed
//!   │  │        │  └────> Failed
//!   │  │        └───────> TimedOut
//!   │  └──> Completed | Failed
//!   └─────> TimedOut
//! ```
//!
//! A handle is created `Queued` by the submitter and only the tracker
//! moves it. Once terminal it never changes again.

use std::fmt;
use std::time::Duration;

use imagegen_comfyui::history::ImageRef;
use imagegen_core::types::Timestamp;
use serde::Serialize;

use crate::status::EngineFailure;

/// Engine-assigned job identifier (ComfyUI's `prompt_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Completed)
                | (Queued, Failed)
                | (Queued, TimedOut)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded status change. `at` is tracker clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: Duration,
}

/// A submitted job and everything learned about it while tracking.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: JobId,
    client_id: String,
    submitted_at: Timestamp,
    status: JobStatus,
    transitions: Vec<Transition>,
    failure: Option<EngineFailure>,
    outputs: Vec<ImageRef>,
}

impl JobHandle {
    pub(crate) fn new(
        job_id: JobId,
        client_id: impl Into<String>,
        submitted_at: Timestamp,
    ) -> Self {
        Self {
            job_id,
            client_id: client_id.into(),
            submitted_at,
            status: JobStatus::Queued,
            transitions: Vec::new(),
            failure: None,
            outputs: Vec::new(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn submitted_at(&self) -> Timestamp {
        self.submitted_at
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// The engine's error payload, once the job has `Failed`.
    pub fn failure(&self) -> Option<&EngineFailure> {
        self.failure.as_ref()
    }

    /// Save-node images reported while tracking, if the status source
    /// saw them. Empty means they must be looked up in history.
    pub fn outputs(&self) -> &[ImageRef] {
        &self.outputs
    }

    /// Move to `to` at clock time `at`. Illegal or no-op transitions are
    /// ignored; returns whether the status changed.
    pub(crate) fn transition(&mut self, to: JobStatus, at: Duration) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        let from = self.status;
        self.status = to;
        self.transitions.push(Transition { from, to, at });
        tracing::debug!(job_id = %self.job_id, %from, %to, at_ms = at.as_millis() as u64, "Job transition");
        true
    }

    pub(crate) fn record_failure(&mut self, failure: EngineFailure) {
        self.failure = Some(failure);
    }

    pub(crate) fn record_outputs(&mut self, outputs: Vec<ImageRef>) {
        self.outputs = outputs;
    }
}
