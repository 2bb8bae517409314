//! Remote job identity and lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a dispatched job. One job per cycle, so this is the cycle index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for JobId {
    fn from(cycle: usize) -> Self {
        Self(cycle as u64)
    }
}

/// Status reported by a poll of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Dispatched, no participant has started yet.
    Pending,
    /// At least one slot has been started or completed.
    Running,
    /// Every slot holds a completed submission.
    Finished,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// State of a single participant slot inside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Waiting for a participant.
    Pending,
    /// A participant is working; the reclaim deadline is running.
    Running,
    /// A submission has been stored.
    Finished,
    /// The deadline elapsed; the slot is open for reassignment.
    Reclaimed,
}

impl SlotState {
    /// Whether a new participant may be assigned to this slot.
    pub fn is_open(&self) -> bool {
        matches!(self, SlotState::Pending | SlotState::Reclaimed)
    }
}

/// Caller-side record of a dispatched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJob {
    pub id: JobId,
    pub slots: usize,
    pub status: JobStatus,
    pub polls: u64,
    pub dispatched_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RemoteJob {
    pub fn new(id: JobId, slots: usize) -> Self {
        Self {
            id,
            slots,
            status: JobStatus::Pending,
            polls: 0,
            dispatched_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record a poll result. `Finished` is terminal.
    pub fn observe(&mut self, status: JobStatus) {
        self.polls += 1;
        if self.status == JobStatus::Finished {
            return;
        }
        self.status = status;
        if status == JobStatus::Finished {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status == JobStatus::Finished
    }
}
