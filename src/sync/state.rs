//! Job state machine and status reporting

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::checkpoint::{Checkpoint, SyncStats};
use crate::cache::CacheStats;
use crate::dedup::DedupStats;
use crate::error::{Error, Result};

// =============================================================================
// Job State Machine
// =============================================================================

/// States of a synchronization job
///
/// ```text
/// Idle → Running → {Paused, Completed, Cancelled, Failed}
/// Paused → {Running, Cancelled, Failed}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum JobState {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Paused, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running | JobState::Paused)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "Idle",
            JobState::Running => "Running",
            JobState::Paused => "Paused",
            JobState::Completed => "Completed",
            JobState::Cancelled => "Cancelled",
            JobState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// One recorded transition
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
    pub message: String,
    /// Time spent in `from`
    pub duration_ms: u64,
}

/// Observable job status
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    pub stats: SyncStats,
    pub last_checkpoint: Option<Checkpoint>,
    /// Cursor the run resumed after, if it resumed
    pub resumed_from: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub transitions: Vec<StateTransition>,
}

impl JobStatus {
    pub fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: JobState::Idle,
            stats: SyncStats::default(),
            last_checkpoint: None,
            resumed_from: None,
            started_at: None,
            finished_at: None,
            error: None,
            transitions: Vec::new(),
        }
    }

    /// Move to `next`, recording the transition
    pub fn transition(&mut self, next: JobState, message: &str) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        let since = self
            .transitions
            .last()
            .map(|t| t.at)
            .or(self.started_at)
            .unwrap_or(now);

        self.transitions.push(StateTransition {
            from: self.state,
            to: next,
            at: now,
            message: message.to_string(),
            duration_ms: (now - since).num_milliseconds().max(0) as u64,
        });
        self.state = next;

        if next == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Move to `Failed`, keeping the error text
    pub fn fail(&mut self, error: &Error) -> Result<()> {
        self.error = Some(error.to_string());
        self.transition(JobState::Failed, &error.to_string())
    }

    pub fn duration(&self) -> Duration {
        match (self.started_at, self.finished_at.or_else(|| Some(Utc::now()))) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or(Duration::ZERO),
            _ => Duration::ZERO,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub state: JobState,
    pub stats: SyncStats,
    pub resumed_from: Option<u64>,
    pub last_cursor: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub transitions: Vec<StateTransition>,
    pub cache: CacheStats,
    pub dedup: DedupStats,
}

impl JobReport {
    pub fn new(status: &JobStatus, last_cursor: Option<u64>, cache: CacheStats, dedup: DedupStats) -> Self {
        Self {
            job_id: status.job_id.clone(),
            state: status.state,
            stats: status.stats,
            resumed_from: status.resumed_from,
            last_cursor,
            started_at: status.started_at,
            finished_at: status.finished_at,
            duration_ms: status.duration().as_millis() as u64,
            error: status.error.clone(),
            transitions: status.transitions.clone(),
            cache,
            dedup,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
