use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::{Job, JobStatus, StatusChange};

/// Something that happened to a job and may move its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
    /// A worker admitted the job.
    Start,
    /// Every targeted module has a recorded result.
    Finish,
    /// Orchestrator-level failure (expansion, persistence, or zero successes when
    /// configured to treat that as failure).
    Fail,
    /// Cancellation was observed.
    Cancel,
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobEvent::Start => write!(f, "start"),
            JobEvent::Finish => write!(f, "finish"),
            JobEvent::Fail => write!(f, "fail"),
            JobEvent::Cancel => write!(f, "cancel"),
        }
    }
}

/// A status change that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition: cannot {event} a {from} job")]
pub struct TransitionError {
    pub from: JobStatus,
    pub event: JobEvent,
}

/// Validates and applies job status transitions.
///
/// ```text
/// queued ──start──▶ running ──finish──▶ completed
///   │                  ├────fail──────▶ failed
///   └──cancel──┐       └────cancel────▶ cancelled
///              └─────────────────────▶ cancelled
/// ```
///
/// Terminal states accept no events.
pub struct JobStateMachine;

impl JobStateMachine {
    pub fn target(from: JobStatus, event: JobEvent) -> Result<JobStatus, TransitionError> {
        let to = match (from, event) {
            (JobStatus::Queued, JobEvent::Start) => JobStatus::Running,
            (JobStatus::Queued, JobEvent::Cancel) => JobStatus::Cancelled,
            (JobStatus::Running, JobEvent::Finish) => JobStatus::Completed,
            (JobStatus::Running, JobEvent::Fail) => JobStatus::Failed,
            (JobStatus::Running, JobEvent::Cancel) => JobStatus::Cancelled,
            _ => return Err(TransitionError { from, event }),
        };
        Ok(to)
    }

    /// Apply `event` to `job`, stamping timestamps and the audit trail. The job is
    /// left untouched when the transition is illegal.
    pub fn apply(job: &mut Job, event: JobEvent) -> Result<Transition, TransitionError> {
        let from = job.status;
        let to = Self::target(from, event)?;
        let now = Utc::now();

        job.status = to;
        job.status_history.push(StatusChange { from, to, at: now });
        if to == JobStatus::Running {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.completed_at = Some(now);
        }
        Ok(Transition { from, to })
    }
}
