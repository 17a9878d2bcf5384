//! Process-wide counters for the orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::resilience::CircuitBreakerState;
use crate::state_machine::{JobStatus, ModuleResult};

#[derive(Debug, Default)]
pub struct OrchestratorMetrics {
    jobs_enqueued: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    modules_succeeded: AtomicU64,
    modules_failed: AtomicU64,
    cards_published: AtomicU64,
    cards_for_review: AtomicU64,
}

impl OrchestratorMetrics {
    pub fn job_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Completed => &self.jobs_completed,
            JobStatus::Failed => &self.jobs_failed,
            JobStatus::Cancelled => &self.jobs_cancelled,
            JobStatus::Queued | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn module_recorded(&self, result: &ModuleResult) {
        if result.success {
            self.modules_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.modules_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.cards_published
            .fetch_add(result.cards_published as u64, Ordering::Relaxed);
        self.cards_for_review
            .fetch_add(result.cards_for_review as u64, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        queued_jobs: usize,
        running_jobs: usize,
        breakers: Vec<CircuitBreakerState>,
    ) -> MetricsSnapshot {
        let cards_published = self.cards_published.load(Ordering::Relaxed);
        let cards_for_review = self.cards_for_review.load(Ordering::Relaxed);
        let total_cards = cards_published + cards_for_review;
        MetricsSnapshot {
            jobs_enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            queued_jobs,
            running_jobs,
            modules_succeeded: self.modules_succeeded.load(Ordering::Relaxed),
            modules_failed: self.modules_failed.load(Ordering::Relaxed),
            cards_published,
            cards_for_review,
            verification_rate: if total_cards == 0 {
                0.0
            } else {
                cards_published as f64 / total_cards as f64
            },
            breakers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_enqueued: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub modules_succeeded: u64,
    pub modules_failed: u64,
    pub cards_published: u64,
    pub cards_for_review: u64,
    /// Share of generated cards that passed verification.
    pub verification_rate: f64,
    pub breakers: Vec<CircuitBreakerState>,
}
