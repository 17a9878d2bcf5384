//! Persistence boundary. The orchestrator and review queue only see these traits;
//! [`memory`] provides the in-process implementations used by default and in tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{CandidateCard, Deck, Verdict};
use crate::state_machine::{Job, JobStatus};

pub use memory::{InMemoryDeckStore, InMemoryJobStore, InMemoryReviewStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new job. Fails with `Conflict` if the id is taken.
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;
    /// Overwrite the stored copy of an existing job.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;
    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError>;
    /// Newest first.
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait DeckStore: Send + Sync {
    /// Store `cards` as the next version of the module's deck. Version numbers are
    /// assigned atomically and increase by one per publish.
    async fn publish(
        &self,
        course_id: &str,
        module_id: &str,
        cards: Vec<CandidateCard>,
    ) -> Result<Deck, StoreError>;

    /// Publish a new version holding the latest deck's cards plus `cards`.
    async fn append(
        &self,
        course_id: &str,
        module_id: &str,
        cards: Vec<CandidateCard>,
    ) -> Result<Deck, StoreError>;

    async fn latest(&self, course_id: &str, module_id: &str) -> Result<Option<Deck>, StoreError>;

    /// Most recently generated deck for `module_id` in any course.
    async fn latest_for_module(&self, module_id: &str) -> Result<Option<Deck>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
}

/// A card that failed verification and waits for a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub card: CandidateCard,
    pub course_id: String,
    pub module_id: String,
    pub job_id: String,
    pub verdict: Option<Verdict>,
    pub status: ReviewStatus,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewItem {
    pub fn pending(card: CandidateCard, course_id: &str, module_id: &str, job_id: &str) -> Self {
        Self {
            verdict: card.verification.clone(),
            card,
            course_id: course_id.to_string(),
            module_id: module_id.to_string(),
            job_id: job_id.to_string(),
            status: ReviewStatus::Pending,
            queued_at: Utc::now(),
            resolved_at: None,
        }
    }
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn push(&self, item: ReviewItem) -> Result<(), StoreError>;
    async fn get(&self, card_id: &str) -> Result<Option<ReviewItem>, StoreError>;
    /// Oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<ReviewItem>, StoreError>;
    /// Atomically move a pending item to approved, optionally replacing its card.
    /// `NotFound` for unknown cards, `Conflict` if it was already approved.
    async fn approve(
        &self,
        card_id: &str,
        replacement: Option<CandidateCard>,
    ) -> Result<ReviewItem, StoreError>;
    /// Put an item back exactly as given, undoing an approval whose publish failed.
    async fn restore(&self, item: ReviewItem) -> Result<(), StoreError>;
}
