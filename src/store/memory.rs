//! In-process stores backed by `DashMap` and `parking_lot` locks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use super::{DeckStore, JobStore, ReviewItem, ReviewStatus, ReviewStore, StoreError};
use crate::pipeline::{CandidateCard, Deck};
use crate::state_machine::{Job, JobStatus};

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<String, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        match self.jobs.entry(job.job_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "job {} already exists",
                job.job_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        match self.jobs.get_mut(&job.job_id) {
            Some(mut stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("job {}", job.job_id))),
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(job_id).map(|j| j.clone()))
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

type DeckKey = (String, String);

/// Keeps every published version so history can be inspected.
#[derive(Default)]
pub struct InMemoryDeckStore {
    decks: Mutex<HashMap<DeckKey, Vec<Deck>>>,
}

impl InMemoryDeckStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self, course_id: &str, module_id: &str) -> Vec<u64> {
        self.decks
            .lock()
            .get(&(course_id.to_string(), module_id.to_string()))
            .map(|history| history.iter().map(|d| d.version).collect())
            .unwrap_or_default()
    }

    fn push_version(
        &self,
        course_id: &str,
        module_id: &str,
        cards: Vec<CandidateCard>,
        keep_existing: bool,
    ) -> Deck {
        let mut decks = self.decks.lock();
        let history = decks
            .entry((course_id.to_string(), module_id.to_string()))
            .or_default();
        let (version, mut all_cards) = match history.last() {
            Some(prev) if keep_existing => (prev.version + 1, prev.cards.clone()),
            Some(prev) => (prev.version + 1, Vec::new()),
            None => (1, Vec::new()),
        };
        all_cards.extend(cards);
        let deck = Deck {
            module_id: module_id.to_string(),
            course_id: course_id.to_string(),
            cards: all_cards,
            generated_at: Utc::now(),
            version,
        };
        history.push(deck.clone());
        deck
    }
}

#[async_trait]
impl DeckStore for InMemoryDeckStore {
    async fn publish(
        &self,
        course_id: &str,
        module_id: &str,
        cards: Vec<CandidateCard>,
    ) -> Result<Deck, StoreError> {
        Ok(self.push_version(course_id, module_id, cards, false))
    }

    async fn append(
        &self,
        course_id: &str,
        module_id: &str,
        cards: Vec<CandidateCard>,
    ) -> Result<Deck, StoreError> {
        Ok(self.push_version(course_id, module_id, cards, true))
    }

    async fn latest(&self, course_id: &str, module_id: &str) -> Result<Option<Deck>, StoreError> {
        Ok(self
            .decks
            .lock()
            .get(&(course_id.to_string(), module_id.to_string()))
            .and_then(|history| history.last().cloned()))
    }

    async fn latest_for_module(&self, module_id: &str) -> Result<Option<Deck>, StoreError> {
        Ok(self
            .decks
            .lock()
            .iter()
            .filter(|((_, module), _)| module == module_id)
            .filter_map(|(_, history)| history.last())
            .max_by(|a, b| {
                a.generated_at
                    .cmp(&b.generated_at)
                    .then_with(|| a.version.cmp(&b.version))
            })
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryReviewStore {
    items: DashMap<String, ReviewItem>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn push(&self, item: ReviewItem) -> Result<(), StoreError> {
        self.items.insert(item.card.card_id.clone(), item);
        Ok(())
    }

    async fn get(&self, card_id: &str) -> Result<Option<ReviewItem>, StoreError> {
        Ok(self.items.get(card_id).map(|i| i.clone()))
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<ReviewItem>, StoreError> {
        let mut pending: Vec<ReviewItem> = self
            .items
            .iter()
            .filter(|i| i.status == ReviewStatus::Pending)
            .map(|i| i.clone())
            .collect();
        pending.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn approve(
        &self,
        card_id: &str,
        replacement: Option<CandidateCard>,
    ) -> Result<ReviewItem, StoreError> {
        let mut item = self
            .items
            .get_mut(card_id)
            .ok_or_else(|| StoreError::NotFound(format!("card {card_id}")))?;
        if item.status == ReviewStatus::Approved {
            return Err(StoreError::Conflict(format!("card {card_id} is already approved")));
        }
        if let Some(card) = replacement {
            item.card = card;
        }
        item.status = ReviewStatus::Approved;
        item.resolved_at = Some(Utc::now());
        Ok(item.clone())
    }

    async fn restore(&self, item: ReviewItem) -> Result<(), StoreError> {
        self.items.insert(item.card.card_id.clone(), item);
        Ok(())
    }
}
