//! Approval gate for cards that failed verification.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::pipeline::{CandidateCard, Deck, HallucinationRisk, Verdict};
use crate::store::{DeckStore, ReviewItem, ReviewStore, StoreError};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("review item not found: {0}")]
    NotFound(String),

    #[error("card {0} was already approved")]
    Conflict(String),

    #[error("invalid edit: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReviewError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ReviewError::NotFound(id),
            StoreError::Conflict(id) => ReviewError::Conflict(id),
            other => ReviewError::Store(other),
        }
    }
}

/// An approved item and the deck version it was published into.
#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub item: ReviewItem,
    pub deck: Deck,
}

#[derive(Clone)]
pub struct ReviewQueue {
    reviews: Arc<dyn ReviewStore>,
    decks: Arc<dyn DeckStore>,
}

impl ReviewQueue {
    pub fn new(reviews: Arc<dyn ReviewStore>, decks: Arc<dyn DeckStore>) -> Self {
        Self { reviews, decks }
    }

    pub async fn list_pending(&self, limit: usize) -> Result<Vec<ReviewItem>, ReviewError> {
        Ok(self.reviews.list_pending(limit).await?)
    }

    /// Accept the card as generated and publish it into a new deck version.
    pub async fn approve(&self, card_id: &str) -> Result<Approval, ReviewError> {
        let before = self.pending_item(card_id).await?;
        let claimed = self.reviews.approve(card_id, None).await?;
        self.publish(claimed, before, "approved by reviewer").await
    }

    /// Replace the question and/or answer, then approve and publish.
    pub async fn edit(
        &self,
        card_id: &str,
        question: Option<String>,
        answer: Option<String>,
    ) -> Result<Approval, ReviewError> {
        let question = question.filter(|q| !q.trim().is_empty());
        let answer = answer.filter(|a| !a.trim().is_empty());
        if question.is_none() && answer.is_none() {
            return Err(ReviewError::Invalid(
                "provide a non-empty question or answer".into(),
            ));
        }

        let before = self.pending_item(card_id).await?;
        let mut card = before.card.clone();
        if let Some(question) = question {
            card.question = question.trim().to_string();
        }
        if let Some(answer) = answer {
            card.answer = answer.trim().to_string();
        }

        let claimed = self.reviews.approve(card_id, Some(card)).await?;
        self.publish(claimed, before, "edited and approved by reviewer").await
    }

    async fn pending_item(&self, card_id: &str) -> Result<ReviewItem, ReviewError> {
        self.reviews
            .get(card_id)
            .await?
            .ok_or_else(|| ReviewError::NotFound(card_id.to_string()))
    }

    /// Append the claimed card to the module deck. If the append fails the item goes
    /// back to `before`, so it stays pending and can be retried.
    async fn publish(
        &self,
        claimed: ReviewItem,
        before: ReviewItem,
        note: &str,
    ) -> Result<Approval, ReviewError> {
        let card = reviewed(claimed.card.clone(), note);
        let deck = match self
            .decks
            .append(&claimed.course_id, &claimed.module_id, vec![card])
            .await
        {
            Ok(deck) => deck,
            Err(e) => {
                warn!(card_id = %claimed.card.card_id, error = %e, "publishing review card failed, reopening");
                if let Err(restore) = self.reviews.restore(before).await {
                    error!(card_id = %claimed.card.card_id, error = %restore, "could not reopen review card");
                }
                return Err(e.into());
            }
        };
        info!(
            card_id = %claimed.card.card_id,
            course_id = %claimed.course_id,
            module_id = %claimed.module_id,
            deck_version = deck.version,
            "review card published"
        );
        Ok(Approval { item: claimed, deck })
    }
}

/// The automated verdict no longer describes a card a human signed off on; the
/// original stays on the review item.
fn reviewed(mut card: CandidateCard, note: &str) -> CandidateCard {
    let coverage = card
        .verification
        .as_ref()
        .map_or(0.0, |v| v.evidence_coverage);
    card.verification = Some(Verdict {
        verified: true,
        confidence: 1.0,
        issues: Vec::new(),
        evidence_coverage: coverage,
        hallucination_risk: HallucinationRisk::Low,
        note: note.to_string(),
    });
    card
}
