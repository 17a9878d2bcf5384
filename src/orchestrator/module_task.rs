//! One module through the pipeline: fetch, Stage A, Stage B, verify, persist.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CancelPolicy;
use crate::content::{ContentFetcher, ModuleContent, ModuleRef};
use crate::pipeline::{
    CandidateCard, Generator, StageError, Summarizer, VerificationMode, Verifier,
};
use crate::resilience::{RetryError, RetryOptions, with_retry};
use crate::state_machine::ModuleResult;
use crate::store::{DeckStore, ReviewItem, ReviewStore, StoreError};

/// Everything a module task needs, shared by all modules of one job.
pub(crate) struct ModulePipeline {
    pub job_id: String,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub decks: Arc<dyn DeckStore>,
    pub reviews: Arc<dyn ReviewStore>,
    pub summarizer: Summarizer,
    pub generator: Generator,
    pub verifier: Verifier,
    pub verification_mode: VerificationMode,
    pub fetch_retry: RetryOptions,
    pub cancel_policy: CancelPolicy,
}

impl ModulePipeline {
    /// Stage failures become a failed [`ModuleResult`]; only persistence errors
    /// escape, since those fail the whole job. `None` means the job was cancelled under
    /// [`CancelPolicy::Abandon`] before anything was persisted. Once a deck or review
    /// item is written the result is always returned, so the job accounts for it.
    pub async fn run(
        &self,
        module: &ModuleRef,
        cancel: &CancellationToken,
    ) -> Result<Option<ModuleResult>, StoreError> {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;
        let abandoned = || self.cancel_policy == CancelPolicy::Abandon && cancel.is_cancelled();

        let cards = match self.produce_cards(module, cancel).await {
            Ok(cards) => cards,
            Err(_) if abandoned() => {
                debug!(job_id = %self.job_id, module_id = %module.module_id, "abandoning module of cancelled job");
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    job_id = %self.job_id,
                    course_id = %module.course_id,
                    module_id = %module.module_id,
                    code = e.code(),
                    class = %e.class(),
                    error = %e,
                    "module failed"
                );
                return Ok(Some(ModuleResult::failed(
                    &module.course_id,
                    &module.module_id,
                    e.code(),
                    &e.to_string(),
                    elapsed_ms(),
                )));
            }
        };
        if abandoned() {
            debug!(job_id = %self.job_id, module_id = %module.module_id, "abandoning module of cancelled job");
            return Ok(None);
        }

        let (publishable, for_review): (Vec<CandidateCard>, Vec<CandidateCard>) =
            cards.into_iter().partition(CandidateCard::is_publishable);
        let cards_published = publishable.len();
        let cards_for_review = for_review.len();

        let deck_version = if publishable.is_empty() {
            None
        } else {
            let deck = self
                .decks
                .publish(&module.course_id, &module.module_id, publishable)
                .await?;
            Some(deck.version)
        };
        for card in for_review {
            self.reviews
                .push(ReviewItem::pending(
                    card,
                    &module.course_id,
                    &module.module_id,
                    &self.job_id,
                ))
                .await?;
        }

        info!(
            job_id = %self.job_id,
            course_id = %module.course_id,
            module_id = %module.module_id,
            cards_published,
            cards_for_review,
            deck_version,
            "module complete"
        );
        Ok(Some(ModuleResult::succeeded(
            &module.course_id,
            &module.module_id,
            cards_published,
            cards_for_review,
            deck_version,
            elapsed_ms(),
        )))
    }

    async fn produce_cards(
        &self,
        module: &ModuleRef,
        cancel: &CancellationToken,
    ) -> Result<Vec<CandidateCard>, StageError> {
        let content = self.fetch(module, cancel).await?;
        debug!(module_id = %module.module_id, chunks = content.chunks.len(), "fetched module content");

        let title = content.title.as_deref().or(module.title.as_deref());
        let stage_a = self
            .summarizer
            .summarize(&module.module_id, title, &content.chunks, cancel)
            .await?;
        let mut cards = self
            .generator
            .generate(&stage_a, &content.chunks, cancel)
            .await?;
        self.verifier
            .verify_cards_batch(&mut cards, self.verification_mode, cancel)
            .await;
        Ok(cards)
    }

    async fn fetch(
        &self,
        module: &ModuleRef,
        cancel: &CancellationToken,
    ) -> Result<ModuleContent, StageError> {
        let outcome = with_retry(
            |_| self.fetcher.fetch_module(&module.course_id, &module.module_id),
            &self.fetch_retry,
            cancel,
        )
        .await;
        match outcome.result {
            Ok(content) => Ok(content),
            Err(RetryError::Cancelled) => Err(StageError::Cancelled),
            Err(RetryError::Operation(e)) => Err(StageError::ContentFetch(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::InMemoryFetcher;
    use crate::pipeline::GeneratorSettings;
    use crate::store::{InMemoryDeckStore, InMemoryReviewStore};
    use crate::test_support::hr_chunks;

    fn pipeline(fetcher: InMemoryFetcher) -> (ModulePipeline, Arc<InMemoryDeckStore>, Arc<InMemoryReviewStore>) {
        pipeline_with(fetcher, CancelPolicy::Finish)
    }

    fn pipeline_with(
        fetcher: InMemoryFetcher,
        cancel_policy: CancelPolicy,
    ) -> (ModulePipeline, Arc<InMemoryDeckStore>, Arc<InMemoryReviewStore>) {
        let decks = Arc::new(InMemoryDeckStore::new());
        let reviews = Arc::new(InMemoryReviewStore::new());
        let p = ModulePipeline {
            job_id: "job-1".into(),
            fetcher: Arc::new(fetcher),
            decks: decks.clone(),
            reviews: reviews.clone(),
            summarizer: Summarizer::new(None, 24_000),
            generator: Generator::new(None, GeneratorSettings::default()),
            verifier: Verifier::heuristic(0.5),
            verification_mode: VerificationMode::Heuristic,
            fetch_retry: RetryOptions::default(),
            cancel_policy,
        };
        (p, decks, reviews)
    }

    fn module(id: &str) -> ModuleRef {
        ModuleRef {
            course_id: "hr".into(),
            module_id: id.into(),
            title: None,
        }
    }

    #[tokio::test]
    async fn empty_module_is_insufficient_content() {
        let (p, decks, _) = pipeline(InMemoryFetcher::new());
        let result = p.run(&module("empty"), &CancellationToken::new()).await.unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("InsufficientContent"));
        assert!(decks.latest("hr", "empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mock_run_publishes_verified_cards() {
        let fetcher = InMemoryFetcher::new().with_module("hr", "handbook", Some("HR Handbook"), hr_chunks());
        let (p, decks, reviews) = pipeline(fetcher);
        let result = p.run(&module("handbook"), &CancellationToken::new()).await.unwrap().unwrap();

        assert!(result.success, "{result:?}");
        assert!(result.cards_published > 0);
        assert_eq!(result.deck_version, Some(1));
        let deck = decks.latest("hr", "handbook").await.unwrap().unwrap();
        assert_eq!(deck.cards.len(), result.cards_published);
        assert!(deck.cards.iter().all(CandidateCard::is_publishable));
        assert_eq!(
            reviews.list_pending(100).await.unwrap().len(),
            result.cards_for_review
        );
    }

    #[tokio::test]
    async fn cancelled_before_fetch_reports_cancelled() {
        let fetcher = InMemoryFetcher::new().with_module("hr", "handbook", None, hr_chunks());
        let (p, _, _) = pipeline(fetcher);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = p.run(&module("handbook"), &cancel).await.unwrap().unwrap();
        assert_eq!(result.error.as_deref(), Some("Cancelled"));
    }

    #[tokio::test]
    async fn abandoned_module_persists_nothing() {
        let fetcher = InMemoryFetcher::new().with_module("hr", "handbook", None, hr_chunks());
        let (p, decks, reviews) = pipeline_with(fetcher, CancelPolicy::Abandon);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(p.run(&module("handbook"), &cancel).await.unwrap().is_none());
        assert!(decks.latest("hr", "handbook").await.unwrap().is_none());
        assert!(reviews.list_pending(100).await.unwrap().is_empty());
    }
}
