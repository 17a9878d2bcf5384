//! Job orchestrator: owns the job lifecycle.
//!
//! Jobs are enqueued into an unbounded queue and admitted by a dispatcher up to
//! `max_running_jobs` at a time. Each admitted job expands its target into modules
//! and runs them through [`ModulePipeline`] with at most `max_concurrent_modules` in
//! flight. All status changes of a running job are made by the task processing it;
//! `cancel` only touches a job directly while it is still queued.

pub mod metrics;
mod module_task;

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::anthropic::{MessageSender, ModelTier};
use crate::config::CardforgeConfig;
use crate::content::{ContentFetcher, DirectoryFetcher, FetchError, InMemoryFetcher, ModuleRef};
use crate::error::CardforgeError;
use crate::pipeline::{Deck, Generator, GeneratorSettings, LlmInvoker, Summarizer, Verifier};
use crate::resilience::{
    CircuitBreakerState, CircuitState, ResilienceRegistry, RetryError, RetryOptions, RetryOutcome,
    with_retry,
};
use crate::review::ReviewQueue;
use crate::state_machine::{
    Job, JobEvent, JobMode, JobOutcome, JobRequest, JobSettings, JobStateMachine, JobStatus,
    JobSummary, Trigger,
};
use crate::store::{
    DeckStore, InMemoryDeckStore, InMemoryJobStore, InMemoryReviewStore, JobStore, ReviewStore,
    StoreError,
};

pub use metrics::{MetricsSnapshot, OrchestratorMetrics};
use module_task::ModulePipeline;

/// Live state of a job known to this process.
struct JobHandle {
    job: Mutex<Job>,
    cancel: CancellationToken,
}

impl JobHandle {
    fn snapshot(&self) -> Job {
        self.job.lock().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub mock_mode: bool,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub breakers: Vec<CircuitBreakerState>,
}

pub struct OrchestratorBuilder {
    config: CardforgeConfig,
    fetcher: Option<Arc<dyn ContentFetcher>>,
    sender: Option<Arc<dyn MessageSender>>,
    jobs: Option<Arc<dyn JobStore>>,
    decks: Option<Arc<dyn DeckStore>>,
    reviews: Option<Arc<dyn ReviewStore>>,
    registry: Option<Arc<ResilienceRegistry>>,
}

impl OrchestratorBuilder {
    pub fn fetcher(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Model endpoint. Ignored when the config asks for mock mode.
    pub fn sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn deck_store(mut self, decks: Arc<dyn DeckStore>) -> Self {
        self.decks = Some(decks);
        self
    }

    pub fn review_store(mut self, reviews: Arc<dyn ReviewStore>) -> Self {
        self.reviews = Some(reviews);
        self
    }

    pub fn registry(mut self, registry: Arc<ResilienceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the orchestrator and start its dispatcher. Must run inside a Tokio
    /// runtime. The dispatcher keeps the orchestrator alive until [`Orchestrator::shutdown`].
    pub fn start(self) -> Arc<Orchestrator> {
        let config = self.config;
        let fetcher = self.fetcher.unwrap_or_else(|| match &config.content.root {
            Some(root) => Arc::new(DirectoryFetcher::new(root.clone())),
            None => Arc::new(InMemoryFetcher::new()),
        });
        let registry = self.registry.unwrap_or_else(|| {
            Arc::new(ResilienceRegistry::new(
                (&config.circuit_breaker).into(),
                (&config.rate_limit).into(),
            ))
        });
        let sender = if config.orchestrator.use_mock {
            None
        } else {
            self.sender
        };

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Orchestrator {
            fetcher,
            sender,
            jobs: self.jobs.unwrap_or_else(|| Arc::new(InMemoryJobStore::new())),
            decks: self.decks.unwrap_or_else(|| Arc::new(InMemoryDeckStore::new())),
            reviews: self.reviews.unwrap_or_else(|| Arc::new(InMemoryReviewStore::new())),
            registry,
            handles: DashMap::new(),
            queue_tx,
            metrics: Arc::new(OrchestratorMetrics::default()),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            config,
        });

        tokio::spawn(Arc::clone(&orchestrator).dispatch(queue_rx));
        info!(
            mock_mode = orchestrator.sender.is_none(),
            max_running_jobs = orchestrator.config.orchestrator.max_running_jobs,
            "orchestrator started"
        );
        orchestrator
    }
}

pub struct Orchestrator {
    config: CardforgeConfig,
    fetcher: Arc<dyn ContentFetcher>,
    sender: Option<Arc<dyn MessageSender>>,
    jobs: Arc<dyn JobStore>,
    decks: Arc<dyn DeckStore>,
    reviews: Arc<dyn ReviewStore>,
    registry: Arc<ResilienceRegistry>,
    handles: DashMap<String, Arc<JobHandle>>,
    queue_tx: mpsc::UnboundedSender<String>,
    metrics: Arc<OrchestratorMetrics>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
}

impl Orchestrator {
    pub fn builder(config: CardforgeConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            fetcher: None,
            sender: None,
            jobs: None,
            decks: None,
            reviews: None,
            registry: None,
        }
    }

    pub fn config(&self) -> &CardforgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ResilienceRegistry> {
        &self.registry
    }

    pub fn is_mock(&self) -> bool {
        self.sender.is_none()
    }

    pub fn review_queue(&self) -> ReviewQueue {
        ReviewQueue::new(Arc::clone(&self.reviews), Arc::clone(&self.decks))
    }

    pub async fn enqueue(&self, request: JobRequest) -> Result<Job, CardforgeError> {
        self.enqueue_triggered(Trigger::Api, request).await
    }

    /// Create a queued job on behalf of `trigger` and hand it to the dispatcher.
    pub async fn enqueue_triggered(
        &self,
        trigger: Trigger,
        request: JobRequest,
    ) -> Result<Job, CardforgeError> {
        if self.shutdown.is_cancelled() {
            return Err(CardforgeError::ShuttingDown);
        }
        request.validate().map_err(CardforgeError::InvalidRequest)?;

        let job = Job::new(request, trigger);
        if self.handles.contains_key(&job.job_id) {
            return Err(CardforgeError::Store(StoreError::Conflict(format!(
                "job {} already exists",
                job.job_id
            ))));
        }
        self.jobs.insert(&job).await?;
        self.handles.insert(
            job.job_id.clone(),
            Arc::new(JobHandle {
                job: Mutex::new(job.clone()),
                cancel: self.shutdown.child_token(),
            }),
        );
        if self.queue_tx.send(job.job_id.clone()).is_err() {
            self.cancel_queued(&job.job_id).await;
            return Err(CardforgeError::ShuttingDown);
        }
        self.metrics.job_enqueued();

        info!(job_id = %job.job_id, mode = %job.mode, %trigger, "job enqueued");
        Ok(job)
    }

    /// Request cancellation. A queued job is cancelled on the spot; a running job
    /// stops admitting modules and reaches `cancelled` once in-flight work settles.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, CardforgeError> {
        let handle = self.handles.get(job_id).map(|h| h.value().clone());
        let Some(handle) = handle else {
            return match self.jobs.get(job_id).await? {
                Some(job) => Err(CardforgeError::JobTerminal {
                    job_id: job.job_id,
                    status: job.status.to_string(),
                }),
                None => Err(CardforgeError::JobNotFound(job_id.to_string())),
            };
        };

        let snapshot = {
            let mut job = handle.job.lock();
            match job.status {
                JobStatus::Queued => {
                    JobStateMachine::apply(&mut job, JobEvent::Cancel)
                        .map_err(|e| CardforgeError::InvalidRequest(e.to_string()))?;
                    job.outcome = Some(JobOutcome::from_results(&job.module_results));
                }
                JobStatus::Running => {}
                status => {
                    return Err(CardforgeError::JobTerminal {
                        job_id: job_id.to_string(),
                        status: status.to_string(),
                    });
                }
            }
            job.clone()
        };
        handle.cancel.cancel();

        if snapshot.status == JobStatus::Cancelled {
            self.jobs.save(&snapshot).await?;
            self.metrics.job_finished(JobStatus::Cancelled);
            self.handles.remove(job_id);
            info!(job_id, "queued job cancelled");
        } else {
            info!(job_id, "cancellation requested for running job");
        }
        Ok(snapshot)
    }

    pub async fn get_job_status(&self, job_id: &str) -> Result<Job, CardforgeError> {
        if let Some(handle) = self.handles.get(job_id) {
            return Ok(handle.snapshot());
        }
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| CardforgeError::JobNotFound(job_id.to_string()))
    }

    /// Newest first. Live jobs come from memory, finished ones from the job store.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobSummary>, CardforgeError> {
        let mut jobs = self.jobs.list(status, limit).await?;
        for job in jobs.iter_mut() {
            if let Some(handle) = self.handles.get(&job.job_id) {
                *job = handle.snapshot();
            }
        }
        jobs.retain(|j| status.is_none_or(|s| j.status == s));
        Ok(jobs.iter().map(Job::summary).collect())
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let (queued, running) = self.live_counts();
        self.metrics
            .snapshot(queued, running, self.registry.breaker_snapshot())
    }

    pub async fn get_module_deck(
        &self,
        course_id: &str,
        module_id: &str,
    ) -> Result<Option<Deck>, CardforgeError> {
        Ok(self.decks.latest(course_id, module_id).await?)
    }

    /// Latest deck for `module_id` across all courses.
    pub async fn get_latest_module_deck(&self, module_id: &str) -> Result<Option<Deck>, CardforgeError> {
        Ok(self.decks.latest_for_module(module_id).await?)
    }

    pub fn health(&self) -> HealthReport {
        let (queued_jobs, running_jobs) = self.live_counts();
        let breakers = self.registry.breaker_snapshot();
        let status = if self.shutdown.is_cancelled() {
            "shutting_down"
        } else if breakers.iter().any(|b| b.state != CircuitState::Closed) {
            "degraded"
        } else {
            "ok"
        };
        HealthReport {
            status: status.to_string(),
            mock_mode: self.is_mock(),
            queued_jobs,
            running_jobs,
            breakers,
        }
    }

    /// Stop admitting jobs, cancel everything live, and wait for running jobs to
    /// reach a terminal state.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("orchestrator shutting down");
            self.shutdown.cancel();
        }
        self.stopped.cancelled().await;
    }

    fn live_counts(&self) -> (usize, usize) {
        let mut queued = 0;
        let mut running = 0;
        for handle in self.handles.iter() {
            match handle.job.lock().status {
                JobStatus::Queued => queued += 1,
                JobStatus::Running => running += 1,
                _ => {}
            }
        }
        (queued, running)
    }

    async fn dispatch(self: Arc<Self>, mut queue: mpsc::UnboundedReceiver<String>) {
        let permits = Arc::new(Semaphore::new(self.config.orchestrator.max_running_jobs));
        let mut running = JoinSet::new();

        loop {
            let job_id = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(_) = running.join_next(), if !running.is_empty() => continue,
                next = queue.recv() => match next {
                    Some(job_id) => job_id,
                    None => break,
                },
            };
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.cancel_queued(&job_id).await;
                    break;
                }
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let this = Arc::clone(&self);
            running.spawn(async move {
                let _permit = permit;
                this.run_job(&job_id).await;
            });
        }

        queue.close();
        while let Ok(job_id) = queue.try_recv() {
            self.cancel_queued(&job_id).await;
        }
        while running.join_next().await.is_some() {}
        self.stopped.cancel();
        info!("orchestrator dispatcher stopped");
    }

    async fn cancel_queued(&self, job_id: &str) {
        if let Err(e) = self.cancel(job_id).await {
            warn!(job_id, error = %e, "could not cancel queued job during shutdown");
        }
    }

    async fn run_job(&self, job_id: &str) {
        let handle = self.handles.get(job_id).map(|h| h.value().clone());
        let Some(handle) = handle else {
            return;
        };

        let started = {
            let mut job = handle.job.lock();
            if job.status != JobStatus::Queued {
                // Cancelled while waiting for a slot.
                return;
            }
            match JobStateMachine::apply(&mut job, JobEvent::Start) {
                Ok(_) => job.clone(),
                Err(e) => {
                    error!(job_id, error = %e, "could not start job");
                    return;
                }
            }
        };
        info!(job_id, mode = %started.mode, "job started");

        let failure = match self.jobs.save(&started).await {
            Ok(()) => self.execute(&handle, &started).await.err(),
            Err(e) => Some(format!("persisting job failed: {e}")),
        };
        self.finalize(&handle, failure).await;
    }

    /// Expand and run every module. `Err` carries an orchestrator-level failure.
    async fn execute(&self, handle: &Arc<JobHandle>, job: &Job) -> Result<(), String> {
        let cancel = &handle.cancel;
        let modules = match self.expand(job, cancel).await {
            Ok(modules) => modules,
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(format!("target expansion failed: {e}")),
        };
        let snapshot = {
            let mut live = handle.job.lock();
            live.expected_modules = Some(modules.len());
            live.clone()
        };
        self.jobs
            .save(&snapshot)
            .await
            .map_err(|e| format!("persisting job failed: {e}"))?;
        info!(job_id = %job.job_id, modules = modules.len(), "target expanded");

        let pipeline = Arc::new(self.pipeline_for(job));
        let concurrency = job
            .settings
            .max_concurrent_modules
            .unwrap_or(self.config.orchestrator.max_concurrent_modules)
            .max(1);
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut tasks: JoinSet<Result<(), StoreError>> = JoinSet::new();
        let mut store_error: Option<StoreError> = None;

        for module in modules {
            while let Some(done) = tasks.try_join_next() {
                note_task_result(done, &mut store_error);
            }
            if store_error.is_some() {
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if cancel.is_cancelled() {
                break;
            }
            tasks.spawn(self.module_task(Arc::clone(handle), Arc::clone(&pipeline), module, permit));
        }

        while let Some(done) = tasks.join_next().await {
            note_task_result(done, &mut store_error);
        }
        match store_error {
            Some(e) => Err(format!("persisting module output failed: {e}")),
            None => Ok(()),
        }
    }

    fn module_task(
        &self,
        handle: Arc<JobHandle>,
        pipeline: Arc<ModulePipeline>,
        module: ModuleRef,
        permit: OwnedSemaphorePermit,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'static {
        let jobs = Arc::clone(&self.jobs);
        let metrics = Arc::clone(&self.metrics);
        async move {
            let _permit = permit;
            let Some(result) = pipeline.run(&module, &handle.cancel).await? else {
                info!(
                    job_id = %pipeline.job_id,
                    module_id = %module.module_id,
                    "discarding module result of cancelled job"
                );
                return Ok(());
            };
            let snapshot = {
                let mut job = handle.job.lock();
                if !job.record_result(result.clone()) {
                    warn!(job_id = %pipeline.job_id, module_id = %module.module_id, "module result not recorded");
                    return Ok(());
                }
                job.clone()
            };
            metrics.module_recorded(&result);
            jobs.save(&snapshot).await
        }
    }

    fn pipeline_for(&self, job: &Job) -> ModulePipeline {
        let settings: &JobSettings = &job.settings;
        let o = &self.config.orchestrator;
        let use_mock = settings.use_mock.unwrap_or(false) || self.sender.is_none();
        let invoker = |tier: ModelTier, retry: RetryOptions| -> Option<LlmInvoker> {
            if use_mock {
                return None;
            }
            self.sender.as_ref().map(|sender| {
                LlmInvoker::new(Arc::clone(sender), Arc::clone(&self.registry), tier, retry)
                    .with_max_tokens(self.config.models.max_tokens)
                    .with_timeout(self.config.models.llm_timeout())
            })
        };

        ModulePipeline {
            job_id: job.job_id.clone(),
            fetcher: Arc::clone(&self.fetcher),
            decks: Arc::clone(&self.decks),
            reviews: Arc::clone(&self.reviews),
            summarizer: Summarizer::new(
                invoker(self.config.models.summarizer, self.config.retry.generation()),
                o.max_prompt_chars,
            ),
            generator: Generator::new(
                invoker(self.config.models.generator, self.config.retry.generation()),
                GeneratorSettings {
                    cards_per_module: settings.cards_per_module.unwrap_or(o.cards_per_module),
                    min_cards: o.min_cards,
                    max_prompt_chars: o.max_prompt_chars,
                },
            ),
            verifier: Verifier::new(
                invoker(self.config.models.judge, self.config.retry.verification()),
                o.coverage_threshold,
            ),
            verification_mode: settings.verification_mode.unwrap_or(o.verification_mode),
            fetch_retry: self.config.retry.fetch(),
            cancel_policy: o.cancel_policy,
        }
    }

    async fn expand(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModuleRef>, FetchError> {
        let retry = self.config.retry.fetch();
        match job.mode {
            JobMode::SingleModule => Ok(vec![ModuleRef {
                course_id: job.target.course_id.clone().unwrap_or_default(),
                module_id: job.target.module_id.clone().unwrap_or_default(),
                title: None,
            }]),
            JobMode::Course => {
                let course_id = job.target.course_id.as_deref().unwrap_or_default();
                self.modules_of(course_id, &retry, cancel).await
            }
            JobMode::AllCourses => {
                let fetcher = &self.fetcher;
                let courses =
                    fetch_outcome(with_retry(move |_| fetcher.list_courses(), &retry, cancel).await)?;
                let mut modules = Vec::new();
                for course_id in &courses {
                    modules.extend(self.modules_of(course_id, &retry, cancel).await?);
                }
                Ok(modules)
            }
        }
    }

    async fn modules_of(
        &self,
        course_id: &str,
        retry: &RetryOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModuleRef>, FetchError> {
        let fetcher = &self.fetcher;
        fetch_outcome(with_retry(move |_| fetcher.list_modules(course_id), retry, cancel).await)
    }

    async fn finalize(&self, handle: &JobHandle, failure: Option<String>) {
        let snapshot = {
            let mut job = handle.job.lock();
            let outcome = JobOutcome::from_results(&job.module_results);
            let zero_successes = job.expected_modules.unwrap_or(0) > 0
                && outcome == JobOutcome::NoneSucceeded;

            let event = if handle.cancel.is_cancelled() {
                JobEvent::Cancel
            } else if let Some(reason) = &failure {
                job.error = Some(reason.clone());
                JobEvent::Fail
            } else if zero_successes && self.config.orchestrator.fail_when_no_module_succeeds {
                job.error = Some("no module succeeded".into());
                JobEvent::Fail
            } else {
                JobEvent::Finish
            };
            job.outcome = Some(outcome);
            if let Err(e) = JobStateMachine::apply(&mut job, event) {
                error!(job_id = %job.job_id, error = %e, "could not finalize job");
            }
            job.clone()
        };

        self.metrics.job_finished(snapshot.status);
        if let Err(e) = self.jobs.save(&snapshot).await {
            error!(job_id = %snapshot.job_id, error = %e, "could not persist final job state");
        }
        self.handles.remove(&snapshot.job_id);
        info!(
            job_id = %snapshot.job_id,
            status = %snapshot.status,
            outcome = ?snapshot.outcome,
            modules = snapshot.module_results.len(),
            succeeded = snapshot.succeeded_modules(),
            "job finished"
        );
    }
}

fn fetch_outcome<T>(outcome: RetryOutcome<T, FetchError>) -> Result<T, FetchError> {
    match outcome.result {
        Ok(value) => Ok(value),
        Err(RetryError::Operation(e)) => Err(e),
        Err(RetryError::Cancelled) => Err(FetchError::Cancelled),
    }
}

fn note_task_result(
    done: Result<Result<(), StoreError>, tokio::task::JoinError>,
    store_error: &mut Option<StoreError>,
) {
    match done {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "module persistence failed");
            store_error.get_or_insert(e);
        }
        Err(e) => error!(error = %e, "module task panicked"),
    }
}
