use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use super::AppState;
use super::error::ApiError;
use crate::orchestrator::{HealthReport, MetricsSnapshot};
use crate::pipeline::Deck;
use crate::review::Approval;
use crate::state_machine::{Job, JobRequest, JobStatus, JobSummary, Trigger};
use crate::store::ReviewItem;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub status: JobStatus,
    pub trigger: Trigger,
}

impl From<Job> for JobAccepted {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            trigger: job.trigger,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct EditCardRequest {
    pub question: Option<String>,
    pub answer: Option<String>,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(value)| value)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

pub async fn generate_batch(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let job = state.orchestrator.enqueue(json_body(body)?).await?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let trigger = Trigger::from_path(&kind)
        .ok_or_else(|| ApiError::NotFound(format!("unknown trigger {kind:?}")))?;
    let job = state
        .orchestrator
        .enqueue_triggered(trigger, json_body(body)?)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job.into())))
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            JobStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status {raw:?}")))?,
        ),
        None => None,
    };
    let jobs = state
        .orchestrator
        .list_jobs(status, clamp_limit(query.limit))
        .await?;
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.orchestrator.get_job_status(&job_id).await?))
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.orchestrator.cancel(&job_id).await?))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.get_metrics())
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthReport> {
    Json(state.orchestrator.health())
}

pub async fn module_deck(
    State(state): State<Arc<AppState>>,
    Path((course_id, module_id)): Path<(String, String)>,
) -> Result<Json<Deck>, ApiError> {
    state
        .orchestrator
        .get_module_deck(&course_id, &module_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no deck for {course_id}/{module_id}")))
}

pub async fn module_flashcards(
    State(state): State<Arc<AppState>>,
    Path(module_id): Path<String>,
) -> Result<Json<Deck>, ApiError> {
    state
        .orchestrator
        .get_latest_module_deck(&module_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no deck for module {module_id}")))
}

pub async fn review_queue(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ReviewItem>>, ApiError> {
    Ok(Json(
        state.reviews.list_pending(clamp_limit(query.limit)).await?,
    ))
}

pub async fn approve_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<String>,
) -> Result<Json<Approval>, ApiError> {
    Ok(Json(state.reviews.approve(&card_id).await?))
}

pub async fn edit_card(
    State(state): State<Arc<AppState>>,
    Path(card_id): Path<String>,
    body: Result<Json<EditCardRequest>, JsonRejection>,
) -> Result<Json<Approval>, ApiError> {
    let edit = json_body(body)?;
    Ok(Json(
        state
            .reviews
            .edit(&card_id, edit.question, edit.answer)
            .await?,
    ))
}
