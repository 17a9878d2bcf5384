use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::truncate_message;
use crate::pipeline::VerificationMode;

/// Longest error text kept on a module result.
pub const MAX_MODULE_ERROR_CHARS: usize = 500;

/// How far a job reaches: one module, every module of a course, or every course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    SingleModule,
    Course,
    AllCourses,
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobMode::SingleModule => write!(f, "single_module"),
            JobMode::Course => write!(f, "course"),
            JobMode::AllCourses => write!(f, "all_courses"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTarget {
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
}

impl JobTarget {
    pub fn module(course_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            course_id: Some(course_id.into()),
            module_id: Some(module_id.into()),
        }
    }

    pub fn course(course_id: impl Into<String>) -> Self {
        Self {
            course_id: Some(course_id.into()),
            module_id: None,
        }
    }
}

/// Per-job overrides. Anything left `None` falls back to the orchestrator defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default)]
    pub cards_per_module: Option<usize>,
    #[serde(default)]
    pub verification_mode: Option<VerificationMode>,
    #[serde(default)]
    pub max_concurrent_modules: Option<usize>,
    #[serde(default)]
    pub use_mock: Option<bool>,
}

/// What caused a job to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Api,
    ContentUpdate,
    Scheduled,
    Manual,
}

impl Trigger {
    /// Parses the path segment used by the trigger endpoints.
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "content-update" => Some(Trigger::ContentUpdate),
            "scheduled" => Some(Trigger::Scheduled),
            "manual" => Some(Trigger::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Api => write!(f, "api"),
            Trigger::ContentUpdate => write!(f, "content_update"),
            Trigger::Scheduled => write!(f, "scheduled"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Whether the recorded modules all succeeded, some did, or none did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    AllSucceeded,
    Partial,
    NoneSucceeded,
}

impl JobOutcome {
    pub fn from_results(results: &[ModuleResult]) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        if succeeded == 0 {
            JobOutcome::NoneSucceeded
        } else if succeeded == results.len() {
            JobOutcome::AllSucceeded
        } else {
            JobOutcome::Partial
        }
    }
}

/// Result of driving one module through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResult {
    pub course_id: String,
    pub module_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub cards_published: usize,
    pub cards_for_review: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deck_version: Option<u64>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl ModuleResult {
    pub fn succeeded(
        course_id: impl Into<String>,
        module_id: impl Into<String>,
        cards_published: usize,
        cards_for_review: usize,
        deck_version: Option<u64>,
        duration_ms: u64,
    ) -> Self {
        Self {
            course_id: course_id.into(),
            module_id: module_id.into(),
            success: true,
            error: None,
            error_detail: None,
            cards_published,
            cards_for_review,
            deck_version,
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    /// A failed module. `code` is the short error name; `detail` is truncated.
    pub fn failed(
        course_id: impl Into<String>,
        module_id: impl Into<String>,
        code: &str,
        detail: &str,
        duration_ms: u64,
    ) -> Self {
        Self {
            course_id: course_id.into(),
            module_id: module_id.into(),
            success: false,
            error: Some(truncate_message(code, MAX_MODULE_ERROR_CHARS)),
            error_detail: Some(truncate_message(detail, MAX_MODULE_ERROR_CHARS)),
            cards_published: 0,
            cards_for_review: 0,
            deck_version: None,
            duration_ms,
            completed_at: Utc::now(),
        }
    }
}

/// One entry of a job's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}

/// Body of an enqueue request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub job_id: Option<String>,
    pub mode: JobMode,
    #[serde(default)]
    pub target: JobTarget,
    #[serde(default)]
    pub settings: Option<JobSettings>,
}

impl JobRequest {
    pub fn single_module(course_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            job_id: None,
            mode: JobMode::SingleModule,
            target: JobTarget::module(course_id, module_id),
            settings: None,
        }
    }

    pub fn course(course_id: impl Into<String>) -> Self {
        Self {
            job_id: None,
            mode: JobMode::Course,
            target: JobTarget::course(course_id),
            settings: None,
        }
    }

    pub fn all_courses() -> Self {
        Self {
            job_id: None,
            mode: JobMode::AllCourses,
            target: JobTarget::default(),
            settings: None,
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Checks that the target carries what the mode needs.
    pub fn validate(&self) -> Result<(), String> {
        let blank = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
        match self.mode {
            JobMode::SingleModule if blank(&self.target.course_id) || blank(&self.target.module_id) => {
                Err("single_module jobs need target.course_id and target.module_id".into())
            }
            JobMode::Course if blank(&self.target.course_id) => {
                Err("course jobs need target.course_id".into())
            }
            _ => {
                if let Some(settings) = &self.settings {
                    if settings.cards_per_module == Some(0) {
                        return Err("settings.cards_per_module must be at least 1".into());
                    }
                    if settings.max_concurrent_modules == Some(0) {
                        return Err("settings.max_concurrent_modules must be at least 1".into());
                    }
                }
                Ok(())
            }
        }
    }
}

/// A batch generation job. Status changes go through
/// [`JobStateMachine`](super::JobStateMachine) only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub mode: JobMode,
    pub target: JobTarget,
    pub settings: JobSettings,
    pub trigger: Trigger,
    pub status: JobStatus,
    pub module_results: Vec<ModuleResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_modules: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
    pub status_history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(request: JobRequest, trigger: Trigger) -> Self {
        Self {
            job_id: request
                .job_id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            mode: request.mode,
            target: request.target,
            settings: request.settings.unwrap_or_default(),
            trigger,
            status: JobStatus::Queued,
            module_results: Vec::new(),
            expected_modules: None,
            outcome: None,
            status_history: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Appends a module result unless the expanded target is already fully
    /// accounted for. Returns whether it was recorded.
    pub fn record_result(&mut self, result: ModuleResult) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(expected) = self.expected_modules {
            if self.module_results.len() >= expected {
                return false;
            }
        }
        self.module_results.push(result);
        true
    }

    pub fn succeeded_modules(&self) -> usize {
        self.module_results.iter().filter(|r| r.success).count()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            mode: self.mode,
            trigger: self.trigger,
            status: self.status,
            outcome: self.outcome,
            modules_expected: self.expected_modules,
            modules_done: self.module_results.len(),
            modules_succeeded: self.succeeded_modules(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Compact listing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub mode: JobMode,
    pub trigger: Trigger,
    pub status: JobStatus,
    pub outcome: Option<JobOutcome>,
    pub modules_expected: Option<usize>,
    pub modules_done: usize,
    pub modules_succeeded: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(module: &str) -> ModuleResult {
        ModuleResult::succeeded("c1", module, 3, 1, Some(1), 10)
    }

    fn err(module: &str) -> ModuleResult {
        ModuleResult::failed("c1", module, "InsufficientContent", "no chunks", 5)
    }

    #[test]
    fn job_creation_defaults() {
        let job = Job::new(JobRequest::single_module("c1", "m1"), Trigger::Api);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.module_results.is_empty());
        assert!(job.status_history.is_empty());
        assert!(!job.job_id.is_empty());
        assert_eq!(job.settings, JobSettings::default());
    }

    #[test]
    fn caller_supplied_job_id_is_kept() {
        let mut req = JobRequest::course("c1");
        req.job_id = Some("nightly-42".into());
        assert_eq!(Job::new(req, Trigger::Scheduled).job_id, "nightly-42");
    }

    #[test]
    fn results_never_exceed_expected_modules() {
        let mut job = Job::new(JobRequest::course("c1"), Trigger::Api);
        job.expected_modules = Some(2);
        assert!(job.record_result(ok("m1")));
        assert!(job.record_result(err("m2")));
        assert!(!job.record_result(ok("m3")));
        assert_eq!(job.module_results.len(), 2);
    }

    #[test]
    fn outcome_is_tri_state() {
        assert_eq!(JobOutcome::from_results(&[]), JobOutcome::NoneSucceeded);
        assert_eq!(JobOutcome::from_results(&[ok("a"), ok("b")]), JobOutcome::AllSucceeded);
        assert_eq!(JobOutcome::from_results(&[ok("a"), err("b")]), JobOutcome::Partial);
        assert_eq!(JobOutcome::from_results(&[err("a")]), JobOutcome::NoneSucceeded);
    }

    #[test]
    fn module_error_is_truncated() {
        let long = "x".repeat(2_000);
        let r = ModuleResult::failed("c", "m", "MalformedOutput", &long, 0);
        assert_eq!(r.error.as_deref(), Some("MalformedOutput"));
        assert_eq!(r.error_detail.unwrap().chars().count(), MAX_MODULE_ERROR_CHARS);
    }

    #[test]
    fn request_validation() {
        assert!(JobRequest::single_module("c1", "m1").validate().is_ok());
        assert!(JobRequest::all_courses().validate().is_ok());

        let mut missing_module = JobRequest::single_module("c1", "m1");
        missing_module.target.module_id = None;
        assert!(missing_module.validate().is_err());

        let mut blank_course = JobRequest::course("c1");
        blank_course.target.course_id = Some("  ".into());
        assert!(blank_course.validate().is_err());

        let zero_cards = JobRequest::course("c1").with_settings(JobSettings {
            cards_per_module: Some(0),
            ..Default::default()
        });
        assert!(zero_cards.validate().is_err());
    }

    #[test]
    fn request_deserializes_from_api_shape() {
        let req: JobRequest = serde_json::from_str(
            r#"{"mode": "single_module", "target": {"course_id": "hr", "module_id": "onboarding"},
                "settings": {"cards_per_module": 4, "verification_mode": "heuristic"}}"#,
        )
        .unwrap();
        assert_eq!(req.mode, JobMode::SingleModule);
        assert_eq!(req.target.module_id.as_deref(), Some("onboarding"));
        let settings = req.settings.unwrap();
        assert_eq!(settings.cards_per_module, Some(4));
        assert_eq!(settings.verification_mode, Some(VerificationMode::Heuristic));
    }

    #[test]
    fn trigger_paths() {
        assert_eq!(Trigger::from_path("content-update"), Some(Trigger::ContentUpdate));
        assert_eq!(Trigger::from_path("scheduled"), Some(Trigger::Scheduled));
        assert_eq!(Trigger::from_path("manual"), Some(Trigger::Manual));
        assert_eq!(Trigger::from_path("api"), None);
    }

    #[test]
    fn job_serialization_uses_snake_case() {
        let job = Job::new(JobRequest::all_courses(), Trigger::ContentUpdate);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["mode"], "all_courses");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["trigger"], "content_update");
    }
}
