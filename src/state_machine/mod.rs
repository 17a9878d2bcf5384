mod job;
mod state;

pub use job::{
    Job, JobMode, JobOutcome, JobRequest, JobSettings, JobStatus, JobSummary, JobTarget,
    MAX_MODULE_ERROR_CHARS, ModuleResult, StatusChange, Trigger,
};
pub use state::{JobEvent, JobStateMachine, Transition, TransitionError};
