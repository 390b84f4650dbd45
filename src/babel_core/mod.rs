//! Core of the Babelbook job orchestrator: domain types, configuration,
//! progress plumbing, and the job management engine.

pub mod config;
pub mod domain;
pub mod jobs;
pub mod locator;
pub mod logging;
pub mod overrides;
pub mod pipeline;
pub mod progress;
pub mod workers;

pub use domain::{
    GeneratedChunk, GeneratedFile, GeneratedFilesManifest, Identity, Job, JobStatus, JobType,
    JobView, Payload, TransitionError,
};
pub use jobs::{JobError, JobManager, JobManagerBuilder, SubmitError};
pub use pipeline::{PipelineInput, PipelineRequest, PipelineResponse, PipelineRunner};
pub use progress::{ProgressEvent, ProgressSnapshot, ProgressTracker, StopToken};
