//! Babelbook job management core.
//!
//! Accepts pipeline submissions, schedules them onto a bounded worker
//! pool, enforces access control on every mutation, persists job state
//! durably across restarts, coordinates cooperative pause/resume/cancel
//! with sentence-level checkpointing, and streams progress events to
//! observers. The translation pipeline itself is an external collaborator
//! plugged in as a [`PipelineRunner`].

pub mod babel_core;
pub(crate) mod sync_ext;

pub use babel_core::config::{PipelineConfig, RuntimeContext, SettingsUpdates};
pub use babel_core::jobs::{
    BackpressurePolicy, BackpressureState, ExecutorHooks, FileJobStore, InMemoryJobStore,
    JobError, JobManager, JobManagerBuilder, JobMetadata, JobStore, MetadataInference,
    QueueFullError, StoreError, SubmitError,
};
#[cfg(feature = "redis-store")]
pub use babel_core::jobs::RedisJobStore;
pub use babel_core::locator::FileLocator;
pub use babel_core::{
    GeneratedChunk, GeneratedFile, GeneratedFilesManifest, Identity, JobStatus, JobType, JobView,
    Payload, PipelineInput, PipelineRequest, PipelineResponse, PipelineRunner, ProgressEvent,
    ProgressSnapshot, ProgressTracker, StopToken, TransitionError,
};
