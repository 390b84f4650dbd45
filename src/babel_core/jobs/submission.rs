//! Job creation: identifier and directory layout, source-file mirroring,
//! environment seeding, and tuning summary attachment.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use filetime::FileTime;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::babel_core::config::build_runtime_context;
use crate::babel_core::domain::{Identity, Job, JobType, Payload};
use crate::babel_core::jobs::request_factory::JobEventObserver;
use crate::babel_core::jobs::tuner::JobTuner;
use crate::babel_core::locator::{FileLocator, to_posix_string};
use crate::babel_core::pipeline::{PipelineRequest, serialize_pipeline_request};
use crate::babel_core::progress::ProgressTracker;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    QueueFull(#[from] crate::babel_core::jobs::backpressure::QueueFullError),
    #[error(transparent)]
    InvalidOverride(#[from] crate::babel_core::overrides::UnknownOverrideKey),
    #[error("failed to prepare job storage: {0}")]
    Storage(#[from] std::io::Error),
    #[error(transparent)]
    Persistence(#[from] crate::babel_core::jobs::store::StoreError),
}

/// Build a fully wired pipeline job from a submission request: directories,
/// mirrored source file, environment overrides, runtime context, serialized
/// payload, and tuning summary.
pub(crate) fn create_pipeline_job(
    mut request: PipelineRequest,
    locator: &FileLocator,
    tuner: &JobTuner,
    identity: &Identity,
    observer: &JobEventObserver,
) -> Result<Job, SubmitError> {
    let job_id = Uuid::new_v4().to_string();
    if request.correlation_id.is_empty() {
        request.correlation_id = job_id.clone();
    }
    request.job_id = Some(job_id.clone());

    fs::create_dir_all(locator.job_root(&job_id))?;
    let media_root = locator.media_root(&job_id);
    fs::create_dir_all(&media_root)?;
    fs::create_dir_all(locator.metadata_root(&job_id))?;
    fs::create_dir_all(locator.data_root(&job_id))?;

    if let Some(source_relative) = persist_source_file(&job_id, &request, locator) {
        request.inputs.book_metadata.insert(
            "source_path".to_string(),
            Value::String(source_relative.clone()),
        );
        request
            .inputs
            .book_metadata
            .insert("source_file".to_string(), Value::String(source_relative));
    }

    request
        .environment_overrides
        .entry("output_dir".to_string())
        .or_insert_with(|| Value::String(media_root.display().to_string()));
    if let Some(storage_url) = locator.resolve_url(&job_id, Some("media")) {
        request
            .environment_overrides
            .entry("job_storage_url".to_string())
            .or_insert_with(|| Value::String(storage_url));
    }

    let mut context = request.context.clone().unwrap_or_else(|| {
        build_runtime_context(&request.config, &request.environment_overrides)
    });
    context.output_dir = media_root;
    request.context = Some(context);

    let request_payload = serialize_pipeline_request(&request);
    let tuning_summary = tuner.build_tuning_summary(&request);

    let tracker = request.progress_tracker.clone();
    let stop_token = request.stop_token.clone();
    {
        let observer = observer.clone();
        let observed_job_id = job_id.clone();
        tracker.register_observer(move |event| observer(&observed_job_id, event));
    }

    let mut job = Job::new(job_id, JobType::Pipeline, Utc::now());
    job.request_payload = Some(request_payload.clone());
    job.resume_context = Some(request_payload);
    job.tracker = Some(tracker);
    job.stop_token = Some(stop_token);
    job.tuning_summary = (!tuning_summary.is_empty()).then_some(tuning_summary);
    job.user_id = identity.user_id.clone();
    job.user_role = identity.user_role.clone();
    job.request = Some(std::sync::Arc::new(request));
    Ok(job)
}

/// Create a non-pipeline background job (subtitle extraction and similar
/// one-shot work). These carry a tracker and stop token but no pipeline
/// request, and never support pause/resume.
pub(crate) fn create_background_job(
    job_type: JobType,
    locator: &FileLocator,
    request_payload: Option<Payload>,
    identity: &Identity,
    observer: &JobEventObserver,
) -> Result<Job, SubmitError> {
    let job_id = Uuid::new_v4().to_string();
    fs::create_dir_all(locator.job_root(&job_id))?;
    fs::create_dir_all(locator.metadata_root(&job_id))?;
    fs::create_dir_all(locator.data_root(&job_id))?;

    let tracker = std::sync::Arc::new(ProgressTracker::new());
    {
        let observer = observer.clone();
        let observed_job_id = job_id.clone();
        tracker.register_observer(move |event| observer(&observed_job_id, event));
    }

    let mut job = Job::new(job_id, job_type, Utc::now());
    job.tracker = Some(tracker);
    job.stop_token = Some(crate::babel_core::progress::StopToken::new());
    job.request_payload = request_payload;
    job.user_id = identity.user_id.clone();
    job.user_role = identity.user_role.clone();
    Ok(job)
}

/// Mirror the submission's input file into the job's data directory so the
/// run does not depend on the original path staying around. Returns the
/// job-relative POSIX path of the mirror, or `None` when the source cannot
/// be resolved (the pipeline will fail with its own diagnostics later).
pub(crate) fn persist_source_file(
    job_id: &str,
    request: &PipelineRequest,
    locator: &FileLocator,
) -> Option<String> {
    let input_file = request.inputs.input_file.trim();
    if input_file.is_empty() {
        return None;
    }

    let candidate = PathBuf::from(input_file);
    let resolved = if candidate.is_file() {
        Some(candidate)
    } else if candidate.is_relative() {
        let cwd_candidate = std::env::current_dir().ok()?.join(&candidate);
        cwd_candidate.is_file().then_some(cwd_candidate)
    } else {
        None
    }?;

    let data_root = locator.data_root(job_id);
    if fs::create_dir_all(&data_root).is_err() {
        return None;
    }
    let file_name = resolved.file_name()?;
    let destination = data_root.join(file_name);

    if !same_file(&destination, &resolved) {
        if let Err(err) = fs::copy(&resolved, &destination) {
            debug!(job_id = %job_id, error = %err, "unable to mirror source file");
            return None;
        }
        if let Ok(meta) = fs::metadata(&resolved) {
            let mtime = FileTime::from_last_modification_time(&meta);
            let atime = FileTime::from_last_access_time(&meta);
            let _ = filetime::set_file_times(&destination, atime, mtime);
        }
    }

    let relative = destination
        .strip_prefix(locator.job_root(job_id))
        .ok()
        .map(to_posix_string)?;
    Some(relative)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
