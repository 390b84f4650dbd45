//! Centralizes every externally requested state transition. Each mutation
//! loads the job under the manager lock, runs the authorization predicate,
//! applies the transition, and re-persists through the shared
//! mutate-and-persist machinery.
//!
//! Transitions are a closed enum rather than caller-supplied mutation
//! callbacks, so every reachable mutation is visible here.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::babel_core::domain::{Identity, Job, JobStatus, Payload, TransitionError};
use crate::babel_core::jobs::JobError;
use crate::babel_core::jobs::lifecycle::{apply_pause_transition, apply_resume_transition};
use crate::babel_core::jobs::state::{
    self, Inner, assert_job_access, mutate_and_persist, retained_in_memory,
};
use crate::babel_core::progress::StopToken;
use crate::sync_ext::MutexExt;

/// Every transition the coordinator can apply.
#[derive(Debug, Clone)]
pub(crate) enum TransitionKind {
    Pause,
    Resume,
    Cancel,
    Delete,
    /// Terminal record written from the executor path. Trusted-internal:
    /// authorization is bypassed by design.
    Finish {
        status: JobStatus,
        error_message: Option<String>,
        result_payload: Option<Payload>,
    },
}

pub(crate) fn apply_transition(
    inner: &Arc<Inner>,
    job_id: &str,
    kind: TransitionKind,
    identity: &Identity,
) -> Result<Job, JobError> {
    match kind {
        TransitionKind::Pause => pause_job(inner, job_id, identity),
        TransitionKind::Resume => resume_job(inner, job_id, identity),
        TransitionKind::Cancel => cancel_job(inner, job_id, identity),
        TransitionKind::Delete => delete_job(inner, job_id, identity),
        TransitionKind::Finish {
            status,
            error_message,
            result_payload,
        } => finish_job(inner, job_id, status, error_message, result_payload),
    }
}

/// Make sure the job carries a stop token shared with its request, and
/// return it for signalling.
fn ensure_stop_token(job: &mut Job) -> StopToken {
    let token = job
        .stop_token
        .clone()
        .or_else(|| job.request.as_ref().map(|request| request.stop_token.clone()))
        .unwrap_or_default();
    job.stop_token = Some(token.clone());
    token
}

fn require_pausable_type(job: &Job, verb: &str) -> Result<(), JobError> {
    if job.job_type.supports_pause() {
        return Ok(());
    }
    Err(TransitionError::new(
        &job.job_id,
        job.status,
        format!("{verb} is not supported for job type '{}'", job.job_type.as_str()),
    )
    .into())
}

fn pause_job(inner: &Arc<Inner>, job_id: &str, identity: &Identity) -> Result<Job, JobError> {
    let job = mutate_and_persist(inner, job_id, Some(identity), |job| {
        require_pausable_type(job, "pause")?;
        if let Some(tracker) = &job.tracker {
            job.media_completed = tracker.is_complete();
        }
        apply_pause_transition(job)?;
        Ok(Some(ensure_stop_token(job)))
    })?;
    info!(job_id = %job_id, status = job.status.as_str(), "pipeline job pause requested");
    Ok(job)
}

fn resume_job(inner: &Arc<Inner>, job_id: &str, identity: &Identity) -> Result<Job, JobError> {
    let job = mutate_and_persist(inner, job_id, Some(identity), |job| {
        require_pausable_type(job, "resume")?;
        apply_resume_transition(job)?;

        let payload = job
            .resume_context
            .clone()
            .or_else(|| job.request_payload.clone())
            .ok_or_else(|| {
                JobError::from(TransitionError::new(
                    &job.job_id,
                    job.status,
                    "job is missing resume context and cannot be resumed",
                ))
            })?;

        let stop_token = StopToken::new();
        let request = inner
            .factory()
            .hydrate_request(job, &payload, stop_token.clone());
        job.request = Some(Arc::new(request));
        job.stop_token = Some(stop_token);
        job.clear_results();
        job.started_at = None;
        job.completed_at = None;
        job.owns_translation_pool = false;
        job.media_completed = false;
        Ok(None)
    })?;
    info!(job_id = %job_id, "pipeline job resumed");
    Ok(job)
}

fn cancel_job(inner: &Arc<Inner>, job_id: &str, identity: &Identity) -> Result<Job, JobError> {
    let job = mutate_and_persist(inner, job_id, Some(identity), |job| {
        if job.status.is_terminal() {
            return Err(TransitionError::new(
                &job.job_id,
                job.status,
                format!(
                    "cannot cancel a job in terminal state {}",
                    job.status.as_str()
                ),
            )
            .into());
        }
        // Preserve whatever artifacts the run produced before the signal;
        // they stay on the record after the pipeline winds down.
        if let Some(tracker) = &job.tracker
            && let Some(manifest) = tracker.generated_files()
            && !manifest.is_empty()
        {
            job.generated_files = Some(manifest);
        }
        let token = ensure_stop_token(job);
        job.status = JobStatus::Cancelled;
        job.started_at.get_or_insert_with(Utc::now);
        job.completed_at.get_or_insert_with(Utc::now);
        Ok(Some(token))
    })?;
    info!(job_id = %job_id, "pipeline job cancelled");
    Ok(job)
}

fn finish_job(
    inner: &Arc<Inner>,
    job_id: &str,
    status: JobStatus,
    error_message: Option<String>,
    result_payload: Option<Payload>,
) -> Result<Job, JobError> {
    if !status.is_terminal() {
        return Err(JobError::InvalidRequest(format!(
            "unsupported terminal status: {}",
            status.as_str()
        )));
    }
    mutate_and_persist(inner, job_id, None, |job| {
        job.status = status;
        job.error_message = error_message;
        if let Some(payload) = result_payload {
            job.result_payload = Some(payload);
        }
        job.started_at.get_or_insert_with(Utc::now);
        job.completed_at.get_or_insert_with(Utc::now);
        Ok(None)
    })
}

/// Deletion is valid from terminal states and `Paused` only; the record is
/// removed from both memory and the store.
fn delete_job(inner: &Arc<Inner>, job_id: &str, identity: &Identity) -> Result<Job, JobError> {
    let (mut job, was_live) = state::load_job_for_mutation(inner, job_id)?;
    assert_job_access(&job, identity)?;

    if !matches!(
        job.status,
        JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Paused
    ) {
        return Err(TransitionError::new(
            &job.job_id,
            job.status,
            format!("cannot delete a job from state {}", job.status.as_str()),
        )
        .into());
    }

    // A cancelled run whose pipeline is still winding down keeps its
    // record alive; deleting now would let the final snapshot resurrect
    // the store document moments later.
    {
        let state = inner.state.lock_unpoisoned();
        if state.active_jobs.contains(job_id) {
            return Err(TransitionError::new(
                &job.job_id,
                job.status,
                "job is still winding down, retry shortly",
            )
            .into());
        }
    }

    if was_live {
        // Push the latest state down before removal; best effort, deletion
        // proceeds either way.
        let snapshot = {
            let _state = inner.state.lock_unpoisoned();
            inner.persistence.snapshot(&mut job)
        };
        let _ = inner.store.update(&snapshot);
    }

    inner
        .store
        .delete(job_id)
        .map_err(|err| JobError::from_store(job_id, err))?;

    {
        let mut state = inner.state.lock_unpoisoned();
        state.jobs.remove(job_id);
    }
    info!(job_id = %job_id, "pipeline job deleted");
    Ok(job)
}

/// The resume entry point used by the manager: apply the transition, then
/// hand the job back to the executor pool.
pub(crate) fn resume_and_dispatch(
    inner: &Arc<Inner>,
    job_id: &str,
    identity: &Identity,
) -> Result<Job, JobError> {
    let job = apply_transition(inner, job_id, TransitionKind::Resume, identity)?;
    debug_assert!(retained_in_memory(job.status));
    state::dispatch(inner, job_id);
    Ok(job)
}
