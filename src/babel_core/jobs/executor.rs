//! Runs one job to completion on an executor worker thread.
//!
//! The executor owns every status transition that happens while a run is
//! in flight. It only takes the manager lock to update and snapshot the
//! job; the pipeline call itself runs with no lock held. The entire
//! post-pipeline bookkeeping (status dispatch, pool release, terminal
//! timestamps, snapshot) happens in one lock scope so a concurrent
//! pause/resume can never observe a half-finalized job.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, info_span, warn};

use crate::babel_core::domain::{Job, JobStatus, Payload};
use crate::babel_core::jobs::state::Inner;
use crate::babel_core::pipeline::{PipelineResponse, serialize_pipeline_response};
use crate::babel_core::progress::FinishReason;
use crate::sync_ext::MutexExt;

pub type MetricAttributes = BTreeMap<String, String>;

type JobHook = Arc<dyn Fn(&Job) + Send + Sync + 'static>;
type JobStatusHook = Arc<dyn Fn(&Job, JobStatus) + Send + Sync + 'static>;
type FailureHook = Arc<dyn Fn(&Job, &str) + Send + Sync + 'static>;
type MetricHook = Arc<dyn Fn(&str, f64, &MetricAttributes) + Send + Sync + 'static>;

/// Optional callbacks invoked during the job execution lifecycle.
#[derive(Clone, Default)]
pub struct ExecutorHooks {
    pub on_start: Option<JobHook>,
    pub on_finish: Option<JobStatusHook>,
    pub on_failure: Option<FailureHook>,
    pub on_interrupted: Option<JobStatusHook>,
    pub record_metric: Option<MetricHook>,
}

impl std::fmt::Debug for ExecutorHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_finish", &self.on_finish.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .field("on_interrupted", &self.on_interrupted.is_some())
            .field("record_metric", &self.record_metric.is_some())
            .finish()
    }
}

/// What happened after the pipeline returned, carried out of the final
/// lock scope for the notification calls that must not hold it.
enum RunDisposition {
    Settled,
    Failed(String),
    Interrupted,
}

/// Execute `job_id` to completion. Called from an executor worker thread.
pub(crate) fn execute(inner: &Arc<Inner>, job_id: &str) {
    // Mark the job running and grab the live handles in one lock scope.
    let (request, correlation_id, start_snapshot, job_for_start) = {
        let mut state = inner.state.lock_unpoisoned();
        // A job cancelled (and evicted) between dispatch and pickup is
        // simply gone; anything not pending any more must not be started.
        let Some(job) = state.jobs.get(job_id) else {
            return;
        };
        if job.status != JobStatus::Pending {
            return;
        }
        state.active_jobs.insert(job_id.to_string());
        let job = state
            .jobs
            .get_mut(job_id)
            .expect("job present under the same lock");
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        let request = job.request.clone();
        let correlation_id = request
            .as_ref()
            .map(|request| request.correlation_id.clone())
            .unwrap_or_else(|| job_id.to_string());
        let snapshot = inner.persistence.snapshot(job);
        (request, correlation_id, snapshot, job.clone())
    };
    if let Err(err) = inner.store.update(&start_snapshot) {
        warn!(job_id = %job_id, error = %err, "failed to persist running snapshot");
    }

    let span = info_span!("pipeline_job", job_id = %job_id, correlation_id = %correlation_id);
    let _span_guard = span.enter();
    info!(job_id = %job_id, "pipeline job started");

    if let Some(hook) = &inner.hooks.on_start {
        hook(&job_for_start);
    }

    let outcome: Result<PipelineResponse, String> = match &request {
        Some(request) => {
            // Acquire a translation pool and surface the live sizing
            // before the long call begins.
            let summary_snapshot = {
                let mut state = inner.state.lock_unpoisoned();
                match state.jobs.get_mut(job_id) {
                    Some(job) => {
                        let (pool, _is_new) = inner.tuner.acquire_worker_pool(job);
                        job.owns_translation_pool = pool.is_some();
                        job.tuning_summary
                            .is_some()
                            .then(|| inner.persistence.snapshot(job))
                    }
                    None => None,
                }
            };
            if let Some(snapshot) = summary_snapshot
                && let Err(err) = inner.store.update(&snapshot)
            {
                warn!(job_id = %job_id, error = %err, "failed to persist tuning snapshot");
            }

            // The only point of indeterminate execution. No lock is held,
            // and a panicking pipeline becomes an ordinary failure.
            match catch_unwind(AssertUnwindSafe(|| inner.runner.run(request))) {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(payload) => Err(format!(
                    "pipeline panicked: {}",
                    panic_payload_to_string(payload.as_ref())
                )),
            }
        }
        None => Err("job has no executable request attached".to_string()),
    };

    // Post-pipeline bookkeeping, all under one lock acquisition.
    let (status, disposition, snapshot, job_clone) = {
        let mut state = inner.state.lock_unpoisoned();
        state.active_jobs.remove(job_id);
        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };

        let disposition = match &outcome {
            Ok(response) => {
                settle_response(job, response);
                RunDisposition::Settled
            }
            Err(message) => {
                let stop_signalled = job
                    .stop_token
                    .as_ref()
                    .map(|token| token.is_signalled())
                    .unwrap_or(true);
                let interruption = matches!(
                    job.status,
                    JobStatus::Paused | JobStatus::Pausing | JobStatus::Cancelled
                ) && stop_signalled;
                if interruption {
                    job.clear_results();
                    if job.status == JobStatus::Pausing {
                        job.status = JobStatus::Paused;
                    }
                    RunDisposition::Interrupted
                } else {
                    job.clear_results();
                    job.status = JobStatus::Failed;
                    job.error_message = Some(message.clone());
                    RunDisposition::Failed(message.clone())
                }
            }
        };

        if job.owns_translation_pool {
            inner.tuner.release_worker_pool(job);
        }
        job.owns_translation_pool = false;
        if job.status.is_terminal() {
            job.completed_at.get_or_insert_with(Utc::now);
        }
        let snapshot = inner.persistence.snapshot(job);
        (job.status, disposition, snapshot, job.clone())
    };

    if let Err(err) = inner.store.update(&snapshot) {
        warn!(job_id = %job_id, error = %err, "failed to persist final snapshot");
    }

    match &disposition {
        RunDisposition::Failed(message) => {
            error!(job_id = %job_id, error = %message, "pipeline job encountered an error");
            if let Some(hook) = &inner.hooks.on_failure {
                hook(&job_clone, message);
            }
            if let Some(tracker) = &job_clone.tracker {
                let mut metadata = Payload::new();
                metadata.insert("stage".to_string(), serde_json::json!("pipeline"));
                tracker.record_error(message, metadata);
            }
        }
        RunDisposition::Interrupted => {
            info!(job_id = %job_id, status = status.as_str(), "pipeline job interrupted");
            if let Some(hook) = &inner.hooks.on_interrupted {
                hook(&job_clone, status);
            }
        }
        RunDisposition::Settled => {}
    }

    if let Some(tracker) = &job_clone.tracker {
        match status {
            JobStatus::Completed => tracker.mark_finished(FinishReason::Completed, false),
            JobStatus::Failed => tracker.mark_finished(FinishReason::Failed, true),
            JobStatus::Cancelled => tracker.mark_finished(FinishReason::Cancelled, true),
            _ => {}
        }
    }

    if status.is_terminal() {
        let duration_ms = match (job_clone.started_at, job_clone.completed_at) {
            (Some(started), Some(completed)) => {
                (completed - started).num_milliseconds().max(0) as f64
            }
            _ => 0.0,
        };
        if let Some(record_metric) = &inner.hooks.record_metric {
            let mut attributes = MetricAttributes::new();
            attributes.insert("job_id".to_string(), job_id.to_string());
            attributes.insert("status".to_string(), status.as_str().to_string());
            record_metric("pipeline.job.duration", duration_ms, &attributes);
        }
        info!(job_id = %job_id, status = status.as_str(), duration_ms, "pipeline job finished");
    } else {
        info!(job_id = %job_id, status = status.as_str(), "pipeline job suspended");
    }

    if let Some(hook) = &inner.hooks.on_finish {
        hook(&job_clone, status);
    }
}

/// Status dispatch once the pipeline has returned normally. A mutation may
/// have moved the job while the call was in flight; the current status
/// decides what the response means.
fn settle_response(job: &mut Job, response: &PipelineResponse) {
    match job.status {
        JobStatus::Cancelled => {
            job.clear_results();
        }
        JobStatus::Pausing => {
            if let Some(manifest) = response.generated_files.clone() {
                job.generated_files = Some(manifest);
            }
            job.clear_results();
            job.media_completed = job
                .tracker
                .as_ref()
                .map(|tracker| tracker.is_complete())
                .unwrap_or(false);
            job.status = JobStatus::Paused;
        }
        JobStatus::Paused => {
            job.clear_results();
            if let Some(tracker) = &job.tracker {
                job.media_completed = tracker.is_complete();
            }
        }
        _ => {
            job.result_payload = Some(serialize_pipeline_response(response));
            job.generated_files = response.generated_files.clone();
            job.status = if response.success {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            job.error_message = if response.success {
                None
            } else {
                Some("pipeline execution reported failure".to_string())
            };
            job.media_completed = response.success;
            job.result = Some(Arc::new(response.clone()));
        }
    }
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "unknown panic payload".to_string()
}
