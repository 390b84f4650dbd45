//! Metadata refresh: re-run the inference collaborator against a job's
//! input file and merge the result into both the request payload and the
//! persisted result payload.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::babel_core::domain::{Identity, Job, Payload};
use crate::babel_core::jobs::JobError;
use crate::babel_core::jobs::state::{Inner, assert_job_access, load_job_for_mutation, mutate_and_persist};
use crate::babel_core::pipeline::serialize_pipeline_request;

/// The metadata inference collaborator. Given the input file and whatever
/// metadata is already known, returns the refreshed mapping.
pub trait MetadataInference: Send + Sync {
    fn infer(
        &self,
        input_file: &Path,
        existing_metadata: &Payload,
        force_refresh: bool,
    ) -> anyhow::Result<Payload>;
}

impl<F> MetadataInference for F
where
    F: Fn(&Path, &Payload, bool) -> anyhow::Result<Payload> + Send + Sync,
{
    fn infer(
        &self,
        input_file: &Path,
        existing_metadata: &Payload,
        force_refresh: bool,
    ) -> anyhow::Result<Payload> {
        self(input_file, existing_metadata, force_refresh)
    }
}

fn request_payload_of(job: &Job) -> Result<Payload, JobError> {
    match (&job.request, &job.request_payload) {
        (Some(request), _) => Ok(serialize_pipeline_request(request)),
        (None, Some(payload)) => Ok(payload.clone()),
        (None, None) => Err(JobError::NotFound(job.job_id.clone())),
    }
}

pub(crate) fn refresh_job_metadata(
    inner: &Arc<Inner>,
    job_id: &str,
    identity: &Identity,
) -> Result<Job, JobError> {
    let inference = inner.inference.clone().ok_or_else(|| {
        JobError::InvalidRequest("no metadata inference collaborator configured".to_string())
    })?;

    // Inference may read the source file or call out to a model endpoint,
    // so it runs against a loaded copy with no lock held. The merge below
    // re-reads the live job.
    let (job, _was_live) = load_job_for_mutation(inner, job_id)?;
    assert_job_access(&job, identity)?;

    let request_payload = request_payload_of(&job)?;
    let inputs = match request_payload.get("inputs") {
        Some(Value::Object(map)) => map.clone(),
        _ => Payload::new(),
    };
    let input_file = inputs
        .get("input_file")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            JobError::InvalidRequest(format!(
                "job {job_id} does not include an input file for metadata refresh"
            ))
        })?;
    let existing = match inputs.get("book_metadata") {
        Some(Value::Object(map)) => map.clone(),
        _ => Payload::new(),
    };

    let refreshed = inference
        .infer(Path::new(&input_file), &existing, true)
        .map_err(|err| JobError::Inference(format!("{err:#}")))?;

    let job = mutate_and_persist(inner, job_id, Some(identity), |job| {
        let mut request_payload = request_payload_of(job)?;
        let mut inputs = match request_payload.get("inputs") {
            Some(Value::Object(map)) => map.clone(),
            _ => Payload::new(),
        };
        inputs.insert(
            "book_metadata".to_string(),
            Value::Object(refreshed.clone()),
        );
        request_payload.insert("inputs".to_string(), Value::Object(inputs));

        job.request_payload = Some(request_payload.clone());
        job.resume_context = Some(request_payload);

        let mut result_payload = job.result_payload.clone().unwrap_or_default();
        result_payload.insert("book_metadata".to_string(), Value::Object(refreshed.clone()));
        job.result_payload = Some(result_payload);
        Ok(None)
    })?;

    info!(job_id = %job_id, "pipeline job metadata refreshed");
    Ok(job)
}
