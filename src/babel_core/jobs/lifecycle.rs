//! Pause/resume transition rules and the block-aligned checkpoint
//! computation that makes resuming a half-finished run safe.
//!
//! Output files are emitted one block at a time (`sentences_per_output_file`
//! sentences per file). Resuming mid-block would leave a partial output
//! file behind, so the resume point is snapped back to the boundary of the
//! block containing the last observed sentence. The cost is re-translating
//! at most `block_size - 1` sentences.

use serde_json::Value;

use crate::babel_core::domain::{Job, JobStatus, Payload, TransitionError};
use crate::babel_core::pipeline::serialize_pipeline_request;

fn coerce_positive_u64(value: &Value) -> Option<u64> {
    let number = match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                .map(|f| f as u64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }?;
    (number > 0).then_some(number)
}

fn resolve_base_payload(job: &Job) -> Option<Payload> {
    if let Some(payload) = &job.request_payload {
        return Some(payload.clone());
    }
    job.request
        .as_ref()
        .map(|request| serialize_pipeline_request(request))
}

fn inputs_object(payload: &mut Payload) -> &mut Payload {
    let entry = payload
        .entry("inputs".to_string())
        .or_insert_with(|| Value::Object(Payload::new()));
    if !entry.is_object() {
        *entry = Value::Object(Payload::new());
    }
    entry.as_object_mut().expect("inputs forced to an object")
}

/// Last sentence whose progress event was observed, preferring an explicit
/// sentence number in the event metadata over derived counters.
fn extract_last_sentence(job: &Job) -> Option<u64> {
    let event = job.last_event.as_ref()?;
    for key in ["sentence_number", "sentence", "current_sentence"] {
        if let Some(value) = event.metadata.get(key)
            && let Some(number) = coerce_positive_u64(value)
        {
            return Some(number);
        }
    }
    None
}

fn resolve_block_size(job: &Job, inputs: &Payload) -> u64 {
    if let Some(size) = inputs
        .get("sentences_per_output_file")
        .and_then(coerce_positive_u64)
    {
        return size;
    }
    if let Some(request) = &job.request {
        return request.inputs.sentences_per_output_file.max(1);
    }
    1
}

/// First sentence of the block containing `sentence_number`.
pub fn compute_block_start(sentence_number: u64, block_size: u64, base_start: u64) -> u64 {
    let origin = base_start.max(1);
    if sentence_number == 0 || sentence_number <= origin {
        return origin;
    }
    let size = block_size.max(1);
    let offset = sentence_number - origin;
    origin + (offset / size) * size
}

/// Build the payload a resumed run will execute: the original submission
/// with `inputs.start_sentence` snapped to the last incomplete block, plus
/// diagnostic fields recording where the run actually stopped.
pub fn compute_resume_context(job: &Job) -> Option<Payload> {
    let mut payload = resolve_base_payload(job)?;
    let inputs = inputs_object(&mut payload);

    let base_start = inputs
        .get("start_sentence")
        .and_then(coerce_positive_u64)
        .unwrap_or(1);

    let last_sentence = extract_last_sentence(job).or_else(|| {
        let completed = job.last_event.as_ref()?.snapshot.completed;
        (completed > 0).then(|| base_start.max(base_start + completed - 1))
    });

    let block_size = resolve_block_size(job, inputs);

    match last_sentence {
        Some(last_sentence) => {
            let block_start = compute_block_start(last_sentence, block_size, base_start);
            inputs.insert("start_sentence".to_string(), Value::from(block_start));
            inputs.insert("resume_block_start".to_string(), Value::from(block_start));
            inputs.insert("resume_last_sentence".to_string(), Value::from(last_sentence));
            inputs.insert(
                "resume_next_sentence".to_string(),
                Value::from(last_sentence + 1),
            );
        }
        None => {
            inputs
                .entry("resume_block_start".to_string())
                .or_insert_with(|| Value::from(base_start));
        }
    }

    Some(payload)
}

/// Record `context` as both the resume context and the request payload the
/// next hydration will use.
pub fn apply_resume_context(job: &mut Job, context: Payload) {
    job.request_payload = Some(context.clone());
    job.resume_context = Some(context);
}

/// Validate and apply the pause transition. The job moves to `Pausing`
/// until the executor observes the stop signal; a job whose media already
/// reached the end has nothing left to interrupt and goes straight to
/// `Paused`.
pub fn apply_pause_transition(job: &mut Job) -> Result<(), TransitionError> {
    if job.status.is_terminal() {
        return Err(TransitionError::new(
            &job.job_id,
            job.status,
            format!("cannot pause a job in terminal state {}", job.status.as_str()),
        ));
    }
    match job.status {
        JobStatus::Paused | JobStatus::Pausing => Err(TransitionError::new(
            &job.job_id,
            job.status,
            "job is already paused",
        )),
        JobStatus::Running => {
            if let Some(context) = compute_resume_context(job) {
                job.resume_context = Some(context);
            }
            job.status = if job.media_completed {
                JobStatus::Paused
            } else {
                JobStatus::Pausing
            };
            Ok(())
        }
        other => Err(TransitionError::new(
            &job.job_id,
            other,
            format!("cannot pause a job from state {}", other.as_str()),
        )),
    }
}

/// Validate and apply the resume transition: `Paused` back to `Pending`
/// with the block-aligned context installed for the next hydration.
pub fn apply_resume_transition(job: &mut Job) -> Result<(), TransitionError> {
    if job.status != JobStatus::Paused {
        return Err(TransitionError::new(
            &job.job_id,
            job.status,
            format!("cannot resume a job from state {}", job.status.as_str()),
        ));
    }
    let context = job.resume_context.clone().or_else(|| compute_resume_context(job));
    if let Some(context) = context {
        apply_resume_context(job, context);
    }
    job.status = JobStatus::Pending;
    Ok(())
}
