//! Rebuilds executable pipeline requests from persisted payloads.
//!
//! Payload coercion is deliberately forgiving: a resume must not fail
//! because an older document carries a string where a number now lives,
//! so unknown or malformed fields fall back to their defaults.

use std::sync::Arc;

use serde_json::Value;

use crate::babel_core::config::PipelineConfig;
use crate::babel_core::domain::{Job, Payload};
use crate::babel_core::pipeline::{PipelineInput, PipelineRequest};
use crate::babel_core::progress::{ProgressEvent, ProgressTracker, StopToken};

/// Observer invoked for every progress event of a job, keyed by job id.
pub type JobEventObserver = Arc<dyn Fn(&str, &ProgressEvent) + Send + Sync + 'static>;

pub fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => true,
            "false" | "0" | "no" | "n" | "off" => false,
            _ => default,
        },
        Some(Value::Number(number)) => number.as_i64().map(|n| n != 0).unwrap_or(default),
        _ => default,
    }
}

pub fn coerce_u64(value: Option<&Value>, default: u64) -> u64 {
    match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(default),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub fn coerce_f64(value: Option<&Value>, default: f64) -> f64 {
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(default),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub fn coerce_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        _ => String::new(),
    }
}

fn coerce_string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(text)) if !text.is_empty() => vec![text.clone()],
        _ => Vec::new(),
    }
}

fn payload_object(value: Option<&Value>) -> Payload {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Payload::new(),
    }
}

/// Construct a [`PipelineInput`] from its payload form.
pub fn build_pipeline_input(payload: &Payload) -> PipelineInput {
    let end_sentence = payload
        .get("end_sentence")
        .and_then(Value::as_u64)
        .or_else(|| {
            payload
                .get("end_sentence")
                .and_then(Value::as_str)
                .and_then(|text| text.trim().parse().ok())
        });

    PipelineInput {
        input_file: coerce_string(payload.get("input_file")),
        base_output_file: coerce_string(payload.get("base_output_file")),
        input_language: coerce_string(payload.get("input_language")),
        target_languages: coerce_string_list(payload.get("target_languages")),
        sentences_per_output_file: coerce_u64(payload.get("sentences_per_output_file"), 1).max(1),
        start_sentence: coerce_u64(payload.get("start_sentence"), 1).max(1),
        end_sentence,
        stitch_full: coerce_bool(payload.get("stitch_full"), false),
        generate_audio: coerce_bool(payload.get("generate_audio"), false),
        audio_mode: coerce_string(payload.get("audio_mode")),
        audio_bitrate_kbps: payload
            .get("audio_bitrate_kbps")
            .map(|value| coerce_u64(Some(value), 0))
            .filter(|bitrate| *bitrate > 0)
            .map(|bitrate| bitrate as u32),
        written_mode: coerce_string(payload.get("written_mode")),
        selected_voice: coerce_string(payload.get("selected_voice")),
        output_html: coerce_bool(payload.get("output_html"), false),
        output_pdf: coerce_bool(payload.get("output_pdf"), false),
        generate_video: coerce_bool(payload.get("generate_video"), false),
        include_transliteration: coerce_bool(payload.get("include_transliteration"), true),
        tempo: coerce_f64(payload.get("tempo"), 1.0),
        translation_batch_size: coerce_u64(payload.get("translation_batch_size"), 0),
        translation_provider: coerce_string(payload.get("translation_provider")),
        book_metadata: payload_object(payload.get("book_metadata")),
    }
}

/// Factory for live [`PipelineRequest`] objects hydrated from persisted
/// payloads, re-attaching tracker and cancellation primitives.
pub struct RequestFactory {
    observer: Option<JobEventObserver>,
}

impl RequestFactory {
    pub fn new(observer: Option<JobEventObserver>) -> Self {
        Self { observer }
    }

    /// Hydrate a request for `job` from `payload`. The job's existing
    /// tracker is reused when still attached; otherwise a fresh one is
    /// created and wired to the factory's observer so progress keeps
    /// flowing into the store after a resume.
    pub fn hydrate_request(
        &self,
        job: &mut Job,
        payload: &Payload,
        stop_token: StopToken,
    ) -> PipelineRequest {
        let config: PipelineConfig = payload
            .get("config")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        let environment_overrides = payload_object(payload.get("environment_overrides"));
        let pipeline_overrides = payload_object(payload.get("pipeline_overrides"));
        let inputs = build_pipeline_input(&payload_object(payload.get("inputs")));

        let tracker = match &job.tracker {
            Some(tracker) => tracker.clone(),
            None => {
                let tracker = Arc::new(ProgressTracker::new());
                if let Some(observer) = &self.observer {
                    let observer = observer.clone();
                    let job_id = job.job_id.clone();
                    tracker.register_observer(move |event| observer(&job_id, event));
                }
                job.tracker = Some(tracker.clone());
                tracker
            }
        };

        let correlation_id = payload
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                job.request
                    .as_ref()
                    .map(|request| request.correlation_id.clone())
            })
            .unwrap_or_else(|| job.job_id.clone());

        let mut request = PipelineRequest::new(config, inputs);
        request.context = job.request.as_ref().and_then(|prev| prev.context.clone());
        request.environment_overrides = environment_overrides;
        request.pipeline_overrides = pipeline_overrides;
        request.progress_tracker = tracker;
        request.stop_token = stop_token;
        request.correlation_id = correlation_id;
        request.job_id = Some(job.job_id.clone());
        request
    }
}
