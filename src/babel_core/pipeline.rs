//! Request and response types for the translation pipeline, plus the trait
//! the opaque pipeline callable implements. The pipeline itself (parsing,
//! translation, TTS, video) lives outside this crate; the job core only
//! needs a stable wire shape and a run entry point that honors the stop
//! token.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::babel_core::config::{PipelineConfig, RuntimeContext};
use crate::babel_core::domain::{GeneratedFilesManifest, Payload};
use crate::babel_core::progress::{ProgressTracker, StopToken};
use crate::babel_core::workers::ThreadWorkerPool;
use crate::sync_ext::MutexExt;

/// User-supplied parameters describing one pipeline execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineInput {
    pub input_file: String,
    pub base_output_file: String,
    pub input_language: String,
    pub target_languages: Vec<String>,
    pub sentences_per_output_file: u64,
    pub start_sentence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_sentence: Option<u64>,
    pub stitch_full: bool,
    pub generate_audio: bool,
    pub audio_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_bitrate_kbps: Option<u32>,
    pub written_mode: String,
    pub selected_voice: String,
    pub output_html: bool,
    pub output_pdf: bool,
    pub generate_video: bool,
    pub include_transliteration: bool,
    pub tempo: f64,
    pub translation_batch_size: u64,
    pub translation_provider: String,
    pub book_metadata: Payload,
}

/// Complete description of one pipeline execution request. Built once at
/// submission (or rebuilt by the request factory on resume) and then
/// shared immutably; the translation pool is the only late-bound slot.
#[derive(Debug)]
pub struct PipelineRequest {
    pub config: PipelineConfig,
    pub context: Option<RuntimeContext>,
    pub environment_overrides: Payload,
    pub pipeline_overrides: Payload,
    pub inputs: PipelineInput,
    pub progress_tracker: Arc<ProgressTracker>,
    pub stop_token: StopToken,
    pub correlation_id: String,
    pub job_id: Option<String>,
    translation_pool: Mutex<Option<Arc<ThreadWorkerPool>>>,
}

impl PipelineRequest {
    pub fn new(config: PipelineConfig, inputs: PipelineInput) -> Self {
        Self {
            config,
            context: None,
            environment_overrides: Payload::new(),
            pipeline_overrides: Payload::new(),
            inputs,
            progress_tracker: Arc::new(ProgressTracker::new()),
            stop_token: StopToken::new(),
            correlation_id: String::new(),
            job_id: None,
            translation_pool: Mutex::new(None),
        }
    }

    pub fn translation_pool(&self) -> Option<Arc<ThreadWorkerPool>> {
        self.translation_pool.lock_unpoisoned().clone()
    }

    pub fn set_translation_pool(&self, pool: Option<Arc<ThreadWorkerPool>>) {
        *self.translation_pool.lock_unpoisoned() = pool;
    }

    /// Detach and return the attached pool so the caller can release it.
    pub fn take_translation_pool(&self) -> Option<Arc<ThreadWorkerPool>> {
        self.translation_pool.lock_unpoisoned().take()
    }
}

/// Result of running the pipeline, reduced to what the job core persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineResponse {
    pub success: bool,
    pub refined_sentences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_files: Option<GeneratedFilesManifest>,
    pub book_metadata: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_output_stem: Option<String>,
}

/// The opaque long-running pipeline callable. Implementations may run for
/// hours, must emit progress through the request's tracker, and must poll
/// the request's stop token at sentence boundaries.
pub trait PipelineRunner: Send + Sync + 'static {
    fn run(&self, request: &PipelineRequest) -> anyhow::Result<PipelineResponse>;
}

impl<F> PipelineRunner for F
where
    F: Fn(&PipelineRequest) -> anyhow::Result<PipelineResponse> + Send + Sync + 'static,
{
    fn run(&self, request: &PipelineRequest) -> anyhow::Result<PipelineResponse> {
        self(request)
    }
}

/// Serialize `request` into its persisted payload form. The runtime
/// context and live handles are deliberately excluded; both are rebuilt
/// when the payload is hydrated again.
pub fn serialize_pipeline_request(request: &PipelineRequest) -> Payload {
    let mut payload = Payload::new();
    if let Ok(config) = serde_json::to_value(&request.config) {
        payload.insert("config".to_string(), config);
    }
    payload.insert(
        "environment_overrides".to_string(),
        serde_json::Value::Object(request.environment_overrides.clone()),
    );
    payload.insert(
        "pipeline_overrides".to_string(),
        serde_json::Value::Object(request.pipeline_overrides.clone()),
    );
    if let Ok(inputs) = serde_json::to_value(&request.inputs) {
        payload.insert("inputs".to_string(), inputs);
    }
    if !request.correlation_id.is_empty() {
        payload.insert(
            "correlation_id".to_string(),
            serde_json::json!(request.correlation_id),
        );
    }
    payload
}

/// Serialize `response` into its persisted payload form.
pub fn serialize_pipeline_response(response: &PipelineResponse) -> Payload {
    match serde_json::to_value(response) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => Payload::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_contains_inputs_and_correlation_id() {
        let mut request = PipelineRequest::new(
            PipelineConfig::default(),
            PipelineInput {
                input_file: "books/alice.epub".to_string(),
                start_sentence: 1,
                sentences_per_output_file: 10,
                target_languages: vec!["de".to_string()],
                ..PipelineInput::default()
            },
        );
        request.correlation_id = "corr-1".to_string();

        let payload = serialize_pipeline_request(&request);
        assert_eq!(
            payload.get("correlation_id").and_then(|v| v.as_str()),
            Some("corr-1")
        );
        let inputs = payload
            .get("inputs")
            .and_then(|v| v.as_object())
            .expect("inputs object");
        assert_eq!(
            inputs.get("input_file").and_then(|v| v.as_str()),
            Some("books/alice.epub")
        );
        assert_eq!(
            inputs.get("sentences_per_output_file").and_then(|v| v.as_u64()),
            Some(10)
        );
    }

    #[test]
    fn translation_pool_slot_is_late_bound() {
        let request = PipelineRequest::new(PipelineConfig::default(), PipelineInput::default());
        assert!(request.translation_pool().is_none());
        let pool = Arc::new(ThreadWorkerPool::new(1));
        request.set_translation_pool(Some(pool.clone()));
        assert!(request.translation_pool().is_some());
        let taken = request.take_translation_pool().expect("pool attached");
        assert!(Arc::ptr_eq(&taken, &pool));
        assert!(request.translation_pool().is_none());
        pool.shutdown(true);
    }

    #[test]
    fn response_payload_round_trips() {
        let response = PipelineResponse {
            success: true,
            refined_sentences: vec!["Erste.".to_string(), "Zweite.".to_string()],
            ..PipelineResponse::default()
        };
        let payload = serialize_pipeline_response(&response);
        let decoded: PipelineResponse =
            serde_json::from_value(serde_json::Value::Object(payload)).unwrap();
        assert_eq!(decoded, response);
    }
}
