//! Typed pipeline configuration, sparse settings updates, and the hardware
//! tuning defaults used when a submission does not size itself explicitly.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::babel_core::domain::Payload;

pub const DEFAULT_JOB_MAX_WORKERS: u32 = 2;
pub const DEFAULT_LLM_SOURCE: &str = "local";

pub const JOB_MAX_WORKERS_ENV_VAR: &str = "JOB_MAX_WORKERS";

/// Canonical provider tags for prefixed LLM model identifiers.
pub const OLLAMA_LOCAL: &str = "ollama_local";
pub const OLLAMA_CLOUD: &str = "ollama_cloud";
pub const LMSTUDIO_LOCAL: &str = "lmstudio_local";

/// Explicitly modelled pipeline configuration. The original carried these as
/// loose key/value settings; every field consumed by the job core is named
/// here and unknown keys are rejected at the API edge instead of being
/// carried along silently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_max_workers: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_words: Option<u32>,
    pub debug: bool,
}

/// Sparse updates layered over a base configuration in one merge step, e.g.
/// secret-store overrides resolved at submission time. `None` fields leave
/// the base value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SettingsUpdates {
    pub thread_count: Option<u32>,
    pub queue_size: Option<u32>,
    pub job_max_workers: Option<u32>,
    pub pipeline_mode: Option<bool>,
    pub llm_source: Option<String>,
    pub llm_model: Option<String>,
    pub max_words: Option<u32>,
    pub debug: Option<bool>,
}

/// Merge `updates` over `base` without mutating either in place.
pub fn apply_updates(base: &PipelineConfig, updates: &SettingsUpdates) -> PipelineConfig {
    PipelineConfig {
        thread_count: updates.thread_count.or(base.thread_count),
        queue_size: updates.queue_size.or(base.queue_size),
        job_max_workers: updates.job_max_workers.or(base.job_max_workers),
        pipeline_mode: updates.pipeline_mode.or(base.pipeline_mode),
        llm_source: updates.llm_source.clone().or_else(|| base.llm_source.clone()),
        llm_model: updates.llm_model.clone().or_else(|| base.llm_model.clone()),
        max_words: updates.max_words.or(base.max_words),
        debug: updates.debug.unwrap_or(base.debug),
    }
}

/// Runtime context derived from configuration plus per-job environment
/// overrides. Attached to a request at submission and consulted by the
/// tuner before falling back to raw configuration values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeContext {
    pub output_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_source: Option<String>,
}

/// Build a runtime context from `config` with `environment_overrides`
/// taking precedence for the keys they carry.
pub fn build_runtime_context(config: &PipelineConfig, environment_overrides: &Payload) -> RuntimeContext {
    let override_u32 = |key: &str| {
        environment_overrides
            .get(key)
            .and_then(coerce_u32)
    };
    let output_dir = environment_overrides
        .get("output_dir")
        .and_then(|value| value.as_str())
        .map(PathBuf::from)
        .unwrap_or_default();

    RuntimeContext {
        output_dir,
        thread_count: override_u32("thread_count").or(config.thread_count),
        queue_size: override_u32("queue_size").or(config.queue_size),
        pipeline_enabled: environment_overrides
            .get("pipeline_mode")
            .and_then(serde_json::Value::as_bool)
            .or(config.pipeline_mode),
        llm_source: environment_overrides
            .get("llm_source")
            .and_then(|value| value.as_str())
            .map(normalize_llm_source)
            .or_else(|| config.llm_source.as_deref().map(normalize_llm_source)),
    }
}

fn coerce_u32(value: &serde_json::Value) -> Option<u32> {
    if let Some(number) = value.as_u64() {
        return u32::try_from(number).ok();
    }
    value.as_str().and_then(|text| text.trim().parse().ok())
}

pub fn normalize_llm_source(raw: &str) -> String {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        DEFAULT_LLM_SOURCE.to_string()
    } else {
        normalized
    }
}

/// Return the canonical provider tag when `raw` names a known provider.
pub fn normalize_llm_provider(raw: &str) -> Option<&'static str> {
    let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    match normalized.as_str() {
        "ollama_local" => Some(OLLAMA_LOCAL),
        "ollama_cloud" => Some(OLLAMA_CLOUD),
        "lmstudio" | "lmstudio_local" => Some(LMSTUDIO_LOCAL),
        _ => None,
    }
}

/// Split a `provider:model` identifier into its provider tag and model name.
/// Identifiers without a recognized provider prefix are returned whole.
pub fn split_llm_model_identifier(raw: &str) -> (Option<&'static str>, Option<String>) {
    let text = raw.trim();
    if text.is_empty() {
        return (None, None);
    }
    let Some((prefix, remainder)) = text.split_once(':') else {
        return (None, Some(text.to_string()));
    };
    match normalize_llm_provider(prefix) {
        Some(provider) => {
            let model = remainder.trim();
            (
                Some(provider),
                if model.is_empty() { None } else { Some(model.to_string()) },
            )
        }
        None => (None, Some(text.to_string())),
    }
}

/// Whether `provider` runs on local hardware (and therefore contends for the
/// GPU with batched translation). `None` when the provider is unknown.
pub fn is_local_llm_provider(provider: &str) -> Option<bool> {
    match provider {
        OLLAMA_CLOUD => Some(false),
        OLLAMA_LOCAL | LMSTUDIO_LOCAL => Some(true),
        _ => None,
    }
}

/// Worker sizing derived from the host hardware, detected once per process.
#[derive(Debug, Clone)]
pub struct HardwareTuning {
    pub profile: &'static str,
    pub detected_cpu_count: usize,
    pub detected_memory_gib: f64,
    pub job_max_workers: u32,
    pub thread_count: u32,
}

static HARDWARE_TUNING: Lazy<HardwareTuning> = Lazy::new(detect_hardware_tuning);

pub fn hardware_tuning_defaults() -> &'static HardwareTuning {
    &HARDWARE_TUNING
}

fn detect_hardware_tuning() -> HardwareTuning {
    let mut system = System::new_all();
    system.refresh_memory();
    let cpu_count = system.cpus().len().max(1);
    let memory_gib = system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

    // Memory is the binding constraint on small hosts; translation workers
    // each hold a chunk of sentences plus model responses in flight.
    let (profile, job_max_workers, thread_count) = if cpu_count >= 16 && memory_gib >= 24.0 {
        ("high-core", 4, (cpu_count / 2).min(12) as u32)
    } else if cpu_count >= 8 && memory_gib >= 12.0 {
        ("balanced", 3, (cpu_count / 2) as u32)
    } else if cpu_count >= 4 {
        ("modest", 2, 2)
    } else {
        ("constrained", 1, 1)
    };

    HardwareTuning {
        profile,
        detected_cpu_count: cpu_count,
        detected_memory_gib: (memory_gib * 10.0).round() / 10.0,
        job_max_workers,
        thread_count: thread_count.max(1),
    }
}

/// Resolve the manager-level worker count: explicit argument, then the
/// environment, then hardware recommendation, then the static default.
pub fn resolve_job_max_workers(explicit: Option<u32>) -> u32 {
    if let Some(value) = explicit
        && value > 0
    {
        return value;
    }
    if let Ok(raw) = std::env::var(JOB_MAX_WORKERS_ENV_VAR)
        && let Ok(value) = raw.trim().parse::<u32>()
        && value > 0
    {
        return value;
    }
    let recommended = hardware_tuning_defaults().job_max_workers;
    if recommended > 0 {
        recommended
    } else {
        DEFAULT_JOB_MAX_WORKERS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_updates_prefers_update_fields_and_keeps_base_for_none() {
        let base = PipelineConfig {
            thread_count: Some(4),
            llm_source: Some("local".to_string()),
            ..PipelineConfig::default()
        };
        let updates = SettingsUpdates {
            thread_count: Some(8),
            llm_model: Some("ollama_cloud:big".to_string()),
            ..SettingsUpdates::default()
        };

        let merged = apply_updates(&base, &updates);
        assert_eq!(merged.thread_count, Some(8));
        assert_eq!(merged.llm_source.as_deref(), Some("local"));
        assert_eq!(merged.llm_model.as_deref(), Some("ollama_cloud:big"));
    }

    #[test]
    fn split_llm_model_identifier_handles_prefixed_and_bare_names() {
        assert_eq!(
            split_llm_model_identifier("ollama-cloud: qwen3 "),
            (Some(OLLAMA_CLOUD), Some("qwen3".to_string()))
        );
        assert_eq!(
            split_llm_model_identifier("qwen3:latest"),
            (None, Some("qwen3:latest".to_string()))
        );
        assert_eq!(split_llm_model_identifier("  "), (None, None));
    }

    #[test]
    fn local_provider_classification() {
        assert_eq!(is_local_llm_provider(OLLAMA_LOCAL), Some(true));
        assert_eq!(is_local_llm_provider(OLLAMA_CLOUD), Some(false));
        assert_eq!(is_local_llm_provider("anthropic"), None);
    }

    #[test]
    fn runtime_context_environment_overrides_win() {
        let config = PipelineConfig {
            thread_count: Some(2),
            queue_size: Some(10),
            ..PipelineConfig::default()
        };
        let mut overrides = Payload::new();
        overrides.insert("thread_count".to_string(), serde_json::json!(6));
        overrides.insert("output_dir".to_string(), serde_json::json!("/tmp/out"));

        let context = build_runtime_context(&config, &overrides);
        assert_eq!(context.thread_count, Some(6));
        assert_eq!(context.queue_size, Some(10));
        assert_eq!(context.output_dir, PathBuf::from("/tmp/out"));
    }
}
