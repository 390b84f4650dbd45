//! Enumerated pipeline override keys. Overrides arrive as a free-form
//! mapping at the API edge; keys outside this list are rejected up front
//! instead of being carried along until something downstream trips on
//! them.

use crate::babel_core::domain::Payload;

/// Every override key a submission may carry.
pub const PIPELINE_OVERRIDE_KEYS: &[&str] = &[
    "thread_count",
    "queue_size",
    "job_max_workers",
    "pipeline_mode",
    "llm_source",
    "llm_model",
    "ollama_model",
    "audio_mode",
    "audio_bitrate_kbps",
];

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown pipeline override key: {key}")]
pub struct UnknownOverrideKey {
    pub key: String,
}

/// Validate `overrides` against the enumerated key set.
pub fn validate_pipeline_overrides(overrides: &Payload) -> Result<(), UnknownOverrideKey> {
    for key in overrides.keys() {
        if !PIPELINE_OVERRIDE_KEYS.contains(&key.as_str()) {
            return Err(UnknownOverrideKey { key: key.clone() });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_keys_pass() {
        let mut overrides = Payload::new();
        overrides.insert("thread_count".to_string(), serde_json::json!(4));
        overrides.insert("llm_model".to_string(), serde_json::json!("qwen3"));
        assert!(validate_pipeline_overrides(&overrides).is_ok());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut overrides = Payload::new();
        overrides.insert("thraed_count".to_string(), serde_json::json!(4));
        let err = validate_pipeline_overrides(&overrides).unwrap_err();
        assert_eq!(err.key, "thraed_count");
    }
}
