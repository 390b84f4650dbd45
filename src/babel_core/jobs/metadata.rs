//! Serializable metadata snapshots for jobs.
//!
//! A snapshot is the single durable representation of a job. Field order is
//! fixed by the struct declaration and every mapping is key-sorted, so
//! re-serializing an unchanged snapshot is byte-identical and content-hash
//! dedup works on the persisted documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::babel_core::domain::{GeneratedFilesManifest, JobStatus, JobType, Payload};

fn default_job_type() -> JobType {
    JobType::Pipeline
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: String,
    #[serde(default = "default_job_type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(rename = "request", default, skip_serializing_if = "Option::is_none")]
    pub request_payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_context: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuning_summary: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_summary: Option<BTreeMap<String, u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_files: Option<GeneratedFilesManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_completed: Option<bool>,
}

impl JobMetadata {
    /// Compact canonical JSON document for this snapshot.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        let mut metadata: Self = serde_json::from_str(payload)?;
        metadata.normalize();
        Ok(metadata)
    }

    /// Apply the defaulting rules older documents rely on: a missing resume
    /// context falls back to the original request payload.
    pub fn normalize(&mut self) {
        if self.resume_context.is_none() {
            self.resume_context = self.request_payload.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> JobMetadata {
        let mut request = Payload::new();
        request.insert("correlation_id".to_string(), serde_json::json!("corr-1"));
        request.insert(
            "inputs".to_string(),
            serde_json::json!({"input_file": "books/alice.epub", "start_sentence": 1}),
        );
        JobMetadata {
            job_id: "job-1".to_string(),
            job_type: JobType::Pipeline,
            status: JobStatus::Paused,
            created_at: "2026-08-01T10:00:00Z".parse().unwrap(),
            started_at: Some("2026-08-01T10:00:01.250Z".parse().unwrap()),
            completed_at: None,
            error_message: None,
            last_event: None,
            result: None,
            request_payload: Some(request.clone()),
            resume_context: Some(request),
            tuning_summary: None,
            retry_summary: None,
            user_id: Some("alice".to_string()),
            user_role: Some("editor".to_string()),
            generated_files: None,
            media_completed: Some(false),
        }
    }

    #[test]
    fn canonical_json_is_stable_across_round_trips() {
        let metadata = sample_metadata();
        let first = metadata.to_canonical_json().unwrap();
        let decoded = JobMetadata::from_json(&first).unwrap();
        let second = decoded.to_canonical_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_resume_context_falls_back_to_request() {
        let mut metadata = sample_metadata();
        metadata.resume_context = None;
        let encoded = metadata.to_canonical_json().unwrap();
        let decoded = JobMetadata::from_json(&encoded).unwrap();
        assert_eq!(decoded.resume_context, metadata.request_payload);
    }

    #[test]
    fn unknown_status_strings_fail_to_parse() {
        let raw = r#"{"job_id":"x","status":"exploded","created_at":"2026-08-01T10:00:00Z"}"#;
        assert!(JobMetadata::from_json(raw).is_err());
    }

    #[test]
    fn absent_optionals_stay_absent_after_round_trip() {
        let metadata = JobMetadata {
            job_id: "job-2".to_string(),
            job_type: JobType::Custom,
            status: JobStatus::Pending,
            created_at: "2026-08-01T11:00:00Z".parse().unwrap(),
            started_at: None,
            completed_at: None,
            error_message: None,
            last_event: None,
            result: None,
            request_payload: None,
            resume_context: None,
            tuning_summary: None,
            retry_summary: None,
            user_id: None,
            user_role: None,
            generated_files: None,
            media_completed: None,
        };
        let encoded = metadata.to_canonical_json().unwrap();
        assert!(!encoded.contains("started_at"));
        assert!(!encoded.contains("generated_files"));
    }
}
