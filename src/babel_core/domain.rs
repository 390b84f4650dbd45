use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::babel_core::pipeline::{PipelineRequest, PipelineResponse};
use crate::babel_core::progress::{ProgressEvent, ProgressTracker, StopToken};

/// Deterministically ordered JSON object used for persisted payloads. The
/// underlying map keeps keys sorted, so re-serializing an unchanged payload
/// produces byte-identical output.
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Pausing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Pausing => "pausing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Kind of work a job performs. Only `Pipeline` jobs run the full
/// translation pipeline and support pause/resume; the other kinds are
/// fire-and-forget background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Pipeline,
    Subtitle,
    Custom,
}

impl JobType {
    pub fn supports_pause(self) -> bool {
        matches!(self, JobType::Pipeline)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Pipeline => "pipeline",
            JobType::Subtitle => "subtitle",
            JobType::Custom => "custom",
        }
    }
}

/// Submitter identity evaluated by the authorization predicate on every
/// mutation. An `admin` role sees and manages every job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub user_role: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, user_role: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            user_role: Some(user_role.into()),
        }
    }

    pub fn admin() -> Self {
        Self {
            user_id: None,
            user_role: Some("admin".to_string()),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.user_role
            .as_deref()
            .is_some_and(|role| role.eq_ignore_ascii_case("admin"))
    }
}

/// Raised when a state transition is requested from a state that does not
/// permit it. Carries the source state so callers can report what was
/// actually attempted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("job {job_id}: {message}")]
pub struct TransitionError {
    pub job_id: String,
    pub from: JobStatus,
    pub message: String,
}

impl TransitionError {
    pub fn new(job_id: &str, from: JobStatus, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            from,
            message: message.into(),
        }
    }
}

/// One file emitted by the pipeline, normalized so every entry carries an
/// absolute path, a job-relative path, and a resolvable URL when the
/// locator has a base URL configured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratedFile {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_fragment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_sentence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_sentence: Option<u64>,
}

/// Files emitted for one contiguous sentence block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratedChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_fragment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_sentence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_sentence: Option<u64>,
    pub files: Vec<GeneratedFile>,
}

/// Manifest of artifacts produced so far, grouped by chunk with a flat
/// per-file index for consumers that do not care about block boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratedFilesManifest {
    pub chunks: Vec<GeneratedChunk>,
    pub files: Vec<GeneratedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
}

impl GeneratedFilesManifest {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.files.is_empty()
    }
}

/// The state of an in-flight or completed pipeline job.
///
/// Live handles (`request`, `tracker`, `stop_token`) are process-local and
/// absent on jobs hydrated from persistence; they are recreated when the
/// job is resumed. Everything else round-trips through [`JobMetadata`].
///
/// [`JobMetadata`]: crate::babel_core::jobs::metadata::JobMetadata
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub request: Option<Arc<PipelineRequest>>,
    pub tracker: Option<Arc<ProgressTracker>>,
    pub stop_token: Option<StopToken>,
    pub last_event: Option<ProgressEvent>,
    pub result: Option<Arc<PipelineResponse>>,
    pub result_payload: Option<Payload>,
    pub error_message: Option<String>,
    pub request_payload: Option<Payload>,
    pub resume_context: Option<Payload>,
    pub tuning_summary: Option<Payload>,
    pub generated_files: Option<GeneratedFilesManifest>,
    pub media_completed: bool,
    pub owns_translation_pool: bool,
    pub user_id: Option<String>,
    pub user_role: Option<String>,
}

impl Job {
    pub fn new(job_id: String, job_type: JobType, created_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            job_type,
            status: JobStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            request: None,
            tracker: None,
            stop_token: None,
            last_event: None,
            result: None,
            result_payload: None,
            error_message: None,
            request_payload: None,
            resume_context: None,
            tuning_summary: None,
            generated_files: None,
            media_completed: false,
            owns_translation_pool: false,
            user_id: None,
            user_role: None,
        }
    }

    /// Clear every field that only makes sense for a finished run. Used on
    /// resume and when an interruption supersedes a half-written result.
    pub fn clear_results(&mut self) {
        self.result = None;
        self.result_payload = None;
        self.error_message = None;
    }
}

/// Read model surfaced by the query API: status, progress, tuning, and the
/// artifact manifest, without any live handles.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuning_summary: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_files: Option<GeneratedFilesManifest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_payload: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub media_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            progress: job.last_event.clone(),
            tuning_summary: job.tuning_summary.clone(),
            generated_files: job.generated_files.clone(),
            result_payload: job.result_payload.clone(),
            error_message: job.error_message.clone(),
            media_completed: job.media_completed,
            user_id: job.user_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pausing.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn only_pipeline_jobs_support_pause() {
        assert!(JobType::Pipeline.supports_pause());
        assert!(!JobType::Subtitle.supports_pause());
        assert!(!JobType::Custom.supports_pause());
    }

    #[test]
    fn admin_role_is_case_insensitive() {
        let identity = Identity::new("ops", "Admin");
        assert!(identity.is_admin());
        assert!(!Identity::new("alice", "viewer").is_admin());
    }

    #[test]
    fn status_serializes_lowercase() {
        let encoded = serde_json::to_string(&JobStatus::Pausing).unwrap();
        assert_eq!(encoded, "\"pausing\"");
        let decoded: JobStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(decoded, JobStatus::Cancelled);
    }
}
