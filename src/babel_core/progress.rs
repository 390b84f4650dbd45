//! Progress reporting primitives shared between the manager and a running
//! pipeline: the one-shot stop token, the event schema, and the tracker
//! that fans events out to observers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::babel_core::domain::{GeneratedFilesManifest, Payload};
use crate::sync_ext::MutexExt;

/// One-shot cooperative cancellation signal. Shared between the manager,
/// the job record, and the running pipeline; the pipeline is expected to
/// poll it at sentence boundaries.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_signalled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Counters describing overall pipeline progress at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSnapshot {
    pub completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub elapsed: f64,
    pub speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_files: Option<BTreeMap<String, Vec<String>>>,
}

/// One progress event delivered to tracker observers. The `metadata`
/// mapping conventionally carries `stage` and `sentence_number`, plus a
/// structured `generated_files` submanifest when artifacts were produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_type: String,
    pub timestamp: f64,
    pub snapshot: ProgressSnapshot,
    #[serde(default)]
    pub metadata: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Convert `event` into its persisted payload form.
pub fn serialize_progress_event(event: &ProgressEvent) -> Payload {
    match serde_json::to_value(event) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => Payload::new(),
    }
}

/// Reconstruct a [`ProgressEvent`] from its persisted payload form.
/// Malformed payloads deserialize to a best-effort default rather than
/// failing restoration.
pub fn deserialize_progress_event(payload: &Payload) -> ProgressEvent {
    serde_json::from_value(serde_json::Value::Object(payload.clone())).unwrap_or(ProgressEvent {
        event_type: "progress".to_string(),
        timestamp: 0.0,
        snapshot: ProgressSnapshot::default(),
        metadata: payload.clone(),
        error: None,
    })
}

/// Why a tracker was marked finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Completed,
    Failed,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Completed => "completed",
            FinishReason::Failed => "failed",
            FinishReason::Cancelled => "cancelled",
        }
    }
}

type Observer = Arc<dyn Fn(&ProgressEvent) + Send + Sync + 'static>;

#[derive(Debug, Default)]
struct TrackerState {
    completed: u64,
    total: Option<u64>,
    started: Option<Instant>,
    generated_files: Option<GeneratedFilesManifest>,
    complete: bool,
    finished: Option<(FinishReason, bool)>,
    retries: BTreeMap<String, u64>,
}

/// Observable progress sink attached to every job. Observer callbacks run
/// on the publishing thread (the pipeline's), never under the manager lock.
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    observers: Mutex<Vec<Observer>>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock_unpoisoned();
        f.debug_struct("ProgressTracker")
            .field("completed", &state.completed)
            .field("total", &state.total)
            .field("complete", &state.complete)
            .field("finished", &state.finished)
            .finish()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn register_observer(&self, observer: impl Fn(&ProgressEvent) + Send + Sync + 'static) {
        self.observers.lock_unpoisoned().push(Arc::new(observer));
    }

    /// Publish the initial event for a run and start the elapsed clock.
    pub fn publish_start(&self, metadata: Payload) {
        {
            let mut state = self.state.lock_unpoisoned();
            state.started.get_or_insert_with(Instant::now);
        }
        self.emit("start", metadata, None);
    }

    /// Publish a progress event. `completed`, `total` and a structured
    /// `generated_files` submanifest are picked up from `metadata` when
    /// present so publishers only have to assemble one mapping.
    pub fn publish_progress(&self, metadata: Payload) {
        {
            let mut state = self.state.lock_unpoisoned();
            state.started.get_or_insert_with(Instant::now);
            if let Some(completed) = metadata.get("completed").and_then(coerce_u64) {
                state.completed = completed;
            }
            if let Some(total) = metadata.get("total").and_then(coerce_u64) {
                state.total = Some(total);
            }
            if let Some(raw) = metadata.get("generated_files")
                && let Ok(manifest) = serde_json::from_value::<GeneratedFilesManifest>(raw.clone())
            {
                if let Some(flag) = manifest.complete {
                    state.complete = flag;
                }
                state.generated_files = Some(manifest);
            }
        }
        self.emit("progress", metadata, None);
    }

    pub fn record_error(&self, message: &str, metadata: Payload) {
        self.emit("error", metadata, Some(message.to_string()));
    }

    /// Count a retry for `stage`. Retry totals survive into the persisted
    /// metadata so repeated endpoint failures are visible after the fact.
    pub fn record_retry(&self, stage: &str) {
        let mut state = self.state.lock_unpoisoned();
        *state.retries.entry(stage.to_string()).or_insert(0) += 1;
    }

    pub fn retry_summary(&self) -> BTreeMap<String, u64> {
        self.state.lock_unpoisoned().retries.clone()
    }

    /// Latest artifact manifest observed from progress events.
    pub fn generated_files(&self) -> Option<GeneratedFilesManifest> {
        self.state.lock_unpoisoned().generated_files.clone()
    }

    /// Whether rendering reached the end of the input according to the last
    /// manifest seen.
    pub fn is_complete(&self) -> bool {
        self.state.lock_unpoisoned().complete
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock_unpoisoned().finished.is_some()
    }

    /// Record the terminal outcome for this run. Idempotent; only the first
    /// call wins.
    pub fn mark_finished(&self, reason: FinishReason, forced: bool) {
        {
            let mut state = self.state.lock_unpoisoned();
            if state.finished.is_some() {
                return;
            }
            state.finished = Some((reason, forced));
        }
        let mut metadata = Payload::new();
        metadata.insert("reason".to_string(), serde_json::json!(reason.as_str()));
        metadata.insert("forced".to_string(), serde_json::json!(forced));
        self.emit("finished", metadata, None);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock_unpoisoned();
        Self::snapshot_locked(&state)
    }

    fn snapshot_locked(state: &TrackerState) -> ProgressSnapshot {
        let elapsed = state
            .started
            .map(|started| started.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let speed = if elapsed > 0.0 {
            state.completed as f64 / elapsed
        } else {
            0.0
        };
        let eta = match (state.total, speed > 0.0) {
            (Some(total), true) if total > state.completed => {
                Some((total - state.completed) as f64 / speed)
            }
            _ => None,
        };
        let generated_files = state.generated_files.as_ref().map(|manifest| {
            let mut by_type: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for file in &manifest.files {
                let kind = file.file_type.clone().unwrap_or_else(|| "file".to_string());
                if let Some(path) = file.relative_path.clone().or_else(|| file.path.clone()) {
                    by_type.entry(kind).or_default().push(path);
                }
            }
            by_type
        });
        ProgressSnapshot {
            completed: state.completed,
            total: state.total,
            elapsed,
            speed,
            eta,
            generated_files,
        }
    }

    fn emit(&self, event_type: &str, metadata: Payload, error: Option<String>) {
        let snapshot = self.snapshot();
        let event = ProgressEvent {
            event_type: event_type.to_string(),
            timestamp: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            snapshot,
            metadata,
            error,
        };
        let observers: Vec<Observer> = self.observers.lock_unpoisoned().clone();
        for observer in &observers {
            observer(&event);
        }
    }
}

fn coerce_u64(value: &serde_json::Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    value.as_str().and_then(|text| text.trim().parse().ok())
}
