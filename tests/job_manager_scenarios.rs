//! End-to-end scenarios driving the job manager against a scripted
//! pipeline double: happy path, pause/resume with block-aligned
//! checkpoints, cancellation, admission control, restart reconciliation,
//! and access control.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use babelbook::{
    BackpressurePolicy, FileLocator, Identity, InMemoryJobStore, JobError, JobManager, JobStatus,
    JobStore, Payload, PipelineInput, PipelineRequest, PipelineResponse, PipelineRunner,
    SubmitError,
};
use babelbook::{ExecutorHooks, PipelineConfig};

fn editor() -> Identity {
    Identity::new("alice", "editor")
}

fn sample_request(input_file: &str) -> PipelineRequest {
    PipelineRequest::new(
        PipelineConfig {
            thread_count: Some(1),
            ..PipelineConfig::default()
        },
        PipelineInput {
            input_file: input_file.to_string(),
            start_sentence: 1,
            sentences_per_output_file: 10,
            target_languages: vec!["de".to_string()],
            ..PipelineInput::default()
        },
    )
}

fn manager_with(
    runner: impl PipelineRunner,
    store: Arc<InMemoryJobStore>,
    dir: &tempfile::TempDir,
    policy: BackpressurePolicy,
    hooks: ExecutorHooks,
) -> JobManager {
    JobManager::builder(runner)
        .store(store)
        .locator(FileLocator::new(dir.path(), None))
        .max_workers(2)
        .backpressure(policy)
        .hooks(hooks)
        .build()
}

fn wait_for_status(
    manager: &JobManager,
    job_id: &str,
    identity: &Identity,
    status: JobStatus,
) -> babelbook::JobView {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let view = manager
            .get(job_id, identity)
            .expect("job visible while waiting");
        if view.status == status {
            return view;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {:?}, job stuck in {:?}",
            status,
            view.status
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn wait_for_signal(rx: &Receiver<()>) {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("pipeline double reached its checkpoint");
}

fn wait_for_stop(request: &PipelineRequest) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !request.stop_token.is_signalled() {
        assert!(Instant::now() < deadline, "stop token never signalled");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn progress_metadata(sentence_number: u64) -> Payload {
    let mut metadata = Payload::new();
    metadata.insert("stage".to_string(), serde_json::json!("translation"));
    metadata.insert("completed".to_string(), serde_json::json!(sentence_number));
    metadata.insert(
        "sentence_number".to_string(),
        serde_json::json!(sentence_number),
    );
    metadata
}

#[test]
fn submit_runs_to_completion_and_records_duration_metric() {
    let store = Arc::new(InMemoryJobStore::new());
    let dir = tempfile::tempdir().unwrap();
    let metrics: Arc<Mutex<Vec<(String, f64, BTreeMap<String, String>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let metrics_clone = metrics.clone();

    let hooks = ExecutorHooks {
        record_metric: Some(Arc::new(move |name, value, attributes| {
            metrics_clone
                .lock()
                .unwrap()
                .push((name.to_string(), value, attributes.clone()));
        })),
        ..ExecutorHooks::default()
    };

    let runner = |request: &PipelineRequest| -> anyhow::Result<PipelineResponse> {
        request
            .progress_tracker
            .publish_progress(progress_metadata(10));
        Ok(PipelineResponse {
            success: true,
            refined_sentences: vec!["Erster Satz.".to_string()],
            ..PipelineResponse::default()
        })
    };

    let manager = manager_with(
        runner,
        store.clone(),
        &dir,
        BackpressurePolicy::default(),
        hooks,
    );
    let submitted = manager.submit(sample_request("books/alice.epub"), &editor()).unwrap();
    assert_eq!(submitted.status, JobStatus::Pending);

    let view = wait_for_status(&manager, &submitted.job_id, &editor(), JobStatus::Completed);
    let started_at = view.started_at.expect("started_at set");
    let completed_at = view.completed_at.expect("completed_at set");
    assert!(view.created_at <= started_at);
    assert!(started_at <= completed_at);
    assert!(view.error_message.is_none());
    assert!(view.result_payload.is_some());
    assert!(view.media_completed);

    // The store holds exactly one record and it matches the live view.
    let records = store.list().unwrap();
    assert_eq!(records.len(), 1);
    let record = records.get(&submitted.job_id).unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert!(record.result.is_some());

    let recorded = metrics.lock().unwrap();
    let (name, value, attributes) = recorded
        .iter()
        .find(|(name, _, _)| name == "pipeline.job.duration")
        .expect("duration metric recorded");
    assert_eq!(name, "pipeline.job.duration");
    assert!(*value >= 0.0);
    assert_eq!(attributes.get("status").map(String::as_str), Some("completed"));

    manager.shutdown();
}

#[test]
fn pause_at_sentence_23_resumes_from_block_boundary() {
    let store = Arc::new(InMemoryJobStore::new());
    let dir = tempfile::tempdir().unwrap();
    let (running_tx, running_rx) = channel::<()>();
    let running_tx = Mutex::new(running_tx);
    let invocation = AtomicUsize::new(0);
    let resumed_starts: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let resumed_starts_clone = resumed_starts.clone();

    let runner = move |request: &PipelineRequest| -> anyhow::Result<PipelineResponse> {
        match invocation.fetch_add(1, Ordering::SeqCst) {
            0 => {
                request
                    .progress_tracker
                    .publish_progress(progress_metadata(23));
                let _ = running_tx.lock().unwrap().send(());
                wait_for_stop(request);
                Ok(PipelineResponse::default())
            }
            _ => {
                resumed_starts_clone
                    .lock()
                    .unwrap()
                    .push(request.inputs.start_sentence);
                assert!(!request.stop_token.is_signalled(), "resume must carry a fresh stop token");
                Ok(PipelineResponse {
                    success: true,
                    ..PipelineResponse::default()
                })
            }
        }
    };

    let manager = manager_with(
        runner,
        store.clone(),
        &dir,
        BackpressurePolicy::default(),
        ExecutorHooks::default(),
    );
    let submitted = manager.submit(sample_request("books/alice.epub"), &editor()).unwrap();
    wait_for_signal(&running_rx);

    let paused_view = manager.pause(&submitted.job_id, &editor()).unwrap();
    assert!(matches!(
        paused_view.status,
        JobStatus::Pausing | JobStatus::Paused
    ));

    wait_for_status(&manager, &submitted.job_id, &editor(), JobStatus::Paused);

    let record = store.get(&submitted.job_id).unwrap();
    let inputs = record
        .resume_context
        .as_ref()
        .and_then(|context| context.get("inputs"))
        .and_then(|value| value.as_object())
        .expect("resume context inputs");
    assert_eq!(inputs.get("start_sentence").and_then(|v| v.as_u64()), Some(21));
    assert_eq!(inputs.get("resume_block_start").and_then(|v| v.as_u64()), Some(21));
    assert_eq!(inputs.get("resume_last_sentence").and_then(|v| v.as_u64()), Some(23));
    assert_eq!(inputs.get("resume_next_sentence").and_then(|v| v.as_u64()), Some(24));

    let resumed = manager.resume(&submitted.job_id, &editor()).unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);

    wait_for_status(&manager, &submitted.job_id, &editor(), JobStatus::Completed);
    assert_eq!(resumed_starts.lock().unwrap().as_slice(), &[21]);

    manager.shutdown();
}

#[test]
fn cancel_mid_run_preserves_partial_artifacts() {
    let store = Arc::new(InMemoryJobStore::new());
    let dir = tempfile::tempdir().unwrap();
    let (running_tx, running_rx) = channel::<()>();
    let running_tx = Mutex::new(running_tx);

    let runner = move |request: &PipelineRequest| -> anyhow::Result<PipelineResponse> {
        let mut metadata = progress_metadata(5);
        metadata.insert(
            "generated_files".to_string(),
            serde_json::json!({
                "chunks": [{
                    "chunk_id": "chunk-1",
                    "start_sentence": 1,
                    "end_sentence": 10,
                    "files": [{"type": "text", "relative_path": "media/chunk-1.txt"}],
                }],
                "complete": false,
            }),
        );
        request.progress_tracker.publish_progress(metadata);
        let _ = running_tx.lock().unwrap().send(());
        wait_for_stop(request);
        Ok(PipelineResponse::default())
    };

    let manager = manager_with(
        runner,
        store.clone(),
        &dir,
        BackpressurePolicy::default(),
        ExecutorHooks::default(),
    );
    let submitted = manager.submit(sample_request("books/alice.epub"), &editor()).unwrap();
    wait_for_signal(&running_rx);

    manager.cancel(&submitted.job_id, &editor()).unwrap();
    let view = wait_for_status(&manager, &submitted.job_id, &editor(), JobStatus::Cancelled);

    assert!(view.result_payload.is_none());
    assert!(view.error_message.is_none());
    let manifest = view.generated_files.expect("partial artifacts preserved");
    assert_eq!(manifest.chunks.len(), 1);
    assert_eq!(manifest.chunks[0].chunk_id.as_deref(), Some("chunk-1"));
    assert_eq!(
        manifest.chunks[0].files[0].relative_path.as_deref(),
        Some("media/chunk-1.txt")
    );

    manager.shutdown();
}

#[test]
fn admission_control_delays_then_rejects_past_the_hard_limit() {
    let store = Arc::new(InMemoryJobStore::new());
    let dir = tempfile::tempdir().unwrap();
    let (gate_tx, gate_rx) = channel::<()>();
    let gate_rx = Mutex::new(gate_rx);

    let runner = move |_request: &PipelineRequest| -> anyhow::Result<PipelineResponse> {
        let _ = gate_rx.lock().unwrap().recv_timeout(Duration::from_secs(30));
        Ok(PipelineResponse {
            success: true,
            ..PipelineResponse::default()
        })
    };

    let manager = manager_with(
        runner,
        store,
        &dir,
        BackpressurePolicy {
            enabled: true,
            soft_limit: 2,
            hard_limit: 4,
            base_delay_seconds: 0.01,
            max_delay_seconds: 0.05,
        },
        ExecutorHooks::default(),
    );

    let mut accepted = Vec::new();
    for index in 0..4 {
        let view = manager
            .submit(sample_request(&format!("books/{index}.epub")), &editor())
            .unwrap_or_else(|err| panic!("submission {index} should be admitted: {err}"));
        accepted.push(view.job_id);
    }

    let rejected = manager.submit(sample_request("books/overflow.epub"), &editor());
    match rejected {
        Err(SubmitError::QueueFull(err)) => {
            assert_eq!(err.queue_depth, 4);
            assert_eq!(err.hard_limit, 4);
        }
        other => panic!("expected queue-full rejection, got {other:?}"),
    }

    let state = manager.backpressure_state();
    assert_eq!(state.rejection_count, 1);
    assert_eq!(state.delay_count, 2);

    // Release the gated runners so worker threads wind down cleanly.
    for _ in 0..accepted.len() {
        let _ = gate_tx.send(());
    }
    manager.shutdown();
}

#[test]
fn restart_reconciles_running_jobs_to_paused() {
    let store = Arc::new(InMemoryJobStore::new());
    let dir = tempfile::tempdir().unwrap();

    // A record persisted as running by a process that died mid-run.
    let document = serde_json::json!({
        "job_id": "job-restart",
        "job_type": "pipeline",
        "status": "running",
        "created_at": "2026-08-01T10:00:00Z",
        "started_at": "2026-08-01T10:00:01Z",
        "user_id": "alice",
        "user_role": "editor",
        "request": {
            "config": {"thread_count": 1, "debug": false},
            "inputs": {
                "input_file": "books/alice.epub",
                "start_sentence": 1,
                "sentences_per_output_file": 10,
            },
            "correlation_id": "corr-restart",
        },
    });
    let metadata = babelbook::JobMetadata::from_json(&document.to_string()).unwrap();
    store.save(&metadata).unwrap();

    let resumed_inputs: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let resumed_inputs_clone = resumed_inputs.clone();
    let runner = move |request: &PipelineRequest| -> anyhow::Result<PipelineResponse> {
        resumed_inputs_clone
            .lock()
            .unwrap()
            .push(request.inputs.start_sentence);
        Ok(PipelineResponse {
            success: true,
            ..PipelineResponse::default()
        })
    };

    let manager = manager_with(
        runner,
        store.clone(),
        &dir,
        BackpressurePolicy::default(),
        ExecutorHooks::default(),
    );

    // The interrupted job comes back paused, both in memory and durably.
    let listed = manager.list(&editor());
    assert_eq!(
        listed.get("job-restart").map(|view| view.status),
        Some(JobStatus::Paused)
    );
    assert_eq!(store.get("job-restart").unwrap().status, JobStatus::Paused);

    // It has no live request attached, so resume rehydrates one from the
    // persisted payload and the run proceeds.
    manager.resume("job-restart", &editor()).unwrap();
    wait_for_status(&manager, "job-restart", &editor(), JobStatus::Completed);
    assert_eq!(resumed_inputs.lock().unwrap().len(), 1);

    manager.shutdown();
}

#[test]
fn unauthorized_mutation_is_rejected_and_leaves_the_job_untouched() {
    let store = Arc::new(InMemoryJobStore::new());
    let dir = tempfile::tempdir().unwrap();
    let (running_tx, running_rx) = channel::<()>();
    let running_tx = Mutex::new(running_tx);

    let runner = move |request: &PipelineRequest| -> anyhow::Result<PipelineResponse> {
        let _ = running_tx.lock().unwrap().send(());
        wait_for_stop(request);
        Ok(PipelineResponse::default())
    };

    let manager = manager_with(
        runner,
        store.clone(),
        &dir,
        BackpressurePolicy::default(),
        ExecutorHooks::default(),
    );
    let submitted = manager.submit(sample_request("books/alice.epub"), &editor()).unwrap();
    wait_for_signal(&running_rx);

    let intruder = Identity::new("bob", "viewer");
    match manager.cancel(&submitted.job_id, &intruder) {
        Err(JobError::PermissionDenied(job_id)) => assert_eq!(job_id, submitted.job_id),
        other => panic!("expected permission denial, got {other:?}"),
    }

    // Unchanged in memory and in the store.
    let view = manager.get(&submitted.job_id, &editor()).unwrap();
    assert_eq!(view.status, JobStatus::Running);
    assert_eq!(store.get(&submitted.job_id).unwrap().status, JobStatus::Running);

    // Viewers cannot even see someone else's job; admins can mutate it.
    assert!(manager.get(&submitted.job_id, &intruder).is_err());
    let admin = Identity::admin();
    manager.cancel(&submitted.job_id, &admin).unwrap();
    wait_for_status(&manager, &submitted.job_id, &admin, JobStatus::Cancelled);

    manager.shutdown();
}

#[test]
fn delete_is_only_valid_from_settled_states() {
    let store = Arc::new(InMemoryJobStore::new());
    let dir = tempfile::tempdir().unwrap();
    let (running_tx, running_rx) = channel::<()>();
    let running_tx = Mutex::new(running_tx);

    let runner = move |request: &PipelineRequest| -> anyhow::Result<PipelineResponse> {
        let _ = running_tx.lock().unwrap().send(());
        wait_for_stop(request);
        Ok(PipelineResponse::default())
    };

    let manager = manager_with(
        runner,
        store.clone(),
        &dir,
        BackpressurePolicy::default(),
        ExecutorHooks::default(),
    );
    let submitted = manager.submit(sample_request("books/alice.epub"), &editor()).unwrap();
    wait_for_signal(&running_rx);

    match manager.delete(&submitted.job_id, &editor()) {
        Err(JobError::Transition(err)) => assert_eq!(err.from, JobStatus::Running),
        other => panic!("expected transition error, got {other:?}"),
    }

    manager.cancel(&submitted.job_id, &editor()).unwrap();
    wait_for_status(&manager, &submitted.job_id, &editor(), JobStatus::Cancelled);

    // The cancelled run may still be winding down for a moment; deletion
    // becomes valid as soon as the executor lets go of the record.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match manager.delete(&submitted.job_id, &editor()) {
            Ok(_) => break,
            Err(JobError::Transition(_)) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(other) => panic!("delete failed: {other}"),
        }
    }
    assert!(manager.get(&submitted.job_id, &editor()).is_err());
    assert!(store.get(&submitted.job_id).is_err());

    manager.shutdown();
}
