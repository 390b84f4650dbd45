//! Shared manager state: the live job map, the dispatch queue feeding the
//! executor workers, and the persist helpers every mutation goes through.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use once_cell::sync::OnceCell;
use tracing::{debug, warn};

use crate::babel_core::domain::{Identity, Job, JobStatus};
use crate::babel_core::jobs::backpressure::BackpressureController;
use crate::babel_core::jobs::executor::ExecutorHooks;
use crate::babel_core::jobs::persistence::JobPersistence;
use crate::babel_core::jobs::refresh::MetadataInference;
use crate::babel_core::jobs::request_factory::{JobEventObserver, RequestFactory};
use crate::babel_core::jobs::store::JobStore;
use crate::babel_core::jobs::tuner::JobTuner;
use crate::babel_core::jobs::JobError;
use crate::babel_core::pipeline::PipelineRunner;
use crate::babel_core::progress::{ProgressEvent, StopToken};
use crate::sync_ext::{CondvarExt, MutexExt};

pub(crate) struct ManagerState {
    pub(crate) jobs: HashMap<String, Job>,
    pub(crate) dispatch_queue: VecDeque<String>,
    /// Jobs currently inside an executor worker. A job with a live
    /// execution is pinned in the map even when a mutation moves it to a
    /// terminal state, so the executor can finish its wind-down against
    /// the same record.
    pub(crate) active_jobs: HashSet<String>,
    pub(crate) spawned_workers: usize,
    pub(crate) shutdown: bool,
}

impl ManagerState {
    pub(crate) fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            dispatch_queue: VecDeque::new(),
            active_jobs: HashSet::new(),
            spawned_workers: 0,
            shutdown: false,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) cv: Condvar,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) persistence: JobPersistence,
    pub(crate) event_observer: OnceCell<JobEventObserver>,
    pub(crate) tuner: JobTuner,
    pub(crate) backpressure: BackpressureController,
    pub(crate) runner: Arc<dyn PipelineRunner>,
    pub(crate) hooks: ExecutorHooks,
    pub(crate) inference: Option<Arc<dyn MetadataInference>>,
    pub(crate) max_workers: usize,
}

impl Inner {
    /// Observer wired to every job tracker so progress events keep flowing
    /// into the store. Set once right after construction.
    pub(crate) fn observer(&self) -> JobEventObserver {
        self.event_observer
            .get()
            .cloned()
            .expect("event observer initialized at construction")
    }

    pub(crate) fn factory(&self) -> RequestFactory {
        RequestFactory::new(self.event_observer.get().cloned())
    }
}

/// Number of admitted-but-unfinished jobs, the depth the admission
/// controller prices against.
pub(crate) fn queue_depth_locked(state: &ManagerState) -> usize {
    state
        .jobs
        .values()
        .filter(|job| matches!(job.status, JobStatus::Pending | JobStatus::Running))
        .count()
}

/// Authorization predicate: admins manage everything, everyone else only
/// their own jobs. Jobs without an owner are open.
pub(crate) fn assert_job_access(job: &Job, identity: &Identity) -> Result<(), JobError> {
    if identity.is_admin() {
        return Ok(());
    }
    let Some(owner) = &job.user_id else {
        return Ok(());
    };
    match &identity.user_id {
        Some(user_id) if user_id == owner => Ok(()),
        _ => Err(JobError::PermissionDenied(job.job_id.clone())),
    }
}

/// Whether a job in `status` stays in the live map. Terminal jobs are
/// evicted from memory but remain in the store until deleted.
pub(crate) fn retained_in_memory(status: JobStatus) -> bool {
    matches!(
        status,
        JobStatus::Pending | JobStatus::Running | JobStatus::Pausing | JobStatus::Paused
    )
}

/// Load `job_id` for mutation: the live copy when present, otherwise a
/// hydrated copy from the store.
pub(crate) fn load_job_for_mutation(inner: &Inner, job_id: &str) -> Result<(Job, bool), JobError> {
    {
        let state = inner.state.lock_unpoisoned();
        if let Some(job) = state.jobs.get(job_id) {
            return Ok((job.clone(), true));
        }
    }
    let metadata = inner
        .store
        .get(job_id)
        .map_err(|err| JobError::from_store(job_id, err))?;
    Ok((inner.persistence.build_job(&metadata), false))
}

/// Apply `mutate` to a job and persist the result.
///
/// The in-memory copy is updated first, then the snapshot is written to the
/// store with the manager lock released (the store may block on I/O). If
/// the store write fails the in-memory change is rolled back and the error
/// is surfaced. The optional stop token returned by `mutate` is signalled
/// only after the mutation is durable, so a failed persist never leaves a
/// half-cancelled run behind.
pub(crate) fn mutate_and_persist(
    inner: &Inner,
    job_id: &str,
    identity: Option<&Identity>,
    mutate: impl FnOnce(&mut Job) -> Result<Option<StopToken>, JobError>,
) -> Result<Job, JobError> {
    // Load, authorize, mutate, install, and snapshot under one lock scope
    // so no concurrent executor update can interleave. Only the store
    // write happens with the lock released.
    let (job, pre_image, signal, snapshot) = {
        let mut state = inner.state.lock_unpoisoned();
        let (mut job, pre_image) = match state.jobs.get(job_id) {
            Some(live) => (live.clone(), Some(live.clone())),
            None => {
                let metadata = inner
                    .store
                    .get(job_id)
                    .map_err(|err| JobError::from_store(job_id, err))?;
                (inner.persistence.build_job(&metadata), None)
            }
        };
        if let Some(identity) = identity {
            assert_job_access(&job, identity)?;
        }

        let signal = mutate(&mut job)?;

        if retained_in_memory(job.status) || state.active_jobs.contains(job_id) {
            state.jobs.insert(job_id.to_string(), job.clone());
        } else {
            state.jobs.remove(job_id);
        }
        let snapshot = inner.persistence.snapshot(&mut job);
        (job, pre_image, signal, snapshot)
    };

    if let Err(err) = inner.store.update(&snapshot) {
        let mut state = inner.state.lock_unpoisoned();
        // Roll back only if nothing else has touched the job since; a
        // concurrent executor write supersedes this mutation.
        let untouched = state
            .jobs
            .get(job_id)
            .map(|current| current.status == job.status)
            .unwrap_or(!retained_in_memory(job.status));
        if untouched {
            match pre_image {
                Some(previous) => {
                    state.jobs.insert(job_id.to_string(), previous);
                }
                None => {
                    state.jobs.remove(job_id);
                }
            }
        }
        return Err(JobError::Persistence {
            job_id: job_id.to_string(),
            source: err,
        });
    }

    if let Some(token) = signal {
        token.signal();
    }
    Ok(job)
}

/// Fold a progress event into the job and persist the refreshed snapshot.
/// This observer path is the sole source of resume data, so it also
/// recomputes the resume context while the job is running.
pub(crate) fn store_event(inner: &Inner, job_id: &str, event: &ProgressEvent) {
    let snapshot = {
        let mut state = inner.state.lock_unpoisoned();
        let Some(job) = state.jobs.get_mut(job_id) else {
            return;
        };
        inner.persistence.absorb_event(job, event);
        if job.status == JobStatus::Running
            && let Some(context) = super::lifecycle::compute_resume_context(job)
        {
            job.resume_context = Some(context);
        }
        inner.persistence.snapshot(job)
    };

    if let Err(err) = inner.store.update(&snapshot) {
        warn!(job_id = %job_id, error = %err, "failed to persist progress snapshot");
    }

    debug!(
        job_id = %job_id,
        event_type = %event.event_type,
        completed = event.snapshot.completed,
        stage = event.metadata.get("stage").and_then(|v| v.as_str()).unwrap_or(""),
        "pipeline progress event"
    );
}

/// Queue `job_id` for an executor worker and wake one up.
pub(crate) fn dispatch(inner: &Inner, job_id: &str) {
    {
        let mut state = inner.state.lock_unpoisoned();
        if state.shutdown {
            return;
        }
        state.dispatch_queue.push_back(job_id.to_string());
    }
    inner.cv.notify_one();
}

/// Spawn executor worker threads up to the configured worker count.
pub(crate) fn spawn_workers(inner: &Arc<Inner>) {
    let (start_index, desired) = {
        let state = inner.state.lock_unpoisoned();
        (state.spawned_workers, inner.max_workers.max(1))
    };

    let mut spawned = 0usize;
    for index in start_index..desired {
        let inner_clone = inner.clone();
        let result = std::thread::Builder::new()
            .name(format!("babelbook-job-worker-{index}"))
            .spawn(move || worker_loop(&inner_clone));
        if let Err(err) = result {
            warn!(error = %err, "failed to spawn job worker thread");
            break;
        }
        spawned += 1;
    }

    if spawned > 0 {
        let mut state = inner.state.lock_unpoisoned();
        state.spawned_workers = state.spawned_workers.max(start_index + spawned);
    }
}

fn worker_loop(inner: &Arc<Inner>) {
    loop {
        let job_id = {
            let mut state = inner.state.lock_unpoisoned();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(job_id) = state.dispatch_queue.pop_front() {
                    break job_id;
                }
                state = inner.cv.wait_unpoisoned(state);
            }
        };

        super::executor::execute(inner, &job_id);
    }
}
