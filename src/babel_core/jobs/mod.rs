//! Background job management: submission, bounded execution, durable
//! persistence, pause/resume/cancel coordination, and progress fan-out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::babel_core::config;
use crate::babel_core::domain::{Identity, Job, JobStatus, JobType, JobView, Payload, TransitionError};
use crate::babel_core::locator::FileLocator;
use crate::babel_core::overrides::validate_pipeline_overrides;
use crate::babel_core::pipeline::{PipelineRequest, PipelineRunner};
use crate::sync_ext::MutexExt;

pub mod backpressure;
pub(crate) mod coordinator;
pub mod executor;
pub mod lifecycle;
pub mod metadata;
pub mod persistence;
pub mod refresh;
pub mod request_factory;
pub(crate) mod state;
pub mod store;
pub mod submission;
pub mod tuner;

pub use backpressure::{BackpressureAction, BackpressurePolicy, BackpressureState, QueueFullError};
pub use executor::ExecutorHooks;
pub use metadata::JobMetadata;
pub use refresh::MetadataInference;
pub use store::{FileJobStore, InMemoryJobStore, JobStorageCoordinator, JobStore, StoreError};
#[cfg(feature = "redis-store")]
pub use store::RedisJobStore;
pub use submission::SubmitError;

use backpressure::{BackpressureAction as Action, BackpressureController};
use coordinator::TransitionKind;
use persistence::JobPersistence;
use state::{Inner, ManagerState, assert_job_access, queue_depth_locked};
use store::JobStorageCoordinator as Storage;
use tuner::JobTuner;

/// Errors surfaced by the query/mutation API.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("not authorized to manage job {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("persistence failure for job {job_id}: {source}")]
    Persistence {
        job_id: String,
        #[source]
        source: StoreError,
    },
    #[error("metadata inference failed: {0}")]
    Inference(String),
    #[error("{0}")]
    InvalidRequest(String),
}

impl JobError {
    pub(crate) fn from_store(job_id: &str, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => JobError::NotFound(job_id.to_string()),
            other => JobError::Persistence {
                job_id: job_id.to_string(),
                source: other,
            },
        }
    }
}

/// Builder for [`JobManager`]. Everything except the pipeline runner has a
/// sensible default derived from the environment and host hardware.
pub struct JobManagerBuilder {
    runner: Arc<dyn PipelineRunner>,
    store: Option<Arc<dyn JobStore>>,
    locator: Option<FileLocator>,
    max_workers: Option<u32>,
    backpressure: Option<BackpressurePolicy>,
    hooks: ExecutorHooks,
    inference: Option<Arc<dyn MetadataInference>>,
    pool_caching: bool,
}

impl JobManagerBuilder {
    pub fn new(runner: impl PipelineRunner) -> Self {
        Self {
            runner: Arc::new(runner),
            store: None,
            locator: None,
            max_workers: None,
            backpressure: None,
            hooks: ExecutorHooks::default(),
            inference: None,
            pool_caching: true,
        }
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn locator(mut self, locator: FileLocator) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn max_workers(mut self, max_workers: u32) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    pub fn backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = Some(policy);
        self
    }

    pub fn hooks(mut self, hooks: ExecutorHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn metadata_inference(mut self, inference: Arc<dyn MetadataInference>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn pool_caching(mut self, enabled: bool) -> Self {
        self.pool_caching = enabled;
        self
    }

    pub fn build(self) -> JobManager {
        let locator = self.locator.unwrap_or_else(FileLocator::from_env);
        let storage = match self.store {
            Some(store) => Storage::new(store),
            None => Storage::from_env(&locator),
        };
        let max_workers = config::resolve_job_max_workers(self.max_workers) as usize;

        let tuner = if self.pool_caching {
            JobTuner::with_cache(Some(max_workers))
        } else {
            JobTuner::new(None, Some(max_workers))
        };

        let inner = Arc::new(Inner {
            state: std::sync::Mutex::new(ManagerState::new()),
            cv: std::sync::Condvar::new(),
            store: storage.store(),
            persistence: JobPersistence::new(locator),
            event_observer: OnceCell::new(),
            tuner,
            backpressure: BackpressureController::new(
                self.backpressure.unwrap_or_default(),
            ),
            runner: self.runner,
            hooks: self.hooks,
            inference: self.inference,
            max_workers,
        });

        let weak = Arc::downgrade(&inner);
        let observer: request_factory::JobEventObserver = Arc::new(move |job_id, event| {
            if let Some(inner) = weak.upgrade() {
                state::store_event(&inner, job_id, event);
            }
        });
        inner
            .event_observer
            .set(observer)
            .ok()
            .expect("event observer set exactly once");

        let manager = JobManager { inner };
        manager.restore_persisted_jobs(&storage);
        state::spawn_workers(&manager.inner);
        manager
    }
}

/// Facade over the job management core. Clones share the same state, like
/// any other handle.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Build a manager with environment defaults around `runner`.
    pub fn new(runner: impl PipelineRunner) -> Self {
        JobManagerBuilder::new(runner).build()
    }

    pub fn builder(runner: impl PipelineRunner) -> JobManagerBuilder {
        JobManagerBuilder::new(runner)
    }

    /// Load persisted jobs and reconcile records that were live when the
    /// previous process died: anything persisted as running (or mid-pause)
    /// comes back paused, ready to resume from its checkpoint.
    fn restore_persisted_jobs(&self, storage: &Storage) {
        let stored = storage.load_all();
        let mut updates = Vec::new();
        {
            let mut state = self.inner.state.lock_unpoisoned();
            for (job_id, metadata) in stored {
                let mut job = self.inner.persistence.build_job(&metadata);
                if matches!(job.status, JobStatus::Running | JobStatus::Pausing) {
                    job.status = JobStatus::Paused;
                    updates.push(self.inner.persistence.snapshot(&mut job));
                }
                if matches!(job.status, JobStatus::Pending | JobStatus::Paused) {
                    state.jobs.insert(job_id, job);
                }
            }
        }
        if !updates.is_empty() {
            info!(count = updates.len(), "reconciled interrupted jobs to paused");
        }
        storage.persist_reconciliation(&updates);
    }

    /// Register `request` for background execution. Admission control runs
    /// first; an admitted submission is persisted before it is dispatched,
    /// so a crash after `submit` returns can never lose the job.
    pub fn submit(
        &self,
        request: PipelineRequest,
        identity: &Identity,
    ) -> Result<JobView, SubmitError> {
        validate_pipeline_overrides(&request.pipeline_overrides)?;

        let depth = {
            let state = self.inner.state.lock_unpoisoned();
            queue_depth_locked(&state)
        };
        match self.inner.backpressure.check(depth) {
            (Action::Reject, _) => {
                let policy = self.inner.backpressure.policy();
                warn!(depth, hard_limit = policy.hard_limit, "submission rejected by backpressure");
                return Err(QueueFullError {
                    queue_depth: depth,
                    hard_limit: policy.hard_limit,
                }
                .into());
            }
            (Action::Delay, seconds) if seconds > 0.0 => {
                std::thread::sleep(Duration::from_secs_f64(seconds));
            }
            _ => {}
        }

        let observer = self.inner.observer();
        let mut job = submission::create_pipeline_job(
            request,
            self.inner.persistence.locator(),
            &self.inner.tuner,
            identity,
            &observer,
        )?;
        let job_id = job.job_id.clone();
        let tuning_summary = job.tuning_summary.clone();
        let tracker = job.tracker.clone();

        let snapshot = {
            let mut state = self.inner.state.lock_unpoisoned();
            let snapshot = self.inner.persistence.snapshot(&mut job);
            state.jobs.insert(job_id.clone(), job.clone());
            snapshot
        };
        if let Err(err) = self.inner.store.save(&snapshot) {
            let mut state = self.inner.state.lock_unpoisoned();
            state.jobs.remove(&job_id);
            return Err(err.into());
        }

        // Surface the computed sizing through the progress stream right
        // away so observers see it before the first pipeline event.
        if let (Some(tracker), Some(summary)) = (tracker, tuning_summary) {
            let mut metadata = Payload::new();
            metadata.insert("stage".to_string(), serde_json::json!("configuration"));
            for (key, value) in summary {
                metadata.insert(key, value);
            }
            tracker.publish_progress(metadata);
        }

        info!(
            job_id = %job_id,
            input_file = %job.request.as_ref().map(|r| r.inputs.input_file.as_str()).unwrap_or(""),
            "pipeline job submitted"
        );

        state::dispatch(&self.inner, &job_id);
        Ok(JobView::from(&job))
    }

    /// Register a non-pipeline background job. The caller drives its
    /// progress through the returned tracker and records the terminal
    /// state via [`JobManager::finish`].
    pub fn register_background_job(
        &self,
        job_type: JobType,
        request_payload: Option<Payload>,
        identity: &Identity,
    ) -> Result<JobView, SubmitError> {
        let observer = self.inner.observer();
        let mut job = submission::create_background_job(
            job_type,
            self.inner.persistence.locator(),
            request_payload,
            identity,
            &observer,
        )?;
        let job_id = job.job_id.clone();
        let snapshot = {
            let mut state = self.inner.state.lock_unpoisoned();
            let snapshot = self.inner.persistence.snapshot(&mut job);
            state.jobs.insert(job_id.clone(), job.clone());
            snapshot
        };
        if let Err(err) = self.inner.store.save(&snapshot) {
            let mut state = self.inner.state.lock_unpoisoned();
            state.jobs.remove(&job_id);
            return Err(err.into());
        }
        Ok(JobView::from(&job))
    }

    pub fn get(&self, job_id: &str, identity: &Identity) -> Result<JobView, JobError> {
        {
            let state = self.inner.state.lock_unpoisoned();
            if let Some(job) = state.jobs.get(job_id) {
                assert_job_access(job, identity)?;
                return Ok(JobView::from(job));
            }
        }
        let metadata = self
            .inner
            .store
            .get(job_id)
            .map_err(|err| JobError::from_store(job_id, err))?;
        let job = self.inner.persistence.build_job(&metadata);
        assert_job_access(&job, identity)?;
        Ok(JobView::from(&job))
    }

    /// Snapshot of all visible jobs: live ones plus persisted records,
    /// filtered by role-based visibility.
    pub fn list(&self, identity: &Identity) -> BTreeMap<String, JobView> {
        let mut jobs: BTreeMap<String, Job> = {
            let state = self.inner.state.lock_unpoisoned();
            state
                .jobs
                .iter()
                .map(|(job_id, job)| (job_id.clone(), job.clone()))
                .collect()
        };
        if let Ok(stored) = self.inner.store.list() {
            for (job_id, metadata) in stored {
                jobs.entry(job_id)
                    .or_insert_with(|| self.inner.persistence.build_job(&metadata));
            }
        }

        jobs.into_iter()
            .filter(|(_, job)| {
                if identity.is_admin() {
                    return true;
                }
                match &identity.user_id {
                    Some(user_id) => job.user_id.as_deref() == Some(user_id.as_str()),
                    None => true,
                }
            })
            .map(|(job_id, job)| (job_id, JobView::from(&job)))
            .collect()
    }

    pub fn pause(&self, job_id: &str, identity: &Identity) -> Result<JobView, JobError> {
        coordinator::apply_transition(&self.inner, job_id, TransitionKind::Pause, identity)
            .map(|job| JobView::from(&job))
    }

    pub fn resume(&self, job_id: &str, identity: &Identity) -> Result<JobView, JobError> {
        coordinator::resume_and_dispatch(&self.inner, job_id, identity).map(|job| JobView::from(&job))
    }

    pub fn cancel(&self, job_id: &str, identity: &Identity) -> Result<JobView, JobError> {
        coordinator::apply_transition(&self.inner, job_id, TransitionKind::Cancel, identity)
            .map(|job| JobView::from(&job))
    }

    pub fn delete(&self, job_id: &str, identity: &Identity) -> Result<JobView, JobError> {
        coordinator::apply_transition(&self.inner, job_id, TransitionKind::Delete, identity)
            .map(|job| JobView::from(&job))
    }

    /// Record a terminal state for `job_id`. Trusted-internal entry point
    /// used by the executor path and by background-job drivers;
    /// authorization is intentionally bypassed.
    pub fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<String>,
        result_payload: Option<Payload>,
    ) -> Result<JobView, JobError> {
        coordinator::apply_transition(
            &self.inner,
            job_id,
            TransitionKind::Finish {
                status,
                error_message,
                result_payload,
            },
            &Identity::admin(),
        )
        .map(|job| JobView::from(&job))
    }

    /// Re-run metadata inference against the job's input file and merge
    /// the result into both request and result payloads.
    pub fn refresh_metadata(&self, job_id: &str, identity: &Identity) -> Result<JobView, JobError> {
        refresh::refresh_job_metadata(&self.inner, job_id, identity).map(|job| JobView::from(&job))
    }

    pub fn backpressure_state(&self) -> BackpressureState {
        let depth = {
            let state = self.inner.state.lock_unpoisoned();
            queue_depth_locked(&state)
        };
        self.inner.backpressure.state(depth)
    }

    /// (caching enabled, cached pools, pools in use)
    pub fn pool_cache_stats(&self) -> (bool, usize, usize) {
        self.inner.tuner.pool_cache_stats()
    }

    /// Stop the executor workers and shut down every cached worker pool.
    /// Jobs already running keep their cooperative stop tokens; this does
    /// not force-kill anything.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            state.shutdown = true;
            state.dispatch_queue.clear();
        }
        self.inner.cv.notify_all();
        self.inner.tuner.shutdown();
    }
}
