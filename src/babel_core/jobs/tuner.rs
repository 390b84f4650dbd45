//! Worker sizing for pipeline jobs, plus the pool cache that makes repeated
//! short jobs cheap by reusing translation worker pools across runs.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::babel_core::config::{
    self, hardware_tuning_defaults, is_local_llm_provider, split_llm_model_identifier,
};
use crate::babel_core::domain::{Job, Payload};
use crate::babel_core::pipeline::PipelineRequest;
use crate::babel_core::workers::ThreadWorkerPool;
use crate::sync_ext::MutexExt;

pub const DEFAULT_MAX_CACHED_POOLS: usize = 4;
pub const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Providers that execute on shared local inference hardware.
const LLM_PROVIDER_ALIASES: &[&str] = &["llm", "ollama", "default"];
/// Worker cap applied when batched translation hits a local provider;
/// a single GPU gains nothing from competing translation threads.
const LLM_BATCH_WORKERS: u32 = 1;

const FALLBACK_POOL_WORKERS: u32 = 4;

struct CacheEntry {
    pool: Arc<ThreadWorkerPool>,
    workers: usize,
    last_used: Instant,
    in_use: bool,
}

/// Caches worker pools keyed by worker count. Pools are marked in-use on
/// acquire; idle pools past the timeout are evicted on the next acquire.
pub struct WorkerPoolCache {
    max_cached: usize,
    idle_timeout: Duration,
    pools: Mutex<Vec<CacheEntry>>,
}

impl WorkerPoolCache {
    pub fn new(max_cached: usize, idle_timeout: Duration) -> Self {
        Self {
            max_cached: max_cached.max(1),
            idle_timeout,
            pools: Mutex::new(Vec::new()),
        }
    }

    /// Return an idle pool with a matching worker count, or create one.
    /// The boolean is true when the pool was newly created.
    pub fn acquire(&self, max_workers: usize) -> (Arc<ThreadWorkerPool>, bool) {
        {
            let mut pools = self.pools.lock_unpoisoned();
            if let Some(entry) = pools
                .iter_mut()
                .find(|entry| entry.workers == max_workers && !entry.in_use)
            {
                entry.in_use = true;
                entry.last_used = Instant::now();
                return (entry.pool.clone(), false);
            }

            if pools.len() >= self.max_cached {
                self.cleanup_idle_locked(&mut pools);
            }

            if pools.len() >= self.max_cached {
                // Replace the longest-idle pool when the cache is full.
                let oldest_idle = pools
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| !entry.in_use)
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(index, _)| index);
                if let Some(index) = oldest_idle {
                    let replaced = &pools[index];
                    replaced.pool.shutdown(false);
                    let pool = Arc::new(ThreadWorkerPool::new(max_workers));
                    pools[index] = CacheEntry {
                        pool: pool.clone(),
                        workers: max_workers,
                        last_used: Instant::now(),
                        in_use: true,
                    };
                    return (pool, true);
                }
                // Every slot is busy; hand out an uncached pool. It will be
                // shut down on release.
                return (Arc::new(ThreadWorkerPool::new(max_workers)), true);
            }

            let pool = Arc::new(ThreadWorkerPool::new(max_workers));
            pools.push(CacheEntry {
                pool: pool.clone(),
                workers: max_workers,
                last_used: Instant::now(),
                in_use: true,
            });
            (pool, true)
        }
    }

    /// Return `pool` to idle state. Pools the cache does not know about
    /// (created while at capacity) are shut down immediately.
    pub fn release(&self, pool: &Arc<ThreadWorkerPool>) {
        {
            let mut pools = self.pools.lock_unpoisoned();
            if let Some(entry) = pools
                .iter_mut()
                .find(|entry| Arc::ptr_eq(&entry.pool, pool))
            {
                entry.in_use = false;
                entry.last_used = Instant::now();
                return;
            }
        }
        pool.shutdown(false);
    }

    fn cleanup_idle_locked(&self, pools: &mut Vec<CacheEntry>) {
        let now = Instant::now();
        pools.retain(|entry| {
            let expired = !entry.in_use && now.duration_since(entry.last_used) > self.idle_timeout;
            if expired {
                entry.pool.shutdown(false);
            }
            !expired
        });
    }

    pub fn shutdown_all(&self) {
        let mut pools = self.pools.lock_unpoisoned();
        for entry in pools.drain(..) {
            entry.pool.shutdown(false);
        }
    }

    pub fn cached_count(&self) -> usize {
        self.pools.lock_unpoisoned().len()
    }

    pub fn in_use_count(&self) -> usize {
        self.pools
            .lock_unpoisoned()
            .iter()
            .filter(|entry| entry.in_use)
            .count()
    }
}

impl Default for WorkerPoolCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHED_POOLS, DEFAULT_POOL_IDLE_TIMEOUT)
    }
}

/// Computes worker counts and tuning summaries from a request plus host
/// hardware, and hands pools out of the cache.
pub struct JobTuner {
    pool_cache: Option<WorkerPoolCache>,
    executor_slots: Option<usize>,
}

impl JobTuner {
    pub fn new(pool_cache: Option<WorkerPoolCache>, executor_slots: Option<usize>) -> Self {
        Self {
            pool_cache,
            executor_slots,
        }
    }

    pub fn with_cache(executor_slots: Option<usize>) -> Self {
        Self::new(Some(WorkerPoolCache::default()), executor_slots)
    }

    /// Assemble the tuning summary attached to a job at submission and
    /// surfaced through progress events.
    pub fn build_tuning_summary(&self, request: &PipelineRequest) -> Payload {
        let mut summary = Payload::new();
        if let Some(thread_count) = self.resolve_thread_count(request) {
            summary.insert("thread_count".to_string(), Value::from(thread_count));
        }
        if let Some(queue_size) = Self::resolve_queue_size(request) {
            summary.insert("queue_size".to_string(), Value::from(queue_size));
        }
        if let Some(job_max_workers) = Self::resolve_job_max_workers(request) {
            summary.insert("job_max_workers".to_string(), Value::from(job_max_workers));
        }
        if let Some(slots) = self.executor_slots
            && slots > 0
        {
            summary.insert("job_worker_slots".to_string(), Value::from(slots as u64));
        }
        if let Some(pipeline_mode) = Self::resolve_pipeline_mode(request) {
            summary.insert("pipeline_mode".to_string(), Value::from(pipeline_mode));
        }
        let hardware = hardware_tuning_defaults();
        summary.insert(
            "hardware_profile".to_string(),
            Value::from(hardware.profile),
        );
        summary.insert(
            "detected_cpu_cores".to_string(),
            Value::from(hardware.detected_cpu_count as u64),
        );
        summary.insert(
            "detected_memory_gib".to_string(),
            Value::from(hardware.detected_memory_gib),
        );
        summary
    }

    /// Acquire a translation pool for `job`, marking the job's tuning
    /// summary with the live pool size. The boolean reports whether the
    /// pool was newly created.
    pub fn acquire_worker_pool(&self, job: &mut Job) -> (Option<Arc<ThreadWorkerPool>>, bool) {
        let Some(request) = job.request.clone() else {
            return (None, false);
        };
        if let Some(existing) = request.translation_pool() {
            Self::update_pool_summary(job, &existing);
            return (Some(existing), false);
        }

        let max_workers = self
            .resolve_thread_count(&request)
            .unwrap_or(FALLBACK_POOL_WORKERS) as usize;

        let (pool, is_new) = match &self.pool_cache {
            Some(cache) => cache.acquire(max_workers),
            None => (Arc::new(ThreadWorkerPool::new(max_workers)), true),
        };

        request.set_translation_pool(Some(pool.clone()));
        Self::update_pool_summary(job, &pool);
        (Some(pool), is_new)
    }

    /// Detach the job's pool and return it to the cache (or shut it down
    /// when caching is disabled). Shutdown failures are not propagated.
    pub fn release_worker_pool(&self, job: &mut Job) {
        let Some(request) = job.request.clone() else {
            return;
        };
        let Some(pool) = request.take_translation_pool() else {
            return;
        };
        match &self.pool_cache {
            Some(cache) => cache.release(&pool),
            None => pool.shutdown(false),
        }
        debug!(job_id = %job.job_id, workers = pool.max_workers(), "translation pool released");
    }

    pub fn shutdown(&self) {
        if let Some(cache) = &self.pool_cache {
            cache.shutdown_all();
        }
    }

    pub fn pool_cache_stats(&self) -> (bool, usize, usize) {
        match &self.pool_cache {
            Some(cache) => (true, cache.cached_count(), cache.in_use_count()),
            None => (false, 0, 0),
        }
    }

    fn update_pool_summary(job: &mut Job, pool: &Arc<ThreadWorkerPool>) {
        if let Some(summary) = &mut job.tuning_summary {
            summary.insert(
                "translation_pool_workers".to_string(),
                Value::from(pool.max_workers() as u64),
            );
        }
    }

    /// Resolve translation worker parallelism: request overrides, then the
    /// runtime context, then configuration. Batched translation against a
    /// local provider is capped to a single worker.
    pub fn resolve_thread_count(&self, request: &PipelineRequest) -> Option<u32> {
        if let Some(value) = request.pipeline_overrides.get("thread_count") {
            let resolved = coerce_non_negative_u32(value)?;
            return Some(resolved.max(1));
        }

        let candidate = request
            .context
            .as_ref()
            .and_then(|context| context.thread_count)
            .or(request.config.thread_count)?;
        let resolved = candidate.max(1);
        if Self::should_limit_batch_workers(request) {
            Some(resolved.min(LLM_BATCH_WORKERS))
        } else {
            Some(resolved)
        }
    }

    fn should_limit_batch_workers(request: &PipelineRequest) -> bool {
        if request.inputs.translation_batch_size <= 1 {
            return false;
        }
        let provider = request.inputs.translation_provider.trim().to_ascii_lowercase();
        if !LLM_PROVIDER_ALIASES.contains(&provider.as_str()) {
            return false;
        }

        let model_name = ["ollama_model", "llm_model"]
            .iter()
            .find_map(|key| {
                request
                    .pipeline_overrides
                    .get(*key)
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
            })
            .map(str::to_string)
            .or_else(|| request.config.llm_model.clone());

        if let Some(model_name) = model_name {
            let (provider, stripped) = split_llm_model_identifier(&model_name);
            if let Some(provider) = provider
                && let Some(local) = is_local_llm_provider(provider)
            {
                return local;
            }
            let candidate = stripped.unwrap_or(model_name);
            return !candidate.to_ascii_lowercase().contains("cloud");
        }

        let llm_source = request
            .pipeline_overrides
            .get("llm_source")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                request
                    .context
                    .as_ref()
                    .and_then(|context| context.llm_source.clone())
            })
            .or_else(|| request.config.llm_source.clone())
            .unwrap_or_else(|| config::DEFAULT_LLM_SOURCE.to_string());
        llm_source.trim().eq_ignore_ascii_case("local")
    }

    fn resolve_queue_size(request: &PipelineRequest) -> Option<u32> {
        request
            .pipeline_overrides
            .get("queue_size")
            .and_then(coerce_non_negative_u32)
            .or_else(|| request.context.as_ref().and_then(|context| context.queue_size))
            .or(request.config.queue_size)
    }

    fn resolve_job_max_workers(request: &PipelineRequest) -> Option<u32> {
        let candidate = request
            .pipeline_overrides
            .get("job_max_workers")
            .and_then(coerce_non_negative_u32)
            .or(request.config.job_max_workers);
        match candidate {
            Some(value) if value > 0 => Some(value),
            _ => {
                let recommended = hardware_tuning_defaults().job_max_workers;
                (recommended > 0).then_some(recommended)
            }
        }
    }

    fn resolve_pipeline_mode(request: &PipelineRequest) -> Option<bool> {
        request
            .pipeline_overrides
            .get("pipeline_mode")
            .and_then(Value::as_bool)
            .or_else(|| {
                request
                    .context
                    .as_ref()
                    .and_then(|context| context.pipeline_enabled)
            })
            .or(request.config.pipeline_mode)
    }
}

fn coerce_non_negative_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::babel_core::config::PipelineConfig;
    use crate::babel_core::domain::JobType;
    use crate::babel_core::pipeline::PipelineInput;
    use chrono::Utc;

    fn request_with(config: PipelineConfig, inputs: PipelineInput) -> PipelineRequest {
        PipelineRequest::new(config, inputs)
    }

    #[test]
    fn cache_reuses_idle_pools_with_matching_size() {
        let cache = WorkerPoolCache::new(2, Duration::from_secs(300));
        let (first, first_new) = cache.acquire(2);
        assert!(first_new);
        cache.release(&first);

        let (second, second_new) = cache.acquire(2);
        assert!(!second_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.in_use_count(), 1);
        cache.shutdown_all();
    }

    #[test]
    fn cache_replaces_oldest_idle_pool_at_capacity() {
        let cache = WorkerPoolCache::new(1, Duration::from_secs(300));
        let (first, _) = cache.acquire(2);
        cache.release(&first);

        // Different size forces a replacement of the only (idle) slot.
        let (second, second_new) = cache.acquire(3);
        assert!(second_new);
        assert!(first.is_shut_down());
        assert_eq!(cache.cached_count(), 1);
        cache.release(&second);
        cache.shutdown_all();
    }

    #[test]
    fn cache_hands_out_uncached_pool_when_every_slot_is_busy() {
        let cache = WorkerPoolCache::new(1, Duration::from_secs(300));
        let (first, _) = cache.acquire(2);
        let (second, second_new) = cache.acquire(2);
        assert!(second_new);
        assert!(!Arc::ptr_eq(&first, &second));

        // Releasing the uncached pool shuts it down outright.
        cache.release(&second);
        assert!(second.is_shut_down());
        cache.release(&first);
        assert!(!first.is_shut_down());
        cache.shutdown_all();
    }

    #[test]
    fn idle_pools_are_evicted_after_the_timeout() {
        let cache = WorkerPoolCache::new(1, Duration::from_millis(0));
        let (first, _) = cache.acquire(2);
        cache.release(&first);
        std::thread::sleep(Duration::from_millis(5));

        let (_second, second_new) = cache.acquire(4);
        assert!(second_new);
        assert!(first.is_shut_down());
        cache.shutdown_all();
    }

    #[test]
    fn thread_count_override_wins_and_is_floored_at_one() {
        let tuner = JobTuner::new(None, None);
        let mut request = request_with(
            PipelineConfig {
                thread_count: Some(6),
                ..PipelineConfig::default()
            },
            PipelineInput::default(),
        );
        request
            .pipeline_overrides
            .insert("thread_count".to_string(), Value::from(0));
        assert_eq!(tuner.resolve_thread_count(&request), Some(1));

        request.pipeline_overrides.remove("thread_count");
        assert_eq!(tuner.resolve_thread_count(&request), Some(6));
    }

    #[test]
    fn batched_local_llm_caps_workers_to_one() {
        let tuner = JobTuner::new(None, None);
        let request = request_with(
            PipelineConfig {
                thread_count: Some(8),
                llm_source: Some("local".to_string()),
                ..PipelineConfig::default()
            },
            PipelineInput {
                translation_batch_size: 4,
                translation_provider: "ollama".to_string(),
                ..PipelineInput::default()
            },
        );
        assert_eq!(tuner.resolve_thread_count(&request), Some(1));
    }

    #[test]
    fn batched_cloud_model_keeps_full_parallelism() {
        let tuner = JobTuner::new(None, None);
        let request = request_with(
            PipelineConfig {
                thread_count: Some(8),
                llm_model: Some("ollama_cloud:qwen3".to_string()),
                ..PipelineConfig::default()
            },
            PipelineInput {
                translation_batch_size: 4,
                translation_provider: "ollama".to_string(),
                ..PipelineInput::default()
            },
        );
        assert_eq!(tuner.resolve_thread_count(&request), Some(8));
    }

    #[test]
    fn unbatched_requests_are_never_capped() {
        let tuner = JobTuner::new(None, None);
        let request = request_with(
            PipelineConfig {
                thread_count: Some(8),
                llm_source: Some("local".to_string()),
                ..PipelineConfig::default()
            },
            PipelineInput {
                translation_batch_size: 1,
                translation_provider: "ollama".to_string(),
                ..PipelineInput::default()
            },
        );
        assert_eq!(tuner.resolve_thread_count(&request), Some(8));
    }

    #[test]
    fn tuning_summary_carries_sizing_and_hardware_fields() {
        let tuner = JobTuner::new(None, Some(3));
        let mut request = request_with(
            PipelineConfig {
                thread_count: Some(4),
                queue_size: Some(64),
                pipeline_mode: Some(true),
                ..PipelineConfig::default()
            },
            PipelineInput::default(),
        );
        request
            .pipeline_overrides
            .insert("job_max_workers".to_string(), Value::from(5));

        let summary = tuner.build_tuning_summary(&request);
        assert_eq!(summary.get("thread_count").and_then(Value::as_u64), Some(4));
        assert_eq!(summary.get("queue_size").and_then(Value::as_u64), Some(64));
        assert_eq!(summary.get("job_max_workers").and_then(Value::as_u64), Some(5));
        assert_eq!(summary.get("job_worker_slots").and_then(Value::as_u64), Some(3));
        assert_eq!(summary.get("pipeline_mode").and_then(Value::as_bool), Some(true));
        assert!(summary.contains_key("hardware_profile"));
        assert!(summary.contains_key("detected_cpu_cores"));
    }

    #[test]
    fn acquire_and_release_round_trip_updates_job_summary() {
        let tuner = JobTuner::with_cache(None);
        let mut job = Job::new("job-1".to_string(), JobType::Pipeline, Utc::now());
        job.tuning_summary = Some(Payload::new());
        let request = request_with(
            PipelineConfig {
                thread_count: Some(2),
                ..PipelineConfig::default()
            },
            PipelineInput::default(),
        );
        job.request = Some(Arc::new(request));

        let (pool, is_new) = tuner.acquire_worker_pool(&mut job);
        let pool = pool.expect("pool acquired");
        assert!(is_new);
        assert_eq!(pool.max_workers(), 2);
        assert_eq!(
            job.tuning_summary
                .as_ref()
                .unwrap()
                .get("translation_pool_workers")
                .and_then(Value::as_u64),
            Some(2)
        );

        // A second acquire sees the attached pool and does not create one.
        let (again, again_new) = tuner.acquire_worker_pool(&mut job);
        assert!(!again_new);
        assert!(Arc::ptr_eq(&again.unwrap(), &pool));

        tuner.release_worker_pool(&mut job);
        assert!(job.request.as_ref().unwrap().translation_pool().is_none());
        tuner.shutdown();
    }
}
