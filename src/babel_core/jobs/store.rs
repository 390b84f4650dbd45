//! Persistence backends for job metadata snapshots.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::babel_core::jobs::metadata::JobMetadata;
use crate::babel_core::locator::FileLocator;
use crate::sync_ext::MutexExt;

pub const JOB_STORE_URL_ENV_VAR: &str = "JOB_STORE_URL";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job store I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("job store serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job store backend failure: {0}")]
    Backend(String),
}

/// Durable key-value persistence for job metadata snapshots. A successful
/// `save`/`update` must be observable by the next `get`/`list`.
pub trait JobStore: Send + Sync {
    fn save(&self, metadata: &JobMetadata) -> Result<(), StoreError>;
    fn update(&self, metadata: &JobMetadata) -> Result<(), StoreError>;
    fn get(&self, job_id: &str) -> Result<JobMetadata, StoreError>;
    fn list(&self) -> Result<BTreeMap<String, JobMetadata>, StoreError>;
    fn delete(&self, job_id: &str) -> Result<(), StoreError>;
}

/// Process-local store used in tests and as the last-resort fallback.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    records: Mutex<BTreeMap<String, JobMetadata>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn save(&self, metadata: &JobMetadata) -> Result<(), StoreError> {
        self.records
            .lock_unpoisoned()
            .insert(metadata.job_id.clone(), metadata.clone());
        Ok(())
    }

    fn update(&self, metadata: &JobMetadata) -> Result<(), StoreError> {
        self.save(metadata)
    }

    fn get(&self, job_id: &str) -> Result<JobMetadata, StoreError> {
        self.records
            .lock_unpoisoned()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    fn list(&self) -> Result<BTreeMap<String, JobMetadata>, StoreError> {
        Ok(self.records.lock_unpoisoned().clone())
    }

    fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        self.records
            .lock_unpoisoned()
            .remove(job_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }
}

/// Filesystem store: one canonical JSON document per job under the storage
/// root, written atomically (temp file, fsync, rename).
#[derive(Debug)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", FileLocator::sanitize_job_id(job_id)))
    }

    fn write_atomic(&self, path: &PathBuf, payload: &str) -> Result<(), StoreError> {
        let tmp_path = path.with_extension("json.tmp");
        let result = (|| -> Result<(), StoreError> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(payload.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)?;
            Ok(())
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }
}

impl JobStore for FileJobStore {
    fn save(&self, metadata: &JobMetadata) -> Result<(), StoreError> {
        let path = self.job_path(&metadata.job_id);
        self.write_atomic(&path, &metadata.to_canonical_json()?)?;
        debug!(job_id = %metadata.job_id, path = %path.display(), "job snapshot persisted");
        Ok(())
    }

    fn update(&self, metadata: &JobMetadata) -> Result<(), StoreError> {
        self.save(metadata)
    }

    fn get(&self, job_id: &str) -> Result<JobMetadata, StoreError> {
        let path = self.job_path(job_id);
        let payload = match fs::read_to_string(&path) {
            Ok(payload) => payload,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(job_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        Ok(JobMetadata::from_json(&payload)?)
    }

    fn list(&self) -> Result<BTreeMap<String, JobMetadata>, StoreError> {
        let mut records = BTreeMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let payload = match fs::read_to_string(&path) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable job document");
                    continue;
                }
            };
            match JobMetadata::from_json(&payload) {
                Ok(metadata) => {
                    records.insert(metadata.job_id.clone(), metadata);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unparsable job document");
                }
            }
        }
        Ok(records)
    }

    fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let path = self.job_path(job_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(job_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Redis-backed store with namespaced keys and scan-based listing.
#[cfg(feature = "redis-store")]
pub struct RedisJobStore {
    connection: Mutex<redis::Connection>,
    namespace: String,
}

#[cfg(feature = "redis-store")]
impl RedisJobStore {
    pub const DEFAULT_NAMESPACE: &'static str = "babelbook:jobs";

    pub fn open(url: &str) -> Result<Self, StoreError> {
        Self::open_with_namespace(url, Self::DEFAULT_NAMESPACE)
    }

    pub fn open_with_namespace(url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|err| StoreError::Backend(err.to_string()))?;
        let connection = client
            .get_connection()
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(Self {
            connection: Mutex::new(connection),
            namespace: namespace.to_string(),
        })
    }

    fn key(&self, job_id: &str) -> String {
        format!("{}:{}", self.namespace, job_id)
    }
}

#[cfg(feature = "redis-store")]
impl JobStore for RedisJobStore {
    fn save(&self, metadata: &JobMetadata) -> Result<(), StoreError> {
        use redis::Commands;
        let payload = metadata.to_canonical_json()?;
        let mut connection = self.connection.lock_unpoisoned();
        connection
            .set::<_, _, ()>(self.key(&metadata.job_id), payload)
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn update(&self, metadata: &JobMetadata) -> Result<(), StoreError> {
        self.save(metadata)
    }

    fn get(&self, job_id: &str) -> Result<JobMetadata, StoreError> {
        use redis::Commands;
        let mut connection = self.connection.lock_unpoisoned();
        let payload: Option<String> = connection
            .get(self.key(job_id))
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        match payload {
            Some(payload) => Ok(JobMetadata::from_json(&payload)?),
            None => Err(StoreError::NotFound(job_id.to_string())),
        }
    }

    fn list(&self) -> Result<BTreeMap<String, JobMetadata>, StoreError> {
        use redis::Commands;
        let mut connection = self.connection.lock_unpoisoned();
        let pattern = format!("{}:*", self.namespace);
        let keys: Vec<String> = {
            let iter = connection
                .scan_match::<_, String>(&pattern)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            iter.collect()
        };

        let prefix = format!("{}:", self.namespace);
        let mut records = BTreeMap::new();
        for key in keys {
            let payload: Option<String> = connection
                .get(&key)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            let Some(payload) = payload else { continue };
            let Some(job_id) = key.strip_prefix(&prefix) else {
                continue;
            };
            match JobMetadata::from_json(&payload) {
                Ok(metadata) => {
                    records.insert(job_id.to_string(), metadata);
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping unparsable redis job record");
                }
            }
        }
        Ok(records)
    }

    fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        use redis::Commands;
        let mut connection = self.connection.lock_unpoisoned();
        let removed: i64 = connection
            .del(self.key(job_id))
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        if removed == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }
}

/// Encapsulates store selection and the best-effort recovery helpers used
/// when the manager restores persisted jobs at construction.
pub struct JobStorageCoordinator {
    store: std::sync::Arc<dyn JobStore>,
}

impl JobStorageCoordinator {
    pub fn new(store: std::sync::Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Select a store: `JOB_STORE_URL` (redis) when configured, otherwise
    /// the filesystem store under the locator's root, otherwise in-memory.
    pub fn from_env(locator: &FileLocator) -> Self {
        if let Ok(url) = std::env::var(JOB_STORE_URL_ENV_VAR)
            && !url.trim().is_empty()
        {
            #[cfg(feature = "redis-store")]
            match RedisJobStore::open(url.trim()) {
                Ok(store) => {
                    debug!(url = %url.trim(), "using redis job store");
                    return Self::new(std::sync::Arc::new(store));
                }
                Err(err) => {
                    warn!(error = %err, "failed to initialize redis job store, falling back");
                }
            }
            #[cfg(not(feature = "redis-store"))]
            warn!(
                url = %url.trim(),
                "JOB_STORE_URL is set but this build lacks the redis-store feature, falling back"
            );
        }
        match FileJobStore::open(locator.storage_root()) {
            Ok(store) => Self::new(std::sync::Arc::new(store)),
            Err(err) => {
                warn!(error = %err, "failed to initialize file job store, using in-memory store");
                Self::new(std::sync::Arc::new(InMemoryJobStore::new()))
            }
        }
    }

    pub fn store(&self) -> std::sync::Arc<dyn JobStore> {
        self.store.clone()
    }

    /// Return all persisted records, treating a backend failure as an empty
    /// store so a damaged backend cannot prevent startup.
    pub fn load_all(&self) -> BTreeMap<String, JobMetadata> {
        match self.store.list() {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "failed to load persisted jobs");
                BTreeMap::new()
            }
        }
    }

    /// Persist metadata updates produced during restart reconciliation.
    pub fn persist_reconciliation(&self, updates: &[JobMetadata]) {
        for metadata in updates {
            if let Err(err) = self.store.update(metadata) {
                warn!(job_id = %metadata.job_id, error = %err, "failed to persist reconciled job state");
            }
        }
    }
}
