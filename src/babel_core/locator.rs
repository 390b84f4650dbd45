//! Resolves per-job filesystem roots and externally visible URLs.
//!
//! Layout under the storage root: one canonical metadata document per job
//! (`<root>/<id>.json`, owned by the file store) next to the job's artifact
//! tree `<root>/<id>/{data,metadata,media}`.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;

pub const JOB_STORAGE_DIR_ENV_VAR: &str = "JOB_STORAGE_DIR";
pub const JOB_STORAGE_BASE_URL_ENV_VAR: &str = "JOB_STORAGE_BASE_URL";

const DEFAULT_STORAGE_RELATIVE: &str = "storage/jobs";

pub const DATA_DIRNAME: &str = "data";
pub const METADATA_DIRNAME: &str = "metadata";
pub const MEDIA_DIRNAME: &str = "media";

#[derive(Debug, Clone, thiserror::Error)]
pub enum LocatorError {
    #[error("path {path} escapes the job root for job {job_id}")]
    PathEscapesJobRoot { job_id: String, path: String },
}

#[derive(Debug, Clone)]
pub struct FileLocator {
    storage_root: PathBuf,
    base_url: Option<String>,
}

impl FileLocator {
    pub fn new(storage_root: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            storage_root: storage_root.into(),
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
        }
    }

    /// Build a locator from the environment: `JOB_STORAGE_DIR` (falling back
    /// to `storage/jobs` under the working directory) and
    /// `JOB_STORAGE_BASE_URL` for artifact URL construction.
    pub fn from_env() -> Self {
        let root = std::env::var(JOB_STORAGE_DIR_ENV_VAR)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_RELATIVE));
        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir().unwrap_or_default().join(root)
        };
        let base_url = std::env::var(JOB_STORAGE_BASE_URL_ENV_VAR).ok();
        Self::new(root, base_url)
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Filesystem-safe form of a job identifier. Anything outside
    /// `[A-Za-z0-9_-]` becomes an underscore.
    pub fn sanitize_job_id(job_id: &str) -> String {
        job_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn job_root(&self, job_id: &str) -> PathBuf {
        self.storage_root.join(Self::sanitize_job_id(job_id))
    }

    pub fn data_root(&self, job_id: &str) -> PathBuf {
        self.job_root(job_id).join(DATA_DIRNAME)
    }

    pub fn metadata_root(&self, job_id: &str) -> PathBuf {
        self.job_root(job_id).join(METADATA_DIRNAME)
    }

    pub fn media_root(&self, job_id: &str) -> PathBuf {
        self.job_root(job_id).join(MEDIA_DIRNAME)
    }

    /// Resolve `relative` inside the job root, rejecting absolute paths and
    /// any traversal that would step outside it.
    pub fn resolve_path(&self, job_id: &str, relative: &Path) -> Result<PathBuf, LocatorError> {
        if Self::escapes_root(relative) {
            return Err(LocatorError::PathEscapesJobRoot {
                job_id: job_id.to_string(),
                path: relative.display().to_string(),
            });
        }
        Ok(self.job_root(job_id).join(relative))
    }

    /// Build the externally resolvable URL for a job-relative path. `None`
    /// when no base URL is configured.
    pub fn resolve_url(&self, job_id: &str, relative: Option<&str>) -> Option<String> {
        let base = self.base_url.as_deref()?;
        let job_segment = Self::sanitize_job_id(job_id);
        match relative {
            Some(rel) => {
                let rel = rel.trim_start_matches('/');
                Some(format!("{base}/{job_segment}/{rel}"))
            }
            None => Some(format!("{base}/{job_segment}")),
        }
    }

    fn escapes_root(relative: &Path) -> bool {
        if relative.is_absolute() {
            return true;
        }
        relative
            .components()
            .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
    }
}

/// POSIX-style rendering of a relative path, used for every manifest entry
/// so persisted documents look the same on every platform.
pub fn to_posix_string(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_string_lossy().into_owned());
        }
    }
    parts.join("/")
}

/// Convenience accessor for string values inside payload mappings.
pub fn payload_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).map(str::trim).filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_hostile_job_ids() {
        assert_eq!(FileLocator::sanitize_job_id("job/../etc"), "job____etc");
        assert_eq!(FileLocator::sanitize_job_id("a-b_C9"), "a-b_C9");
    }

    #[test]
    fn resolve_path_rejects_escapes() {
        let locator = FileLocator::new("/srv/jobs", None);
        assert!(locator.resolve_path("job-1", Path::new("media/out.mp3")).is_ok());
        assert!(locator.resolve_path("job-1", Path::new("../other")).is_err());
        assert!(locator.resolve_path("job-1", Path::new("/abs/path")).is_err());
    }

    #[test]
    fn resolve_url_requires_base() {
        let bare = FileLocator::new("/srv/jobs", None);
        assert_eq!(bare.resolve_url("job-1", Some("media/a.mp3")), None);

        let with_base = FileLocator::new("/srv/jobs", Some("https://cdn.example/jobs/".to_string()));
        assert_eq!(
            with_base.resolve_url("job-1", Some("media/a.mp3")).as_deref(),
            Some("https://cdn.example/jobs/job-1/media/a.mp3")
        );
        assert_eq!(
            with_base.resolve_url("job-1", None).as_deref(),
            Some("https://cdn.example/jobs/job-1")
        );
    }

    #[test]
    fn posix_rendering_drops_platform_separators() {
        let rendered = to_posix_string(Path::new("media").join("chunk-1.txt").as_path());
        assert_eq!(rendered, "media/chunk-1.txt");
    }
}
