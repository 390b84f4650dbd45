//! Serializes live jobs to metadata snapshots and hydrates them back.
//!
//! Snapshotting also performs the side-effect persistence that keeps later
//! queries independent of transient paths: sentence-level sidecar files
//! under the job's metadata directory and a mirrored copy of any referenced
//! cover image. Sidecar failures are logged and swallowed; only the main
//! snapshot write (done by the store, not here) is allowed to fail loudly.

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde_json::Value;
use tracing::debug;

use crate::babel_core::domain::{
    GeneratedFile, GeneratedFilesManifest, Job, Payload,
};
use crate::babel_core::jobs::metadata::JobMetadata;
use crate::babel_core::locator::{FileLocator, METADATA_DIRNAME, payload_str, to_posix_string};
use crate::babel_core::pipeline::{serialize_pipeline_request, serialize_pipeline_response};
use crate::babel_core::progress::{
    ProgressEvent, deserialize_progress_event, serialize_progress_event,
};

pub const COVER_ASSET_KEY: &str = "job_cover_asset";
const COVER_SOURCE_KEY: &str = "book_cover_file";
const BOOK_SIDECAR: &str = "book.json";
const SENTENCES_SIDECAR: &str = "sentences.json";

#[derive(Debug, Clone)]
pub struct JobPersistence {
    locator: FileLocator,
}

impl JobPersistence {
    pub fn new(locator: FileLocator) -> Self {
        Self { locator }
    }

    pub fn locator(&self) -> &FileLocator {
        &self.locator
    }

    /// Produce a metadata snapshot for `job`, normalizing its generated
    /// files manifest in place and writing the metadata sidecars.
    pub fn snapshot(&self, job: &mut Job) -> JobMetadata {
        let last_event = job.last_event.as_ref().map(serialize_progress_event);

        let result_payload = job.result_payload.clone().or_else(|| {
            job.result
                .as_ref()
                .map(|response| serialize_pipeline_response(response))
        });

        let request_payload = match &job.request {
            Some(request) => Some(serialize_pipeline_request(request)),
            None => job.request_payload.clone(),
        };

        let resume_context = job
            .resume_context
            .clone()
            .or_else(|| request_payload.clone());

        let normalized = self.normalize_generated_files(&job.job_id, job.generated_files.as_ref());
        if let Some(manifest) = &normalized
            && let Some(flag) = manifest.complete
        {
            job.media_completed = flag;
        }
        job.generated_files = normalized.clone();

        let retry_summary = job
            .tracker
            .as_ref()
            .map(|tracker| tracker.retry_summary())
            .filter(|summary| !summary.is_empty());

        let mut snapshot = JobMetadata {
            job_id: job.job_id.clone(),
            job_type: job.job_type,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_message: job.error_message.clone(),
            last_event,
            result: result_payload,
            request_payload,
            resume_context,
            tuning_summary: job.tuning_summary.clone(),
            retry_summary,
            user_id: job.user_id.clone(),
            user_role: job.user_role.clone(),
            generated_files: normalized,
            media_completed: Some(job.media_completed),
        };

        self.persist_metadata_files(job, &mut snapshot);
        snapshot
    }

    /// Hydrate a job from `metadata`. The result carries no live request,
    /// tracker, or stop token; those are recreated on the next execution.
    pub fn build_job(&self, metadata: &JobMetadata) -> Job {
        let mut job = Job::new(metadata.job_id.clone(), metadata.job_type, metadata.created_at);
        job.status = metadata.status;
        job.started_at = metadata.started_at;
        job.completed_at = metadata.completed_at;
        job.error_message = metadata.error_message.clone();
        job.result_payload = metadata.result.clone();
        job.request_payload = metadata.request_payload.clone();
        job.resume_context = metadata
            .resume_context
            .clone()
            .or_else(|| metadata.request_payload.clone());
        job.tuning_summary = metadata.tuning_summary.clone();
        job.user_id = metadata.user_id.clone();
        job.user_role = metadata.user_role.clone();
        job.media_completed = metadata.media_completed.unwrap_or(false);

        let normalized =
            self.normalize_generated_files(&metadata.job_id, metadata.generated_files.as_ref());
        if let Some(manifest) = &normalized
            && let Some(flag) = manifest.complete
        {
            job.media_completed = flag;
        }
        job.generated_files = normalized;

        if let Some(event) = &metadata.last_event {
            job.last_event = Some(deserialize_progress_event(event));
        }
        job
    }

    /// Fold a progress event into `job`: record it as the last event and
    /// capture any structured `generated_files` submanifest it carries.
    pub fn absorb_event(&self, job: &mut Job, event: &ProgressEvent) {
        job.last_event = Some(event.clone());
        if let Some(raw) = event.metadata.get("generated_files")
            && let Ok(manifest) = serde_json::from_value::<GeneratedFilesManifest>(raw.clone())
        {
            if let Some(flag) = manifest.complete {
                job.media_completed = flag;
            }
            job.generated_files = Some(manifest);
        }
    }

    /// Normalize a manifest so each entry carries an absolute path, a
    /// job-relative POSIX path, and a URL when resolvable. Entries whose
    /// relative path would escape the job root lose that path rather than
    /// being trusted.
    pub fn normalize_generated_files(
        &self,
        job_id: &str,
        raw: Option<&GeneratedFilesManifest>,
    ) -> Option<GeneratedFilesManifest> {
        let raw = raw?;
        if raw.is_empty() {
            return None;
        }
        let job_root = self.locator.job_root(job_id);

        let mut chunks = Vec::with_capacity(raw.chunks.len());
        for chunk in &raw.chunks {
            let mut normalized_chunk = chunk.clone();
            normalized_chunk.files = chunk
                .files
                .iter()
                .map(|file| self.normalize_file_entry(job_id, &job_root, file))
                .collect();
            chunks.push(normalized_chunk);
        }

        // Flat per-file index, deduped by (path, type), annotated with the
        // owning chunk so consumers do not have to walk the block structure.
        let mut files = Vec::new();
        let mut seen: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
        for chunk in &chunks {
            for entry in &chunk.files {
                let Some(path) = &entry.path else { continue };
                let key = (
                    path.clone(),
                    entry.file_type.clone().unwrap_or_default(),
                );
                if !seen.insert(key) {
                    continue;
                }
                let mut record = entry.clone();
                record.chunk_id = record.chunk_id.clone().or_else(|| chunk.chunk_id.clone());
                record.range_fragment = record
                    .range_fragment
                    .clone()
                    .or_else(|| chunk.range_fragment.clone());
                record.start_sentence = record.start_sentence.or(chunk.start_sentence);
                record.end_sentence = record.end_sentence.or(chunk.end_sentence);
                files.push(record);
            }
        }

        if chunks.is_empty() && files.is_empty() {
            return None;
        }
        Some(GeneratedFilesManifest {
            chunks,
            files,
            complete: raw.complete,
        })
    }

    fn normalize_file_entry(
        &self,
        job_id: &str,
        job_root: &Path,
        file: &GeneratedFile,
    ) -> GeneratedFile {
        let mut normalized = GeneratedFile {
            file_type: file.file_type.clone(),
            chunk_id: file.chunk_id.clone(),
            range_fragment: file.range_fragment.clone(),
            start_sentence: file.start_sentence,
            end_sentence: file.end_sentence,
            ..GeneratedFile::default()
        };

        let mut relative: Option<String> = None;
        let mut absolute: Option<PathBuf> = None;

        if let Some(raw_relative) = &file.relative_path {
            let cleaned = raw_relative.replace('\\', "/");
            let candidate = Path::new(&cleaned);
            if self.locator.resolve_path(job_id, candidate).is_ok() {
                relative = Some(to_posix_string(candidate));
                absolute = Some(job_root.join(candidate));
            }
        }

        if absolute.is_none()
            && let Some(raw_path) = &file.path
        {
            let candidate = PathBuf::from(raw_path);
            absolute = Some(if candidate.is_absolute() {
                candidate
            } else {
                job_root.join(candidate)
            });
        }

        if let Some(path) = &absolute {
            normalized.path = Some(path.display().to_string());
            if relative.is_none()
                && let Ok(stripped) = path.strip_prefix(job_root)
            {
                relative = Some(to_posix_string(stripped));
            }
        }

        if let Some(rel) = &relative {
            normalized.relative_path = Some(rel.clone());
            normalized.url = self.locator.resolve_url(job_id, Some(rel));
        }
        normalized
    }

    /// Write the metadata sidecars for `snapshot` and mirror the cover
    /// asset. Mutates the snapshot's (and job's) result payload so the
    /// `job_cover_asset` reference always points at the mirrored copy.
    fn persist_metadata_files(&self, job: &mut Job, snapshot: &mut JobMetadata) {
        let metadata_root = self.locator.metadata_root(&job.job_id);
        if let Err(err) = fs::create_dir_all(&metadata_root) {
            debug!(job_id = %job.job_id, error = %err, "unable to prepare metadata directory");
            return;
        }

        let mut result_payload = snapshot.result.clone().unwrap_or_default();
        let mut book_metadata = match result_payload.get("book_metadata") {
            Some(Value::Object(map)) => map.clone(),
            _ => Payload::new(),
        };

        match self.mirror_cover_asset(&job.job_id, &metadata_root, &book_metadata) {
            Some(cover_asset) => {
                book_metadata.insert(COVER_ASSET_KEY.to_string(), Value::String(cover_asset));
            }
            None => {
                book_metadata.remove(COVER_ASSET_KEY);
            }
        }
        result_payload.insert(
            "book_metadata".to_string(),
            Value::Object(book_metadata.clone()),
        );

        if snapshot.result.is_some() || !book_metadata.is_empty() {
            snapshot.result = Some(result_payload.clone());
            if job.result_payload.is_some() {
                job.result_payload = Some(result_payload.clone());
            }
        }

        match serde_json::to_string_pretty(&book_metadata) {
            Ok(rendered) => {
                if let Err(err) = fs::write(metadata_root.join(BOOK_SIDECAR), rendered) {
                    debug!(job_id = %job.job_id, error = %err, "unable to persist book metadata sidecar");
                }
            }
            Err(err) => {
                debug!(job_id = %job.job_id, error = %err, "unable to render book metadata sidecar");
            }
        }

        if let Some(Value::Array(sentences)) = result_payload.get("refined_sentences")
            && !sentences.is_empty()
        {
            match serde_json::to_string_pretty(sentences) {
                Ok(rendered) => {
                    if let Err(err) = fs::write(metadata_root.join(SENTENCES_SIDECAR), rendered) {
                        debug!(job_id = %job.job_id, error = %err, "unable to persist sentence sidecar");
                    }
                }
                Err(err) => {
                    debug!(job_id = %job.job_id, error = %err, "unable to render sentence sidecar");
                }
            }
        }
    }

    /// Mirror the referenced cover image into the job's metadata directory
    /// and return its job-relative path. Returns `None` (after cleaning up
    /// stale mirrors) when no cover is referenced or resolvable.
    fn mirror_cover_asset(
        &self,
        job_id: &str,
        metadata_root: &Path,
        book_metadata: &Payload,
    ) -> Option<String> {
        let raw_value = match payload_str(book_metadata.get(COVER_SOURCE_KEY)) {
            Some(value) => value,
            None => {
                Self::cleanup_cover_assets(metadata_root, None);
                return None;
            }
        };

        let source = match self.resolve_cover_source(job_id, metadata_root, raw_value) {
            Some(source) => source,
            None => {
                Self::cleanup_cover_assets(metadata_root, None);
                return None;
            }
        };

        match self.copy_cover_asset(metadata_root, &source) {
            Ok(relative) => Some(relative),
            Err(err) => {
                debug!(job_id = %job_id, error = %err, "unable to mirror cover asset");
                None
            }
        }
    }

    fn resolve_cover_source(
        &self,
        job_id: &str,
        metadata_root: &Path,
        raw_value: &str,
    ) -> Option<PathBuf> {
        let candidate = PathBuf::from(raw_value);
        let mut search_paths: Vec<PathBuf> = Vec::new();

        if candidate.is_absolute() {
            search_paths.push(candidate);
        } else {
            let trimmed = raw_value.trim_start_matches(['/', '\\']);
            let relative = PathBuf::from(trimmed);
            let mut variants = vec![relative.clone()];
            // References persisted by earlier runs may carry a leading
            // storage/metadata/covers segment.
            if let Some(first) = relative.components().next().map(|c| {
                c.as_os_str().to_string_lossy().to_ascii_lowercase()
            }) && ["storage", "metadata", "covers"].contains(&first.as_str())
            {
                let rest: PathBuf = relative.components().skip(1).collect();
                if !rest.as_os_str().is_empty() {
                    variants.push(rest);
                }
            }
            for variant in variants {
                search_paths.push(metadata_root.join(&variant));
                if let Ok(resolved) = self.locator.resolve_path(job_id, &variant) {
                    search_paths.push(resolved);
                }
                search_paths.push(self.locator.storage_root().join(&variant));
            }
        }

        search_paths.into_iter().find(|path| path.is_file())
    }

    fn copy_cover_asset(&self, metadata_root: &Path, source: &Path) -> std::io::Result<String> {
        let suffix = source
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| "jpg".to_string());
        let destination_name = format!("cover.{suffix}");
        let destination = metadata_root.join(&destination_name);

        let mut should_copy = true;
        if destination != source && destination.exists() {
            // Skip the copy when size and mtime already match the source.
            if let (Ok(src_meta), Ok(dest_meta)) = (fs::metadata(source), fs::metadata(&destination))
            {
                let src_mtime = FileTime::from_last_modification_time(&src_meta);
                let dest_mtime = FileTime::from_last_modification_time(&dest_meta);
                if src_meta.len() == dest_meta.len()
                    && src_mtime.unix_seconds() == dest_mtime.unix_seconds()
                {
                    should_copy = false;
                }
            }
        }
        if destination == source {
            should_copy = false;
        }

        if should_copy {
            fs::copy(source, &destination)?;
            if let Ok(src_meta) = fs::metadata(source) {
                let mtime = FileTime::from_last_modification_time(&src_meta);
                let atime = FileTime::from_last_access_time(&src_meta);
                let _ = filetime::set_file_times(&destination, atime, mtime);
            }
        }

        Self::cleanup_cover_assets(metadata_root, Some(&destination_name));
        Ok(format!("{METADATA_DIRNAME}/{destination_name}"))
    }

    fn cleanup_cover_assets(metadata_root: &Path, keep: Option<&str>) {
        let Ok(entries) = fs::read_dir(metadata_root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("cover.") {
                continue;
            }
            if keep == Some(name) {
                continue;
            }
            let _ = fs::remove_file(entry.path());
        }
    }
}
