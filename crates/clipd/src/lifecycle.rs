//! One trigger, start to finish.
//!
//! SELECT → MERGE → PERSIST → UPLOAD → CLEANUP, strictly in order and
//! without retries. The first failing stage ends the run; nothing already
//! done is rolled back. The ephemeral merge output is removed only after a
//! successful upload, so a failed upload leaves it in the buffer directory
//! for inspection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::concat::{merge_stem, Concatenator, MERGE_PREFIX};
use crate::error::ClipError;
use crate::segment::{
    finalized_segments, parse_segment_index, segments_for_duration, select_window, BufferConfig,
    Segment, SegmentStore, COMPLETION_LOG,
};
use crate::upload::Uploader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Select,
    Merge,
    Persist,
    Upload,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Select => "select",
            Stage::Merge => "merge",
            Stage::Persist => "persist",
            Stage::Upload => "upload",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {error}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub error: ClipError,
}

fn at(stage: Stage) -> impl FnOnce(ClipError) -> StageError {
    move |error| StageError { stage, error }
}

#[derive(Debug, Clone)]
pub struct ClipRequest {
    pub duration_secs: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClipOutcome {
    pub requested_secs: u32,
    pub actual_secs: u32,
    pub segments_merged: usize,
    pub created_at: DateTime<Utc>,
    pub ephemeral_path: PathBuf,
    pub durable_path: PathBuf,
    pub file_name: String,
    pub upload_result: serde_json::Value,
}

pub struct ClipPipeline {
    buffer: BufferConfig,
    store: SegmentStore,
    threshold: Duration,
    concat: Concatenator,
    clips_dir: PathBuf,
}

impl ClipPipeline {
    pub fn new(buffer: BufferConfig, threshold: Duration, concat: Concatenator, clips_dir: PathBuf) -> Self {
        let store = SegmentStore::new(buffer.dir.clone());
        Self {
            buffer,
            store,
            threshold,
            concat,
            clips_dir,
        }
    }

    pub fn buffer(&self) -> &BufferConfig {
        &self.buffer
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Window of finalized segments covering `duration_secs`, or fewer when
    /// the buffer is not yet that full.
    pub fn select(&self, duration_secs: u32, now: SystemTime) -> Result<Vec<Segment>, ClipError> {
        let finalized = finalized_segments(&self.store, now, self.threshold);
        let wanted = segments_for_duration(duration_secs, self.buffer.segment_secs)
            .min(self.buffer.max_window_segments());
        let window = select_window(&finalized, wanted)?;
        if window.len() < wanted {
            tracing::warn!(
                wanted,
                available = window.len(),
                "buffer shorter than requested, merging what is finalized"
            );
        }
        Ok(window)
    }

    pub async fn run<U: Uploader>(&self, req: &ClipRequest, uploader: &U) -> Result<ClipOutcome, StageError> {
        let created_at = Utc::now();

        let window = self
            .select(req.duration_secs, SystemTime::now())
            .map_err(at(Stage::Select))?;
        tracing::info!(
            requested_secs = req.duration_secs,
            segments = window.len(),
            first = %window[0].name,
            last = %window[window.len() - 1].name,
            "window selected"
        );

        let pruned = prune_retained_merges(&self.buffer.dir).await;
        if pruned > 0 {
            tracing::info!(files = pruned, "discarded merge output kept from an earlier failed upload");
        }

        let ephemeral = self
            .concat
            .concatenate(&window, &self.buffer.dir, &merge_stem())
            .await
            .map_err(at(Stage::Merge))?;

        let durable = persist(&ephemeral, &self.clips_dir, created_at.timestamp(), req.duration_secs)
            .await
            .map_err(at(Stage::Persist))?;
        let file_name = durable
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        tracing::info!(path = %durable.display(), "clip saved");

        let description = format!("Last {} seconds capture", req.duration_secs);
        let upload_result = uploader
            .upload(&ephemeral, &file_name, &description)
            .await
            .map_err(at(Stage::Upload))?;

        tokio::fs::remove_file(&ephemeral)
            .await
            .map_err(|e| at(Stage::Cleanup)(e.into()))?;

        Ok(ClipOutcome {
            requested_secs: req.duration_secs,
            actual_secs: window.len() as u32 * self.buffer.segment_secs,
            segments_merged: window.len(),
            created_at,
            ephemeral_path: ephemeral,
            durable_path: durable,
            file_name,
            upload_result,
        })
    }
}

pub fn clip_file_name(timestamp: i64, duration_secs: u32, attempt: u32) -> String {
    if attempt == 0 {
        format!("clip_{timestamp}_{duration_secs}s.mp4")
    } else {
        format!("clip_{timestamp}_{duration_secs}s-{attempt}.mp4")
    }
}

/// Copy `src` into `clips_dir` under a fresh `clip_<ts>_<D>s.mp4` name.
/// The copy lands under a `.partial` name first and is renamed into place.
pub async fn persist(src: &Path, clips_dir: &Path, timestamp: i64, duration_secs: u32) -> Result<PathBuf, ClipError> {
    tokio::fs::create_dir_all(clips_dir).await?;

    let mut attempt = 0;
    let dest = loop {
        let candidate = clips_dir.join(clip_file_name(timestamp, duration_secs, attempt));
        if !tokio::fs::try_exists(&candidate).await? {
            break candidate;
        }
        attempt += 1;
    };

    let partial = dest.with_extension("mp4.partial");
    if let Err(e) = tokio::fs::copy(src, &partial).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e.into());
    }
    tokio::fs::rename(&partial, &dest).await?;
    Ok(dest)
}

/// Remove merge output a previous failed upload left behind, so at most one
/// retained clip ever sits next to the ring. Failures are logged only.
async fn prune_retained_merges(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to scan for retained merge output");
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(MERGE_PREFIX) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(file = %name, error = %e, "failed to remove retained merge output"),
        }
    }
    removed
}

/// Clear the buffer directory at startup.
///
/// Merge artifacts of a crashed run are always removed. With `include_ring`
/// the segments and completion log of a previous encoder run go too; leave it
/// off when another process owns the ring.
pub fn sweep_stale(dir: &Path, include_ring: bool) -> std::io::Result<usize> {
    std::fs::create_dir_all(dir)?;

    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let ring = parse_segment_index(&name).is_some() || name.starts_with(COMPLETION_LOG);
        let stale = name.starts_with(MERGE_PREFIX) || (include_ring && ring);
        if !stale || !entry.file_type()?.is_file() {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(file = %name, error = %e, "failed to remove stale buffer file"),
        }
    }
    Ok(removed)
}
