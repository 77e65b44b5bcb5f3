//! Segment ring buffer: listing, finalization and window selection.
//!
//! The encoder writes `segment_NNN.mp4` into one directory and wraps back to
//! index 0 after `capacity` segments. File names are reused across wraps, so
//! content is ordered by mtime (or by the encoder's completion log), never by
//! name.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::ClipError;

pub const SEGMENT_PREFIX: &str = "segment_";
pub const SEGMENT_EXT: &str = ".mp4";

/// Flat segment list maintained by ffmpeg (`-segment_list`). ffmpeg appends a
/// name only after closing that segment and replaces the file via rename.
pub const COMPLETION_LOG: &str = "segments.list";

/// Process-wide ring buffer parameters. Fixed for the lifetime of the encoder.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub dir: PathBuf,
    /// Segment duration `T` in seconds.
    pub segment_secs: u32,
    /// Ring capacity `W` (ffmpeg `-segment_wrap`).
    pub capacity: u32,
}

impl BufferConfig {
    /// Longest window that never reads a slot the encoder is about to reuse.
    ///
    /// One slot is always open for writing and the oldest closed one is
    /// truncated next, so only `W - 2` segments are safe to read.
    pub fn max_window_segments(&self) -> usize {
        self.capacity.saturating_sub(2).max(1) as usize
    }

    pub fn max_clip_secs(&self) -> u64 {
        self.segment_secs as u64 * self.max_window_segments() as u64
    }

    pub fn completion_log_path(&self) -> PathBuf {
        self.dir.join(COMPLETION_LOG)
    }

    pub fn segment_pattern(&self) -> PathBuf {
        self.dir.join(format!("{SEGMENT_PREFIX}%03d{SEGMENT_EXT}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub name: String,
    /// Ring slot parsed from the file name.
    pub index: u32,
    pub modified: SystemTime,
    pub size: u64,
}

/// Names of segments the encoder has closed, oldest first, plus the time the
/// list itself was last replaced.
#[derive(Debug, Clone)]
pub struct CompletionLog {
    pub names: Vec<String>,
    pub modified: SystemTime,
}

/// Parse the ring slot out of `segment_<digits>.mp4`.
pub fn parse_segment_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_EXT)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Read-only view over the buffer directory.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
}

impl SegmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every segment file currently in the buffer, oldest mtime first.
    ///
    /// An unreadable or empty directory yields an empty list: that is the
    /// normal "no data yet" state right after startup.
    pub fn list_segments(&self) -> Vec<Segment> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "buffer directory unreadable");
                return Vec::new();
            }
        };

        let mut segments: Vec<Segment> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_str()?.to_string();
                let index = parse_segment_index(&name)?;
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some(Segment {
                    path: entry.path(),
                    name,
                    index,
                    modified: meta.modified().ok()?,
                    size: meta.len(),
                })
            })
            .collect();

        segments.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.index.cmp(&b.index)));
        segments
    }

    /// The encoder's completion log, if it writes one.
    pub fn read_completion_log(&self) -> Option<CompletionLog> {
        let path = self.dir.join(COMPLETION_LOG);
        let modified = std::fs::metadata(&path).and_then(|m| m.modified());
        let contents = std::fs::read_to_string(&path);

        match (modified, contents) {
            (Ok(modified), Ok(contents)) => {
                let names = contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .filter_map(|l| Path::new(l).file_name()?.to_str().map(str::to_string))
                    .collect();
                Some(CompletionLog { names, modified })
            }
            (Err(e), _) | (_, Err(e)) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %e, "completion log unreadable");
                }
                None
            }
        }
    }
}

/// Keep segments older than `threshold`. Input order is preserved.
///
/// An mtime ahead of `now` counts as fresh.
pub fn finalize(segments: &[Segment], now: SystemTime, threshold: Duration) -> Vec<Segment> {
    segments
        .iter()
        .filter(|s| match now.duration_since(s.modified) {
            Ok(age) => age > threshold,
            Err(_) => false,
        })
        .cloned()
        .collect()
}

/// Keep segments the encoder has reported closed, in completion order.
///
/// A segment modified after the log was written has been reopened for the
/// next wrap and is dropped. If a name appears twice only its latest position
/// counts.
pub fn finalize_with_log(segments: &[Segment], log: &CompletionLog) -> Vec<Segment> {
    let by_name: HashMap<&str, &Segment> = segments.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut seen: HashSet<&String> = HashSet::new();

    let mut finalized: Vec<Segment> = log
        .names
        .iter()
        .rev()
        .filter(|name| seen.insert(*name))
        .filter_map(|name| by_name.get(name.as_str()).copied())
        .filter(|s| s.modified <= log.modified)
        .cloned()
        .collect();
    finalized.reverse();
    finalized
}

/// Finalized segments of the store at `now`: completion log when the encoder
/// provides one, mtime threshold otherwise.
pub fn finalized_segments(store: &SegmentStore, now: SystemTime, threshold: Duration) -> Vec<Segment> {
    let segments = store.list_segments();
    match store.read_completion_log() {
        Some(log) => finalize_with_log(&segments, &log),
        None => finalize(&segments, now, threshold),
    }
}

/// Number of segments covering `duration_secs`, rounded up.
pub fn segments_for_duration(duration_secs: u32, segment_secs: u32) -> usize {
    duration_secs.div_ceil(segment_secs.max(1)) as usize
}

/// Trailing `requested_count` finalized segments, or all of them when fewer
/// exist. Fails only when nothing is finalized.
pub fn select_window(finalized: &[Segment], requested_count: usize) -> Result<Vec<Segment>, ClipError> {
    if finalized.is_empty() {
        return Err(ClipError::NoDataAvailable);
    }
    let start = finalized.len().saturating_sub(requested_count.max(1));
    Ok(finalized[start..].to_vec())
}
