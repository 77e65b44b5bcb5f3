//! Lossless concatenation of a segment window.
//!
//! We invoke the ffmpeg CLI with its concat demuxer and `-c copy`. All
//! segments come from one running encoder, so codec parameters match and no
//! re-encode is needed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::error::ClipError;
use crate::segment::Segment;

/// Prefix of every transient merge artifact in the buffer directory.
pub const MERGE_PREFIX: &str = "merge_";

/// Unique file stem for one merge: list and output share it.
pub fn merge_stem() -> String {
    format!(
        "{MERGE_PREFIX}{}_{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Concat demuxer input: one `file '<path>'` line per segment, in order.
pub fn concat_list(window: &[Segment]) -> String {
    window
        .iter()
        .map(|s| {
            let path = s.path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}

pub struct Concatenator {
    program: String,
    leading_args: Vec<String>,
    timeout: Duration,
}

impl Concatenator {
    pub fn new(ffmpeg_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: ffmpeg_bin.into(),
            leading_args: Vec::new(),
            timeout,
        }
    }

    /// Arguments passed before the concat arguments, e.g. `sh -c <script>`.
    #[cfg(test)]
    pub(crate) fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    /// Join `window` into `<staging_dir>/<stem>.mp4`.
    ///
    /// The list file `<stem>.txt` lives only for the duration of this call.
    /// On failure any partial output is removed.
    pub async fn concatenate(
        &self,
        window: &[Segment],
        staging_dir: &Path,
        stem: &str,
    ) -> Result<PathBuf, ClipError> {
        if window.is_empty() {
            return Err(ClipError::NoDataAvailable);
        }

        let list_path = staging_dir.join(format!("{stem}.txt"));
        let output_path = staging_dir.join(format!("{stem}.mp4"));

        tokio::fs::write(&list_path, concat_list(window)).await?;
        let result = self.run(&list_path, &output_path, window.len()).await;

        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            tracing::warn!(path = %list_path.display(), error = %e, "failed to remove concat list");
        }

        match result {
            Ok(()) => Ok(output_path),
            Err(e) => {
                match tokio::fs::remove_file(&output_path).await {
                    Ok(()) => tracing::debug!(path = %output_path.display(), "discarded partial merge output"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => tracing::warn!(path = %output_path.display(), error = %err, "failed to discard partial merge output"),
                }
                Err(e)
            }
        }
    }

    async fn run(&self, list: &Path, output: &Path, segments: usize) -> Result<(), ClipError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(list)
            .args(["-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let out = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ClipError::Timeout {
                what: "concatenation",
                secs: self.timeout.as_secs(),
            })?
            .map_err(|e| ClipError::ToolFailure(format!("failed to execute {}: {e}", self.program)))?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(ClipError::ToolFailure(format!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                tail.join(" | ")
            )));
        }

        let size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(ClipError::ToolFailure(format!(
                "{} exited successfully but produced no output",
                self.program
            )));
        }

        tracing::info!(
            output = %output.display(),
            segments,
            bytes = size,
            duration_ms = start.elapsed().as_millis() as u64,
            "segments concatenated"
        );
        Ok(())
    }
}
