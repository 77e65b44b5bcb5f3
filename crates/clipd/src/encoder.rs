//! Long-lived capture encoder feeding the segment ring buffer.
//!
//! ffmpeg reads the webcam (v4l2) and microphone (PulseAudio) and writes
//! `-segment_time`-second MP4 segments, wrapping after `-segment_wrap` files.
//! It also maintains the completion log consumed by the finalization filter.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

use crate::segment::BufferConfig;

/// Capture parameters. Changing any of them requires restarting the encoder.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub ffmpeg_bin: String,
    pub video_device: String,
    pub audio_source: String,
    pub video_size: String,
    pub framerate: u32,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub audio_volume: f32,
    pub buffer: BufferConfig,
}

/// Full ffmpeg argument list for the capture pipeline.
pub fn encoder_args(cfg: &EncoderConfig) -> Vec<String> {
    let buffer = &cfg.buffer;
    let list_size = buffer.capacity.saturating_sub(1).max(1);

    let mut args: Vec<String> = Vec::new();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    push(&["-hide_banner", "-loglevel", "warning", "-nostdin", "-y"]);
    push(&["-thread_queue_size", "512", "-f", "v4l2", "-input_format", "mjpeg"]);
    push(&["-video_size", cfg.video_size.as_str()]);
    push(&["-framerate", cfg.framerate.to_string().as_str()]);
    push(&["-i", cfg.video_device.as_str()]);
    push(&["-thread_queue_size", "512", "-f", "pulse", "-i", cfg.audio_source.as_str()]);
    push(&["-map", "0:v", "-map", "1:a"]);
    push(&["-filter:a", format!("volume={}", cfg.audio_volume).as_str()]);
    push(&["-c:v", "libx264", "-preset", "ultrafast", "-b:v", cfg.video_bitrate.as_str()]);
    push(&["-c:a", "aac", "-b:a", cfg.audio_bitrate.as_str()]);
    push(&["-f", "segment"]);
    push(&["-segment_time", buffer.segment_secs.to_string().as_str()]);
    push(&["-segment_wrap", buffer.capacity.to_string().as_str()]);
    // W-1 entries: the slot being rewritten is never listed.
    push(&["-segment_list", &*buffer.completion_log_path().to_string_lossy()]);
    push(&["-segment_list_type", "flat"]);
    push(&["-segment_list_size", list_size.to_string().as_str()]);
    push(&[&*buffer.segment_pattern().to_string_lossy()]);
    args
}

/// Owned handle to the background encoder process.
///
/// The child is spawned with `kill_on_drop`, so dropping the handle on any
/// exit path still releases the capture devices.
pub struct EncoderProcess {
    program: String,
    child: Child,
}

impl EncoderProcess {
    pub fn start(cfg: &EncoderConfig) -> Result<Self> {
        let args = encoder_args(cfg);
        tracing::info!(
            bin = %cfg.ffmpeg_bin,
            video = %cfg.video_device,
            audio = %cfg.audio_source,
            segment_secs = cfg.buffer.segment_secs,
            capacity = cfg.buffer.capacity,
            "starting encoder"
        );
        Self::spawn(&cfg.ffmpeg_bin, &args)
    }

    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn encoder {program}"))?;

        tracing::info!(pid = child.id(), program, "encoder running");
        Ok(Self {
            program: program.to_string(),
            child,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// True while the child has not exited.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(program = %self.program, %status, "encoder has exited");
                false
            }
            Err(e) => {
                tracing::warn!(program = %self.program, error = %e, "failed to poll encoder");
                false
            }
        }
    }

    /// SIGTERM, wait up to `grace` for ffmpeg to finish the open segment,
    /// then SIGKILL.
    pub async fn stop(&mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        if let Some(pid) = self.child.id() {
            // SAFETY: pid is our own child and has not been reaped yet.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                tracing::warn!(pid, error = %std::io::Error::last_os_error(), "SIGTERM to encoder failed");
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("failed to wait for encoder")?;
                tracing::info!(%status, "encoder stopped");
                Ok(status)
            }
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "encoder ignored SIGTERM, killing");
                self.child.kill().await.context("failed to kill encoder")?;
                let status = self.child.wait().await.context("failed to reap encoder")?;
                Ok(status)
            }
        }
    }
}
