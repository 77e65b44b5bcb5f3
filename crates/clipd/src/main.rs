mod api;
mod concat;
mod encoder;
mod error;
mod lifecycle;
mod segment;
mod state;
mod switch;
mod upload;
mod validate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::concat::Concatenator;
use crate::encoder::{EncoderConfig, EncoderProcess};
use crate::lifecycle::ClipPipeline;
use crate::segment::BufferConfig;
use crate::state::AppState;
use crate::switch::SwitchClient;
use crate::upload::{GoogleTokenSource, PhotosUploader};

/// clipd: keeps a rolling camera buffer and turns the last N seconds into a
/// clip on demand.
#[derive(Parser, Debug)]
#[command(name = "clipd", version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:5000")]
    listen: String,

    /// Ring buffer directory (fast, volatile storage).
    #[arg(long, default_value = "/dev/shm/clipd")]
    buffer_dir: PathBuf,

    /// Directory for saved clips.
    #[arg(long, default_value = "/var/lib/clipd/clips")]
    clips_dir: PathBuf,

    /// Segment duration in seconds.
    #[arg(long, default_value_t = 2)]
    segment_secs: u32,

    /// Number of segments in the ring before the encoder wraps.
    #[arg(long, default_value_t = 155)]
    capacity: u32,

    /// Clip durations (seconds) a trigger may request.
    #[arg(long, value_delimiter = ',', default_value = "30,60,120,300")]
    allowed_durations: Vec<u32>,

    /// Minimum segment age before it is read when the encoder's completion
    /// log is unavailable. Calibrate against the encoder's write latency.
    #[arg(long, default_value_t = 3000)]
    finalize_threshold_ms: u64,

    /// ffmpeg binary used for capture and concatenation.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg_bin: String,

    /// V4L2 capture device.
    #[arg(long, default_value = "/dev/video0")]
    video_device: String,

    /// PulseAudio source name.
    #[arg(long, default_value = "default")]
    audio_source: String,

    #[arg(long, default_value = "1920x1080")]
    video_size: String,

    #[arg(long, default_value_t = 30)]
    framerate: u32,

    #[arg(long, default_value = "4M")]
    video_bitrate: String,

    #[arg(long, default_value = "128k")]
    audio_bitrate: String,

    /// Audio gain applied before encoding.
    #[arg(long, default_value_t = 7.5)]
    audio_volume: f32,

    /// Do not spawn the encoder; segments are produced by another process.
    #[arg(long, default_value_t = false)]
    external_encoder: bool,

    /// Seconds the encoder gets to finish its open segment on shutdown.
    #[arg(long, default_value_t = 5)]
    stop_grace_secs: u64,

    /// Upper bound for one concatenation run.
    #[arg(long, default_value_t = 120)]
    concat_timeout_secs: u64,

    /// Upper bound for each outbound HTTP call.
    #[arg(long, default_value_t = 60)]
    http_timeout_secs: u64,

    /// Upper bound for sending the clip bytes to the photo service.
    #[arg(long, default_value_t = 900)]
    upload_timeout_secs: u64,

    /// Home Assistant base URL.
    #[arg(long, env = "HA_URL", default_value = "http://homeassistant.local:8123")]
    ha_url: String,

    /// Home Assistant long-lived access token.
    #[arg(long, env = "HA_TOKEN", hide_env_values = true)]
    ha_token: Option<String>,

    #[arg(long, env = "GOOGLE_CLIENT_ID", hide_env_values = true)]
    google_client_id: String,

    #[arg(long, env = "GOOGLE_CLIENT_SECRET", hide_env_values = true)]
    google_client_secret: String,

    #[arg(long, env = "GOOGLE_REFRESH_TOKEN", hide_env_values = true)]
    google_refresh_token: String,

    #[arg(long, default_value = upload::TOKEN_URL)]
    token_url: String,

    #[arg(long, default_value = upload::UPLOAD_URL)]
    upload_url: String,

    #[arg(long, default_value = upload::CREATE_URL)]
    create_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!(
        listen = %args.listen,
        buffer_dir = %args.buffer_dir.display(),
        clips_dir = %args.clips_dir.display(),
        "starting clipd"
    );

    let buffer = BufferConfig {
        dir: args.buffer_dir.clone(),
        segment_secs: args.segment_secs,
        capacity: args.capacity,
    };
    validate::validate_buffer(&buffer, &args.allowed_durations).map_err(anyhow::Error::msg)?;
    for url in [&args.ha_url, &args.token_url, &args.upload_url, &args.create_url] {
        validate::validate_url(url).map_err(anyhow::Error::msg)?;
    }

    std::fs::create_dir_all(&args.clips_dir)
        .with_context(|| format!("failed to create clips directory {}", args.clips_dir.display()))?;
    // An external encoder owns the ring; only our own merge leftovers go.
    let swept = lifecycle::sweep_stale(&buffer.dir, !args.external_encoder)
        .with_context(|| format!("failed to prepare buffer directory {}", buffer.dir.display()))?;
    if swept > 0 {
        tracing::info!(files = swept, "removed stale buffer files");
    }

    let http_timeout = Duration::from_secs(args.http_timeout_secs);
    let client = reqwest::Client::builder()
        .timeout(http_timeout)
        .build()
        .context("failed to build HTTP client")?;

    let token_source = GoogleTokenSource::new(
        client.clone(),
        &args.token_url,
        &args.google_client_id,
        &args.google_client_secret,
        &args.google_refresh_token,
        http_timeout,
    );
    let uploader = PhotosUploader::new(
        client.clone(),
        &args.upload_url,
        &args.create_url,
        http_timeout,
        token_source,
    )
    .with_upload_timeout(Duration::from_secs(args.upload_timeout_secs));
    if let Err(e) = uploader.warm_up().await {
        tracing::warn!(error = %e, "initial token refresh failed, will retry on first trigger");
    }

    if args.ha_token.is_none() {
        tracing::warn!("HA_TOKEN not set, switch toggles will be skipped");
    }
    let switch = SwitchClient::new(client, &args.ha_url, args.ha_token.clone());

    let encoder = if args.external_encoder {
        tracing::info!("external encoder mode, not spawning ffmpeg");
        None
    } else {
        let cfg = EncoderConfig {
            ffmpeg_bin: args.ffmpeg_bin.clone(),
            video_device: args.video_device.clone(),
            audio_source: args.audio_source.clone(),
            video_size: args.video_size.clone(),
            framerate: args.framerate,
            video_bitrate: args.video_bitrate.clone(),
            audio_bitrate: args.audio_bitrate.clone(),
            audio_volume: args.audio_volume,
            buffer: buffer.clone(),
        };
        Some(EncoderProcess::start(&cfg)?)
    };

    let concat = Concatenator::new(
        args.ffmpeg_bin.clone(),
        Duration::from_secs(args.concat_timeout_secs),
    );
    let pipeline = ClipPipeline::new(
        buffer,
        Duration::from_millis(args.finalize_threshold_ms),
        concat,
        args.clips_dir.clone(),
    );

    let state = Arc::new(AppState {
        pipeline,
        uploader,
        switch,
        encoder: Mutex::new(encoder),
        trigger_lock: Mutex::new(()),
        allowed_durations: args.allowed_durations.clone(),
    });

    let app = api::router(state.clone());

    // From here on the encoder must be stopped on every exit path.
    let served = serve(&args.listen, app).await;

    if let Some(mut proc) = state.encoder.lock().await.take() {
        if let Err(e) = proc.stop(Duration::from_secs(args.stop_grace_secs)).await {
            tracing::error!(error = %e, "failed to stop encoder");
        }
    }

    served?;
    tracing::info!("clipd shutdown complete");
    Ok(())
}

async fn serve(listen: &str, app: axum::Router) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(listen, "clipd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
