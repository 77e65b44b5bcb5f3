use std::time::SystemTime;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ClipError;
use crate::lifecycle::ClipRequest;
use crate::segment::{finalize, finalize_with_log};
use crate::state::SharedState;
use crate::upload::Uploader;

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub duration: Option<u32>,
    pub entity_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: &'static str,
    pub uploaded_clip: String,
    pub saved_local_path: String,
    pub upload_result: serde_json::Value,
    pub segments_merged: usize,
    pub actual_duration: u32,
    pub switch_toggled: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn reject(status: StatusCode, error: String) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            status: "error",
            error,
        }),
    )
}

fn reject_clip(e: &ClipError) -> ApiError {
    reject(e.status(), e.to_string())
}

pub fn router<U>(state: SharedState<U>) -> Router
where
    U: Uploader + Send + Sync + 'static,
{
    Router::new()
        .route("/trigger", post(trigger_handler::<U>))
        .route("/health", get(health_handler::<U>))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

/// Parse and validate a trigger body. Nothing has happened yet when this fails.
pub fn parse_trigger(body: &[u8], allowed: &[u32]) -> Result<(u32, String), ClipError> {
    let req: TriggerRequest = serde_json::from_slice(body)
        .map_err(|e| ClipError::InvalidRequest(format!("malformed body: {e}")))?;

    let duration = req
        .duration
        .ok_or_else(|| ClipError::InvalidRequest("missing duration".to_string()))?;
    crate::validate::validate_duration(duration, allowed).map_err(ClipError::InvalidRequest)?;

    let entity_id = req
        .entity_id
        .ok_or_else(|| ClipError::InvalidRequest("missing entity_id".to_string()))?;
    crate::validate::validate_entity_id(&entity_id).map_err(ClipError::InvalidRequest)?;

    Ok((duration, entity_id))
}

/// POST /trigger: cut the last `duration` seconds, then save, upload and flip the switch.
pub async fn trigger_handler<U>(
    State(state): State<SharedState<U>>,
    body: Bytes,
) -> Result<Json<TriggerResponse>, ApiError>
where
    U: Uploader + Send + Sync + 'static,
{
    let (duration, entity_id) = parse_trigger(&body, &state.allowed_durations).map_err(|e| {
        tracing::warn!(error = %e, "rejected trigger");
        reject_clip(&e)
    })?;

    let _guard = state.trigger_lock.lock().await;
    tracing::info!(duration, entity_id = %entity_id, "trigger received");

    if let Some(encoder) = state.encoder.lock().await.as_mut() {
        if !encoder.is_alive() {
            let e = ClipError::EncoderDown("encoder process has exited".to_string());
            tracing::error!(error = %e, "trigger failed");
            return Err(reject_clip(&e));
        }
    }

    let outcome = state
        .pipeline
        .run(&ClipRequest { duration_secs: duration }, &state.uploader)
        .await
        .map_err(|e| {
            tracing::error!(stage = %e.stage, error = %e.error, "trigger failed");
            reject(e.error.status(), e.to_string())
        })?;

    let switch_toggled = state.switch.turn_off(&entity_id).await;

    tracing::info!(
        clip = %outcome.file_name,
        segments = outcome.segments_merged,
        actual_secs = outcome.actual_secs,
        switch_toggled,
        "trigger complete"
    );

    Ok(Json(TriggerResponse {
        status: "success",
        uploaded_clip: outcome.file_name,
        saved_local_path: outcome.durable_path.display().to_string(),
        upload_result: outcome.upload_result,
        segments_merged: outcome.segments_merged,
        actual_duration: outcome.actual_secs,
        switch_toggled,
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// `running`, `exited` or `external`.
    pub encoder: &'static str,
    pub encoder_pid: Option<u32>,
    pub segments: usize,
    pub finalized: usize,
    pub newest_segment_age_secs: Option<f64>,
    /// No segment written for three segment durations past the threshold.
    pub stalled: bool,
    pub completion_log: bool,
    pub segment_secs: u32,
    pub capacity: u32,
    pub max_clip_secs: u64,
    pub allowed_durations: Vec<u32>,
}

/// GET /health: encoder liveness and buffer fill.
pub async fn health_handler<U>(State(state): State<SharedState<U>>) -> Json<HealthResponse>
where
    U: Uploader + Send + Sync + 'static,
{
    let (encoder, encoder_pid) = match state.encoder.lock().await.as_mut() {
        Some(proc) => {
            if proc.is_alive() {
                ("running", proc.pid())
            } else {
                ("exited", None)
            }
        }
        None => ("external", None),
    };

    let pipeline = &state.pipeline;
    let buffer = pipeline.buffer();
    let now = SystemTime::now();
    let segments = pipeline.store().list_segments();
    let log = pipeline.store().read_completion_log();
    let finalized = match &log {
        Some(log) => finalize_with_log(&segments, log).len(),
        None => finalize(&segments, now, pipeline.threshold()).len(),
    };

    let newest_age = segments
        .last()
        .and_then(|s| now.duration_since(s.modified).ok())
        .map(|d| d.as_secs_f64());
    let stall_after = 3.0 * buffer.segment_secs as f64 + pipeline.threshold().as_secs_f64();
    let stalled = encoder != "exited" && newest_age.map(|age| age > stall_after).unwrap_or(false);

    let status = if encoder == "exited" || stalled { "degraded" } else { "ok" };

    Json(HealthResponse {
        status,
        encoder,
        encoder_pid,
        segments: segments.len(),
        finalized,
        newest_segment_age_secs: newest_age,
        stalled,
        completion_log: log.is_some(),
        segment_secs: buffer.segment_secs,
        capacity: buffer.capacity,
        max_clip_secs: buffer.max_clip_secs(),
        allowed_durations: state.allowed_durations.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use std::sync::Arc;
    use crate::concat::tests::{shell_tool, COPY_LIST};
    use crate::encoder::EncoderProcess;
    use crate::lifecycle::ClipPipeline;
    use crate::segment::tests::write_segment;
    use crate::segment::BufferConfig;
    use crate::switch::SwitchClient;
    use axum::body::Body;
    use axum::http::Request;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    struct StaticUploader;

    impl Uploader for StaticUploader {
        async fn upload(&self, _path: &Path, file_name: &str, _description: &str) -> Result<serde_json::Value, ClipError> {
            Ok(serde_json::json!({ "uploaded": file_name }))
        }
    }

    fn state(buffer: &Path, clips: &Path, encoder: Option<EncoderProcess>) -> SharedState<StaticUploader> {
        let cfg = BufferConfig {
            dir: buffer.to_path_buf(),
            segment_secs: 5,
            capacity: 12,
        };
        Arc::new(AppState {
            pipeline: ClipPipeline::new(
                cfg,
                Duration::from_secs(1),
                shell_tool(COPY_LIST, Duration::from_secs(10)),
                clips.to_path_buf(),
            ),
            uploader: StaticUploader,
            switch: SwitchClient::new(reqwest::Client::new(), "http://127.0.0.1:1", None),
            encoder: Mutex::new(encoder),
            trigger_lock: Mutex::new(()),
            allowed_durations: vec![30, 60],
        })
    }

    async fn post_trigger(app: Router, body: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/trigger")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_parse_trigger() {
        let allowed = [30, 60];
        let (d, e) = parse_trigger(br#"{"duration": 30, "entity_id": "input_boolean.flask_switch"}"#, &allowed).unwrap();
        assert_eq!(d, 30);
        assert_eq!(e, "input_boolean.flask_switch");

        for body in [
            r#"{"entity_id": "input_boolean.flask_switch"}"#,
            r#"{"duration": 45, "entity_id": "input_boolean.flask_switch"}"#,
            r#"{"duration": "30", "entity_id": "input_boolean.flask_switch"}"#,
            r#"{"duration": 30}"#,
            r#"{"duration": 30, "entity_id": "not an entity"}"#,
            "not json",
            "",
        ] {
            let err = parse_trigger(body.as_bytes(), &allowed).unwrap_err();
            assert!(matches!(err, ClipError::InvalidRequest(_)), "{body}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_trigger_success_response_shape() {
        let buffer = tempfile::tempdir().expect("tempdir");
        let clips = tempfile::tempdir().expect("tempdir");
        let base = SystemTime::now() - Duration::from_secs(120);
        for i in 0..8 {
            write_segment(buffer.path(), i, base + Duration::from_secs(5 * i as u64));
        }

        let app = router(state(buffer.path(), clips.path(), None));
        let (status, body) =
            post_trigger(app, r#"{"duration": 30, "entity_id": "input_boolean.flask_switch"}"#).await;

        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "success");
        assert_eq!(body["segments_merged"], 6);
        assert_eq!(body["actual_duration"], 30);
        assert_eq!(body["switch_toggled"], false);
        let clip = body["uploaded_clip"].as_str().unwrap();
        assert!(clip.starts_with("clip_") && clip.ends_with("_30s.mp4"), "{clip}");
        assert_eq!(body["upload_result"]["uploaded"], clip);
        assert!(Path::new(body["saved_local_path"].as_str().unwrap()).exists());
    }

    #[tokio::test]
    async fn test_trigger_bad_request_has_no_side_effects() {
        let buffer = tempfile::tempdir().expect("tempdir");
        let clips = tempfile::tempdir().expect("tempdir");
        write_segment(buffer.path(), 0, SystemTime::now() - Duration::from_secs(60));

        let app = router(state(buffer.path(), clips.path(), None));
        let (status, body) = post_trigger(app, r#"{"duration": 45, "entity_id": "switch.x"}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("duration"));
        assert_eq!(std::fs::read_dir(clips.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_trigger_empty_buffer_is_500() {
        let buffer = tempfile::tempdir().expect("tempdir");
        let clips = tempfile::tempdir().expect("tempdir");

        let app = router(state(buffer.path(), clips.path(), None));
        let (status, body) =
            post_trigger(app, r#"{"duration": 30, "entity_id": "switch.porch"}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(body["error"].as_str().unwrap().contains("no finalized segments"));
    }

    #[tokio::test]
    async fn test_trigger_dead_encoder_is_reported() {
        let buffer = tempfile::tempdir().expect("tempdir");
        let clips = tempfile::tempdir().expect("tempdir");
        write_segment(buffer.path(), 0, SystemTime::now() - Duration::from_secs(60));

        let mut proc = EncoderProcess::spawn("true", &[]).expect("spawn");
        proc.stop(Duration::from_secs(5)).await.expect("reap");

        let app = router(state(buffer.path(), clips.path(), Some(proc)));
        let (status, body) =
            post_trigger(app, r#"{"duration": 30, "entity_id": "switch.porch"}"#).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("encoder is not running"));
        assert_eq!(std::fs::read_dir(clips.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_health_reports_buffer() {
        let buffer = tempfile::tempdir().expect("tempdir");
        let clips = tempfile::tempdir().expect("tempdir");
        let now = SystemTime::now();
        write_segment(buffer.path(), 0, now - Duration::from_secs(10));
        write_segment(buffer.path(), 1, now);

        let app = router(state(buffer.path(), clips.path(), None));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["status"], "ok");
        assert_eq!(body["encoder"], "external");
        assert_eq!(body["segments"], 2);
        assert_eq!(body["finalized"], 1);
        assert_eq!(body["max_clip_secs"], 50);
        assert_eq!(body["completion_log"], false);
    }

    #[tokio::test]
    async fn test_health_reports_exited_encoder() {
        let buffer = tempfile::tempdir().expect("tempdir");
        let clips = tempfile::tempdir().expect("tempdir");

        let mut proc = EncoderProcess::spawn("true", &[]).expect("spawn");
        proc.stop(Duration::from_secs(5)).await.expect("reap");

        let app = router(state(buffer.path(), clips.path(), Some(proc)));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["encoder"], "exited");
        assert_eq!(body["encoder_pid"], serde_json::Value::Null);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_health_reports_running_encoder() {
        let buffer = tempfile::tempdir().expect("tempdir");
        let clips = tempfile::tempdir().expect("tempdir");

        let proc = EncoderProcess::spawn("sleep", &["30".to_string()]).expect("spawn");
        let pid = proc.pid().expect("pid");

        let state = state(buffer.path(), clips.path(), Some(proc));
        let resp = router(state.clone())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body["encoder"], "running");
        assert_eq!(body["encoder_pid"], pid);

        if let Some(mut proc) = state.encoder.lock().await.take() {
            proc.stop(Duration::from_secs(5)).await.expect("stop");
        };
    }
}
