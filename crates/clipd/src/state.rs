use std::sync::Arc;
use tokio::sync::Mutex;

use crate::encoder::EncoderProcess;
use crate::lifecycle::ClipPipeline;
use crate::switch::SwitchClient;
use crate::upload::PhotosUploader;

/// Shared application state passed to all axum handlers via State extractor.
pub struct AppState<U = PhotosUploader> {
    pub pipeline: ClipPipeline,
    pub uploader: U,
    pub switch: SwitchClient,
    /// `None` when the encoder is managed outside clipd.
    pub encoder: Mutex<Option<EncoderProcess>>,
    /// Held for a whole trigger so two triggers never read the ring at once.
    pub trigger_lock: Mutex<()>,
    pub allowed_durations: Vec<u32>,
}

/// Type alias for the shared state used across the application.
pub type SharedState<U = PhotosUploader> = Arc<AppState<U>>;
