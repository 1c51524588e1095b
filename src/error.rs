//! Error taxonomy for the tracking pipeline.
//! Each variant maps to one recovery policy: capture, segmentation and detection
//! failures are absorbed by the polling loop, validation failures are logged and
//! skipped, analysis failures stay inside the scheduler. Only the orchestration
//! variants (`Config`, `MissingCredential`, `Device`) end the process.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("segmentation failed: {0}")]
    Segmentation(String),
    #[error("detection failed: {0}")]
    Detection(String),
    #[error("invalid position string '{fen}': {reason}")]
    Validation { fen: String, reason: String },
    #[error("analysis failed: {0}")]
    Analysis(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0} environment variable not set")]
    MissingCredential(&'static str),
    #[error("capture device unavailable: {0}")]
    Device(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// True for failures that must tear the whole pipeline down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_) | PipelineError::MissingCredential(_) | PipelineError::Device(_)
        )
    }

    pub fn validation(fen: &str, reason: impl Into<String>) -> Self {
        PipelineError::Validation {
            fen: fen.to_string(),
            reason: reason.into(),
        }
    }
}
