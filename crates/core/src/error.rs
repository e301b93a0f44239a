//! Failure taxonomy for the pipeline stages.
//!
//! Errors are propagated as `anyhow::Error` with a [`StageError`] at the root
//! so callers can classify a failure without parsing message text. Scope
//! policy: every variant is fatal only for the single `process` request that
//! raised it — sessions and config remain valid for subsequent requests.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageError {
    /// Every execution provider and the raw-bytes retry failed for a model.
    SessionCreationFailed,
    /// The source image bytes could not be decoded.
    ImageDecodeFailed,
    /// The primary inference pass failed for a tile.
    InferenceRunFailed,
    /// The final output image could not be encoded.
    EncodeFailed,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionCreationFailed => write!(f, "session creation failed"),
            Self::ImageDecodeFailed => write!(f, "image decode failed"),
            Self::InferenceRunFailed => write!(f, "inference run failed"),
            Self::EncodeFailed => write!(f, "output encode failed"),
        }
    }
}

impl std::error::Error for StageError {}

/// Classify an error chain by the [`StageError`] found in it, if any.
pub fn classify(error: &anyhow::Error) -> Option<StageError> {
    error.downcast_ref::<StageError>().copied()
}
