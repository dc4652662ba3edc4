//! Error types of the metering layer.
//!
//! None of these reach a meter's consumer: [`crate::single::SingleMeter`] and
//! [`crate::multi::MultiMeter`] turn them into silent levels and a log record.
use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EngineState;

/// Reasons a probe could not be attached to a signal path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttachError {
    /// The audio engine is not running. Retried on the next enable/reconcile cycle.
    #[error("audio engine unavailable (state: {0:?})")]
    EngineUnavailable(EngineState),
    /// The signal path handle is stale, closed or of the wrong kind. Only retried once the caller
    /// supplies a different handle.
    #[error("signal path is stale or closed")]
    InvalidSource,
    /// The engine refused the tap for any other reason. Handled like [`Self::InvalidSource`].
    #[error("engine rejected the tap: {0}")]
    AttachFailed(String),
    /// The probe configuration failed validation.
    #[error("invalid probe configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

impl AttachError {
    /// Whether attaching again with the same handle may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::EngineUnavailable(_))
    }
}

/// Failure to remove a probe from the audio graph. Always recovered locally: the tap is
/// considered detached regardless.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("failed to detach probe: {0}")]
pub struct DetachError(pub String);
