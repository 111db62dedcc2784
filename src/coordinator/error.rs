use crate::domain::models::Axis;
use crate::infrastructure::bluetooth::error::BleError;
use thiserror::Error;

/// Failures surfaced by coordinator operations after retries are exhausted.
#[derive(Debug, Error)]
pub enum BedError {
    /// Nothing matched this cycle; the next poll tries again.
    #[error("bed address not found")]
    AddressNotFound,

    #[error("timed out connecting to the bed")]
    ConnectionTimeout,

    #[error("command characteristic not found")]
    CharacteristicNotFound,

    #[error("PIN rejected by the bed")]
    AuthRejected,

    /// No accept/reject notification arrived and the link dropped.
    #[error("no PIN response and the bed disconnected")]
    AuthAmbiguous,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("{0} calibration already in progress")]
    CalibrationInProgress(Axis),

    #[error("no calibration is running")]
    CalibrationNotRunning,

    #[error("position {0} is outside 0-100")]
    InvalidPosition(f64),

    #[error(transparent)]
    Transport(BleError),
}

impl From<BleError> for BedError {
    fn from(e: BleError) -> Self {
        match e {
            BleError::ConnectionTimeout(_) => BedError::ConnectionTimeout,
            BleError::CharacteristicNotFound => BedError::CharacteristicNotFound,
            BleError::WriteFailed(reason) => BedError::WriteFailed(reason),
            other => BedError::Transport(other),
        }
    }
}

impl BedError {
    /// Transient failures worth one quick retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BedError::ConnectionTimeout
                | BedError::WriteFailed(_)
                | BedError::AuthAmbiguous
                | BedError::Transport(_)
        )
    }
}
