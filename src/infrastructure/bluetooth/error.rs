use crate::domain::models::MacAddress;
use thiserror::Error;

/// Transport-level failures reported by a BLE backend.
#[derive(Debug, Error)]
pub enum BleError {
    #[error("no Bluetooth adapters available")]
    NoAdapters,

    #[error("device {0} is not visible to any adapter")]
    DeviceNotVisible(MacAddress),

    #[error("timed out connecting to {0}")]
    ConnectionTimeout(MacAddress),

    /// Capability-discovery race on proxied backends; resolved by reconnecting.
    #[error("command characteristic not found")]
    CharacteristicNotFound,

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Backend(#[from] btleplug::Error),
}
