//! Backend seam between the coordinator and a concrete BLE stack.

use super::error::BleError;
use crate::domain::models::MacAddress;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A device seen advertising by some adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: Option<String>,
    pub address: MacAddress,
}

/// Adapter-level operations: discovery and connecting.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Whether any adapter currently sees the address.
    async fn is_present(&self, address: &MacAddress) -> bool;

    /// Devices currently advertising.
    async fn discovered(&self) -> Result<Vec<Advertisement>, BleError>;

    /// Open a fresh GATT session. No services or handles are reused from a
    /// previous session.
    async fn connect(
        &self,
        address: &MacAddress,
        timeout: Duration,
    ) -> Result<Arc<dyn BleLink>, BleError>;
}

/// One open GATT session on the command characteristic.
#[async_trait]
pub trait BleLink: Send + Sync {
    async fn write(&self, frame: &[u8]) -> Result<(), BleError>;

    /// Start receiving notifications. Each call returns a new receiver.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BleError>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), BleError>;
}
