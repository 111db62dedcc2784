//! Real BLE backend on top of `btleplug`.
//!
//! Works against local adapters and anything the OS stack exposes through
//! relays. Every connect looks the peripheral up again so no negotiated
//! services survive from a previous session.

use super::error::BleError;
use super::protocol::{COMMAND_CHAR_UUID, SERVICE_UUID};
use super::transport::{Advertisement, BleBackend, BleLink};
use crate::domain::models::MacAddress;
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

pub struct BtleplugBackend {
    _manager: Manager,
    adapters: Vec<Adapter>,
}

impl BtleplugBackend {
    /// Open every adapter and start a passive background scan on each.
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        if adapters.is_empty() {
            return Err(BleError::NoAdapters);
        }

        for adapter in &adapters {
            let name = adapter
                .adapter_info()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            info!(adapter = %name, "Starting BLE scan");
            adapter.start_scan(ScanFilter::default()).await?;
        }

        Ok(Self {
            _manager: manager,
            adapters,
        })
    }

    async fn find_peripheral(&self, address: &MacAddress) -> Result<Option<Peripheral>, BleError> {
        let wanted = BDAddr::from(address.octets());
        for adapter in &self.adapters {
            for peripheral in adapter.peripherals().await? {
                if peripheral.address() == wanted {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn is_present(&self, address: &MacAddress) -> bool {
        match self.find_peripheral(address).await {
            Ok(Some(peripheral)) => matches!(peripheral.properties().await, Ok(Some(_))),
            Ok(None) => false,
            Err(e) => {
                debug!("Presence check failed: {}", e);
                false
            }
        }
    }

    async fn discovered(&self) -> Result<Vec<Advertisement>, BleError> {
        let mut found = Vec::new();
        for adapter in &self.adapters {
            for peripheral in adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                found.push(Advertisement {
                    name: properties.local_name,
                    address: MacAddress::new(properties.address.into_inner()),
                });
            }
        }
        Ok(found)
    }

    async fn connect(
        &self,
        address: &MacAddress,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn BleLink>, BleError> {
        let peripheral = self
            .find_peripheral(address)
            .await?
            .ok_or(BleError::DeviceNotVisible(*address))?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            match timeout(connect_timeout, peripheral.connect()).await {
                Ok(result) => result?,
                Err(_) => return Err(BleError::ConnectionTimeout(*address)),
            }
        }

        match timeout(connect_timeout, peripheral.discover_services()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(BleError::ConnectionTimeout(*address));
            }
        }

        let Some(characteristic) = find_command_characteristic(&peripheral) else {
            warn!(%address, "Command characteristic missing after service discovery");
            let _ = peripheral.disconnect().await;
            return Err(BleError::CharacteristicNotFound);
        };

        let write_type = if characteristic
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        debug!(%address, uuid = %characteristic.uuid, ?write_type, "GATT session ready");
        Ok(Arc::new(BtleplugLink {
            peripheral,
            characteristic,
            write_type,
            forwarders: Mutex::new(Vec::new()),
        }))
    }
}

/// Match by UUID first, then fall back to any writable characteristic of the
/// bed service for relays that rewrite characteristic identities.
fn find_command_characteristic(peripheral: &Peripheral) -> Option<Characteristic> {
    let characteristics = peripheral.characteristics();
    characteristics
        .iter()
        .find(|c| c.uuid == COMMAND_CHAR_UUID)
        .or_else(|| {
            characteristics.iter().find(|c| {
                c.service_uuid == SERVICE_UUID
                    && c.properties
                        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
            })
        })
        .cloned()
}

struct BtleplugLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_type: WriteType,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn abort_forwarders(&self) {
        let mut forwarders = match self.forwarders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handle in forwarders.drain(..) {
            handle.abort();
        }
    }
}

fn map_write_error(e: btleplug::Error) -> BleError {
    match e {
        btleplug::Error::NoSuchCharacteristic => BleError::CharacteristicNotFound,
        btleplug::Error::NotConnected => BleError::NotConnected,
        other => BleError::WriteFailed(other.to_string()),
    }
}

#[async_trait]
impl BleLink for BtleplugLink {
    async fn write(&self, frame: &[u8]) -> Result<(), BleError> {
        trace!(len = frame.len(), "GATT write");
        self.peripheral
            .write(&self.characteristic, frame, self.write_type)
            .await
            .map_err(map_write_error)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BleError> {
        let mut stream = self.peripheral.notifications().await?;
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(map_write_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let uuid = self.characteristic.uuid;
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(notification.value).is_err() {
                    break;
                }
            }
        });

        match self.forwarders.lock() {
            Ok(mut guard) => guard.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.abort_forwarders();
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.abort_forwarders();
    }
}
