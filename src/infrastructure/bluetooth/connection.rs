//! BLE Connection Module
//!
//! Owns the single physical connection to the bed. Every operation holds the
//! connection gate for its whole duration, connects, does its work and
//! disconnects before the next operation may start.

use crate::coordinator::error::BedError;
use crate::domain::models::MacAddress;
use crate::infrastructure::bluetooth::transport::{BleBackend, BleLink};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Retry/backoff discipline shared by every operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra full reconnects after a missing characteristic
    pub characteristic_retries: u32,
    /// Backoff unit for missing-characteristic retries, multiplied by the attempt
    pub characteristic_backoff: Duration,
    /// Extra attempts after any other transient failure
    pub transient_retries: u32,
    pub transient_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            characteristic_retries: 2,
            characteristic_backoff: Duration::from_secs(3),
            transient_retries: 1,
            transient_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` to give up.
    pub fn backoff(&self, error: &BedError, attempt: u32) -> Option<Duration> {
        match error {
            BedError::CharacteristicNotFound if attempt <= self.characteristic_retries => {
                Some(self.characteristic_backoff * attempt)
            }
            e if e.is_transient() && attempt <= self.transient_retries => {
                Some(self.transient_backoff)
            }
            _ => None,
        }
    }
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }
}

/// Exclusive right to use the bed connection. Dropping it lets the next
/// operation in.
pub type ConnectionLease = OwnedMutexGuard<()>;

pub struct ConnectionManager {
    backend: Arc<dyn BleBackend>,
    gate: Arc<Mutex<()>>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn BleBackend>, config: ConnectionConfig) -> Self {
        Self {
            backend,
            gate: Arc::new(Mutex::new(())),
            config,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Wait for exclusive use of the connection
    pub async fn acquire(&self) -> ConnectionLease {
        self.gate.clone().lock_owned().await
    }

    /// Take the connection only if nobody holds it
    pub fn try_acquire(&self) -> Option<ConnectionLease> {
        self.gate.clone().try_lock_owned().ok()
    }

    /// One bounded connect attempt with a fresh device handle
    pub async fn connect_once(&self, address: &MacAddress) -> Result<Arc<dyn BleLink>, BedError> {
        let timeout = self.config.connect_timeout;
        debug!(%address, ?timeout, "Connecting");
        match tokio::time::timeout(timeout, self.backend.connect(address, timeout)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BedError::ConnectionTimeout),
        }
    }

    /// Connect, retrying per the policy. Caller must hold a lease.
    pub async fn open(&self, address: &MacAddress) -> Result<Arc<dyn BleLink>, BedError> {
        let mut attempt = 0;
        loop {
            match self.connect_once(address).await {
                Ok(link) => {
                    info!(%address, "Connected");
                    return Ok(link);
                }
                Err(e) => {
                    attempt += 1;
                    let Some(delay) = self.config.retry.backoff(&e, attempt) else {
                        warn!(%address, attempt, "Connect failed: {}", e);
                        return Err(e);
                    };
                    warn!(%address, attempt, ?delay, "Connect failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Disconnect if still connected. A link that already dropped is left alone.
    pub async fn release(&self, link: &Arc<dyn BleLink>) {
        if !link.is_connected().await {
            debug!("Link already closed");
            return;
        }
        if let Err(e) = link.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
    }

    /// Connect, run `op`, disconnect. The whole sequence is retried per the
    /// policy. Caller must hold a lease.
    pub async fn run<T, F, Fut>(&self, address: &MacAddress, mut op: F) -> Result<T, BedError>
    where
        F: FnMut(Arc<dyn BleLink>) -> Fut,
        Fut: Future<Output = Result<T, BedError>>,
    {
        let mut attempt = 0;
        loop {
            let result = match self.connect_once(address).await {
                Ok(link) => {
                    let result = op(link.clone()).await;
                    self.release(&link).await;
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    let Some(delay) = self.config.retry.backoff(&e, attempt) else {
                        return Err(e);
                    };
                    warn!(%address, attempt, ?delay, "Operation failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// [`run`](Self::run) under a freshly acquired lease
    pub async fn with_connection<T, F, Fut>(&self, address: &MacAddress, op: F) -> Result<T, BedError>
    where
        F: FnMut(Arc<dyn BleLink>) -> Fut,
        Fut: Future<Output = Result<T, BedError>>,
    {
        let _lease = self.acquire().await;
        self.run(address, op).await
    }
}
