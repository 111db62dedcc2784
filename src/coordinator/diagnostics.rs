//! Diagnostic opcode scanning.
//!
//! Sends candidate frames one at a time on a single authenticated session and
//! records whatever the bed notifies back. Used to map undocumented opcodes;
//! failures are logged and never surface as errors.

use super::{lock, ActiveTask, Coordinator, Inner};
use crate::coordinator::error::BedError;
use crate::domain::models::{MacAddress, Pin};
use crate::infrastructure::bluetooth::protocol::{self, DiagnosticFamily, DIAGNOSTIC_CANDIDATES};
use crate::infrastructure::bluetooth::transport::BleLink;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticStatus {
    pub running: bool,
    /// Frames sent by the current or last scan
    pub sent: usize,
    pub last_sent: Option<(DiagnosticFamily, u8)>,
    pub last_notification: Option<Vec<u8>>,
}

/// Every opcode of one family, in order.
pub fn full_sweep(family: DiagnosticFamily) -> Vec<(DiagnosticFamily, u8)> {
    (0..=u8::MAX).map(|opcode| (family, opcode)).collect()
}

/// The short list of opcodes worth trying first.
pub fn candidate_plan() -> Vec<(DiagnosticFamily, u8)> {
    DIAGNOSTIC_CANDIDATES.to_vec()
}

type DiagnosticSession = (Arc<dyn BleLink>, Option<mpsc::UnboundedReceiver<Vec<u8>>>);

impl Inner {
    fn record_diagnostic_sent(&self, family: DiagnosticFamily, opcode: u8) {
        let mut status = lock(&self.diagnostic_status);
        status.sent += 1;
        status.last_sent = Some((family, opcode));
    }

    fn record_diagnostic_notification(&self, bytes: Vec<u8>) {
        info!(bytes = %protocol::to_hex(&bytes), "Diagnostic notification");
        lock(&self.diagnostic_status).last_notification = Some(bytes.clone());
        self.state().last_notification = Some(bytes);
    }

    async fn open_diagnostic_session(
        &self,
        address: &MacAddress,
        pin: &Pin,
    ) -> Result<DiagnosticSession, BedError> {
        let link = self.connections.open(address).await?;
        if let Err(e) = self.authenticate(&link, pin).await.and_then(|r| r.check()) {
            self.connections.release(&link).await;
            return Err(e);
        }
        let notifications = match link.subscribe().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Diagnostic scan running without notifications: {}", e);
                None
            }
        };
        Ok((link, notifications))
    }

    async fn run_diagnostic_scan(&self, plan: Vec<(DiagnosticFamily, u8)>, cancel: CancellationToken) {
        let _lease = tokio::select! {
            lease = self.connections.acquire() => lease,
            _ = cancel.cancelled() => return,
        };
        let address = match self.require_address().await {
            Ok(address) => address,
            Err(e) => {
                warn!("Diagnostic scan not started: {}", e);
                return;
            }
        };
        let pin = self.pin();
        let delay = self.config.diagnostic_delay;
        let mut session: Option<DiagnosticSession> = None;

        info!(frames = plan.len(), "Diagnostic scan started");
        for (family, opcode) in plan {
            if cancel.is_cancelled() {
                break;
            }
            if session.is_none() {
                match self.open_diagnostic_session(&address, &pin).await {
                    Ok(opened) => session = Some(opened),
                    Err(e) => {
                        warn!("Diagnostic scan cannot connect, giving up: {}", e);
                        break;
                    }
                }
            }
            let Some((link, notifications)) = session.as_mut() else {
                break;
            };

            let frame = protocol::diagnostic_frame(family, opcode);
            debug!(%family, opcode, frame = %protocol::to_hex(&frame), "Diagnostic send");
            if let Err(e) = link.write(&frame).await {
                warn!(%family, opcode, "Diagnostic write failed: {}", e);
                self.connections.release(link).await;
                session = None;
                continue;
            }
            self.record_diagnostic_sent(family, opcode);

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(rx) = notifications {
                while let Ok(bytes) = rx.try_recv() {
                    self.record_diagnostic_notification(bytes);
                }
            }
        }

        if let Some((link, _)) = session {
            self.connections.release(&link).await;
        }
        info!(sent = lock(&self.diagnostic_status).sent, "Diagnostic scan finished");
    }
}

impl Coordinator {
    /// Start scanning `plan` in the background, replacing any running scan.
    pub async fn start_diagnostic_scan(&self, plan: Vec<(DiagnosticFamily, u8)>) {
        self.stop_diagnostic_scan().await;
        {
            let mut status = lock(&self.inner.diagnostic_status);
            status.sent = 0;
            status.last_sent = None;
        }

        let inner = self.inner.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            inner.run_diagnostic_scan(plan, token).await;
        });
        *lock(&self.inner.diagnostics) = Some(ActiveTask { cancel, handle });
    }

    pub async fn stop_diagnostic_scan(&self) {
        let task = lock(&self.inner.diagnostics).take();
        if let Some(task) = task {
            task.stop(self.inner.config.stop_wait).await;
        }
    }

    pub fn diagnostic_status(&self) -> DiagnosticStatus {
        let running = lock(&self.inner.diagnostics)
            .as_ref()
            .is_some_and(ActiveTask::is_running);
        DiagnosticStatus {
            running,
            ..lock(&self.inner.diagnostic_status).clone()
        }
    }

    /// Send one diagnostic frame and return the first notification it provokes.
    pub async fn send_diagnostic(
        &self,
        family: DiagnosticFamily,
        opcode: u8,
    ) -> Result<Option<Vec<u8>>, BedError> {
        let frame = protocol::diagnostic_frame(family, opcode);
        let wait = self.inner.config.auth.response_wait;
        let reply = self
            .inner
            .with_session(|link| {
                let frame = frame.clone();
                async move {
                    let mut notifications = link.subscribe().await?;
                    link.write(&frame).await?;
                    Ok::<_, BedError>(
                        tokio::time::timeout(wait, notifications.recv())
                            .await
                            .ok()
                            .flatten(),
                    )
                }
            })
            .await?;

        self.inner.record_diagnostic_sent(family, opcode);
        if let Some(bytes) = &reply {
            self.inner.record_diagnostic_notification(bytes.clone());
        }
        Ok(reply)
    }
}
