//! PIN handshake.
//!
//! The bed answers a keep-alive frame with a status notification, but relays
//! may swallow notifications entirely. When nothing classifying arrives the
//! only evidence left is whether the link survived, and that is reported as
//! an ambiguous outcome rather than guessed into accept or reject.

use crate::coordinator::error::BedError;
use crate::domain::models::{AuthOutcome, Connectivity, Pin, PinCheckProbe, PinResponse};
use crate::infrastructure::bluetooth::protocol::{self, BedCommand};
use crate::infrastructure::bluetooth::transport::BleLink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Bounded wait for the first classifying notification
    pub response_wait: Duration,
    /// Extra wait before judging connectivity when nothing arrived
    pub settle_wait: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            response_wait: Duration::from_secs(3),
            settle_wait: Duration::from_millis(1750),
        }
    }
}

/// Outcome of one handshake plus the notification that decided it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthReport {
    pub outcome: AuthOutcome,
    pub notification: Option<Vec<u8>>,
}

impl AuthReport {
    /// Err when commands must not be sent on this session.
    pub fn check(&self) -> Result<(), BedError> {
        match self.outcome {
            AuthOutcome::Rejected => Err(BedError::AuthRejected),
            AuthOutcome::Ambiguous(Connectivity::Disconnected) => Err(BedError::AuthAmbiguous),
            _ => Ok(()),
        }
    }
}

pub struct AuthProtocol {
    /// Set once the bed reports it has no PIN; never cleared.
    no_pin_mode: AtomicBool,
    config: AuthConfig,
}

impl AuthProtocol {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            no_pin_mode: AtomicBool::new(false),
            config,
        }
    }

    pub fn no_pin_mode(&self) -> bool {
        self.no_pin_mode.load(Ordering::Relaxed)
    }

    /// Frame that authenticates/keeps the session alive in the current mode.
    pub fn auth_frame(&self, pin: &Pin) -> Vec<u8> {
        if self.no_pin_mode() {
            BedCommand::AppInit.as_bytes().to_vec()
        } else {
            protocol::keep_alive_frame(pin)
        }
    }

    pub async fn authenticate(
        &self,
        link: &Arc<dyn BleLink>,
        pin: &Pin,
    ) -> Result<AuthReport, BedError> {
        if self.no_pin_mode() {
            link.write(BedCommand::AppInit.as_bytes()).await?;
            return Ok(AuthReport {
                outcome: AuthOutcome::NoPinSet,
                notification: None,
            });
        }

        let (response, notification) = self.exchange(link, pin).await?;
        let outcome = match response {
            Some(PinResponse::Accepted) => AuthOutcome::Accepted,
            Some(PinResponse::Rejected) => AuthOutcome::Rejected,
            Some(PinResponse::NoPinSet) => {
                info!("Bed reports no PIN, switching to app-init frames");
                self.no_pin_mode.store(true, Ordering::Relaxed);
                AuthOutcome::NoPinSet
            }
            Some(PinResponse::Unknown) | None => {
                AuthOutcome::Ambiguous(self.observe_connectivity(link).await)
            }
        };

        match outcome {
            AuthOutcome::Rejected => warn!("PIN rejected"),
            AuthOutcome::Ambiguous(connectivity) => {
                warn!(?connectivity, "No PIN response from bed")
            }
            _ => debug!(?outcome, "Authenticated"),
        }
        Ok(AuthReport {
            outcome,
            notification,
        })
    }

    /// Send a deliberately wrong PIN and see how the bed reacts.
    pub async fn probe_validates_pin(
        &self,
        link: &Arc<dyn BleLink>,
        wrong_pin: &Pin,
    ) -> Result<PinCheckProbe, BedError> {
        let (response, _) = self.exchange(link, wrong_pin).await?;
        let probe = match response {
            Some(PinResponse::Rejected) => PinCheckProbe::Rejected,
            Some(PinResponse::Accepted) | Some(PinResponse::NoPinSet) => PinCheckProbe::NotEnforced,
            Some(PinResponse::Unknown) | None => match self.observe_connectivity(link).await {
                Connectivity::StayedConnected => PinCheckProbe::NotEnforced,
                Connectivity::Disconnected => PinCheckProbe::Disconnected,
            },
        };
        info!(?probe, "PIN check probe finished");
        Ok(probe)
    }

    async fn exchange(
        &self,
        link: &Arc<dyn BleLink>,
        pin: &Pin,
    ) -> Result<(Option<PinResponse>, Option<Vec<u8>>), BedError> {
        let mut notifications = match link.subscribe().await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Notification subscribe failed, relying on connectivity: {}", e);
                None
            }
        };

        link.write(&protocol::keep_alive_frame(pin)).await?;

        match notifications.as_mut() {
            Some(rx) => Ok(first_classified(rx, self.config.response_wait)
                .await
                .map(|(response, bytes)| (Some(response), Some(bytes)))
                .unwrap_or((None, None))),
            None => Ok((None, None)),
        }
    }

    async fn observe_connectivity(&self, link: &Arc<dyn BleLink>) -> Connectivity {
        tokio::time::sleep(self.config.settle_wait).await;
        if link.is_connected().await {
            Connectivity::StayedConnected
        } else {
            Connectivity::Disconnected
        }
    }
}

/// Wait for the first notification that classifies as something other than
/// `Unknown`.
pub async fn first_classified(
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    wait: Duration,
) -> Option<(PinResponse, Vec<u8>)> {
    let deadline = Instant::now() + wait;
    loop {
        let bytes = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) | Err(_) => return None,
        };
        match protocol::parse_notification(&bytes) {
            PinResponse::Unknown => {
                debug!(bytes = %protocol::to_hex(&bytes), "Ignoring unclassified notification");
            }
            response => return Some((response, bytes)),
        }
    }
}

/// A PIN guaranteed to differ from `pin` in every digit.
pub fn decoy_pin(pin: &Pin) -> Pin {
    let digits: String = pin
        .digits()
        .iter()
        .map(|d| char::from(b'0' + (d + 5) % 10))
        .collect();
    Pin::normalize(&digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::{bed_address, FakeBed, ACCEPTED, REJECTED};
    use crate::infrastructure::bluetooth::transport::BleBackend;

    async fn link(bed: &FakeBed) -> Arc<dyn BleLink> {
        bed.connect(&bed_address(), Duration::from_secs(20))
            .await
            .unwrap()
    }

    fn auth() -> AuthProtocol {
        AuthProtocol::new(AuthConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted() {
        let bed = FakeBed::new();
        let link = link(&bed).await;

        let report = auth()
            .authenticate(&link, &Pin::normalize("1234"))
            .await
            .unwrap();
        assert_eq!(report.outcome, AuthOutcome::Accepted);
        assert_eq!(report.notification, Some(ACCEPTED.to_vec()));
        assert!(report.check().is_ok());
        assert_eq!(
            bed.frames(),
            vec![protocol::keep_alive_frame(&Pin::normalize("1234"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected() {
        let bed = FakeBed::new();
        let link = link(&bed).await;

        let report = auth()
            .authenticate(&link, &Pin::normalize("0000"))
            .await
            .unwrap();
        assert_eq!(report.outcome, AuthOutcome::Rejected);
        assert_eq!(report.notification, Some(REJECTED.to_vec()));
        assert!(matches!(report.check(), Err(BedError::AuthRejected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pin_mode_is_sticky() {
        let bed = FakeBed::new();
        bed.set_device_pin(None);
        let link = link(&bed).await;
        let auth = auth();
        let pin = Pin::normalize("1234");

        let report = auth.authenticate(&link, &pin).await.unwrap();
        assert_eq!(report.outcome, AuthOutcome::NoPinSet);
        assert!(auth.no_pin_mode());
        assert_eq!(auth.auth_frame(&pin), BedCommand::AppInit.as_bytes());

        let report = auth.authenticate(&link, &pin).await.unwrap();
        assert_eq!(report.outcome, AuthOutcome::NoPinSet);
        assert_eq!(bed.frames().last().unwrap(), BedCommand::AppInit.as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_and_connected_is_ambiguous() {
        let bed = FakeBed::new();
        bed.set_notify(false);
        let link = link(&bed).await;

        let start = Instant::now();
        let report = auth()
            .authenticate(&link, &Pin::normalize("1234"))
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            AuthOutcome::Ambiguous(Connectivity::StayedConnected)
        );
        assert!(report.check().is_ok());
        assert_eq!(start.elapsed(), Duration::from_millis(4750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_disconnect_is_ambiguous_not_rejected() {
        let bed = FakeBed::new();
        bed.set_notify(false);
        bed.set_disconnect_on_wrong_pin(true);
        let link = link(&bed).await;

        let report = auth()
            .authenticate(&link, &Pin::normalize("9999"))
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            AuthOutcome::Ambiguous(Connectivity::Disconnected)
        );
        assert!(matches!(report.check(), Err(BedError::AuthAmbiguous)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_outcomes() {
        let auth = auth();
        let decoy = decoy_pin(&Pin::normalize("1234"));
        assert_eq!(decoy.to_string(), "6789");

        let bed = FakeBed::new();
        let probe = auth.probe_validates_pin(&link(&bed).await, &decoy).await;
        assert_eq!(probe.unwrap(), PinCheckProbe::Rejected);

        let bed = FakeBed::new();
        bed.set_notify(false);
        bed.set_disconnect_on_wrong_pin(true);
        let probe = auth.probe_validates_pin(&link(&bed).await, &decoy).await;
        assert_eq!(probe.unwrap(), PinCheckProbe::Disconnected);

        let bed = FakeBed::new();
        bed.set_enforces_pin(false);
        let probe = auth.probe_validates_pin(&link(&bed).await, &decoy).await;
        assert_eq!(probe.unwrap(), PinCheckProbe::NotEnforced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_classified_skips_unknown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(vec![0x40, 0x21, 0x43, 0x00, 0x01, 0x55, 0x40]).unwrap();
        tx.send(ACCEPTED.to_vec()).unwrap();

        let (response, bytes) = first_classified(&mut rx, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(response, PinResponse::Accepted);
        assert_eq!(bytes, ACCEPTED.to_vec());

        assert!(first_classified(&mut rx, Duration::from_secs(3)).await.is_none());
    }
}
