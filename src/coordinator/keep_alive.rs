//! Background keep-alive and state polling.
//!
//! Both loops stay off the connection while a movement or calibration
//! session is running; that session re-authenticates on its own.

use super::{connection_state_for, lock, Coordinator, Inner};
use crate::domain::models::{AuthOutcome, ConnectionState};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct BackgroundLoops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Inner {
    /// One idle keep-alive round. Returns the auth outcome when one was sent.
    pub(crate) async fn keep_alive_tick(&self) -> Option<AuthOutcome> {
        if self.busy.is_busy() {
            debug!("Keep-alive skipped, session active");
            return None;
        }
        let address = self.configured_address()?;
        if !self.resolver.is_present(&address).await {
            debug!(%address, "Keep-alive skipped, bed not visible");
            return None;
        }
        let Some(_lease) = self.connections.try_acquire() else {
            debug!("Keep-alive skipped, connection in use");
            return None;
        };

        let pin = self.pin();
        let result = self
            .connections
            .run(&address, |link| async move {
                self.authenticate(&link, &pin).await
            })
            .await;
        match result {
            Ok(report) => Some(report.outcome),
            Err(e) => {
                warn!("Keep-alive failed after retries: {}", e);
                let mut state = self.state();
                state.last_auth = None;
                state.connection = ConnectionState::PinNotAccepted;
                None
            }
        }
    }

    /// Recompute the reported connection state.
    pub(crate) async fn poll(&self) -> ConnectionState {
        if self.busy.is_busy() {
            return self.state().connection;
        }

        let configured = self.configured_address();
        let state = match self.resolver.resolve().await {
            None => {
                self.state().last_auth = None;
                if configured.is_some() {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Searching
                }
            }
            Some(address) => {
                if self.state().last_auth.is_none() {
                    match self.connections.try_acquire() {
                        Some(_lease) => {
                            let pin = self.pin();
                            let result = self
                                .connections
                                .run(&address, |link| async move {
                                    self.authenticate(&link, &pin).await
                                })
                                .await;
                            if let Err(e) = result {
                                warn!(%address, "Poll authentication failed: {}", e);
                            }
                        }
                        None => debug!("Poll skipped authentication, connection in use"),
                    }
                }
                connection_state_for(self.state().last_auth)
            }
        };

        let mut current = self.state();
        if current.connection != state {
            info!(from = %current.connection, to = %state, "Connection state changed");
        }
        current.connection = state;
        state
    }
}

async fn run_every<F, Fut>(period: Duration, immediate: bool, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let first = if immediate {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut ticker = tokio::time::interval_at(first, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }
}

impl Coordinator {
    /// Start the keep-alive and poll loops. Calling it again is a no-op.
    pub fn start(&self) {
        let mut loops = lock(&self.inner.loops);
        if loops.is_some() {
            debug!("Background loops already running");
            return;
        }

        let cancel = CancellationToken::new();
        let keep_alive = {
            let inner = self.inner.clone();
            let period = inner.config.idle_keep_alive;
            tokio::spawn(run_every(period, false, cancel.clone(), move || {
                let inner = inner.clone();
                async move {
                    inner.keep_alive_tick().await;
                }
            }))
        };
        let poll = {
            let inner = self.inner.clone();
            let period = inner.config.poll_interval;
            tokio::spawn(run_every(period, true, cancel.clone(), move || {
                let inner = inner.clone();
                async move {
                    inner.poll().await;
                }
            }))
        };

        *loops = Some(BackgroundLoops {
            cancel,
            handles: vec![keep_alive, poll],
        });
        info!("Background loops started");
    }

    /// Refresh the connection state now.
    pub async fn poll(&self) -> ConnectionState {
        self.inner.poll().await
    }

    /// Stop the background loops and any running session. Safe to call twice.
    pub async fn shutdown(&self) {
        let loops = lock(&self.inner.loops).take();
        if let Some(BackgroundLoops { cancel, handles }) = loops {
            cancel.cancel();
            for mut handle in handles {
                if tokio::time::timeout(self.inner.config.stop_wait, &mut handle)
                    .await
                    .is_err()
                {
                    handle.abort();
                }
            }
            info!("Background loops stopped");
        }

        {
            let _control = self.inner.control.lock().await;
            if let Some(task) = self.inner.take_movement() {
                task.stop(self.inner.config.stop_wait).await;
            }
            self.abort_calibration().await;
        }
        self.stop_diagnostic_scan().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::coordinator;
    use super::*;
    use crate::domain::models::{Direction, Pin, Section};
    use crate::infrastructure::bluetooth::fake::{ConnectFault, FakeBed};
    use crate::infrastructure::bluetooth::protocol;

    fn auth_frames(bed: &FakeBed) -> usize {
        bed.count(&protocol::keep_alive_frame(&Pin::normalize("1234")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_every_idle_interval() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);
        coordinator.start();
        coordinator.start();

        // Immediate poll authenticates once
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(auth_frames(&bed), 1);
        assert_eq!(coordinator.snapshot().connection, ConnectionState::Connected);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(auth_frames(&bed), 2);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(auth_frames(&bed), 3);

        coordinator.shutdown().await;
        coordinator.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(auth_frames(&bed), 3);
        assert_eq!(bed.open_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_skips_while_busy() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);

        coordinator
            .start_hold(Section::Head, Direction::Up)
            .await
            .unwrap();
        assert_eq!(coordinator.inner.keep_alive_tick().await, None);
        coordinator.stop_hold().await;

        assert_eq!(
            coordinator.inner.keep_alive_tick().await,
            Some(AuthOutcome::Accepted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_bed_drops_connected_state() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);
        assert_eq!(
            coordinator.inner.keep_alive_tick().await,
            Some(AuthOutcome::Accepted)
        );
        assert_eq!(coordinator.snapshot().connection, ConnectionState::Connected);

        // Still advertising, but both connect attempts time out
        bed.fail_next_connects(ConnectFault::Timeout, 2);
        assert_eq!(coordinator.inner.keep_alive_tick().await, None);
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.connection, ConnectionState::PinNotAccepted);
        assert_eq!(snapshot.last_auth, None);

        // The next poll authenticates again
        assert_eq!(coordinator.poll().await, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_skips_absent_bed() {
        let bed = FakeBed::new();
        bed.set_visible(false);
        let (coordinator, _dir) = coordinator(&bed);
        assert_eq!(coordinator.inner.keep_alive_tick().await, None);
        assert_eq!(bed.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_states() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);
        assert_eq!(coordinator.poll().await, ConnectionState::Connected);

        bed.set_visible(false);
        assert_eq!(coordinator.poll().await, ConnectionState::Disconnected);

        bed.set_visible(true);
        bed.set_device_pin(Some("8888"));
        assert_eq!(coordinator.poll().await, ConnectionState::PinNotAccepted);

        coordinator.inner.resolver.forget();
        bed.set_visible(false);
        assert_eq!(coordinator.poll().await, ConnectionState::Searching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_address_rediscovers_by_name() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);
        let found = coordinator.reset_address().await;
        assert_eq!(found, Some(crate::infrastructure::bluetooth::fake::bed_address()));
        assert_eq!(coordinator.snapshot().connection, ConnectionState::Connected);
    }
}
