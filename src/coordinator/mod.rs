//! Device Control Coordinator
//!
//! Single owner of everything the bed integration does over BLE. UI adapters
//! and the console call the public operations on [`Coordinator`]; each
//! operation takes the connection gate, authenticates, does its work and
//! disconnects.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Coordinator                         │
//! │   movement · calibration · keep-alive/poll · diagnostics  │
//! └───────────────┬──────────────────────────────┬───────────┘
//!                 │                              │
//!                 ▼                              ▼
//!        ┌─────────────────┐           ┌──────────────────┐
//!        │ ConnectionManager│──────────▶│   AuthProtocol   │
//!        │ gate + retries   │           │ PIN handshake    │
//!        └────────┬────────┘           └──────────────────┘
//!                 ▼
//!        ┌─────────────────┐   ┌─────────────────┐
//!        │   BleBackend    │   │ AddressResolver │
//!        └─────────────────┘   └─────────────────┘
//! ```

pub mod calibration;
pub mod diagnostics;
pub mod error;
pub mod keep_alive;
pub mod movement;

use crate::domain::models::{
    AuthOutcome, AxisPosition, CalibrationConstant, ConnectionState, MacAddress, Pin,
    PinCheckProbe, PinResponse, PinValidation, StateSnapshot,
};
use crate::domain::settings::{lock_settings, BleSettings, SharedSettings};
use crate::infrastructure::bluetooth::auth::{
    decoy_pin, first_classified, AuthConfig, AuthProtocol, AuthReport,
};
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, ConnectionManager};
use crate::infrastructure::bluetooth::protocol::{self, BedCommand};
use crate::infrastructure::bluetooth::scanner::AddressResolver;
use crate::infrastructure::bluetooth::transport::{BleBackend, BleLink};
use calibration::CalibrationSession;
use diagnostics::DiagnosticStatus;
use error::BedError;
use keep_alive::BackgroundLoops;
use movement::MovementPhase;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pause after a deliberately wrong PIN before trying the real one
const WRONG_PIN_COOLDOWN: Duration = Duration::from_secs(5);
/// Gap between the two make-discoverable sends
const REPEAT_GAP: Duration = Duration::from_millis(500);

/// Timing and retry knobs for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub connection: ConnectionConfig,
    pub auth: AuthConfig,
    pub cadence: Duration,
    /// Auth frame re-send interval while streaming
    pub active_keep_alive: Duration,
    /// Background keep-alive interval while idle
    pub idle_keep_alive: Duration,
    pub poll_interval: Duration,
    pub diagnostic_delay: Duration,
    /// Total stream sessions allowed per leg when the characteristic disappears
    pub resume_attempts: u32,
    /// Bounded wait for a cancelled task before aborting it
    pub stop_wait: Duration,
    pub calibration_settle: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&BleSettings::default())
    }
}

impl From<&BleSettings> for CoordinatorConfig {
    fn from(ble: &BleSettings) -> Self {
        Self {
            connection: ConnectionConfig {
                connect_timeout: ble.connect_timeout(),
                ..ConnectionConfig::default()
            },
            auth: AuthConfig {
                response_wait: ble.pin_response_wait(),
                settle_wait: ble.settle_wait(),
            },
            cadence: ble.cadence(),
            active_keep_alive: ble.active_keep_alive(),
            idle_keep_alive: ble.idle_keep_alive(),
            poll_interval: ble.poll_interval(),
            diagnostic_delay: ble.diagnostic_delay(),
            resume_attempts: ble.resume_attempts.max(1),
            stop_wait: ble.stop_wait(),
            calibration_settle: Duration::from_millis(500),
        }
    }
}

/// Reconfiguration request. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    /// Empty string clears the nickname
    pub nickname: Option<String>,
    pub pin: Option<Pin>,
    pub address: Option<MacAddress>,
    pub head_calibration_secs: Option<f64>,
    pub feet_calibration_secs: Option<f64>,
}

/// Mutable runtime state shared by every task.
pub(crate) struct DeviceState {
    pub(crate) position: AxisPosition,
    pub(crate) calibration: CalibrationConstant,
    pub(crate) light_on: bool,
    pub(crate) connection: ConnectionState,
    pub(crate) last_auth: Option<AuthOutcome>,
    pub(crate) last_notification: Option<Vec<u8>>,
    pub(crate) phase: MovementPhase,
}

/// Counts running movement/calibration sessions. Keep-alive and poll stay
/// away from the connection while it is non-zero.
#[derive(Clone, Default)]
pub(crate) struct BusyFlag(Arc<AtomicUsize>);

impl BusyFlag {
    pub(crate) fn enter(&self) -> BusyGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        BusyGuard(self.0.clone())
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

/// Clears its share of the busy flag on drop, whatever path the task took.
pub(crate) struct BusyGuard(Arc<AtomicUsize>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A spawned, cooperatively cancellable task.
pub(crate) struct ActiveTask {
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
}

impl ActiveTask {
    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal cancel and wait up to `wait`; abort after that.
    /// Returns `true` when the task had to be aborted.
    pub(crate) async fn stop(mut self, wait: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(wait, &mut self.handle).await {
            Ok(_) => false,
            Err(_) => {
                warn!(?wait, "Task did not stop in time, aborting");
                self.handle.abort();
                true
            }
        }
    }
}

pub(crate) fn connection_state_for(outcome: Option<AuthOutcome>) -> ConnectionState {
    match outcome {
        Some(outcome) if outcome.permits_commands() => ConnectionState::Connected,
        _ => ConnectionState::PinNotAccepted,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct Inner {
    pub(crate) settings: SharedSettings,
    pub(crate) resolver: AddressResolver,
    pub(crate) connections: ConnectionManager,
    pub(crate) auth: AuthProtocol,
    pub(crate) config: CoordinatorConfig,
    pub(crate) busy: BusyFlag,
    /// Held while a stream is being replaced, started or stopped
    pub(crate) control: tokio::sync::Mutex<()>,
    state: Mutex<DeviceState>,
    movement: Mutex<Option<ActiveTask>>,
    calibration: Mutex<Option<CalibrationSession>>,
    diagnostics: Mutex<Option<ActiveTask>>,
    diagnostic_status: Mutex<DiagnosticStatus>,
    loops: Mutex<Option<BackgroundLoops>>,
}

impl Inner {
    pub(crate) fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.state)
    }

    pub(crate) fn pin(&self) -> Pin {
        lock_settings(&self.settings).get().pin
    }

    pub(crate) fn configured_address(&self) -> Option<MacAddress> {
        lock_settings(&self.settings).get().device_address
    }

    pub(crate) async fn require_address(&self) -> Result<MacAddress, BedError> {
        self.resolver.resolve().await.ok_or(BedError::AddressNotFound)
    }

    pub(crate) fn record_auth(&self, report: &AuthReport) {
        let mut state = self.state();
        state.last_auth = Some(report.outcome);
        if report.notification.is_some() {
            state.last_notification = report.notification.clone();
        }
        state.connection = connection_state_for(Some(report.outcome));
    }

    pub(crate) fn persist_positions(&self) {
        let position = self.state().position;
        if let Err(e) = lock_settings(&self.settings).update_positions(position) {
            warn!("Failed to persist positions: {}", e);
        }
    }

    /// Authenticate on an open link and record the outcome.
    pub(crate) async fn authenticate(
        &self,
        link: &Arc<dyn BleLink>,
        pin: &Pin,
    ) -> Result<AuthReport, BedError> {
        let report = self.auth.authenticate(link, pin).await?;
        self.record_auth(&report);
        Ok(report)
    }

    /// Connect, authenticate, run `op`, disconnect; retried as a whole.
    pub(crate) async fn with_session<T, F, Fut>(&self, mut op: F) -> Result<T, BedError>
    where
        F: FnMut(Arc<dyn BleLink>) -> Fut,
        Fut: Future<Output = Result<T, BedError>>,
    {
        let address = self.require_address().await?;
        let pin = self.pin();
        self.connections
            .with_connection(&address, |link| {
                let work = op(link.clone());
                async move {
                    self.authenticate(&link, &pin).await?.check()?;
                    work.await
                }
            })
            .await
    }

    /// Single stop frame on a fresh session, for paths where a stream was torn down.
    pub(crate) async fn best_effort_stop(&self) {
        let result = self
            .with_session(|link| async move {
                link.write(BedCommand::Stop.as_bytes()).await?;
                Ok::<_, BedError>(())
            })
            .await;
        if let Err(e) = result {
            warn!("Best-effort stop failed: {}", e);
        }
    }

    pub(crate) fn take_movement(&self) -> Option<ActiveTask> {
        lock(&self.movement).take()
    }

    /// Store the running stream. A stream it displaces is cancelled, never
    /// left detached.
    pub(crate) async fn set_movement(&self, task: ActiveTask) {
        let displaced = lock(&self.movement).replace(task);
        if let Some(displaced) = displaced {
            warn!("Movement slot was occupied, cancelling the older stream");
            displaced.stop(self.config.stop_wait).await;
        }
    }

    pub(crate) fn movement_running(&self) -> bool {
        lock(&self.movement).as_ref().is_some_and(ActiveTask::is_running)
    }

    /// Stop whatever movement stream is running, forcing a stop frame if it
    /// had to be aborted.
    pub(crate) async fn halt_movement(&self) {
        if let Some(task) = self.take_movement() {
            if task.stop(self.config.stop_wait).await {
                self.best_effort_stop().await;
            }
        }
    }
}

/// Cheap-to-clone handle to the coordinator.
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) inner: Arc<Inner>,
}

impl Coordinator {
    /// Build a coordinator with timings from the settings file.
    pub fn new(backend: Arc<dyn BleBackend>, settings: SharedSettings) -> Self {
        let config = CoordinatorConfig::from(&lock_settings(&settings).get().ble);
        Self::with_config(backend, settings, config)
    }

    pub fn with_config(
        backend: Arc<dyn BleBackend>,
        settings: SharedSettings,
        config: CoordinatorConfig,
    ) -> Self {
        let (position, calibration, address) = {
            let guard = lock_settings(&settings);
            let s = guard.get();
            (s.position(), s.calibration(), s.device_address)
        };

        let state = DeviceState {
            position,
            calibration,
            light_on: false,
            connection: if address.is_some() {
                ConnectionState::Disconnected
            } else {
                ConnectionState::Searching
            },
            last_auth: None,
            last_notification: None,
            phase: MovementPhase::Idle,
        };

        Self {
            inner: Arc::new(Inner {
                resolver: AddressResolver::new(backend.clone(), settings.clone()),
                connections: ConnectionManager::new(backend, config.connection.clone()),
                auth: AuthProtocol::new(config.auth.clone()),
                settings,
                config,
                busy: BusyFlag::default(),
                control: tokio::sync::Mutex::new(()),
                state: Mutex::new(state),
                movement: Mutex::new(None),
                calibration: Mutex::new(None),
                diagnostics: Mutex::new(None),
                diagnostic_status: Mutex::new(DiagnosticStatus::default()),
                loops: Mutex::new(None),
            }),
        }
    }

    /// Everything an adapter needs to render the bed.
    pub fn snapshot(&self) -> StateSnapshot {
        let (address, title) = {
            let settings = lock_settings(&self.inner.settings);
            let record = settings.get().device_record();
            (record.address, record.display_title())
        };
        let movement_active = self.inner.movement_running();
        let calibration_active = self.calibration_running();
        let state = self.inner.state();

        StateSnapshot {
            head_position: state.position.head(),
            feet_position: state.position.feet(),
            light_on: state.light_on,
            connection: state.connection,
            last_auth: state.last_auth,
            movement_active: movement_active || state.phase != MovementPhase::Idle,
            calibration_active,
            address,
            title,
            last_notification: state.last_notification.clone(),
        }
    }

    pub fn calibration_constant(&self) -> CalibrationConstant {
        self.inner.state().calibration
    }

    /// Stop every running stream and send a stop frame.
    pub async fn stop_all(&self) -> Result<(), BedError> {
        info!("Stop all requested");
        {
            let _control = self.inner.control.lock().await;
            if let Some(task) = self.inner.take_movement() {
                task.stop(self.inner.config.stop_wait).await;
            }
            self.abort_calibration().await;
        }
        self.stop_diagnostic_scan().await;

        self.inner
            .with_session(|link| async move {
                link.write(BedCommand::Stop.as_bytes()).await?;
                link.write(BedCommand::Stop.as_bytes()).await?;
                Ok::<_, BedError>(())
            })
            .await
    }

    /// Replace the bed's PIN. The new PIN is only stored once the bed
    /// explicitly accepts it.
    pub async fn set_pin(&self, raw: &str) -> Result<(), BedError> {
        let new_pin = Pin::normalize(raw);
        let wait = self.inner.config.auth.response_wait;

        let response = self
            .inner
            .with_session(|link| async move {
                let mut notifications = link.subscribe().await?;
                link.write(&protocol::set_pin_frame(&new_pin)).await?;
                Ok::<_, BedError>(first_classified(&mut notifications, wait).await)
            })
            .await?;

        match response {
            Some((PinResponse::Accepted, bytes)) => {
                self.inner.state().last_notification = Some(bytes);
                if let Err(e) = lock_settings(&self.inner.settings).set_pin(new_pin) {
                    warn!("Failed to persist new PIN: {}", e);
                }
                info!("Bed accepted new PIN");
                Ok(())
            }
            Some((PinResponse::Rejected, bytes)) => {
                self.inner.state().last_notification = Some(bytes);
                Err(BedError::AuthRejected)
            }
            _ => Err(BedError::AuthAmbiguous),
        }
    }

    pub async fn set_light(&self, on: bool, permanent: bool) -> Result<(), BedError> {
        let command = BedCommand::light(on, permanent);
        self.inner
            .with_session(|link| async move {
                link.write(command.as_bytes()).await?;
                Ok::<_, BedError>(())
            })
            .await?;
        self.inner.state().light_on = on;
        info!(on, permanent, "Light updated");
        Ok(())
    }

    /// Put the bed into pairing mode so a remote can find it.
    pub async fn make_discoverable(&self) -> Result<(), BedError> {
        self.inner
            .with_session(|link| async move {
                link.write(BedCommand::MakeDiscoverable.as_bytes()).await?;
                tokio::time::sleep(REPEAT_GAP).await;
                link.write(BedCommand::MakeDiscoverable.as_bytes()).await?;
                Ok::<_, BedError>(())
            })
            .await
    }

    pub async fn soft_reset(&self) -> Result<(), BedError> {
        self.inner
            .with_session(|link| async move {
                link.write(BedCommand::SoftReset.as_bytes()).await?;
                Ok::<_, BedError>(())
            })
            .await
    }

    /// Forget the stored address and look for the bed by name again.
    pub async fn reset_address(&self) -> Option<MacAddress> {
        self.inner.resolver.forget();
        {
            let mut state = self.inner.state();
            state.last_auth = None;
            state.connection = ConnectionState::Searching;
        }
        self.poll().await;
        self.inner.configured_address()
    }

    pub fn reconfigure(&self, update: DeviceUpdate) {
        let mut reset_auth = false;
        let calibration = {
            let mut settings = lock_settings(&self.inner.settings);
            let s = settings.get_mut();
            if let Some(name) = update.name {
                s.device_name = name;
            }
            if let Some(nickname) = update.nickname {
                let nickname = nickname.trim().to_string();
                s.nickname = (!nickname.is_empty()).then_some(nickname);
            }
            if let Some(pin) = update.pin {
                reset_auth |= s.pin != pin;
                s.pin = pin;
            }
            if let Some(address) = update.address {
                reset_auth |= s.device_address != Some(address);
                s.device_address = Some(address);
            }
            if let Some(secs) = update.head_calibration_secs {
                s.head_calibration_secs = crate::domain::settings::clamp_calibration_secs(secs);
            }
            if let Some(secs) = update.feet_calibration_secs {
                s.feet_calibration_secs = crate::domain::settings::clamp_calibration_secs(secs);
            }
            let record = s.device_record();
            if record.title_is_generic() {
                s.title = Some(record.derived_title());
            }
            let calibration = s.calibration();
            if let Err(e) = settings.save() {
                warn!("Failed to persist reconfiguration: {}", e);
            }
            calibration
        };

        let mut state = self.inner.state();
        state.calibration = calibration;
        if reset_auth {
            state.last_auth = None;
            state.connection = ConnectionState::PinNotAccepted;
        }
        info!("Device reconfigured");
    }

    /// Setup-time PIN check with a better diagnosis than a plain handshake.
    pub async fn validate_pin(&self, raw: &str) -> PinValidation {
        let candidate = Pin::normalize(raw);
        let Ok(address) = self.inner.require_address().await else {
            return PinValidation::ConnectionFailed;
        };
        let inner = &self.inner;
        let _lease = inner.connections.acquire().await;

        let probe = match inner.connections.open(&address).await {
            Ok(link) => {
                let probe = inner.auth.probe_validates_pin(&link, &decoy_pin(&candidate)).await;
                inner.connections.release(&link).await;
                probe
            }
            Err(e) => Err(e),
        };
        match probe {
            Ok(PinCheckProbe::NotEnforced) => return PinValidation::NoPinCheck,
            Ok(_) => {}
            Err(e) => {
                warn!("PIN probe failed: {}", e);
                return PinValidation::ConnectionFailed;
            }
        }

        tokio::time::sleep(WRONG_PIN_COOLDOWN).await;

        let report = match inner.connections.open(&address).await {
            Ok(link) => {
                let report = inner.auth.authenticate(&link, &candidate).await;
                inner.connections.release(&link).await;
                report
            }
            Err(e) => Err(e),
        };
        match report.map(|r| r.outcome) {
            Ok(outcome) if outcome.permits_commands() => PinValidation::Valid,
            Ok(_) => PinValidation::WrongPin,
            Err(e) => {
                warn!("PIN validation handshake failed: {}", e);
                PinValidation::ConnectionFailed
            }
        }
    }
}
