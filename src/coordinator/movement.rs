//! Movement streaming.
//!
//! The bed only moves while a directional frame keeps arriving, so every
//! movement is a stream of the same frame at a fixed cadence on one
//! authenticated session. The stream survives the command characteristic
//! disappearing mid-way by reconnecting and continuing for the time that is
//! still owed.

use super::{ActiveTask, Coordinator, Inner};
use crate::coordinator::error::BedError;
use crate::domain::models::{Axis, Direction, MacAddress, Pin, Section};
use crate::domain::motion::{estimate_position, near_limit, plan_move, AxisMove, MovementLeg};
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::protocol::BedCommand;
use crate::infrastructure::bluetooth::transport::BleLink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause between consecutive legs of one move
const LEG_GAP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementPhase {
    Idle,
    Connecting,
    Authenticating,
    Streaming,
    Stopping,
}

/// Why a stream ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    LimitReached,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StreamLeg {
    pub(crate) section: Section,
    pub(crate) direction: Direction,
    /// `None` streams until cancelled
    pub(crate) bound: Option<Duration>,
    /// Update position estimates and end at a limit
    pub(crate) track: bool,
}

impl StreamLeg {
    pub(crate) fn held(section: Section, direction: Direction) -> Self {
        Self {
            section,
            direction,
            bound: None,
            track: true,
        }
    }
}

impl From<&MovementLeg> for StreamLeg {
    fn from(leg: &MovementLeg) -> Self {
        Self {
            section: leg.section,
            direction: leg.direction,
            bound: Some(leg.duration),
            track: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StreamPlan {
    pub(crate) legs: Vec<StreamLeg>,
    /// Send one stop frame before the first command
    pub(crate) pre_stop: bool,
    /// Wait after the pre-stop
    pub(crate) settle: Duration,
    /// Exact positions recorded as each axis's last leg completes
    pub(crate) targets: Vec<(Axis, f64)>,
}

/// Streaming-start signal plus the final result of a launched stream.
pub(crate) struct StreamHandles {
    pub(crate) started: oneshot::Receiver<()>,
    pub(crate) done: oneshot::Receiver<Result<StreamEnd, BedError>>,
}

impl StreamHandles {
    /// Resolve once frames are flowing, or with the error that prevented it.
    pub(crate) async fn streaming(&mut self) -> Result<(), BedError> {
        if (&mut self.started).await.is_ok() {
            return Ok(());
        }
        match (&mut self.done).await {
            Ok(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }
}

type AxisStart = (Axis, f64, u64);

/// Index of the last leg that drives `axis`.
fn last_leg_of(legs: &[StreamLeg], axis: Axis) -> Option<usize> {
    legs.iter().rposition(|leg| leg.section.axes().contains(&axis))
}

impl Inner {
    fn set_phase(&self, phase: MovementPhase) {
        self.state().phase = phase;
    }

    /// Write one frame. Anything but a missing characteristic is retried once.
    pub(crate) async fn write_retrying(
        &self,
        link: &Arc<dyn BleLink>,
        frame: &[u8],
    ) -> Result<(), BedError> {
        match link.write(frame).await {
            Ok(()) => Ok(()),
            Err(BleError::CharacteristicNotFound) => Err(BedError::CharacteristicNotFound),
            Err(e) => {
                let delay = self.connections.policy().transient_backoff;
                warn!(?delay, "Write failed, retrying once: {}", e);
                tokio::time::sleep(delay).await;
                link.write(frame).await.map_err(BedError::from)
            }
        }
    }

    /// Connect and authenticate for streaming. `Ok(None)` means cancelled.
    async fn open_stream_session(
        &self,
        address: &MacAddress,
        pin: &Pin,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<dyn BleLink>>, BedError> {
        let mut attempt = 0;
        loop {
            self.set_phase(MovementPhase::Connecting);
            let error = match self.connections.connect_once(address).await {
                Ok(link) => {
                    self.set_phase(MovementPhase::Authenticating);
                    match self.authenticate(&link, pin).await.and_then(|r| r.check()) {
                        Ok(()) => return Ok(Some(link)),
                        Err(e) => {
                            self.connections.release(&link).await;
                            e
                        }
                    }
                }
                Err(e) => e,
            };

            attempt += 1;
            let Some(delay) = self.connections.policy().backoff(&error, attempt) else {
                return Err(error);
            };
            warn!(attempt, ?delay, "Stream setup failed, retrying: {}", error);
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Update estimates for the moving axes. True once any of them reaches
    /// the limit it is heading for.
    fn track_positions(&self, direction: Direction, starts: &[AxisStart], elapsed: Duration) -> bool {
        let limit = direction.limit();
        let mut state = self.state();
        let mut at_limit = false;
        for &(axis, start, calibration_ms) in starts {
            let position = estimate_position(start, direction, elapsed, calibration_ms);
            state.position.set(axis, position);
            at_limit |= position == limit;
        }
        at_limit
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_leg(
        &self,
        link: &Arc<dyn BleLink>,
        leg: &StreamLeg,
        starts: &[AxisStart],
        pin: &Pin,
        streamed: &mut Duration,
        wrote: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, BedError> {
        let command = BedCommand::movement(leg.section, leg.direction);
        let base = *streamed;
        let session_start = Instant::now();
        let mut last_auth = session_start;
        let mut ticker = tokio::time::interval(self.config.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                _ = ticker.tick() => {}
            }

            let elapsed = base + session_start.elapsed();
            let at_limit = leg.track && self.track_positions(leg.direction, starts, elapsed);
            if leg.bound.is_some_and(|bound| elapsed >= bound) {
                return Ok(StreamEnd::Completed);
            }
            if at_limit {
                info!(section = %leg.section, "Reached travel limit");
                return Ok(StreamEnd::LimitReached);
            }

            if last_auth.elapsed() >= self.config.active_keep_alive {
                self.write_retrying(link, &self.auth.auth_frame(pin)).await?;
                last_auth = Instant::now();
            }
            self.write_retrying(link, command.as_bytes()).await?;
            *wrote = true;
            *streamed = elapsed;
        }
    }

    async fn send_stops(&self, link: &Arc<dyn BleLink>, repeats: usize) -> bool {
        for _ in 0..repeats {
            if let Err(e) = link.write(BedCommand::Stop.as_bytes()).await {
                warn!("Stop send failed: {}", e);
                return false;
            }
        }
        true
    }

    /// Stop frames after a stream: twice on a clean end, once after a failure.
    /// Falls back to a fresh connection when the stream's link is unusable.
    async fn finish_stream(
        &self,
        address: &MacAddress,
        pin: &Pin,
        link: Option<Arc<dyn BleLink>>,
        wrote: bool,
        clean: bool,
    ) {
        let repeats = if clean { 2 } else { 1 };
        let mut stopped = !wrote;
        if let Some(active) = link {
            if wrote && active.is_connected().await {
                stopped = self.send_stops(&active, repeats).await;
            }
            self.connections.release(&active).await;
        }
        if stopped {
            return;
        }

        warn!("Stream link unusable, sending stop on a fresh connection");
        match self.connections.connect_once(address).await {
            Ok(fresh) => {
                if let Err(e) = self.authenticate(&fresh, pin).await {
                    warn!("Authentication for stop failed: {}", e);
                }
                self.send_stops(&fresh, repeats).await;
                self.connections.release(&fresh).await;
            }
            Err(e) => warn!("Could not deliver stop: {}", e),
        }
    }

    /// Run a stream plan under one connection lease.
    ///
    /// `started` fires once the first command is about to go out.
    pub(crate) async fn run_stream(
        &self,
        address: MacAddress,
        plan: StreamPlan,
        cancel: &CancellationToken,
        mut started: Option<oneshot::Sender<()>>,
    ) -> Result<StreamEnd, BedError> {
        let _lease = tokio::select! {
            lease = self.connections.acquire() => lease,
            _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
        };
        let pin = self.pin();
        let mut link: Option<Arc<dyn BleLink>> = None;
        let mut wrote = false;
        let mut sessions_left = self.config.resume_attempts;
        let mut outcome = Ok(StreamEnd::Completed);

        'legs: for (index, leg) in plan.legs.iter().enumerate() {
            if index > 0 {
                if let Some(active) = &link {
                    self.send_stops(active, 1).await;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        outcome = Ok(StreamEnd::Cancelled);
                        break 'legs;
                    }
                    _ = tokio::time::sleep(LEG_GAP) => {}
                }
            }

            let starts: Vec<AxisStart> = {
                let state = self.state();
                leg.section
                    .axes()
                    .iter()
                    .map(|&axis| (axis, state.position.get(axis), state.calibration.get(axis)))
                    .collect()
            };
            let mut streamed = Duration::ZERO;

            loop {
                let active = match link.clone() {
                    Some(active) => active,
                    None => match self.open_stream_session(&address, &pin, cancel).await {
                        Ok(Some(active)) => {
                            link = Some(active.clone());
                            if plan.pre_stop && !wrote {
                                wrote = true;
                                if let Err(e) =
                                    self.write_retrying(&active, BedCommand::Stop.as_bytes()).await
                                {
                                    outcome = Err(e);
                                    break 'legs;
                                }
                                tokio::time::sleep(plan.settle).await;
                            }
                            active
                        }
                        Ok(None) => {
                            outcome = Ok(StreamEnd::Cancelled);
                            break 'legs;
                        }
                        Err(e) => {
                            outcome = Err(e);
                            break 'legs;
                        }
                    },
                };

                if let Some(tx) = started.take() {
                    let _ = tx.send(());
                }
                self.set_phase(MovementPhase::Streaming);
                debug!(section = %leg.section, direction = ?leg.direction, bound = ?leg.bound, "Streaming");

                match self
                    .stream_leg(&active, leg, &starts, &pin, &mut streamed, &mut wrote, cancel)
                    .await
                {
                    Ok(StreamEnd::Completed) => {
                        // Axes finishing in this leg land on their targets
                        let mut state = self.state();
                        for &(axis, target) in &plan.targets {
                            if last_leg_of(&plan.legs, axis) == Some(index) {
                                state.position.set(axis, target);
                            }
                        }
                        break;
                    }
                    // A bounded leg ends early at a limit; later legs still run
                    Ok(StreamEnd::LimitReached) if leg.bound.is_some() => {
                        outcome = Ok(StreamEnd::LimitReached);
                        break;
                    }
                    Ok(end) => {
                        outcome = Ok(end);
                        break 'legs;
                    }
                    Err(BedError::CharacteristicNotFound) if sessions_left > 1 => {
                        sessions_left -= 1;
                        warn!(
                            streamed = ?streamed,
                            sessions_left,
                            "Command characteristic lost mid-stream, reconnecting"
                        );
                        self.connections.release(&active).await;
                        link = None;
                    }
                    Err(e) => {
                        outcome = Err(e);
                        break 'legs;
                    }
                }
            }
        }

        self.set_phase(MovementPhase::Stopping);
        self.finish_stream(&address, &pin, link, wrote, outcome.is_ok())
            .await;

        self.set_phase(MovementPhase::Idle);
        self.persist_positions();

        match &outcome {
            Ok(end) => info!(?end, "Stream finished"),
            Err(e) => warn!("Stream failed: {}", e),
        }
        outcome
    }
}

impl Coordinator {
    /// Spawn a stream task. The busy flag is held until the task ends.
    pub(crate) fn launch(&self, address: MacAddress, plan: StreamPlan) -> (ActiveTask, StreamHandles) {
        let inner = self.inner.clone();
        let busy = inner.busy.enter();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let (started_tx, started) = oneshot::channel();
        let (done_tx, done) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let _busy = busy;
            let result = inner.run_stream(address, plan, &token, Some(started_tx)).await;
            let _ = done_tx.send(result);
        });

        (ActiveTask { cancel, handle }, StreamHandles { started, done })
    }

    fn bounded_plan(&self, section: Section, target: f64) -> Option<StreamPlan> {
        let (position, calibration) = {
            let state = self.inner.state();
            (state.position, state.calibration)
        };
        let moves: Vec<AxisMove> = section
            .axes()
            .iter()
            .map(|&axis| AxisMove {
                axis,
                current: position.get(axis),
                target,
            })
            .collect();

        let legs = plan_move(&moves, &calibration);
        if legs.is_empty() {
            return None;
        }
        Some(StreamPlan {
            legs: legs.iter().map(StreamLeg::from).collect(),
            pre_stop: moves.iter().any(|m| !near_limit(m.current)),
            settle: Duration::ZERO,
            targets: moves.iter().map(|m| (m.axis, m.target)).collect(),
        })
    }

    /// Start a bounded move and return its result channel, or `None` when the
    /// section is already there.
    pub(crate) async fn begin_move(
        &self,
        section: Section,
        target: f64,
    ) -> Result<Option<StreamHandles>, BedError> {
        if !target.is_finite() || !(0.0..=100.0).contains(&target) {
            return Err(BedError::InvalidPosition(target));
        }
        let _control = self.inner.control.lock().await;
        self.ensure_not_calibrating()?;
        self.inner.halt_movement().await;

        let Some(plan) = self.bounded_plan(section, target) else {
            debug!(%section, target, "Already at target");
            return Ok(None);
        };
        let address = self.inner.require_address().await?;
        info!(%section, target, legs = plan.legs.len(), "Moving");
        let (task, handles) = self.launch(address, plan);
        self.inner.set_movement(task).await;
        Ok(Some(handles))
    }

    /// Drive a section to a target percentage and wait for the stream to end.
    pub async fn move_to(&self, section: Section, target: f64) -> Result<(), BedError> {
        let Some(handles) = self.begin_move(section, target).await? else {
            return Ok(());
        };
        match handles.done.await {
            Ok(result) => result.map(|_| ()),
            // Aborted by a stop request
            Err(_) => Ok(()),
        }
    }

    /// Flatten the bed.
    pub async fn move_to_zero(&self) -> Result<(), BedError> {
        self.move_to(Section::Both, 0.0).await
    }

    /// Stream a direction until [`stop_hold`](Self::stop_hold) or a limit.
    /// Returns once frames are flowing.
    pub async fn start_hold(&self, section: Section, direction: Direction) -> Result<(), BedError> {
        let mut handles = {
            let _control = self.inner.control.lock().await;
            self.ensure_not_calibrating()?;
            self.inner.halt_movement().await;
            let address = self.inner.require_address().await?;

            let plan = StreamPlan {
                legs: vec![StreamLeg::held(section, direction)],
                ..StreamPlan::default()
            };
            info!(%section, ?direction, "Hold started");
            let (task, handles) = self.launch(address, plan);
            self.inner.set_movement(task).await;
            handles
        };
        handles.streaming().await
    }

    pub async fn stop_hold(&self) {
        let _control = self.inner.control.lock().await;
        self.inner.halt_movement().await;
    }
}
