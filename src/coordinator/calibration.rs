//! Calibration measures how long one axis takes to travel its full range.
//! The user starts it with the axis flat and stops it when the axis tops out;
//! the elapsed streaming time becomes that axis's calibration constant.

use super::movement::{StreamEnd, StreamLeg, StreamPlan};
use super::{lock, ActiveTask, Coordinator};
use crate::coordinator::error::BedError;
use crate::domain::calibration::CalibrationRun;
use crate::domain::models::{Axis, CalibrationProgress, Direction};
use crate::domain::settings::lock_settings;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

pub(crate) struct CalibrationSession {
    id: u64,
    pub(crate) run: CalibrationRun,
    pub(crate) task: ActiveTask,
    pub(crate) done: oneshot::Receiver<Result<StreamEnd, BedError>>,
}

impl Coordinator {
    fn calibrating_axis(&self) -> Option<Axis> {
        lock(&self.inner.calibration)
            .as_ref()
            .filter(|session| session.task.is_running())
            .map(|session| session.run.axis)
    }

    pub(crate) fn calibration_running(&self) -> bool {
        self.calibrating_axis().is_some()
    }

    pub(crate) fn ensure_not_calibrating(&self) -> Result<(), BedError> {
        match self.calibrating_axis() {
            Some(axis) => Err(BedError::CalibrationInProgress(axis)),
            None => Ok(()),
        }
    }

    /// Start timing `axis`. Returns once the axis is moving up from flat.
    pub async fn start_calibration(&self, axis: Axis) -> Result<(), BedError> {
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let started = {
            let _control = self.inner.control.lock().await;
            self.ensure_not_calibrating()?;
            self.inner.halt_movement().await;
            let address = self.inner.require_address().await?;

            let plan = StreamPlan {
                legs: vec![StreamLeg {
                    section: axis.into(),
                    direction: Direction::Up,
                    bound: None,
                    track: false,
                }],
                pre_stop: true,
                settle: self.inner.config.calibration_settle,
                targets: Vec::new(),
            };
            let (task, handles) = self.launch(address, plan);
            // Registered before frames flow so a concurrent start sees it
            *lock(&self.inner.calibration) = Some(CalibrationSession {
                id,
                run: CalibrationRun::start(axis),
                task,
                done: handles.done,
            });
            handles.started
        };

        if started.await.is_err() {
            return Err(self.take_failed_start(id).await);
        }

        let registered = {
            let mut session = lock(&self.inner.calibration);
            match session.as_mut().filter(|s| s.id == id) {
                Some(session) => {
                    session.run = CalibrationRun::start(axis);
                    true
                }
                None => false,
            }
        };
        if !registered {
            // Stopped while the stream was still being set up
            return Err(BedError::CalibrationNotRunning);
        }
        self.inner.state().position.set(axis, 0.0);
        self.inner.persist_positions();
        info!(%axis, "Calibration started");
        Ok(())
    }

    /// The stream ended before streaming; clear its session and report why.
    async fn take_failed_start(&self, id: u64) -> BedError {
        let session = {
            let mut slot = lock(&self.inner.calibration);
            if slot.as_ref().is_some_and(|session| session.id == id) {
                slot.take()
            } else {
                None
            }
        };
        match session {
            Some(session) => match session.done.await {
                Ok(Err(e)) => e,
                _ => BedError::CalibrationNotRunning,
            },
            None => BedError::CalibrationNotRunning,
        }
    }

    /// Stop timing, store the measured constant and send the axis back flat.
    /// Returns the measured seconds.
    pub async fn stop_calibration(&self) -> Result<f64, BedError> {
        let Some(CalibrationSession { run, task, mut done, .. }) = lock(&self.inner.calibration).take()
        else {
            return Err(BedError::CalibrationNotRunning);
        };
        // Measure before waiting on the stream so teardown time is excluded
        let measured_ms = run.measured_ms();
        let axis = run.axis;

        if task.stop(self.inner.config.stop_wait).await {
            self.inner.best_effort_stop().await;
        }
        if let Ok(Err(e)) = done.try_recv() {
            warn!(%axis, "Calibration stream failed, measurement discarded: {}", e);
            return Err(e);
        }

        let secs = measured_ms as f64 / 1000.0;
        {
            let mut state = self.inner.state();
            state.calibration.set(axis, measured_ms);
            state.position.set(axis, 100.0);
        }
        if let Err(e) = lock_settings(&self.inner.settings).update_calibration(axis, secs) {
            warn!("Failed to persist calibration: {}", e);
        }
        self.inner.persist_positions();
        info!(%axis, secs, "Calibration stored");

        if let Err(e) = self.begin_move(axis.into(), 0.0).await {
            warn!(%axis, "Return to flat failed: {}", e);
        }
        Ok(secs)
    }

    /// Drop a running calibration without storing anything.
    pub(crate) async fn abort_calibration(&self) {
        let session = lock(&self.inner.calibration).take();
        if let Some(session) = session {
            if session.task.stop(self.inner.config.stop_wait).await {
                self.inner.best_effort_stop().await;
            }
            info!(axis = %session.run.axis, "Calibration aborted");
        }
    }

    /// Elapsed time of the running calibration against `reference`.
    pub fn calibration_progress(&self, reference: Duration) -> Option<CalibrationProgress> {
        lock(&self.inner.calibration)
            .as_ref()
            .filter(|session| session.task.is_running())
            .map(|session| session.run.progress(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{coordinator, settings_of};
    use super::*;
    use crate::domain::models::Section;
    use crate::infrastructure::bluetooth::fake::FakeBed;
    use crate::infrastructure::bluetooth::protocol::BedCommand;

    #[tokio::test(start_paused = true)]
    async fn test_calibration_measures_and_returns_flat() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);

        coordinator.start_calibration(Axis::Head).await.unwrap();
        assert!(coordinator.snapshot().calibration_active);
        assert_eq!(bed.frames()[1], BedCommand::Stop.as_bytes());

        tokio::time::sleep(Duration::from_secs(45)).await;
        let secs = coordinator.stop_calibration().await.unwrap();

        assert_eq!(secs, 45.0);
        assert_eq!(coordinator.calibration_constant().get(Axis::Head), 45_000);
        assert_eq!(settings_of(&coordinator).head_calibration_secs, 45.0);
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.head_position, 100.0);
        assert!(!snapshot.calibration_active);

        tokio::time::sleep(Duration::from_secs(50)).await;
        let snapshot = coordinator.snapshot();
        assert!(!snapshot.movement_active);
        assert_eq!(snapshot.head_position, 0.0);
        assert_eq!(bed.count(BedCommand::HeadDown.as_bytes()), 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_is_exclusive() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);

        assert!(matches!(
            coordinator.stop_calibration().await,
            Err(BedError::CalibrationNotRunning)
        ));

        coordinator.start_calibration(Axis::Feet).await.unwrap();
        assert!(matches!(
            coordinator.start_calibration(Axis::Head).await,
            Err(BedError::CalibrationInProgress(Axis::Feet))
        ));
        assert!(matches!(
            coordinator.move_to(Section::Head, 30.0).await,
            Err(BedError::CalibrationInProgress(Axis::Feet))
        ));

        tokio::time::sleep(Duration::from_secs(15)).await;
        let progress = coordinator
            .calibration_progress(Duration::from_secs(30))
            .unwrap();
        assert_eq!(progress.axis, Axis::Feet);
        assert_eq!(progress.elapsed, Duration::from_secs(15));
        assert_eq!(progress.percent_of_reference, 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_start_persists_flat_position() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);
        coordinator.inner.state().position.set(Axis::Head, 40.0);
        coordinator.inner.persist_positions();

        coordinator.start_calibration(Axis::Head).await.unwrap();
        assert_eq!(coordinator.snapshot().head_position, 0.0);
        assert_eq!(settings_of(&coordinator).head_position, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calibration_starts() {
        let bed = FakeBed::new();
        bed.set_yield_on_lookup(true);
        let (coordinator, _dir) = coordinator(&bed);

        let head = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.start_calibration(Axis::Head).await }
        });
        let feet = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.start_calibration(Axis::Feet).await }
        });
        let results = [head.await.unwrap(), feet.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(BedError::CalibrationInProgress(_)))));

        tokio::time::sleep(Duration::from_secs(2)).await;
        coordinator.stop_all().await.unwrap();
        let moving = bed.count(BedCommand::HeadUp.as_bytes()) + bed.count(BedCommand::FeetUp.as_bytes());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            bed.count(BedCommand::HeadUp.as_bytes()) + bed.count(BedCommand::FeetUp.as_bytes()),
            moving
        );
        assert!(!coordinator.snapshot().calibration_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_clamped_to_maximum() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);

        coordinator.start_calibration(Axis::Feet).await.unwrap();
        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(coordinator.stop_calibration().await.unwrap(), 120.0);
        assert_eq!(coordinator.calibration_constant().get(Axis::Feet), 120_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_discards_calibration() {
        let bed = FakeBed::new();
        let (coordinator, _dir) = coordinator(&bed);

        coordinator.start_calibration(Axis::Head).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        coordinator.stop_all().await.unwrap();

        assert_eq!(coordinator.calibration_constant().get(Axis::Head), 30_000);
        assert!(coordinator.calibration_progress(Duration::from_secs(30)).is_none());
        assert!(matches!(
            coordinator.stop_calibration().await,
            Err(BedError::CalibrationNotRunning)
        ));
        assert!(!coordinator.snapshot().movement_active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_needs_accepted_pin() {
        let bed = FakeBed::new();
        bed.set_device_pin(Some("4444"));
        let (coordinator, _dir) = coordinator(&bed);

        assert!(matches!(
            coordinator.start_calibration(Axis::Head).await,
            Err(BedError::AuthRejected)
        ));
        assert!(!coordinator.snapshot().calibration_active);
        assert_eq!(bed.count(BedCommand::HeadUp.as_bytes()), 0);
    }
}
