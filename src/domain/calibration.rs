use super::models::{clamp_calibration_ms, Axis, CalibrationProgress};
use std::time::Duration;
use tokio::time::Instant;

/// Timer for one calibration run.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationRun {
    pub axis: Axis,
    started: Instant,
}

impl CalibrationRun {
    pub fn start(axis: Axis) -> Self {
        Self {
            axis,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Measured full-travel time, clamped to the accepted range.
    pub fn measured_ms(&self) -> u64 {
        let elapsed = self.elapsed().as_millis().min(u64::MAX as u128) as u64;
        clamp_calibration_ms(elapsed)
    }

    /// Progress against a caller-supplied reference duration.
    pub fn progress(&self, reference: Duration) -> CalibrationProgress {
        let elapsed = self.elapsed();
        let percent = if reference.is_zero() {
            100.0
        } else {
            (elapsed.as_secs_f64() / reference.as_secs_f64() * 100.0).min(100.0)
        };
        CalibrationProgress {
            axis: self.axis,
            elapsed,
            percent_of_reference: percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{MAX_CALIBRATION_MS, MIN_CALIBRATION_MS};

    #[tokio::test(start_paused = true)]
    async fn test_measured_ms_is_clamped() {
        let run = CalibrationRun::start(Axis::Head);
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(run.measured_ms(), MIN_CALIBRATION_MS);

        tokio::time::advance(Duration::from_millis(44_800)).await;
        assert_eq!(run.measured_ms(), 45_000);

        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(run.measured_ms(), MAX_CALIBRATION_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_view() {
        let run = CalibrationRun::start(Axis::Feet);
        tokio::time::advance(Duration::from_secs(15)).await;

        let progress = run.progress(Duration::from_secs(30));
        assert_eq!(progress.axis, Axis::Feet);
        assert_eq!(progress.elapsed, Duration::from_secs(15));
        assert!((progress.percent_of_reference - 50.0).abs() < 1e-9);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(run.progress(Duration::from_secs(30)).percent_of_reference, 100.0);
        assert_eq!(run.progress(Duration::ZERO).percent_of_reference, 100.0);
    }
}
