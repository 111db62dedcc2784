//! Timing model for movement streams.
//!
//! The bed reports no position. Every position here is derived from how long
//! a directional command has been streamed and the axis's measured full-travel
//! time.

use super::models::{clamp_percent, Axis, CalibrationConstant, Direction, Section};
use std::time::Duration;

/// Shortest stream ever sent for a bounded move
pub const MIN_STREAM: Duration = Duration::from_millis(300);
/// Position deltas below this are treated as already there
pub const NOOP_THRESHOLD: f64 = 0.5;
/// Axes within this distance of a limit are considered parked there
pub const LIMIT_MARGIN: f64 = 2.0;
/// A trailing single-axis leg shorter than this is dropped
pub const MIN_TRAILING_LEG: Duration = Duration::from_millis(100);

/// Stream duration needed to move one axis from `current` to `target`.
///
/// Returns `None` when the move is a no-op.
pub fn stream_duration(current: f64, target: f64, calibration_ms: u64) -> Option<Duration> {
    let delta = (clamp_percent(target) - clamp_percent(current)).abs();
    if delta < NOOP_THRESHOLD {
        return None;
    }

    let full = Duration::from_millis(calibration_ms);
    let wanted = full.mul_f64(delta / 100.0);
    Some(wanted.clamp(MIN_STREAM, full.max(MIN_STREAM)))
}

/// Linear position estimate after streaming for `elapsed`.
pub fn estimate_position(
    start: f64,
    direction: Direction,
    elapsed: Duration,
    calibration_ms: u64,
) -> f64 {
    if calibration_ms == 0 {
        return clamp_percent(start);
    }
    let travelled = elapsed.as_secs_f64() * 1000.0 / calibration_ms as f64 * 100.0;
    clamp_percent(start + direction.sign() * travelled)
}

/// Whether an axis is close enough to either end that it cannot be moving.
pub fn near_limit(position: f64) -> bool {
    position <= LIMIT_MARGIN || position >= 100.0 - LIMIT_MARGIN
}

/// One contiguous streamed command within a move.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementLeg {
    pub section: Section,
    pub direction: Direction,
    pub duration: Duration,
}

/// Per-axis request feeding [`plan_move`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisMove {
    pub axis: Axis,
    pub current: f64,
    pub target: f64,
}

/// Break a move into streamed legs.
///
/// Same-direction head+feet moves share a combined leg for the overlap and
/// then finish the slower axis alone. Opposite directions run one axis after
/// the other, head first, so opposite commands never share a cadence window.
pub fn plan_move(moves: &[AxisMove], calibration: &CalibrationConstant) -> Vec<MovementLeg> {
    let mut pending: Vec<(Axis, Direction, Duration)> = moves
        .iter()
        .filter_map(|m| {
            stream_duration(m.current, m.target, calibration.get(m.axis))
                .map(|d| (m.axis, Direction::toward(m.current, m.target), d))
        })
        .collect();
    pending.sort_by_key(|(axis, _, _)| match axis {
        Axis::Head => 0,
        Axis::Feet => 1,
    });

    match pending.as_slice() {
        [] => Vec::new(),
        [(axis, direction, duration)] => vec![MovementLeg {
            section: Section::from(*axis),
            direction: *direction,
            duration: *duration,
        }],
        [(head, head_dir, head_d), (feet, feet_dir, feet_d), ..] if head_dir == feet_dir => {
            let overlap = (*head_d).min(*feet_d);
            let mut legs = vec![MovementLeg {
                section: Section::Both,
                direction: *head_dir,
                duration: overlap,
            }];
            let (slower, remainder) = if head_d > feet_d {
                (*head, *head_d - overlap)
            } else {
                (*feet, *feet_d - overlap)
            };
            if remainder > MIN_TRAILING_LEG {
                legs.push(MovementLeg {
                    section: Section::from(slower),
                    direction: *head_dir,
                    duration: remainder,
                });
            }
            legs
        }
        other => other
            .iter()
            .map(|(axis, direction, duration)| MovementLeg {
                section: Section::from(*axis),
                direction: *direction,
                duration: *duration,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_duration_rule() {
        assert_eq!(
            stream_duration(0.0, 50.0, 30_000),
            Some(Duration::from_millis(15_000))
        );
        assert_eq!(stream_duration(10.0, 10.4, 30_000), None);
        assert_eq!(stream_duration(10.0, 9.6, 30_000), None);
        // Tiny but real move is raised to the floor
        assert_eq!(stream_duration(10.0, 10.5, 30_000), Some(MIN_STREAM));
        // Full travel is capped at the calibration constant
        assert_eq!(
            stream_duration(0.0, 100.0, 45_000),
            Some(Duration::from_millis(45_000))
        );
        // Out-of-range targets are clamped first
        assert_eq!(
            stream_duration(100.0, -20.0, 20_000),
            Some(Duration::from_millis(20_000))
        );
    }

    #[test]
    fn test_stream_duration_within_bounds_for_all_targets() {
        for cal in [1_000u64, 30_000, 120_000] {
            for target in 0..=100 {
                let target = target as f64;
                match stream_duration(37.0, target, cal) {
                    None => assert!((target - 37.0).abs() < NOOP_THRESHOLD),
                    Some(d) => {
                        assert!(d >= MIN_STREAM);
                        assert!(d <= Duration::from_millis(cal));
                    }
                }
            }
        }
    }

    #[test]
    fn test_estimate_position() {
        let pos = estimate_position(0.0, Direction::Up, Duration::from_millis(15_000), 30_000);
        assert!((pos - 50.0).abs() < 1e-9);
        let pos = estimate_position(80.0, Direction::Down, Duration::from_secs(10), 20_000);
        assert!((pos - 30.0).abs() < 1e-9);
        assert_eq!(
            estimate_position(90.0, Direction::Up, Duration::from_secs(60), 30_000),
            100.0
        );
        assert_eq!(
            estimate_position(5.0, Direction::Down, Duration::from_secs(60), 30_000),
            0.0
        );
    }

    #[test]
    fn test_near_limit() {
        assert!(near_limit(0.0));
        assert!(near_limit(1.5));
        assert!(near_limit(99.0));
        assert!(!near_limit(50.0));
        assert!(!near_limit(3.0));
    }

    #[test]
    fn test_plan_combined_same_direction() {
        let cal = CalibrationConstant::new(30_000, 20_000);
        let legs = plan_move(
            &[
                AxisMove { axis: Axis::Head, current: 0.0, target: 50.0 },
                AxisMove { axis: Axis::Feet, current: 0.0, target: 50.0 },
            ],
            &cal,
        );
        assert_eq!(
            legs,
            vec![
                MovementLeg {
                    section: Section::Both,
                    direction: Direction::Up,
                    duration: Duration::from_millis(10_000),
                },
                MovementLeg {
                    section: Section::Head,
                    direction: Direction::Up,
                    duration: Duration::from_millis(5_000),
                },
            ]
        );
    }

    #[test]
    fn test_plan_combined_drops_tiny_remainder() {
        let cal = CalibrationConstant::new(30_000, 30_000);
        let legs = plan_move(
            &[
                AxisMove { axis: Axis::Feet, current: 60.0, target: 20.0 },
                AxisMove { axis: Axis::Head, current: 60.0, target: 20.0 },
            ],
            &cal,
        );
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].section, Section::Both);
        assert_eq!(legs[0].direction, Direction::Down);
    }

    #[test]
    fn test_plan_opposite_directions_sequential() {
        let cal = CalibrationConstant::new(30_000, 30_000);
        let legs = plan_move(
            &[
                AxisMove { axis: Axis::Feet, current: 80.0, target: 40.0 },
                AxisMove { axis: Axis::Head, current: 10.0, target: 40.0 },
            ],
            &cal,
        );
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].section, Section::Head);
        assert_eq!(legs[0].direction, Direction::Up);
        assert_eq!(legs[1].section, Section::Feet);
        assert_eq!(legs[1].direction, Direction::Down);
    }

    #[test]
    fn test_plan_skips_noop_axis() {
        let cal = CalibrationConstant::new(30_000, 30_000);
        let legs = plan_move(
            &[
                AxisMove { axis: Axis::Head, current: 40.0, target: 40.2 },
                AxisMove { axis: Axis::Feet, current: 0.0, target: 100.0 },
            ],
            &cal,
        );
        assert_eq!(legs.len(), 1);
        assert_eq!(legs[0].section, Section::Feet);
        assert!(plan_move(&[], &cal).is_empty());
    }
}
