//! Dynamic Heading Calibrator (`spec.md` §4.F): recovers the additive
//! offset between magnetometer heading and true walking direction from
//! the first few steps of straight walking.

use crate::error::{LocalizationError, Result};
use crate::types::normalize_angle;

const UPSIDE_DOWN_LOW_RAD: f64 = 150.0 * std::f64::consts::PI / 180.0;
const UPSIDE_DOWN_HIGH_RAD: f64 = 210.0 * std::f64::consts::PI / 180.0;
const ABANDON_THRESHOLD_RAD: f64 = 120.0 * std::f64::consts::PI / 180.0;
const MIN_TOTAL_DISTANCE_M: f64 = 0.5;

#[derive(Clone, Copy, Debug)]
pub struct HeadingCalibrationResult {
    pub offset_rad: f64,
    pub snapped_upside_down: bool,
}

struct BufferedStep {
    x: f64,
    y: f64,
    mag_heading: f64,
}

/// Recovers the mag-heading / PDR-heading offset from early straight
/// walking, then latches it until an explicit reset
/// (`spec.md` §4.F "Idempotence").
pub struct DynamicHeadingCalibrator {
    enabled: bool,
    min_steps_required: usize,
    max_offset_rad: f64,
    straight_line_threshold_m: f64,
    steps: Vec<BufferedStep>,
    offset: Option<f64>,
}

impl DynamicHeadingCalibrator {
    pub fn new(enabled: bool, min_steps_required: usize, max_offset_rad: f64, straight_line_threshold_m: f64) -> Self {
        Self {
            enabled,
            min_steps_required,
            max_offset_rad,
            straight_line_threshold_m,
            steps: Vec::new(),
            offset: None,
        }
    }

    pub fn offset(&self) -> Option<f64> {
        self.offset
    }

    pub fn reset(&mut self) {
        self.steps.clear();
        self.offset = None;
    }

    /// Feed a validated step's position and the concurrent magnetometer
    /// heading. Returns `Some(result)` the moment calibration converges.
    pub fn observe_step(&mut self, x: f64, y: f64, mag_heading: f64) -> Result<Option<HeadingCalibrationResult>> {
        if !self.enabled || self.offset.is_some() {
            return Ok(None);
        }

        self.steps.push(BufferedStep { x, y, mag_heading });
        if self.steps.len() < self.min_steps_required {
            return Ok(None);
        }

        let first = &self.steps[0];
        let last = &self.steps[self.steps.len() - 1];
        let dx = last.x - first.x;
        let dy = last.y - first.y;
        let total_distance = (dx * dx + dy * dy).sqrt();

        if total_distance < MIN_TOTAL_DISTANCE_M {
            return Ok(None);
        }

        let max_perp = self.max_perpendicular_distance(first.x, first.y, dx, dy, total_distance);
        if max_perp > self.straight_line_threshold_m {
            return Ok(None);
        }

        let pdr_direction = normalize_angle(dy.atan2(dx));
        let mag_mean = circular_mean(self.steps.iter().map(|s| s.mag_heading));
        let raw_offset = normalize_angle(pdr_direction - mag_mean);

        let (accepted_offset, snapped) = if raw_offset.abs() > self.max_offset_rad {
            if raw_offset.abs() >= UPSIDE_DOWN_LOW_RAD && raw_offset.abs() <= UPSIDE_DOWN_HIGH_RAD {
                (std::f64::consts::PI.copysign(raw_offset), true)
            } else if raw_offset.abs() <= ABANDON_THRESHOLD_RAD {
                log::warn!(
                    target: "localization::heading_cal",
                    "accepting marginal heading offset {:.3} rad",
                    raw_offset
                );
                (raw_offset, false)
            } else {
                log::warn!(target: "localization::heading_cal", "abandoning heading offset {:.3} rad", raw_offset);
                self.steps.clear();
                return Err(LocalizationError::ExcessiveOffset { step: "dynamic_heading" });
            }
        } else {
            (raw_offset, false)
        };

        self.offset = Some(accepted_offset);
        log::info!(target: "localization::heading_cal", "heading offset latched at {:.3} rad", accepted_offset);
        Ok(Some(HeadingCalibrationResult { offset_rad: accepted_offset, snapped_upside_down: snapped }))
    }

    fn max_perpendicular_distance(&self, x0: f64, y0: f64, dx: f64, dy: f64, segment_len: f64) -> f64 {
        self.steps
            .iter()
            .map(|s| {
                let px = s.x - x0;
                let py = s.y - y0;
                ((px * dy - py * dx) / segment_len).abs()
            })
            .fold(0.0, f64::max)
    }
}

fn circular_mean<I: Iterator<Item = f64>>(angles: I) -> f64 {
    let (mut sum_sin, mut sum_cos, mut n) = (0.0, 0.0, 0.0);
    for a in angles {
        sum_sin += a.sin();
        sum_cos += a.cos();
        n += 1.0;
    }
    if n == 0.0 {
        return 0.0;
    }
    normalize_angle((sum_sin / n).atan2(sum_cos / n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fewer_than_minimum_steps_does_not_converge() {
        let mut cal = DynamicHeadingCalibrator::new(true, 3, 1.2, 0.3);
        let result = cal.observe_step(0.0, 0.0, 0.0).unwrap();
        assert!(result.is_none());
        let result = cal.observe_step(0.7, 0.0, 0.0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn straight_walk_converges_with_zero_offset() {
        let mut cal = DynamicHeadingCalibrator::new(true, 3, 1.2, 0.3);
        let mut result = None;
        for x in [0.0, 0.7, 1.4] {
            result = cal.observe_step(x, 0.0, 0.0).unwrap();
        }
        let r = result.expect("calibration should converge");
        assert!(r.offset_rad.abs() < 1e-6);
        assert!(!r.snapped_upside_down);
    }

    #[test]
    fn upside_down_phone_snaps_to_pi() {
        let mut cal = DynamicHeadingCalibrator::new(true, 3, 1.2, 0.3);
        let mut result = None;
        for x in [0.0, 0.7, 1.4] {
            // PDR says heading 0, mag says heading pi (phone upside down).
            result = cal.observe_step(x, 0.0, std::f64::consts::PI).unwrap();
        }
        let r = result.expect("calibration should converge");
        assert!((r.offset_rad.abs() - std::f64::consts::PI).abs() < 1e-6);
        assert!(r.snapped_upside_down);
    }

    #[test]
    fn latches_until_reset() {
        let mut cal = DynamicHeadingCalibrator::new(true, 3, 1.2, 0.3);
        for x in [0.0, 0.7, 1.4] {
            cal.observe_step(x, 0.0, 0.0).unwrap();
        }
        assert!(cal.offset().is_some());
        let again = cal.observe_step(2.1, 0.0, 0.0).unwrap();
        assert!(again.is_none());
        cal.reset();
        assert!(cal.offset().is_none());
    }
}
