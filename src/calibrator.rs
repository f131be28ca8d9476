//! Orientation Calibrator (`spec.md` §4.C): one-shot gravity-alignment
//! rotation via Rodrigues' formula, driven either by the facade's
//! explicit `calibrate()` call or by the Attitude Tracker's
//! auto-recalibration trigger.

use nalgebra::{Matrix3, Vector3};

use crate::error::CalibrationReason;

const DEFAULT_DURATION_MS: u64 = 5_000;
const DEFAULT_SAMPLES_REQUIRED: usize = 30;
const MAX_CALIBRATION_TIME_MS: u64 = 15_000;
const GRAVITY_THRESHOLD: f64 = 0.5;
const GYRO_THRESHOLD: f64 = 0.3;
const GRAVITY_MAGNITUDE: f64 = 9.81;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationMode {
    Strict,
    Tolerant,
}

#[derive(Clone, Debug)]
pub enum CalibratorOutcome {
    Complete { rotation: Matrix3<f64>, avg_gravity: Vector3<f64> },
    Failed(CalibrationReason),
}

#[derive(Clone, Copy, Debug)]
pub struct CalibrationProgress {
    pub fraction: f32,
    pub collected: usize,
    pub stable: usize,
}

struct Sample {
    acc: Vector3<f64>,
    stable: bool,
}

/// Collects acc/gyro samples for a fixed window, then derives the
/// rotation that aligns measured gravity to `(0, 0, -1)`.
pub struct OrientationCalibrator {
    mode: CalibrationMode,
    duration_ms: u64,
    samples_required: usize,
    start_timestamp_ms: Option<u64>,
    samples: Vec<Sample>,
}

impl OrientationCalibrator {
    pub fn new(mode: CalibrationMode) -> Self {
        Self {
            mode,
            duration_ms: DEFAULT_DURATION_MS,
            samples_required: DEFAULT_SAMPLES_REQUIRED,
            start_timestamp_ms: None,
            samples: Vec::new(),
        }
    }

    /// Shorter window used by the Attitude Tracker's background
    /// auto-recalibration (`spec.md` §4.B: "3 s, 30 samples").
    pub fn new_auto() -> Self {
        Self {
            mode: CalibrationMode::Tolerant,
            duration_ms: 3_000,
            samples_required: 30,
            start_timestamp_ms: None,
            samples: Vec::new(),
        }
    }

    pub fn progress(&self) -> CalibrationProgress {
        let stable = self.samples.iter().filter(|s| s.stable).count();
        let fraction = (self.samples.len() as f32 / self.samples_required as f32).min(1.0);
        CalibrationProgress { fraction, collected: self.samples.len(), stable }
    }

    /// Feed one acc/gyro sample. Returns `Some(outcome)` once the
    /// window finalizes (successfully or not), `None` while still
    /// collecting.
    pub fn push(
        &mut self,
        timestamp_ms: u64,
        acc: Vector3<f64>,
        gyro: Vector3<f64>,
    ) -> Option<CalibratorOutcome> {
        let start = *self.start_timestamp_ms.get_or_insert(timestamp_ms);
        let elapsed_ms = timestamp_ms.saturating_sub(start);

        let gravity_diff = (acc.norm() - GRAVITY_MAGNITUDE).abs();
        let gyro_mag = gyro.norm();
        let stable = gravity_diff <= GRAVITY_THRESHOLD && gyro_mag <= GYRO_THRESHOLD;

        match self.mode {
            CalibrationMode::Strict => {
                if stable {
                    self.samples.push(Sample { acc, stable });
                }
            }
            CalibrationMode::Tolerant => {
                self.samples.push(Sample { acc, stable });
            }
        }

        let hard_timeout = elapsed_ms >= MAX_CALIBRATION_TIME_MS;
        let window_done = elapsed_ms >= self.duration_ms || self.samples.len() >= self.samples_required;

        if hard_timeout {
            if self.samples.len() >= self.samples_required / 2 {
                return Some(self.finalize());
            }
            return Some(CalibratorOutcome::Failed(CalibrationReason::Timeout));
        }

        if window_done {
            let stable_count = self.samples.iter().filter(|s| s.stable).count();
            let required_stable = (0.6 * self.samples_required as f64).ceil() as usize;
            if stable_count >= required_stable {
                return Some(self.finalize());
            }
            let reason = match self.mode {
                CalibrationMode::Strict => CalibrationReason::InsufficientSamples,
                CalibrationMode::Tolerant => CalibrationReason::ExcessiveMotion,
            };
            return Some(CalibratorOutcome::Failed(reason));
        }

        None
    }

    fn finalize(&self) -> CalibratorOutcome {
        let accepted: Vec<&Sample> = match self.mode {
            CalibrationMode::Strict => self.samples.iter().collect(),
            CalibrationMode::Tolerant => self.samples.iter().filter(|s| s.stable).collect(),
        };
        let n = accepted.len().max(1) as f64;
        let mean: Vector3<f64> = accepted.iter().map(|s| s.acc).sum::<Vector3<f64>>() / n;
        let mag = mean.norm();

        if !(8.0 < mag && mag < 12.0) {
            return CalibratorOutcome::Failed(CalibrationReason::AberrantGravity);
        }

        let rotation = rodrigues_align_to_down(mean);
        CalibratorOutcome::Complete { rotation, avg_gravity: mean }
    }
}

/// Rotation matrix aligning `measured_gravity` onto `(0, 0, -1)` via
/// Rodrigues' formula.
pub fn rodrigues_align_to_down(measured_gravity: Vector3<f64>) -> Matrix3<f64> {
    let target = Vector3::new(0.0, 0.0, -1.0);
    let g_norm = measured_gravity.norm();
    if g_norm < 1e-9 {
        return Matrix3::identity();
    }
    let g = measured_gravity / g_norm;

    let axis = g.cross(&target);
    let axis_norm = axis.norm();
    let cos_angle = g.dot(&target).clamp(-1.0, 1.0);
    let angle = cos_angle.acos();

    if axis_norm < 1e-6 || angle.abs() < 1e-6 {
        return Matrix3::identity();
    }

    let k = axis / axis_norm;
    let k_cross = Matrix3::new(0.0, -k.z, k.y, k.z, 0.0, -k.x, -k.y, k.x, 0.0);

    Matrix3::identity() + angle.sin() * k_cross + (1.0 - angle.cos()) * (k_cross * k_cross)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_calibration_completes_on_steady_gravity() {
        let mut cal = OrientationCalibrator::new(CalibrationMode::Strict);
        let mut outcome = None;
        for i in 0..40 {
            let t = i * 100;
            outcome = cal.push(t, Vector3::new(0.0, 0.0, 9.81), Vector3::new(0.0, 0.0, 0.0));
            if outcome.is_some() {
                break;
            }
        }
        match outcome {
            Some(CalibratorOutcome::Complete { rotation, .. }) => {
                assert!((rotation.determinant() - 1.0).abs() < 0.1);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn aberrant_gravity_fails() {
        let mut cal = OrientationCalibrator::new(CalibrationMode::Tolerant);
        let mut outcome = None;
        for i in 0..40 {
            let t = i * 100;
            outcome = cal.push(t, Vector3::new(0.0, 0.0, 30.0), Vector3::new(0.0, 0.0, 0.0));
            if outcome.is_some() {
                break;
            }
        }
        assert!(matches!(outcome, Some(CalibratorOutcome::Failed(CalibrationReason::AberrantGravity))));
    }

    #[test]
    fn excessive_motion_fails_in_strict_mode() {
        let mut cal = OrientationCalibrator::new(CalibrationMode::Strict);
        let mut outcome = None;
        for i in 0..200 {
            let t = i * 100;
            outcome = cal.push(t, Vector3::new(5.0, 5.0, 9.81), Vector3::new(5.0, 5.0, 5.0));
            if outcome.is_some() {
                break;
            }
        }
        assert!(matches!(
            outcome,
            Some(CalibratorOutcome::Failed(CalibrationReason::InsufficientSamples))
                | Some(CalibratorOutcome::Failed(CalibrationReason::Timeout))
        ));
    }

    #[test]
    fn rodrigues_aligns_gravity_to_down() {
        let measured = Vector3::new(3.0, 4.0, 0.0);
        let r = rodrigues_align_to_down(measured);
        let rotated = r * measured;
        let expected = Vector3::new(0.0, 0.0, -measured.norm());
        assert!((rotated - expected).norm() < 1e-6);
    }
}
