//! Attitude Tracker (`spec.md` §4.B): Madgwick AHRS with magnetometer
//! gating, stability detection, and auto-recalibration.
//!
//! Hand-rolled gradient-descent filter rather than a dependency on the
//! `ahrs` crate: the magnetometer-confidence gain boost and the
//! stability-triggered recalibration hook need direct access to the
//! raw gradient step, the way the teacher's `ekf_15d.rs` hand-rolls its
//! own quaternion integration and renormalization instead of reaching
//! for `nalgebra::UnitQuaternion`.

use std::collections::VecDeque;

use nalgebra::Vector3;

use crate::calibrator::{CalibratorOutcome, OrientationCalibrator};
use crate::config::LocalizationConfig;
use crate::types::Quat;

const MAG_WINDOW: usize = 50;
const STABILITY_WINDOW_MS: u64 = 2_000;
const MIN_STABILITY_SAMPLES: usize = 10;
const EARTH_MAG_NORM_UT: f64 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttitudeEvent {
    StabilityChanged(bool),
    Recalibrated,
}

struct MagWindow {
    norms: VecDeque<f64>,
    reference: Option<Vector3<f64>>,
}

impl MagWindow {
    fn new() -> Self {
        Self { norms: VecDeque::with_capacity(MAG_WINDOW), reference: None }
    }

    fn push(&mut self, m: Vector3<f64>) -> f64 {
        if self.norms.len() >= MAG_WINDOW {
            self.norms.pop_front();
        }
        self.norms.push_back(m.norm());

        let n = self.norms.len() as f64;
        let mean: f64 = self.norms.iter().sum::<f64>() / n;
        let var: f64 = self.norms.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

        let tau_norm = 400.0; // µT^2, scales the variance penalty
        let conf_var = (1.0 - var / tau_norm).clamp(0.0, 1.0);
        let conf_mean = (1.0 - (mean - EARTH_MAG_NORM_UT).abs() / EARTH_MAG_NORM_UT).clamp(0.0, 1.0);
        let confidence = conf_var * conf_mean;

        if self.reference.is_none() && confidence > 0.8 {
            self.reference = Some(m.normalize());
        }
        confidence
    }
}

struct StabilityTracker {
    samples: VecDeque<(u64, Vector3<f64>, Vector3<f64>)>,
    acc_threshold: f64,
    gyro_threshold: f64,
    is_stable: bool,
    stable_since_ms: Option<u64>,
}

impl StabilityTracker {
    fn new(acc_threshold: f64, gyro_threshold: f64) -> Self {
        Self {
            samples: VecDeque::new(),
            acc_threshold,
            gyro_threshold,
            is_stable: false,
            stable_since_ms: None,
        }
    }

    /// Returns `Some(on_or_off)` when the stability flag changed.
    fn push(&mut self, timestamp_ms: u64, acc: Vector3<f64>, gyro: Vector3<f64>) -> Option<bool> {
        self.samples.push_back((timestamp_ms, acc, gyro));
        while let Some(&(t, _, _)) = self.samples.front() {
            if timestamp_ms.saturating_sub(t) > STABILITY_WINDOW_MS {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        if self.samples.len() < MIN_STABILITY_SAMPLES {
            return None;
        }

        let n = self.samples.len() as f64;
        let mean_acc_norm: f64 = self.samples.iter().map(|(_, a, _)| a.norm()).sum::<f64>() / n;
        let acc_variance: f64 = self
            .samples
            .iter()
            .map(|(_, a, _)| (a.norm() - mean_acc_norm).powi(2))
            .sum::<f64>()
            / n;
        let gyro_mean: f64 = self.samples.iter().map(|(_, _, g)| g.norm()).sum::<f64>() / n;

        let stable_now = acc_variance < self.acc_threshold && gyro_mean < self.gyro_threshold;

        if stable_now && self.stable_since_ms.is_none() {
            self.stable_since_ms = Some(timestamp_ms);
        } else if !stable_now {
            self.stable_since_ms = None;
        }

        if stable_now != self.is_stable {
            self.is_stable = stable_now;
            Some(stable_now)
        } else {
            None
        }
    }

    fn stable_duration_ms(&self, now_ms: u64) -> u64 {
        self.stable_since_ms.map(|t| now_ms.saturating_sub(t)).unwrap_or(0)
    }
}

/// Madgwick gradient-descent attitude filter with magnetometer gating
/// and triggered re-calibration while the device is held still.
pub struct AttitudeTracker {
    beta0: f64,
    q: Quat,
    mag_window: MagWindow,
    stability: StabilityTracker,
    last_timestamp_ms: Option<u64>,
    last_recalibration_ms: Option<u64>,
    recalibration_interval_ms: u64,
    stability_duration_required_ms: u64,
    pending_calibration: Option<OrientationCalibrator>,
    body_to_phone: nalgebra::Matrix3<f64>,
}

impl AttitudeTracker {
    pub fn new(config: &LocalizationConfig) -> Self {
        Self {
            beta0: config.beta0,
            q: Quat::IDENTITY,
            mag_window: MagWindow::new(),
            stability: StabilityTracker::new(
                config.stability_acc_threshold,
                config.stability_gyro_threshold,
            ),
            last_timestamp_ms: None,
            last_recalibration_ms: None,
            recalibration_interval_ms: config.recalibration_interval_ms,
            stability_duration_required_ms: 2_000,
            pending_calibration: None,
            body_to_phone: nalgebra::Matrix3::identity(),
        }
    }

    pub fn quaternion(&self) -> Quat {
        self.q
    }

    /// Advance the filter by one acc+gyro(+mag) sample. Returns
    /// whatever auxiliary events fired this step (`spec.md` §4.B).
    pub fn update(
        &mut self,
        timestamp_ms: u64,
        acc: Vector3<f64>,
        gyro: Vector3<f64>,
        mag: Option<Vector3<f64>>,
    ) -> Vec<AttitudeEvent> {
        let mut events = Vec::new();

        let dt = match self.last_timestamp_ms {
            Some(last) => ((timestamp_ms - last) as f64 / 1000.0).max(1e-4),
            None => 1.0 / 25.0,
        };
        self.last_timestamp_ms = Some(timestamp_ms);

        let mag_confidence = mag.map(|m| self.mag_window.push(m)).unwrap_or(0.0);
        self.step_madgwick(acc, gyro, mag, mag_confidence, dt);

        if let Some(change) = self.stability.push(timestamp_ms, acc, gyro) {
            events.push(AttitudeEvent::StabilityChanged(change));
        }

        if let Some(calibrator) = self.pending_calibration.as_mut() {
            match calibrator.push(timestamp_ms, acc, gyro) {
                Some(CalibratorOutcome::Complete { rotation, .. }) => {
                    self.body_to_phone = rotation;
                    self.last_recalibration_ms = Some(timestamp_ms);
                    self.pending_calibration = None;
                    events.push(AttitudeEvent::Recalibrated);
                }
                Some(CalibratorOutcome::Failed(reason)) => {
                    log::debug!(target: "localization::attitude", "auto-recalibration aborted: {reason}");
                    self.pending_calibration = None;
                }
                None => {}
            }
        } else if self.stability.is_stable
            && self.stability.stable_duration_ms(timestamp_ms) >= self.stability_duration_required_ms
            && self
                .last_recalibration_ms
                .map(|t| timestamp_ms.saturating_sub(t) >= self.recalibration_interval_ms)
                .unwrap_or(true)
        {
            log::info!(target: "localization::attitude", "stability sustained, triggering auto-recalibration");
            self.pending_calibration = Some(OrientationCalibrator::new_auto());
        }

        events
    }

    /// Rotation aligning the device body frame to the held-phone
    /// reference frame, refreshed by auto-recalibration.
    pub fn body_to_phone_matrix(&self) -> nalgebra::Matrix3<f64> {
        self.body_to_phone
    }

    pub fn is_stable(&self) -> bool {
        self.stability.is_stable
    }

    fn step_madgwick(
        &mut self,
        acc: Vector3<f64>,
        gyro: Vector3<f64>,
        mag: Option<Vector3<f64>>,
        mag_confidence: f64,
        dt: f64,
    ) {
        let (qw, qx, qy, qz) = (self.q.w, self.q.x, self.q.y, self.q.z);

        let q_dot_w = 0.5 * (-qx * gyro.x - qy * gyro.y - qz * gyro.z);
        let q_dot_x = 0.5 * (qw * gyro.x + qy * gyro.z - qz * gyro.y);
        let q_dot_y = 0.5 * (qw * gyro.y - qx * gyro.z + qz * gyro.x);
        let q_dot_z = 0.5 * (qw * gyro.z + qx * gyro.y - qy * gyro.x);

        let acc_norm = acc.norm();
        let mut beta = self.beta0;
        let mut grad = [0.0_f64; 4];

        if acc_norm > 1e-9 {
            let a = acc / acc_norm;
            let f1 = 2.0 * (qx * qz - qw * qy) - a.x;
            let f2 = 2.0 * (qw * qx + qy * qz) - a.y;
            let f3 = 2.0 * (0.5 - qx * qx - qy * qy) - a.z;

            grad[0] += -2.0 * qy * f1 + 2.0 * qx * f2;
            grad[1] += 2.0 * qz * f1 + 2.0 * qw * f2 - 4.0 * qx * f3;
            grad[2] += -2.0 * qw * f1 + 2.0 * qz * f2 - 4.0 * qy * f3;
            grad[3] += 2.0 * qx * f1 + 2.0 * qy * f2;

            if let Some(m) = mag {
                if mag_confidence > 0.3 {
                    beta *= 1.0 + 0.5 * mag_confidence;

                    let m_norm = m.norm();
                    if m_norm > 1e-9 {
                        let mn = m / m_norm;
                        // Rotate the normalized mag reading into the reference frame
                        // to obtain the horizontal reference field (b_x, 0, b_z).
                        let h = self.q.rotate(mn);
                        let bx = (h.x * h.x + h.y * h.y).sqrt();
                        let bz = h.z;

                        let fm1 = 2.0 * bx * (0.5 - qy * qy - qz * qz)
                            + 2.0 * bz * (qx * qz - qw * qy)
                            - mn.x;
                        let fm2 = 2.0 * bx * (qx * qy - qw * qz)
                            + 2.0 * bz * (qw * qx + qy * qz)
                            - mn.y;
                        let fm3 = 2.0 * bx * (qw * qy + qx * qz)
                            + 2.0 * bz * (0.5 - qx * qx - qy * qy)
                            - mn.z;

                        grad[0] += -2.0 * bz * qy * fm1
                            + (-2.0 * bx * qz + 2.0 * bz * qx) * fm2
                            + 2.0 * bx * qy * fm3;
                        grad[1] += 2.0 * bz * qz * fm1
                            + (2.0 * bx * qy + 2.0 * bz * qw) * fm2
                            + (2.0 * bx * qz - 4.0 * bz * qx) * fm3;
                        grad[2] += (-4.0 * bx * qy - 2.0 * bz * qw) * fm1
                            + (2.0 * bx * qx + 2.0 * bz * qz) * fm2
                            + (2.0 * bx * qw - 4.0 * bz * qy) * fm3;
                        grad[3] += (-4.0 * bx * qz + 2.0 * bz * qx) * fm1
                            + (-2.0 * bx * qw + 2.0 * bz * qy) * fm2
                            + 2.0 * bx * qx * fm3;
                    }
                }
            }
        }

        let grad_norm = (grad[0] * grad[0] + grad[1] * grad[1] + grad[2] * grad[2] + grad[3] * grad[3]).sqrt();
        if grad_norm > 1e-9 {
            for g in grad.iter_mut() {
                *g /= grad_norm;
            }
        }

        let new_q = Quat {
            w: qw + (q_dot_w - beta * grad[0]) * dt,
            x: qx + (q_dot_x - beta * grad[1]) * dt,
            y: qy + (q_dot_y - beta * grad[2]) * dt,
            z: qz + (q_dot_z - beta * grad[3]) * dt,
        };

        self.q = match new_q.normalized() {
            Some(q) if q.norm().is_finite() => q,
            _ => {
                log::warn!(target: "localization::attitude", "quaternion norm collapsed, resetting to identity");
                Quat::IDENTITY
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LocalizationConfig {
        LocalizationConfig::default()
    }

    #[test]
    fn identity_gravity_keeps_quaternion_near_identity() {
        let mut tracker = AttitudeTracker::new(&config());
        for t in (0..2000).step_by(40) {
            tracker.update(t as u64, Vector3::new(0.0, 0.0, -9.81), Vector3::new(0.0, 0.0, 0.0), None);
        }
        let q = tracker.quaternion();
        assert!((q.norm() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn invalid_quaternion_falls_back_to_identity() {
        let mut tracker = AttitudeTracker::new(&config());
        tracker.q = Quat { w: 0.0, x: 0.0, y: 0.0, z: 0.0 };
        tracker.update(0, Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.0), None);
        assert_eq!(tracker.quaternion(), Quat::IDENTITY);
    }

    #[test]
    fn stability_flag_requires_minimum_samples() {
        let mut tracker = AttitudeTracker::new(&config());
        for t in 0..5 {
            let events = tracker.update(
                t * 40,
                Vector3::new(0.0, 0.0, -9.81),
                Vector3::new(0.0, 0.0, 0.0),
                None,
            );
            assert!(events.is_empty());
        }
    }
}
