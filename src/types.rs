//! Core data types shared across the fusion pipeline.
//!
//! Mirrors the dimension-alias convention in the teacher's
//! `types/linalg.rs`: fixed-size `nalgebra` vectors/matrices for
//! everything that has a known compile-time shape, plain structs for
//! sensor records.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

// ===== EKF dimensions =====

/// 7-state EKF: (x, y, z, vx, vy, vz, psi)
pub const EKF_STATE_DIM: usize = 7;

pub type EkfStateVec = SVector<f64, EKF_STATE_DIM>;
pub type EkfCovMat = SMatrix<f64, EKF_STATE_DIM, EKF_STATE_DIM>;

// ===== Sensor samples =====

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    Acc,
    Gyro,
    Mag,
    Baro,
}

/// A single raw sensor reading.
///
/// `values` holds the 3-axis reading for `Acc`/`Gyro`/`Mag`; `scalar`
/// holds the pressure (hPa) for `Baro`. Timestamps are monotonic
/// milliseconds, strictly increasing per kind (`spec.md` §3).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SensorSample {
    pub kind: SensorKind,
    pub values: [f64; 3],
    pub scalar: f64,
    pub timestamp_ms: u64,
}

impl SensorSample {
    pub fn vector(&self) -> Vector3<f64> {
        Vector3::new(self.values[0], self.values[1], self.values[2])
    }

    pub fn acc(timestamp_ms: u64, x: f64, y: f64, z: f64) -> Self {
        Self { kind: SensorKind::Acc, values: [x, y, z], scalar: 0.0, timestamp_ms }
    }

    pub fn gyro(timestamp_ms: u64, x: f64, y: f64, z: f64) -> Self {
        Self { kind: SensorKind::Gyro, values: [x, y, z], scalar: 0.0, timestamp_ms }
    }

    pub fn mag(timestamp_ms: u64, x: f64, y: f64, z: f64) -> Self {
        Self { kind: SensorKind::Mag, values: [x, y, z], scalar: 0.0, timestamp_ms }
    }

    pub fn baro(timestamp_ms: u64, pressure_hpa: f64) -> Self {
        Self { kind: SensorKind::Baro, values: [0.0; 3], scalar: pressure_hpa, timestamp_ms }
    }
}

// ===== Attitude =====

/// Unit quaternion representing the device-to-world rotation.
///
/// Hand-rolled rather than `nalgebra::UnitQuaternion` so the Madgwick
/// gradient-descent step (`attitude.rs`) can manipulate raw components
/// directly, the way the teacher's `ekf_15d.rs` integrates its own
/// attitude quaternion by hand.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quat {
    pub const IDENTITY: Quat = Quat { w: 1.0, x: 0.0, y: 0.0, z: 0.0 };

    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn normalized(&self) -> Option<Quat> {
        let n = self.norm();
        if n < 1e-6 {
            return None;
        }
        Some(Quat { w: self.w / n, x: self.x / n, y: self.y / n, z: self.z / n })
    }

    /// Rotate a body-frame vector into the world frame.
    pub fn rotate(&self, v: Vector3<f64>) -> Vector3<f64> {
        let (qw, qx, qy, qz) = (self.w, self.x, self.y, self.z);
        let r00 = 1.0 - 2.0 * (qy * qy + qz * qz);
        let r01 = 2.0 * (qx * qy - qw * qz);
        let r02 = 2.0 * (qx * qz + qw * qy);
        let r10 = 2.0 * (qx * qy + qw * qz);
        let r11 = 1.0 - 2.0 * (qx * qx + qz * qz);
        let r12 = 2.0 * (qy * qz - qw * qx);
        let r20 = 2.0 * (qx * qz - qw * qy);
        let r21 = 2.0 * (qy * qz + qw * qx);
        let r22 = 1.0 - 2.0 * (qx * qx + qy * qy);
        Vector3::new(
            r00 * v.x + r01 * v.y + r02 * v.z,
            r10 * v.x + r11 * v.y + r12 * v.z,
            r20 * v.x + r21 * v.y + r22 * v.z,
        )
    }

    /// Yaw (heading) extracted from the quaternion, normalized to (-pi, pi].
    pub fn yaw(&self) -> f64 {
        let (qw, qx, qy, qz) = (self.w, self.x, self.y, self.z);
        let siny_cosp = 2.0 * (qw * qz + qx * qy);
        let cosy_cosp = 1.0 - 2.0 * (qy * qy + qz * qz);
        normalize_angle(siny_cosp.atan2(cosy_cosp))
    }
}

impl Default for Quat {
    fn default() -> Self {
        Quat::IDENTITY
    }
}

/// 3x3 rotation matrix with a validity check (`spec.md` §3).
pub type RotationMatrix = Matrix3<f64>;

pub fn is_valid_rotation(r: &RotationMatrix) -> bool {
    (r.determinant() - 1.0).abs() < 0.1
}

// ===== Activity / PDR =====

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityMode {
    Stationary,
    Walking,
    Running,
    Crawling,
}

impl std::fmt::Display for ActivityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityMode::Stationary => "stationary",
            ActivityMode::Walking => "walking",
            ActivityMode::Running => "running",
            ActivityMode::Crawling => "crawling",
        };
        write!(f, "{s}")
    }
}

/// A single detected step (`spec.md` §3). `index` is monotonically
/// increasing within a session and only resets (to 0, with a
/// discontinuity event) on an explicit facade reset.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StepEvent {
    pub index: u64,
    pub length_m: f64,
    pub timestamp_ms: u64,
    pub peak_amplitude: f64,
}

/// Calibration bundle: the facade's persistable calibration state.
/// Round-tripping this through an external store must be lossless
/// (`spec.md` §6 "Persisted state").
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CalibrationBundle {
    pub acc_offset: (f64, f64, f64),
    pub gyro_offset: (f64, f64, f64),
    pub mag_offset: (f64, f64, f64),
    pub body_to_world_rotation: [[f64; 3]; 3],
    pub mag_heading_offset: Option<f64>,
    pub baro_baseline_hpa: f64,
}

impl CalibrationBundle {
    pub fn identity() -> Self {
        Self {
            acc_offset: (0.0, 0.0, 0.0),
            gyro_offset: (0.0, 0.0, 0.0),
            mag_offset: (0.0, 0.0, 0.0),
            body_to_world_rotation: [
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
            mag_heading_offset: None,
            baro_baseline_hpa: 1013.25,
        }
    }

    pub fn body_to_world_matrix(&self) -> RotationMatrix {
        Matrix3::from_row_slice(&[
            self.body_to_world_rotation[0][0],
            self.body_to_world_rotation[0][1],
            self.body_to_world_rotation[0][2],
            self.body_to_world_rotation[1][0],
            self.body_to_world_rotation[1][1],
            self.body_to_world_rotation[1][2],
            self.body_to_world_rotation[2][0],
            self.body_to_world_rotation[2][1],
            self.body_to_world_rotation[2][2],
        ])
    }

    pub fn set_body_to_world_matrix(&mut self, m: &RotationMatrix) {
        for r in 0..3 {
            for c in 0..3 {
                self.body_to_world_rotation[r][c] = m[(r, c)];
            }
        }
    }
}

/// Normalize an angle (radians) into `(-pi, pi]`.
pub fn normalize_angle(angle: f64) -> f64 {
    let two_pi = std::f64::consts::TAU;
    let mut a = (angle + std::f64::consts::PI) % two_pi;
    if a <= 0.0 {
        a += two_pi;
    }
    a - std::f64::consts::PI
}

/// Barometric altitude from pressure (hPa), international formula
/// (`spec.md` §4.E).
pub fn pressure_to_altitude(pressure_hpa: f64, baseline_hpa: f64) -> f64 {
    44330.0 * (1.0 - (pressure_hpa / baseline_hpa).powf(0.1903))
}

/// Inverse of [`pressure_to_altitude`]: the pressure that yields a
/// given altitude above the baseline. Used only by tests to check the
/// round-trip property in `spec.md` §8.
pub fn altitude_to_pressure(altitude_m: f64, baseline_hpa: f64) -> f64 {
    baseline_hpa * (1.0 - altitude_m / 44330.0).powf(1.0 / 0.1903)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_angle_wraps_multiples_of_tau() {
        let x = 0.73;
        for k in -3..=3 {
            let shifted = x + std::f64::consts::TAU * k as f64;
            assert!((normalize_angle(shifted) - normalize_angle(x)).abs() < 1e-9);
        }
    }

    #[test]
    fn normalize_angle_stays_in_range() {
        for i in -20..20 {
            let a = normalize_angle(i as f64 * 1.3);
            assert!(a > -std::f64::consts::PI - 1e-9 && a <= std::f64::consts::PI + 1e-9);
        }
    }

    #[test]
    fn pressure_altitude_round_trip() {
        let baseline = 1013.25;
        for h in [-200.0, -50.0, 0.0, 50.0, 200.0] {
            let p = altitude_to_pressure(h, baseline);
            let back = pressure_to_altitude(p, baseline);
            assert!((back - h).abs() < 0.1, "h={h} back={back}");
        }
    }

    #[test]
    fn quat_identity_rotates_vector_unchanged() {
        let q = Quat::IDENTITY;
        let v = Vector3::new(1.0, 2.0, 3.0);
        let r = q.rotate(v);
        assert!((r - v).norm() < 1e-9);
    }

    #[test]
    fn rotation_matrix_identity_is_valid() {
        assert!(is_valid_rotation(&RotationMatrix::identity()));
    }
}
