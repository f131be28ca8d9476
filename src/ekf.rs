//! 7-state Extended Kalman Filter (`spec.md` §4.E): fuses the PDR
//! position/heading increment with magnetometer heading, barometric
//! altitude, and (optionally) map-matching.
//!
//! Fixed-size `nalgebra` state/covariance, matching the teacher's
//! `types/linalg.rs` dimension-alias convention (`StateVec15`/
//! `StateMat15`, here at dimension 7), with Joseph-form covariance
//! updates in the same style as `filters/ekf_15d.rs::update_body_velocity`.

use nalgebra::{Matrix1, SMatrix, Vector1};

use crate::error::{LocalizationError, Result};
use crate::types::{normalize_angle, pressure_to_altitude, ActivityMode, EkfCovMat, EkfStateVec, EKF_STATE_DIM};

const IDX_X: usize = 0;
const IDX_Y: usize = 1;
const IDX_Z: usize = 2;
const IDX_VX: usize = 3;
const IDX_VY: usize = 4;
const IDX_VZ: usize = 5;
const IDX_PSI: usize = 6;

#[derive(Clone, Copy, Debug)]
pub struct PdrIncrement {
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub dpsi: f64,
    pub dt: f64,
}

pub struct EkfConfig {
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub magnetometer_noise: f64,
    pub barometer_noise: f64,
}

/// 7-state EKF `(x, y, z, vx, vy, vz, psi)`.
pub struct Ekf {
    state: EkfStateVec,
    covariance: EkfCovMat,
    config: EkfConfig,
    zupt_active: bool,
}

impl Ekf {
    pub fn new(config: EkfConfig) -> Self {
        let mut covariance = EkfCovMat::identity();
        covariance *= 10.0;
        Self { state: EkfStateVec::zeros(), covariance, config, zupt_active: false }
    }

    pub fn state(&self) -> &EkfStateVec {
        &self.state
    }

    pub fn position(&self) -> (f64, f64, f64) {
        (self.state[IDX_X], self.state[IDX_Y], self.state[IDX_Z])
    }

    pub fn yaw(&self) -> f64 {
        self.state[IDX_PSI]
    }

    pub fn velocity(&self) -> (f64, f64, f64) {
        (self.state[IDX_VX], self.state[IDX_VY], self.state[IDX_VZ])
    }

    pub fn reset_position(&mut self, x: f64, y: f64, z: f64, psi: f64) {
        self.state[IDX_X] = x;
        self.state[IDX_Y] = y;
        self.state[IDX_Z] = z;
        self.state[IDX_PSI] = normalize_angle(psi);
        self.state[IDX_VX] = 0.0;
        self.state[IDX_VY] = 0.0;
        self.state[IDX_VZ] = 0.0;
    }

    /// Retroactively rotate position/yaw, used by the dynamic heading
    /// calibrator (`spec.md` §4.F step 6).
    pub fn apply_heading_offset(&mut self, offset: f64) {
        let (s, c) = (-offset).sin_cos();
        let x = self.state[IDX_X];
        let y = self.state[IDX_Y];
        self.state[IDX_X] = x * c - y * s;
        self.state[IDX_Y] = x * s + y * c;
        self.state[IDX_PSI] = normalize_angle(self.state[IDX_PSI] + offset);
    }

    /// Confidence derived from the position-block covariance trace
    /// (`spec.md` §4.E).
    pub fn confidence(&self) -> f64 {
        let trace = self.covariance[(0, 0)] + self.covariance[(1, 1)] + self.covariance[(2, 2)];
        1.0 / (1.0 + trace)
    }

    /// Predict step driven by a PDR increment as control input
    /// (`spec.md` §4.E "Prediction").
    pub fn predict(&mut self, increment: PdrIncrement, mode: ActivityMode) {
        let dt = increment.dt.max(1e-4);

        self.state[IDX_X] += increment.dx;
        self.state[IDX_Y] += increment.dy;
        self.state[IDX_Z] += increment.dz;
        self.state[IDX_PSI] = normalize_angle(self.state[IDX_PSI] + increment.dpsi);

        self.state[IDX_VX] = increment.dx / dt;
        self.state[IDX_VY] = increment.dy / dt;
        self.state[IDX_VZ] = increment.dz / dt;

        let mut f = EkfCovMat::identity();
        f[(IDX_X, IDX_VX)] = dt;
        f[(IDX_Y, IDX_VY)] = dt;
        f[(IDX_Z, IDX_VZ)] = dt;

        let mode_scale = match mode {
            ActivityMode::Stationary => 0.1,
            ActivityMode::Crawling => 0.5,
            ActivityMode::Walking => 1.0,
            ActivityMode::Running => 1.0,
        };
        let q = EkfCovMat::identity() * (self.config.process_noise * mode_scale * dt * dt);

        self.covariance = f * self.covariance * f.transpose() + q;
        symmetrize(&mut self.covariance);
    }

    /// Scalar measurement update in Joseph form
    /// (`spec.md` §4.E "Innovation + gain"), generalized over the
    /// measurement row `h` and expected value so barometer,
    /// magnetometer, PDR-position, PDR-yaw, and map-matching all share
    /// one code path — the same "reuse the update math, vary H/R"
    /// shape as the teacher's `update_body_velocity`.
    fn scalar_update(
        &mut self,
        step: &'static str,
        h_row: [f64; EKF_STATE_DIM],
        measurement: f64,
        predicted: f64,
        noise: f64,
        wrap_angle: bool,
    ) -> Result<()> {
        let h = SMatrix::<f64, 1, EKF_STATE_DIM>::from_row_slice(&h_row);
        let mut innovation = measurement - predicted;
        if wrap_angle {
            innovation = normalize_angle(innovation);
        }

        let s = (h * self.covariance * h.transpose())[(0, 0)] + noise;
        if s.abs() < 1e-12 {
            log::debug!(target: "localization::ekf", "[{step}] singular innovation, measurement skipped");
            return Err(LocalizationError::SingularInnovation { step });
        }
        let s_mat = Matrix1::new(s);
        let s_inv = s_mat.try_inverse().ok_or(LocalizationError::SingularInnovation { step })?;

        let p_ht = self.covariance * h.transpose();
        let k = p_ht * s_inv;

        self.state += k * Vector1::new(innovation);
        self.state[IDX_PSI] = normalize_angle(self.state[IDX_PSI]);

        let identity = EkfCovMat::identity();
        let i_kh = identity - k * h;
        let r_mat = Matrix1::new(noise);
        self.covariance = i_kh * self.covariance * i_kh.transpose() + k * r_mat * k.transpose();
        symmetrize(&mut self.covariance);

        Ok(())
    }

    pub fn update_barometer(&mut self, pressure_hpa: f64, baseline_hpa: f64) -> Result<()> {
        let predicted = self.state[IDX_Z];
        let measured_altitude = pressure_to_altitude(pressure_hpa, baseline_hpa);
        let mut h = [0.0; EKF_STATE_DIM];
        h[IDX_Z] = 1.0;
        self.scalar_update(
            "fusion",
            h,
            measured_altitude,
            predicted,
            self.config.barometer_noise,
            false,
        )
    }

    pub fn update_magnetometer_heading(&mut self, mag_x: f64, mag_y: f64, mag_offset: f64, confidence: f64) -> Result<()> {
        let heading = normalize_angle(mag_y.atan2(mag_x) + mag_offset);
        let predicted = self.state[IDX_PSI];
        let noise = (self.config.magnetometer_noise / confidence.max(0.1)).min(2.0);
        let mut h = [0.0; EKF_STATE_DIM];
        h[IDX_PSI] = 1.0;
        self.scalar_update("fusion", h, heading, predicted, noise, true)
    }

    pub fn update_pdr_position(&mut self, x_pdr: f64, y_pdr: f64, mode: ActivityMode) -> Result<()> {
        let noise = match mode {
            ActivityMode::Stationary => 0.005,
            ActivityMode::Crawling => 0.05,
            ActivityMode::Walking => 0.08,
            ActivityMode::Running => 0.15,
        };
        let mut h_x = [0.0; EKF_STATE_DIM];
        h_x[IDX_X] = 1.0;
        self.scalar_update("fusion", h_x, x_pdr, self.state[IDX_X], noise, false)?;

        let mut h_y = [0.0; EKF_STATE_DIM];
        h_y[IDX_Y] = 1.0;
        self.scalar_update("fusion", h_y, y_pdr, self.state[IDX_Y], noise, false)
    }

    pub fn update_pdr_yaw(&mut self, psi_pdr: f64, mode: ActivityMode) -> Result<()> {
        let noise = match mode {
            ActivityMode::Stationary => 0.025,
            ActivityMode::Crawling => 0.06,
            ActivityMode::Walking => 0.05,
            ActivityMode::Running => 0.1,
        };
        let mut h = [0.0; EKF_STATE_DIM];
        h[IDX_PSI] = 1.0;
        self.scalar_update("fusion", h, psi_pdr, self.state[IDX_PSI], noise, true)
    }

    pub fn update_map_match(&mut self, projected_x: f64, projected_y: f64, noise: f64) -> Result<()> {
        let mut h_x = [0.0; EKF_STATE_DIM];
        h_x[IDX_X] = 1.0;
        self.scalar_update("fusion", h_x, projected_x, self.state[IDX_X], noise, false)?;

        let mut h_y = [0.0; EKF_STATE_DIM];
        h_y[IDX_Y] = 1.0;
        self.scalar_update("fusion", h_y, projected_y, self.state[IDX_Y], noise, false)
    }

    /// Zero-velocity pseudo-measurement (`spec.md` §4.E "ZUPT hook").
    pub fn apply_zupt(&mut self, active: bool) -> Result<()> {
        if active && !self.zupt_active {
            self.zupt_active = true;
            let noise = 1e-4;
            let mut h_vx = [0.0; EKF_STATE_DIM];
            h_vx[IDX_VX] = 1.0;
            self.scalar_update("fusion", h_vx, 0.0, self.state[IDX_VX], noise, false)?;
            let mut h_vy = [0.0; EKF_STATE_DIM];
            h_vy[IDX_VY] = 1.0;
            self.scalar_update("fusion", h_vy, 0.0, self.state[IDX_VY], noise, false)?;
            let mut h_vz = [0.0; EKF_STATE_DIM];
            h_vz[IDX_VZ] = 1.0;
            self.scalar_update("fusion", h_vz, 0.0, self.state[IDX_VZ], noise, false)?;
        } else if !active {
            self.zupt_active = false;
        }
        Ok(())
    }
}

fn symmetrize(p: &mut EkfCovMat) {
    *p = (*p + p.transpose()) * 0.5;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EkfConfig {
        EkfConfig { process_noise: 0.25, measurement_noise: 0.1, magnetometer_noise: 0.2, barometer_noise: 1.0 }
    }

    #[test]
    fn prediction_advances_position_by_increment() {
        let mut ekf = Ekf::new(config());
        ekf.predict(PdrIncrement { dx: 1.0, dy: 0.0, dz: 0.0, dpsi: 0.0, dt: 1.0 }, ActivityMode::Walking);
        assert!((ekf.position().0 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn covariance_stays_symmetric() {
        let mut ekf = Ekf::new(config());
        for _ in 0..20 {
            ekf.predict(PdrIncrement { dx: 0.5, dy: 0.2, dz: 0.0, dpsi: 0.05, dt: 0.5 }, ActivityMode::Walking);
            let _ = ekf.update_barometer(1013.25, 1013.25);
            let _ = ekf.update_magnetometer_heading(25.0, 0.0, 0.0, 0.9);
        }
        let cov = &ekf.covariance;
        for r in 0..EKF_STATE_DIM {
            for c in 0..EKF_STATE_DIM {
                assert!((cov[(r, c)] - cov[(c, r)]).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn yaw_stays_normalized() {
        let mut ekf = Ekf::new(config());
        ekf.predict(
            PdrIncrement { dx: 0.0, dy: 0.0, dz: 0.0, dpsi: 10.0, dt: 1.0 },
            ActivityMode::Walking,
        );
        assert!(ekf.yaw() > -std::f64::consts::PI - 1e-9 && ekf.yaw() <= std::f64::consts::PI + 1e-9);
    }

    #[test]
    fn zupt_drives_velocity_to_zero() {
        let mut ekf = Ekf::new(config());
        ekf.predict(PdrIncrement { dx: 1.0, dy: 0.0, dz: 0.0, dpsi: 0.0, dt: 1.0 }, ActivityMode::Walking);
        assert!(ekf.velocity().0.abs() > 0.0);
        ekf.apply_zupt(true).unwrap();
        assert!(ekf.velocity().0.abs() < 1e-3);
    }
}
