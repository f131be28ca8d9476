//! Localization Facade (`spec.md` §4.H): lifecycle, component wiring,
//! and external event fan-out.
//!
//! The cyclic wiring between attitude, PDR, the EKF, and the two
//! calibrators (`spec.md` §9 "Cyclic wiring") is resolved by one-way
//! message passing within a single tick: each component's `update`
//! takes a snapshot and returns outputs consumed by the next in a
//! fixed order, rather than holding object back-references. Lifecycle
//! state machine grounded in the teacher's `Session`
//! (`motion-tracker-android/src/session.rs`, `Idle/Recording/Paused`),
//! here `Uninitialized/Calibrating/Running/Stopped`.

use std::sync::Arc;

use nalgebra::Vector3;

use crate::attitude::{AttitudeEvent, AttitudeTracker};
use crate::buffer::SensorFrameBuffer;
use crate::calibrator::{CalibrationMode, CalibratorOutcome, OrientationCalibrator};
use crate::config::LocalizationConfig;
use crate::ekf::{Ekf, EkfConfig, PdrIncrement};
use crate::error::{LocalizationError, Result};
use crate::heading_calibrator::DynamicHeadingCalibrator;
use crate::map_match::VectorMap;
use crate::pdr::{PdrEngine, UserCalibrationCapture};
use crate::scheduler::SensorScheduler;
use crate::types::{is_valid_rotation, ActivityMode, CalibrationBundle, RotationMatrix, SensorKind, SensorSample};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized,
    Calibrating,
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeSelection {
    Auto,
    Manual(ActivityMode),
}

#[derive(Clone, Debug)]
pub enum LocalizationEvent {
    DataUpdate { kind: SensorKind },
    StepDetected { index: u64, length_m: f64, x: f64, y: f64, psi: f64 },
    ModeChanged { mode: ActivityMode },
    PositionUpdate { x: f64, y: f64, psi: f64, mode: ActivityMode },
    CalibrationProgress { step: &'static str, progress: f32, message: &'static str },
    EnergyStatus { low_power: bool, rate_hz: f64 },
    UserCalibrationComplete { variance_min: f64, amplitude_min: f64, frequency_min: f64 },
}

/// The facade's public surface: lifecycle operations, sample ingest,
/// and ordered event emission (`spec.md` §4.H).
pub struct LocalizationFacade {
    config: LocalizationConfig,
    state: LifecycleState,

    buffer: SensorFrameBuffer,
    attitude: AttitudeTracker,
    pdr: PdrEngine,
    ekf: Ekf,
    heading_calibrator: DynamicHeadingCalibrator,
    scheduler: SensorScheduler,
    calibrator: Option<OrientationCalibrator>,

    calibration_bundle: CalibrationBundle,
    map: Option<Arc<dyn VectorMap>>,

    last_pdr_position_update_ms: Option<u64>,
    last_ekf_predict_ms: Option<u64>,
    latest_mag: Option<Vector3<f64>>,
    latest_baro_hpa: Option<f64>,
    user_calibration: Option<UserCalibrationCapture>,
}

impl LocalizationFacade {
    /// `initialize(map?)`: probe sensors, build components, load an
    /// optional vector map.
    pub fn initialize(config: LocalizationConfig, map: Option<Arc<dyn VectorMap>>) -> Result<Self> {
        log::info!(target: "localization::facade", "initializing localization facade");
        let ekf_config = EkfConfig {
            process_noise: config.process_noise,
            measurement_noise: config.measurement_noise,
            magnetometer_noise: config.magnetometer_noise,
            barometer_noise: config.barometer_noise,
        };
        let buffer_capacity = config.step_detection_window.max(50);
        let facade = Self {
            pdr: PdrEngine::new(
                config.user_height_m,
                config.height_ratio,
                config.zupt_threshold,
                config.zupt_duration_ms,
                config.step_detection_window,
            ),
            attitude: AttitudeTracker::new(&config),
            ekf: Ekf::new(ekf_config),
            heading_calibrator: DynamicHeadingCalibrator::new(
                config.dynamic_heading_enabled,
                config.min_steps_required,
                config.max_offset_rad,
                config.straight_line_threshold_m,
            ),
            scheduler: SensorScheduler::new(
                config.base_rate_hz,
                config.high_rate_hz,
                config.ultra_low_rate_hz,
                config.inactivity_timeout_ms,
            ),
            buffer: SensorFrameBuffer::with_capacity(buffer_capacity),
            calibrator: None,
            calibration_bundle: CalibrationBundle::identity(),
            map,
            last_pdr_position_update_ms: None,
            last_ekf_predict_ms: None,
            latest_mag: None,
            latest_baro_hpa: None,
            user_calibration: None,
            config,
            state: LifecycleState::Uninitialized,
        };
        Ok(facade)
    }

    fn require_initialized(&self, step: &'static str) -> Result<()> {
        if self.state == LifecycleState::Uninitialized {
            return Err(LocalizationError::NotInitialized { step });
        }
        Ok(())
    }

    /// `calibrate(progressSink)`: drive the Orientation Calibrator once.
    /// Returns the calibration bundle's new rotation on success.
    pub fn calibrate<F: FnMut(LocalizationEvent)>(
        &mut self,
        samples: impl Iterator<Item = (u64, Vector3<f64>, Vector3<f64>)>,
        mut progress_sink: F,
    ) -> Result<RotationMatrix> {
        self.state = LifecycleState::Calibrating;
        let mut calibrator = OrientationCalibrator::new(CalibrationMode::Strict);

        for (t, acc, gyro) in samples {
            let progress = calibrator.progress();
            progress_sink(LocalizationEvent::CalibrationProgress {
                step: "calibration",
                progress: progress.fraction,
                message: "collecting calibration samples",
            });

            if let Some(outcome) = calibrator.push(t, acc, gyro) {
                return match outcome {
                    CalibratorOutcome::Complete { rotation, avg_gravity: _ } => {
                        self.calibration_bundle.set_body_to_world_matrix(&rotation);
                        progress_sink(LocalizationEvent::CalibrationProgress {
                            step: "calibration",
                            progress: 1.0,
                            message: "calibration complete",
                        });
                        Ok(rotation)
                    }
                    CalibratorOutcome::Failed(reason) => {
                        let progress = calibrator.progress().fraction;
                        Err(LocalizationError::CalibrationFailed { step: "calibration", reason, progress })
                    }
                };
            }
        }

        Err(LocalizationError::CalibrationFailed {
            step: "calibration",
            reason: crate::error::CalibrationReason::InsufficientSamples,
            progress: calibrator.progress().fraction,
        })
    }

    /// `start(saved_rotation?, calibration_samples?)`: validate a saved
    /// rotation, or run calibration against `calibration_samples` if
    /// absent/invalid (`spec.md` §4.H "if invalid, run calibration");
    /// begin the sensor stream.
    pub fn start<I, F>(
        &mut self,
        saved_rotation: Option<RotationMatrix>,
        calibration_samples: Option<I>,
        progress_sink: F,
    ) -> Result<()>
    where
        I: Iterator<Item = (u64, Vector3<f64>, Vector3<f64>)>,
        F: FnMut(LocalizationEvent),
    {
        match saved_rotation {
            Some(r) if is_valid_rotation(&r) => {
                self.calibration_bundle.set_body_to_world_matrix(&r);
                log::info!(target: "localization::facade", "starting with saved rotation");
            }
            Some(_) => {
                log::warn!(target: "localization::facade", "saved rotation invalid, running calibration");
                let samples = calibration_samples.ok_or(LocalizationError::InvalidRotationMatrix { step: "start" })?;
                self.calibrate(samples, progress_sink)?;
            }
            None => {
                log::info!(target: "localization::facade", "no saved rotation, running calibration before start");
                let samples = calibration_samples.ok_or(LocalizationError::NotInitialized { step: "start" })?;
                self.calibrate(samples, progress_sink)?;
            }
        }
        self.state = LifecycleState::Running;
        Ok(())
    }

    /// `stop`: detach sensors, flush state.
    pub fn stop(&mut self) -> Result<()> {
        self.require_initialized("stop")?;
        self.state = LifecycleState::Stopped;
        log::info!(target: "localization::facade", "stopped");
        Ok(())
    }

    /// `reset_position(x,y,z,psi)`: atomically set PDR and EKF state.
    pub fn reset_position(&mut self, x: f64, y: f64, z: f64, psi: f64) -> Result<()> {
        self.require_initialized("fusion")?;
        self.pdr.reset_position(x, y, z, psi);
        self.ekf.reset_position(x, y, z, psi);
        Ok(())
    }

    /// `set_mode(auto | manual(m))`: toggle the classifier or pin a mode.
    pub fn set_mode(&mut self, selection: ModeSelection) {
        match selection {
            ModeSelection::Auto => self.pdr.set_mode_override(None),
            ModeSelection::Manual(m) => self.pdr.set_mode_override(Some(m)),
        }
    }

    /// `force_recalibration(reason)`: clear the mag-offset and
    /// retrigger dynamic calibration.
    pub fn force_recalibration(&mut self, reason: &str) {
        log::info!(target: "localization::facade", "forcing dynamic heading recalibration: {reason}");
        self.heading_calibrator.reset();
        self.calibration_bundle.mag_heading_offset = None;
    }

    pub fn calibration_bundle(&self) -> CalibrationBundle {
        self.calibration_bundle
    }

    /// Begin an optional two-phase user calibration capture (10 s
    /// normal walk, 10 s slow walk) that personalizes the PDR's
    /// classification thresholds (`spec.md` §4.D "User calibration").
    /// The result is applied automatically once both phases elapse.
    pub fn begin_user_calibration(&mut self) {
        log::info!(target: "localization::pdr", "starting user calibration capture");
        self.user_calibration = Some(UserCalibrationCapture::new());
    }

    /// Feed one raw sensor sample through the full pipeline, emitting
    /// events in the guaranteed order: `DataUpdate -> StepDetected? ->
    /// ModeChanged -> PositionUpdate` (`spec.md` §4.H "Ordering
    /// guarantee").
    pub fn feed_sample(&mut self, sample: SensorSample) -> Vec<LocalizationEvent> {
        let mut events = Vec::new();

        if let Err(e) = self.buffer.push(sample) {
            log::warn!(target: "localization::buffer", "{e}");
            return events;
        }
        events.push(LocalizationEvent::DataUpdate { kind: sample.kind });

        match sample.kind {
            SensorKind::Mag => {
                self.latest_mag = Some(sample.vector());
                return events;
            }
            SensorKind::Baro => {
                self.latest_baro_hpa = Some(sample.scalar);
                return events;
            }
            SensorKind::Gyro => return events,
            SensorKind::Acc => {}
        }

        if self.scheduler.observe(sample.timestamp_ms, sample.vector().norm()).is_some() {
            events.push(LocalizationEvent::EnergyStatus {
                low_power: self.scheduler.is_low_power(),
                rate_hz: self.scheduler.rate_hz(),
            });
        }

        let acc = sample.vector();
        let gyro_samples = self.buffer.drain(SensorKind::Gyro);
        let gyro = gyro_samples.last().map(|s| s.vector()).unwrap_or(Vector3::zeros());

        let rotation = self.calibration_bundle.body_to_world_matrix();
        let acc_world = rotation * acc;
        let gyro_world = rotation * gyro;

        for attitude_event in self.attitude.update(sample.timestamp_ms, acc_world, gyro_world, self.latest_mag) {
            if let AttitudeEvent::Recalibrated = attitude_event {
                self.calibration_bundle.set_body_to_world_matrix(&self.attitude.body_to_phone_matrix());
            }
        }

        let world_acc = self.attitude.quaternion().rotate(acc_world);
        let world_gyro = self.attitude.quaternion().rotate(gyro_world);

        let before = self.pdr.position();
        let before_yaw = self.pdr.yaw();
        let outputs = self.pdr.update(sample.timestamp_ms, world_acc, world_gyro);

        if let Some(capture) = self.user_calibration.as_mut() {
            let features = self.pdr.current_features();
            if let Some(result) = capture.push(sample.timestamp_ms, features) {
                self.pdr.apply_user_calibration(result);
                self.user_calibration = None;
                events.push(LocalizationEvent::UserCalibrationComplete {
                    variance_min: result.variance_min,
                    amplitude_min: result.amplitude_min,
                    frequency_min: result.frequency_min,
                });
            }
        }

        let (x, y, z) = outputs.position;
        let dx = x - before.0;
        let dy = y - before.1;
        let dz = z - before.2;
        let dpsi = outputs.yaw - before_yaw;
        let dt = self
            .last_ekf_predict_ms
            .map(|t| ((sample.timestamp_ms.saturating_sub(t)) as f64 / 1000.0).max(1e-6))
            .unwrap_or_else(|| 1.0 / self.scheduler.rate_hz());
        self.last_ekf_predict_ms = Some(sample.timestamp_ms);

        self.ekf.predict(PdrIncrement { dx, dy, dz, dpsi, dt }, self.pdr.mode());

        if let Some(baro_hpa) = self.latest_baro_hpa {
            if self.scheduler.barometer_enabled() {
                if let Err(e) = self.ekf.update_barometer(baro_hpa, self.calibration_bundle.baro_baseline_hpa) {
                    log::debug!(target: "localization::ekf", "{e}");
                }
            }
        }

        if let Some(mag) = self.latest_mag {
            let offset = self.calibration_bundle.mag_heading_offset.unwrap_or(0.0);
            if let Err(e) = self.ekf.update_magnetometer_heading(mag.x, mag.y, offset, 0.8) {
                log::debug!(target: "localization::ekf", "{e}");
            }
        }

        if let Err(e) = self.ekf.apply_zupt(outputs.zupt_active) {
            log::debug!(target: "localization::ekf", "{e}");
        }

        let rate_limited = self
            .last_pdr_position_update_ms
            .map(|t| sample.timestamp_ms.saturating_sub(t) >= 1_000)
            .unwrap_or(true);
        if rate_limited {
            self.last_pdr_position_update_ms = Some(sample.timestamp_ms);
            if let Err(e) = self.ekf.update_pdr_position(x, y, self.pdr.mode()) {
                log::debug!(target: "localization::ekf", "{e}");
            }
            if let Err(e) = self.ekf.update_pdr_yaw(outputs.yaw, self.pdr.mode()) {
                log::debug!(target: "localization::ekf", "{e}");
            }
        }

        if let Some(map) = &self.map {
            if let Some((projection, _distance)) = map.nearest_wall((x, y), 2.0) {
                if let Err(e) = self.ekf.update_map_match(projection.x, projection.y, self.config.measurement_noise) {
                    log::debug!(target: "localization::ekf", "{e}");
                }
            }
        }

        if let Some(step) = outputs.step {
            events.push(LocalizationEvent::StepDetected {
                index: step.index,
                length_m: step.length_m,
                x,
                y,
                psi: outputs.yaw,
            });

            if let Some(mag) = self.latest_mag {
                let mag_heading = mag.y.atan2(mag.x);
                match self.heading_calibrator.observe_step(x, y, mag_heading) {
                    Ok(Some(result)) => {
                        self.calibration_bundle.mag_heading_offset = Some(result.offset_rad);
                        self.pdr.apply_heading_offset(result.offset_rad);
                        self.ekf.apply_heading_offset(result.offset_rad);
                        log::info!(
                            target: "localization::heading_cal",
                            "dynamic heading calibration converged (snapped={})",
                            result.snapped_upside_down
                        );
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!(target: "localization::heading_cal", "{e}"),
                }
            }
        }

        if let Some(mode) = outputs.mode_changed {
            events.push(LocalizationEvent::ModeChanged { mode });
        }

        let (ekf_x, ekf_y, _) = self.ekf.position();
        events.push(LocalizationEvent::PositionUpdate { x: ekf_x, y: ekf_y, psi: self.ekf.yaw(), mode: self.pdr.mode() });

        events
    }

    pub fn confidence(&self) -> f64 {
        self.ekf.confidence()
    }

    pub fn position(&self) -> (f64, f64, f64) {
        self.ekf.position()
    }

    pub fn velocity(&self) -> (f64, f64, f64) {
        self.ekf.velocity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LocalizationConfig {
        LocalizationConfig::default()
    }

    type NoSamples = std::iter::Empty<(u64, Vector3<f64>, Vector3<f64>)>;

    #[test]
    fn start_without_calibration_requires_rotation() {
        let mut facade = LocalizationFacade::initialize(config(), None).unwrap();
        let err = facade.start::<NoSamples, _>(None, None, |_| {}).unwrap_err();
        assert_eq!(err.step(), "start");
    }

    #[test]
    fn start_with_identity_rotation_succeeds() {
        let mut facade = LocalizationFacade::initialize(config(), None).unwrap();
        facade.start::<NoSamples, _>(Some(RotationMatrix::identity()), None, |_| {}).unwrap();
        assert_eq!(facade.state, LifecycleState::Running);
    }

    #[test]
    fn start_with_invalid_rotation_runs_calibration_from_samples() {
        let mut facade = LocalizationFacade::initialize(config(), None).unwrap();
        let bad = RotationMatrix::zeros();
        let samples = (0..50u64).map(|i| (i * 10, Vector3::new(0.0, 0.0, 9.81), Vector3::zeros()));
        facade.start(Some(bad), Some(samples), |_| {}).unwrap();
        assert_eq!(facade.state, LifecycleState::Running);
    }

    #[test]
    fn feed_sample_emits_data_update_first() {
        let mut facade = LocalizationFacade::initialize(config(), None).unwrap();
        facade.start::<NoSamples, _>(Some(RotationMatrix::identity()), None, |_| {}).unwrap();
        let events = facade.feed_sample(SensorSample::acc(0, 0.0, 0.0, 9.81));
        assert!(matches!(events[0], LocalizationEvent::DataUpdate { kind: SensorKind::Acc }));
    }

    #[test]
    fn reset_position_updates_both_pdr_and_ekf() {
        let mut facade = LocalizationFacade::initialize(config(), None).unwrap();
        facade.start::<NoSamples, _>(Some(RotationMatrix::identity()), None, |_| {}).unwrap();
        facade.reset_position(2.0, 3.0, 0.0, 0.5).unwrap();
        let (x, y, _) = facade.position();
        assert!((x - 2.0).abs() < 1e-6);
        assert!((y - 3.0).abs() < 1e-6);
    }
}
