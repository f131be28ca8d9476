//! Error taxonomy for the localization pipeline (`spec.md` §7).
//!
//! One enum for the whole crate surface, in the shape of the teacher's
//! `MotionTrackerError` (`motion-tracker-android/src/error.rs`):
//! named variants with `#[error("...")]` messages via `thiserror`.
//! Per-sample errors are logged and suppressed by the component that
//! raises them; only lifecycle errors (`initialize`, `start`,
//! `calibrate`) are expected to propagate to the caller as `Err`.

use thiserror::Error;

/// Reason a calibration attempt failed (`spec.md` §4.C, §7).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationReason {
    #[error("measured gravity outside [8, 12] m/s^2")]
    AberrantGravity,
    #[error("fewer than the required stable samples were collected")]
    InsufficientSamples,
    #[error("calibration did not finish within the hard timeout")]
    Timeout,
    #[error("motion exceeded acceptance thresholds throughout the window")]
    ExcessiveMotion,
}

/// A single unrecognized configuration key (`spec.md` §9).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized configuration key: {0}")]
pub struct ConfigurationError(pub String);

/// The label identifying which phase of the pipeline raised an error
/// (`spec.md` §7: "a `step` label identifying the phase").
pub type Step = &'static str;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocalizationError {
    #[error("[{step}] accelerometer or gyroscope unavailable")]
    SensorUnavailable { step: Step },

    #[error("[{step}] operation requires a prior call to initialize()")]
    NotInitialized { step: Step },

    #[error("[{step}] calibration failed: {reason} (progress={progress:.2})")]
    CalibrationFailed { step: Step, reason: CalibrationReason, progress: f32 },

    #[error("[{step}] supplied rotation matrix is not orthonormal")]
    InvalidRotationMatrix { step: Step },

    #[error("[{step}] non-monotonic timestamp, sample dropped")]
    OrderingViolation { step: Step },

    #[error("[{step}] EKF innovation covariance singular, measurement skipped")]
    SingularInnovation { step: Step },

    #[error("[{step}] dynamic heading offset out of acceptable range")]
    ExcessiveOffset { step: Step },

    #[error("[{step}] {0}", step = "configuration")]
    Configuration(#[from] ConfigurationError),
}

impl LocalizationError {
    /// Phase label for all variants (`spec.md` §7).
    pub fn step(&self) -> Step {
        match self {
            LocalizationError::SensorUnavailable { step }
            | LocalizationError::NotInitialized { step }
            | LocalizationError::CalibrationFailed { step, .. }
            | LocalizationError::InvalidRotationMatrix { step }
            | LocalizationError::OrderingViolation { step }
            | LocalizationError::SingularInnovation { step }
            | LocalizationError::ExcessiveOffset { step } => step,
            LocalizationError::Configuration(_) => "configuration",
        }
    }

    /// Progress fraction when meaningful, `None` otherwise.
    pub fn progress(&self) -> Option<f32> {
        match self {
            LocalizationError::CalibrationFailed { progress, .. } => Some(*progress),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LocalizationError>;
