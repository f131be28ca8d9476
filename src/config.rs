//! Configuration record (`spec.md` §6). All fields optional with
//! defaults; unrecognized keys in an external override map produce
//! `ConfigurationError` rather than being silently ignored
//! (`spec.md` §9 "Configuration").

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    // ── User ──
    pub user_height_m: f64,

    // ── Rates (Hz) ──
    pub base_rate_hz: f64,
    pub high_rate_hz: f64,
    pub ultra_low_rate_hz: f64,

    // ── PDR ──
    pub default_step_length_m: f64,
    pub height_ratio: f64,
    pub step_detection_window: usize,
    pub zupt_threshold: f64,
    pub zupt_duration_ms: u64,

    // ── EKF ──
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub magnetometer_noise: f64,
    pub barometer_noise: f64,

    // ── Attitude ──
    pub beta0: f64,
    pub stability_acc_threshold: f64,
    pub stability_gyro_threshold: f64,
    pub recalibration_interval_ms: u64,

    // ── Dynamic heading calibration ──
    pub dynamic_heading_enabled: bool,
    pub min_steps_required: usize,
    pub max_offset_rad: f64,
    pub straight_line_threshold_m: f64,

    // ── Energy ──
    pub adaptive_sampling: bool,
    pub battery_optimization: bool,
    pub inactivity_timeout_ms: u64,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            user_height_m: 1.7,

            base_rate_hz: 25.0,
            high_rate_hz: 100.0,
            ultra_low_rate_hz: 5.0,

            default_step_length_m: 0.7,
            height_ratio: 0.4,
            step_detection_window: 30,
            zupt_threshold: 0.1,
            zupt_duration_ms: 300,

            process_noise: 0.25,
            measurement_noise: 0.1,
            magnetometer_noise: 0.2,
            barometer_noise: 1.0,

            beta0: 0.1,
            stability_acc_threshold: 0.2,
            stability_gyro_threshold: 0.1,
            recalibration_interval_ms: 30_000,

            dynamic_heading_enabled: true,
            min_steps_required: 3,
            max_offset_rad: 1.2,
            straight_line_threshold_m: 0.3,

            adaptive_sampling: true,
            battery_optimization: true,
            inactivity_timeout_ms: 120_000,
        }
    }
}

impl LocalizationConfig {
    /// The full set of recognized override keys, used to reject
    /// unknown fields instead of silently ignoring them.
    const RECOGNIZED_KEYS: &'static [&'static str] = &[
        "user_height_m",
        "base_rate_hz",
        "high_rate_hz",
        "ultra_low_rate_hz",
        "default_step_length_m",
        "height_ratio",
        "step_detection_window",
        "zupt_threshold",
        "zupt_duration_ms",
        "process_noise",
        "measurement_noise",
        "magnetometer_noise",
        "barometer_noise",
        "beta0",
        "stability_acc_threshold",
        "stability_gyro_threshold",
        "recalibration_interval_ms",
        "dynamic_heading_enabled",
        "min_steps_required",
        "max_offset_rad",
        "straight_line_threshold_m",
        "adaptive_sampling",
        "battery_optimization",
        "inactivity_timeout_ms",
    ];

    /// Build a config by applying a partial JSON object on top of
    /// `Default::default()`. Any key not in `RECOGNIZED_KEYS` is
    /// rejected with `ConfigurationError` before anything is applied.
    pub fn from_overrides(overrides: &Value) -> Result<Self, ConfigurationError> {
        let object = overrides
            .as_object()
            .ok_or_else(|| ConfigurationError("overrides must be a JSON object".to_string()))?;

        for key in object.keys() {
            if !Self::RECOGNIZED_KEYS.contains(&key.as_str()) {
                return Err(ConfigurationError(key.clone()));
            }
        }

        let mut merged = serde_json::to_value(Self::default())
            .expect("LocalizationConfig always serializes");
        if let Value::Object(ref mut base) = merged {
            for (k, v) in object {
                base.insert(k.clone(), v.clone());
            }
        }

        serde_json::from_value(merged)
            .map_err(|e| ConfigurationError(format!("malformed override value: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_spec() {
        let c = LocalizationConfig::default();
        assert_eq!(c.user_height_m, 1.7);
        assert_eq!(c.base_rate_hz, 25.0);
        assert_eq!(c.high_rate_hz, 100.0);
        assert_eq!(c.ultra_low_rate_hz, 5.0);
        assert_eq!(c.step_detection_window, 30);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let overrides = json!({ "not_a_real_field": 1.0 });
        let err = LocalizationConfig::from_overrides(&overrides).unwrap_err();
        assert_eq!(err.0, "not_a_real_field");
    }

    #[test]
    fn known_key_overrides_default() {
        let overrides = json!({ "user_height_m": 1.9, "base_rate_hz": 50.0 });
        let c = LocalizationConfig::from_overrides(&overrides).unwrap();
        assert_eq!(c.user_height_m, 1.9);
        assert_eq!(c.base_rate_hz, 50.0);
        assert_eq!(c.step_detection_window, 30);
    }
}
