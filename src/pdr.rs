//! Pedestrian Dead Reckoning engine (`spec.md` §4.D): step detection,
//! activity classification, dynamic step length, orientation
//! integration, and ZUPT.
//!
//! Structured as a pure computation module with no tokio/async
//! dependency, the way the teacher's `sensor_fusion.rs` keeps its core
//! fusion logic independent of the runtime driving sample delivery.

use std::collections::VecDeque;

use nalgebra::Vector3;

use crate::types::{normalize_angle, ActivityMode, StepEvent};

const MAGNITUDE_HISTORY_SAMPLES: usize = 50; // ~2 s at 25 Hz
const BALLOT_CAPACITY: usize = 20;
const MODE_UPDATE_INTERVAL_MS: u64 = 1_000;
const ZUPT_HISTORY_SAMPLES: usize = 5;
const STEP_LENGTH_SMOOTHING_ALPHA: f64 = 0.05;

const DEFAULT_VARIANCE_MIN: f64 = 0.025;
const DEFAULT_AMPLITUDE_MIN: f64 = 0.3;
const DEFAULT_FREQUENCY_MIN: f64 = 0.2;

const USER_CALIBRATION_NORMAL_PHASE_MS: u64 = 10_000;
const USER_CALIBRATION_SLOW_PHASE_MS: u64 = 10_000;
const USER_CALIBRATION_RATIO: f64 = 0.75; // within the 70-80% band

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ModeOverride {
    Auto,
    Manual(ActivityMode),
}

#[derive(Clone, Copy, Debug)]
struct ClassificationFeatures {
    acc_variance: f64,
    step_frequency: f64,
    peak_amplitude: f64,
}

#[derive(Clone, Copy, Debug)]
struct Vote {
    mode: ActivityMode,
    weight: f64,
}

/// Personalized classification thresholds from an optional user
/// calibration capture (`spec.md` §4.D "User calibration").
#[derive(Clone, Copy, Debug)]
pub struct UserCalibrationResult {
    pub variance_min: f64,
    pub amplitude_min: f64,
    pub frequency_min: f64,
}

/// Two-phase capture session (10 s normal walk, 10 s slow walk) that
/// derives personalized activity-classification thresholds as the
/// slow-walk-phase means scaled into the 70-80% band (`spec.md` §4.D
/// "User calibration"). The first phase is discarded; only the
/// slow-walk phase feeds the result.
pub struct UserCalibrationCapture {
    started_at_ms: Option<u64>,
    slow_phase_samples: Vec<(f64, f64, f64)>,
}

impl UserCalibrationCapture {
    pub fn new() -> Self {
        Self { started_at_ms: None, slow_phase_samples: Vec::new() }
    }

    /// Feed one `(acc_variance, peak_amplitude, step_frequency)`
    /// snapshot. Returns `Some(result)` once both phases have elapsed.
    pub fn push(&mut self, timestamp_ms: u64, features: (f64, f64, f64)) -> Option<UserCalibrationResult> {
        let started_at = *self.started_at_ms.get_or_insert(timestamp_ms);
        let elapsed = timestamp_ms.saturating_sub(started_at);

        if elapsed < USER_CALIBRATION_NORMAL_PHASE_MS {
            return None;
        }
        if elapsed < USER_CALIBRATION_NORMAL_PHASE_MS + USER_CALIBRATION_SLOW_PHASE_MS {
            self.slow_phase_samples.push(features);
            return None;
        }

        if self.slow_phase_samples.is_empty() {
            return None;
        }
        let n = self.slow_phase_samples.len() as f64;
        let (sum_v, sum_a, sum_f) = self
            .slow_phase_samples
            .iter()
            .fold((0.0, 0.0, 0.0), |(av, aa, af), (v, a, f)| (av + v, aa + a, af + f));

        Some(UserCalibrationResult {
            variance_min: (sum_v / n) * USER_CALIBRATION_RATIO,
            amplitude_min: (sum_a / n) * USER_CALIBRATION_RATIO,
            frequency_min: (sum_f / n) * USER_CALIBRATION_RATIO,
        })
    }
}

impl Default for UserCalibrationCapture {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PdrOutputs {
    pub step: Option<StepEvent>,
    pub mode_changed: Option<ActivityMode>,
    pub position: (f64, f64, f64),
    pub yaw: f64,
    pub zupt_active: bool,
    pub velocity: Vector3<f64>,
}

/// Pedestrian Dead Reckoning state machine.
pub struct PdrEngine {
    height_m: f64,
    height_ratio: f64,
    zupt_threshold: f64,
    zupt_duration_ms: u64,
    step_window_samples: usize,

    variance_min: f64,
    amplitude_min: f64,
    frequency_min: f64,

    magnitude_history: VecDeque<f64>,
    step_window: VecDeque<(u64, f64)>,

    ballot: VecDeque<Vote>,
    mode: ActivityMode,
    mode_override: ModeOverride,
    last_mode_update_ms: Option<u64>,
    last_features: ClassificationFeatures,

    last_step_ms: Option<u64>,
    step_length_m: f64,
    step_index: u64,
    baseline_sigma: f64,
    warm_up_samples: usize,

    acc_recent: VecDeque<f64>,
    zupt_active: bool,
    zupt_stable_since_ms: Option<u64>,

    x: f64,
    y: f64,
    z: f64,
    yaw: f64,
    pitch: f64,
    roll: f64,
    velocity: Vector3<f64>,

    last_timestamp_ms: Option<u64>,
}

impl PdrEngine {
    pub fn new(
        height_m: f64,
        height_ratio: f64,
        zupt_threshold: f64,
        zupt_duration_ms: u64,
        step_detection_window: usize,
    ) -> Self {
        Self {
            height_m,
            height_ratio,
            zupt_threshold,
            zupt_duration_ms,
            step_window_samples: step_detection_window,
            variance_min: DEFAULT_VARIANCE_MIN,
            amplitude_min: DEFAULT_AMPLITUDE_MIN,
            frequency_min: DEFAULT_FREQUENCY_MIN,
            magnitude_history: VecDeque::with_capacity(MAGNITUDE_HISTORY_SAMPLES),
            step_window: VecDeque::with_capacity(step_detection_window),
            ballot: VecDeque::with_capacity(BALLOT_CAPACITY),
            mode: ActivityMode::Stationary,
            mode_override: ModeOverride::Auto,
            last_mode_update_ms: None,
            last_features: ClassificationFeatures { acc_variance: 0.0, step_frequency: 0.0, peak_amplitude: 0.0 },
            last_step_ms: None,
            step_length_m: height_m * height_ratio,
            step_index: 0,
            baseline_sigma: 0.5,
            warm_up_samples: 0,
            acc_recent: VecDeque::with_capacity(ZUPT_HISTORY_SAMPLES),
            zupt_active: false,
            zupt_stable_since_ms: None,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            velocity: Vector3::zeros(),
            last_timestamp_ms: None,
        }
    }

    pub fn set_mode_override(&mut self, mode: Option<ActivityMode>) {
        self.mode_override = match mode {
            Some(m) => ModeOverride::Manual(m),
            None => ModeOverride::Auto,
        };
    }

    /// Adopt personalized thresholds from a completed user calibration
    /// capture (`spec.md` §4.D "User calibration").
    pub fn apply_user_calibration(&mut self, result: UserCalibrationResult) {
        self.variance_min = result.variance_min;
        self.amplitude_min = result.amplitude_min;
        self.frequency_min = result.frequency_min;
        log::info!(
            target: "localization::pdr",
            "user calibration applied: variance_min={:.4} amplitude_min={:.3} frequency_min={:.3}",
            self.variance_min, self.amplitude_min, self.frequency_min
        );
    }

    /// Snapshot of the most recently computed classification features,
    /// fed into a [`UserCalibrationCapture`] by the caller.
    pub fn current_features(&self) -> (f64, f64, f64) {
        (self.last_features.acc_variance, self.last_features.peak_amplitude, self.last_features.step_frequency)
    }

    pub fn reset_position(&mut self, x: f64, y: f64, z: f64, yaw: f64) {
        self.x = x;
        self.y = y;
        self.z = z;
        self.yaw = normalize_angle(yaw);
    }

    /// Retroactively rotate the accumulated position around the
    /// origin and bump yaw, used by the dynamic heading calibrator
    /// (`spec.md` §4.F step 6).
    pub fn apply_heading_offset(&mut self, offset: f64) {
        let (s, c) = (-offset).sin_cos();
        let new_x = self.x * c - self.y * s;
        let new_y = self.x * s + self.y * c;
        self.x = new_x;
        self.y = new_y;
        self.yaw = normalize_angle(self.yaw + offset);
    }

    pub fn position(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }

    pub fn yaw(&self) -> f64 {
        self.yaw
    }

    pub fn mode(&self) -> ActivityMode {
        self.mode
    }

    pub fn is_zupt_active(&self) -> bool {
        self.zupt_active
    }

    /// Advance the barometer-derived altitude by a clamped delta
    /// (`spec.md` §4.D "z changes only by barometer delta").
    pub fn apply_altitude_delta(&mut self, delta_z: f64) {
        self.z += delta_z.clamp(-1.0, 1.0);
    }

    /// Feed one attitude-corrected acc+gyro sample.
    pub fn update(&mut self, timestamp_ms: u64, acc: Vector3<f64>, gyro: Vector3<f64>) -> PdrOutputs {
        let dt = match self.last_timestamp_ms {
            Some(last) => ((timestamp_ms - last) as f64 / 1000.0).max(1e-4),
            None => 1.0 / 25.0,
        };
        self.last_timestamp_ms = Some(timestamp_ms);

        self.integrate_orientation(gyro, dt);

        let magnitude = acc.norm();
        self.push_magnitude(magnitude);
        self.push_zupt_sample(magnitude, timestamp_ms);

        let features = self.classify_window();
        self.last_features = features;
        self.cast_vote(features, timestamp_ms);

        let mode_changed = self.maybe_elect_mode(timestamp_ms);

        let step = self.detect_step(timestamp_ms, magnitude, features);

        PdrOutputs {
            step,
            mode_changed,
            position: self.position(),
            yaw: self.yaw,
            zupt_active: self.zupt_active,
            velocity: self.velocity,
        }
    }

    fn integrate_orientation(&mut self, gyro: Vector3<f64>, dt: f64) {
        let gz = gyro.z.clamp(-10.0, 10.0);
        self.yaw = normalize_angle(self.yaw + gz * dt);
        self.pitch = normalize_angle(self.pitch + gyro.x.clamp(-10.0, 10.0) * dt * 0.1);
        self.roll = normalize_angle(self.roll + gyro.y.clamp(-10.0, 10.0) * dt * 0.1);
    }

    fn push_magnitude(&mut self, magnitude: f64) {
        if self.magnitude_history.len() >= MAGNITUDE_HISTORY_SAMPLES {
            self.magnitude_history.pop_front();
        }
        self.magnitude_history.push_back(magnitude);
        self.warm_up_samples += 1;
    }

    fn push_zupt_sample(&mut self, magnitude: f64, timestamp_ms: u64) {
        if self.acc_recent.len() >= ZUPT_HISTORY_SAMPLES {
            self.acc_recent.pop_front();
        }
        self.acc_recent.push_back(magnitude);

        if self.acc_recent.len() < ZUPT_HISTORY_SAMPLES {
            return;
        }
        let n = self.acc_recent.len() as f64;
        let mean: f64 = self.acc_recent.iter().sum::<f64>() / n;
        let variance: f64 = self.acc_recent.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;

        if variance < self.zupt_threshold {
            if self.zupt_stable_since_ms.is_none() {
                self.zupt_stable_since_ms = Some(timestamp_ms);
            }
            let stable_for = timestamp_ms.saturating_sub(self.zupt_stable_since_ms.unwrap());
            if stable_for >= self.zupt_duration_ms && !self.zupt_active {
                self.zupt_active = true;
                log::debug!(target: "localization::pdr", "ZUPT engaged");
            }
        } else {
            self.zupt_stable_since_ms = None;
            if self.zupt_active {
                self.zupt_active = false;
                log::debug!(target: "localization::pdr", "ZUPT released");
            }
        }

        if self.zupt_active {
            self.velocity *= 0.1;
        }
    }

    fn classify_window(&self) -> ClassificationFeatures {
        if self.step_window.is_empty() {
            return ClassificationFeatures { acc_variance: 0.0, step_frequency: 0.0, peak_amplitude: 0.0 };
        }
        let values: Vec<f64> = self.step_window.iter().map(|(_, m)| *m).collect();
        let n = values.len() as f64;
        let mean: f64 = values.iter().sum::<f64>() / n;
        let variance: f64 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        let mut peaks = 0usize;
        let mut peak_amplitude: f64 = 0.0;
        for i in 1..values.len().saturating_sub(1) {
            if values[i] > values[i - 1] && values[i] > values[i + 1] {
                peaks += 1;
                peak_amplitude = peak_amplitude.max((values[i] - mean).abs());
            }
        }
        let span_s = self
            .step_window
            .back()
            .zip(self.step_window.front())
            .map(|((t1, _), (t0, _))| ((*t1 - *t0) as f64 / 1000.0).max(1e-3))
            .unwrap_or(1.0);
        let step_frequency = peaks as f64 / span_s;

        ClassificationFeatures { acc_variance: variance, step_frequency, peak_amplitude }
    }

    fn classify_candidate(&self, features: ClassificationFeatures) -> ActivityMode {
        if features.acc_variance < self.variance_min {
            return ActivityMode::Stationary;
        }
        if features.peak_amplitude < 0.5 && features.acc_variance < 0.1 && features.step_frequency < 1.0 {
            return ActivityMode::Crawling;
        }
        if features.step_frequency >= 2.5 {
            return ActivityMode::Running;
        }
        if features.step_frequency >= self.frequency_min
            && features.step_frequency < 2.5
            && features.peak_amplitude >= self.amplitude_min
        {
            if features.peak_amplitude > 1.0 && features.step_frequency > 1.6 {
                return ActivityMode::Running;
            }
            return ActivityMode::Walking;
        }
        ActivityMode::Walking
    }

    fn cast_vote(&mut self, features: ClassificationFeatures, _timestamp_ms: u64) {
        let candidate = self.classify_candidate(features);
        let mut weight = 1.0;

        let near_soft_walking_threshold = (features.step_frequency - self.frequency_min).abs() < 0.1
            || (features.step_frequency - 2.5).abs() < 0.1;
        if candidate == ActivityMode::Walking && near_soft_walking_threshold {
            weight *= 1.5;
        }
        if self.mode == ActivityMode::Stationary && candidate == ActivityMode::Walking {
            weight *= 1.4;
        }
        if candidate == ActivityMode::Stationary && features.acc_variance > 0.015 {
            weight *= 0.8;
        }

        if self.ballot.len() >= BALLOT_CAPACITY {
            self.ballot.pop_front();
        }
        self.ballot.push_back(Vote { mode: candidate, weight });
    }

    fn maybe_elect_mode(&mut self, timestamp_ms: u64) -> Option<ActivityMode> {
        if let ModeOverride::Manual(m) = self.mode_override {
            if self.mode != m {
                self.mode = m;
                return Some(m);
            }
            return None;
        }

        let due = match self.last_mode_update_ms {
            Some(last) => timestamp_ms.saturating_sub(last) >= MODE_UPDATE_INTERVAL_MS,
            None => true,
        };
        if !due || self.ballot.is_empty() {
            return None;
        }
        self.last_mode_update_ms = Some(timestamp_ms);

        let total_weight: f64 = self.ballot.iter().map(|v| v.weight).sum();
        let mut tally: std::collections::HashMap<ActivityMode, f64> = std::collections::HashMap::new();
        for vote in &self.ballot {
            *tally.entry(vote.mode).or_insert(0.0) += vote.weight;
        }
        let (winner, winner_weight) = tally
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .unwrap_or((self.mode, 0.0));

        let share = if total_weight > 0.0 { winner_weight / total_weight } else { 0.0 };
        let required_share = if self.mode == ActivityMode::Stationary && winner == ActivityMode::Walking {
            0.4
        } else {
            0.5
        };

        if share >= required_share && winner != self.mode {
            self.mode = winner;
            log::info!(target: "localization::pdr", "activity mode -> {winner}");
            Some(winner)
        } else {
            None
        }
    }

    fn mode_coefficient(&self) -> f64 {
        match self.mode {
            ActivityMode::Running => 0.2,
            ActivityMode::Walking => 0.3,
            ActivityMode::Crawling => 0.5,
            ActivityMode::Stationary => 0.4,
        }
    }

    fn mode_ceiling(&self) -> f64 {
        match self.mode {
            ActivityMode::Running => 3.0,
            ActivityMode::Walking => 2.0,
            ActivityMode::Crawling => 1.5,
            ActivityMode::Stationary => 1.0,
        }
    }

    fn detect_step(
        &mut self,
        timestamp_ms: u64,
        magnitude: f64,
        features: ClassificationFeatures,
    ) -> Option<StepEvent> {
        self.step_window.push_back((timestamp_ms, magnitude));
        if self.step_window.len() > self.step_window_samples {
            self.step_window.pop_front();
        }
        if self.step_window.len() < self.step_window_samples {
            return None;
        }

        let values: Vec<f64> = self.step_window.iter().map(|(_, m)| *m).collect();
        let n = values.len() as f64;
        let mean: f64 = values.iter().sum::<f64>() / n;
        let detrended: Vec<f64> = values.iter().map(|m| (m - mean).abs()).collect();

        let d_mean: f64 = detrended.iter().sum::<f64>() / n;
        let d_var: f64 = detrended.iter().map(|d| (d - d_mean).powi(2)).sum::<f64>() / n;
        let d_sigma = d_var.sqrt();

        if self.warm_up_samples > 100 {
            self.baseline_sigma = d_sigma;
        }

        let mut k = self.mode_coefficient();
        if self.warm_up_samples > 100 {
            let scale = (self.baseline_sigma / 0.5).clamp(0.5, 2.0);
            k = (k * scale).min(self.mode_ceiling());
        }

        let threshold = (d_mean + k * d_sigma).clamp(0.01, 2.0);

        let last_idx = detrended.len() - 1;
        if last_idx < 1 {
            return None;
        }
        let mid = last_idx - 1;
        if mid == 0 {
            return None;
        }
        let is_peak = detrended[mid] > detrended[mid - 1]
            && detrended[mid] > detrended[mid + 1]
            && detrended[mid] > threshold;

        if !is_peak {
            return None;
        }

        let guard_ms = self.inter_step_guard_ms(features.step_frequency);
        if let Some(last) = self.last_step_ms {
            if timestamp_ms.saturating_sub(last) < guard_ms {
                return None;
            }
        }

        if self.mode == ActivityMode::Stationary {
            return None;
        }

        self.last_step_ms = Some(timestamp_ms);
        let peak_amplitude = detrended[mid];

        let amplitude_factor = (0.7 + 0.4 * (peak_amplitude / threshold.max(1e-6)).clamp(0.0, 1.0)).clamp(0.7, 1.1);
        let mode_factor = match self.mode {
            ActivityMode::Running => 1.2,
            ActivityMode::Walking => 1.0,
            ActivityMode::Crawling => 0.3,
            ActivityMode::Stationary => 0.0,
        };
        let raw_length =
            (self.height_m * self.height_ratio * amplitude_factor * mode_factor).clamp(0.3, 1.2);
        self.step_length_m =
            self.step_length_m + STEP_LENGTH_SMOOTHING_ALPHA * (raw_length - self.step_length_m);

        self.x += self.step_length_m * self.yaw.cos();
        self.y += self.step_length_m * self.yaw.sin();
        self.step_index += 1;

        Some(StepEvent {
            index: self.step_index,
            length_m: self.step_length_m,
            timestamp_ms,
            peak_amplitude,
        })
    }

    fn inter_step_guard_ms(&self, frequency: f64) -> u64 {
        match self.mode {
            ActivityMode::Running => 200,
            _ => {
                if frequency < 1.0 {
                    (800.0 / frequency.max(1e-3)).clamp(400.0, 1500.0) as u64
                } else if frequency < 1.5 {
                    400
                } else {
                    250
                }
            }
        }
    }
}
