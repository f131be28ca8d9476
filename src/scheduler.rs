//! Adaptive Sensor Scheduler (`spec.md` §4.G): motion-driven sample
//! rate and a low-power state machine.
//!
//! Modeled after the teacher's small state-tracking structs examined
//! each tick (`health_monitor.rs`, `restart_manager.rs`), but the
//! scheduling decision here is synchronous — no tokio timers on the
//! hot path.

use std::collections::VecDeque;

const MOTION_HISTORY_SAMPLES: usize = 10;
const MOTION_THRESHOLD: f64 = 2.0;
const LOW_MOTION_THRESHOLD: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorRate {
    Base,
    HalfBase,
    High,
    UltraLow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerEvent {
    pub rate: SensorRate,
    pub barometer_enabled: bool,
}

/// Base/High/UltraLow rate state machine driven by recent
/// accelerometer magnitudes.
pub struct SensorScheduler {
    base_rate_hz: f64,
    high_rate_hz: f64,
    ultra_low_rate_hz: f64,
    inactivity_timeout_ms: u64,

    recent_acc: VecDeque<f64>,
    rate: SensorRate,
    barometer_enabled: bool,
    low_power: bool,
    last_active_ms: u64,
}

impl SensorScheduler {
    pub fn new(base_rate_hz: f64, high_rate_hz: f64, ultra_low_rate_hz: f64, inactivity_timeout_ms: u64) -> Self {
        Self {
            base_rate_hz,
            high_rate_hz,
            ultra_low_rate_hz,
            inactivity_timeout_ms,
            recent_acc: VecDeque::with_capacity(MOTION_HISTORY_SAMPLES),
            rate: SensorRate::Base,
            barometer_enabled: true,
            low_power: false,
            last_active_ms: 0,
        }
    }

    pub fn rate(&self) -> SensorRate {
        self.rate
    }

    pub fn rate_hz(&self) -> f64 {
        match self.rate {
            SensorRate::Base => self.base_rate_hz,
            SensorRate::HalfBase => self.base_rate_hz / 2.0,
            SensorRate::High => self.high_rate_hz,
            SensorRate::UltraLow => self.ultra_low_rate_hz,
        }
    }

    pub fn is_low_power(&self) -> bool {
        self.low_power
    }

    pub fn barometer_enabled(&self) -> bool {
        self.barometer_enabled
    }

    /// Feed the latest accelerometer magnitude; returns `Some(event)`
    /// when the rate or energy regime changed.
    pub fn observe(&mut self, timestamp_ms: u64, acc_magnitude: f64) -> Option<SchedulerEvent> {
        if self.recent_acc.len() >= MOTION_HISTORY_SAMPLES {
            self.recent_acc.pop_front();
        }
        self.recent_acc.push_back(acc_magnitude);

        let n = self.recent_acc.len() as f64;
        let max_a = self.recent_acc.iter().cloned().fold(f64::MIN, f64::max);
        let mean: f64 = self.recent_acc.iter().sum::<f64>() / n;
        let variance: f64 = self.recent_acc.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;

        let sub_threshold = max_a < LOW_MOTION_THRESHOLD && variance < LOW_MOTION_THRESHOLD;
        if !sub_threshold {
            self.last_active_ms = timestamp_ms;
        }

        let was_low_power = self.low_power;
        if sub_threshold {
            if timestamp_ms.saturating_sub(self.last_active_ms) >= self.inactivity_timeout_ms {
                self.low_power = true;
            }
        } else {
            self.low_power = false;
        }

        let target_rate = if self.low_power {
            SensorRate::UltraLow
        } else if max_a > MOTION_THRESHOLD || variance > MOTION_THRESHOLD {
            SensorRate::High
        } else if sub_threshold {
            SensorRate::HalfBase
        } else {
            SensorRate::Base
        };

        let target_barometer_enabled = !self.low_power;

        let changed = target_rate != self.rate
            || target_barometer_enabled != self.barometer_enabled
            || was_low_power != self.low_power;

        self.rate = target_rate;
        self.barometer_enabled = target_barometer_enabled;

        if changed {
            if was_low_power && !self.low_power {
                log::info!(target: "localization::scheduler", "motion detected, exiting low-power regime");
            } else if !was_low_power && self.low_power {
                log::info!(target: "localization::scheduler", "inactivity timeout reached, entering low-power regime");
            }
            Some(SchedulerEvent { rate: self.rate, barometer_enabled: self.barometer_enabled })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_motion_below_inactivity_timeout_halves_base_rate() {
        let mut sched = SensorScheduler::new(25.0, 100.0, 5.0, 120_000);
        let mut last_rate = SensorRate::Base;
        for i in 0..20u64 {
            if let Some(e) = sched.observe(i * 40, 0.0) {
                last_rate = e.rate;
            }
        }
        assert_eq!(last_rate, SensorRate::HalfBase);
        assert!(!sched.is_low_power());
        assert!((sched.rate_hz() - 12.5).abs() < 1e-9);
    }

    #[test]
    fn high_motion_raises_rate() {
        let mut sched = SensorScheduler::new(25.0, 100.0, 5.0, 120_000);
        let mut last_rate = SensorRate::Base;
        for i in 0..12u64 {
            if let Some(e) = sched.observe(i * 40, 3.0) {
                last_rate = e.rate;
            }
        }
        assert_eq!(last_rate, SensorRate::High);
    }

    #[test]
    fn sustained_inactivity_enters_low_power_and_disables_barometer() {
        let mut sched = SensorScheduler::new(25.0, 100.0, 5.0, 1_000);
        let mut entered_low_power = false;
        for i in 0..100u64 {
            let t = i * 40;
            if let Some(e) = sched.observe(t, 0.0) {
                if e.rate == SensorRate::UltraLow {
                    entered_low_power = true;
                }
            }
        }
        assert!(entered_low_power);
        assert!(sched.is_low_power());
        assert!(!sched.barometer_enabled());
    }

    #[test]
    fn motion_burst_exits_low_power_immediately() {
        let mut sched = SensorScheduler::new(25.0, 100.0, 5.0, 1_000);
        for i in 0..100u64 {
            sched.observe(i * 40, 0.0);
        }
        assert!(sched.is_low_power());

        let event = sched.observe(100 * 40, 3.0).expect("rate should change");
        assert_ne!(event.rate, SensorRate::UltraLow);
        assert!(event.barometer_enabled);
        assert!(!sched.is_low_power());
    }
}
