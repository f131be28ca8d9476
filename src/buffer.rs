//! Sensor Frame Buffer (`spec.md` §4.A).
//!
//! One bounded ring per `SensorKind`, in the shape of the teacher's
//! `push_to_bounded_queue_with_logging` (`motion-tracker-android/src/session.rs`):
//! drop the oldest entry and log at capacity rather than block or grow
//! unbounded. Non-monotonic timestamps are rejected outright rather
//! than silently reordered.

use std::collections::VecDeque;

use crate::error::{LocalizationError, Result};
use crate::types::{SensorKind, SensorSample};

const DEFAULT_CAPACITY: usize = 256;

struct Ring {
    samples: VecDeque<SensorSample>,
    capacity: usize,
    last_timestamp_ms: Option<u64>,
    dropped: u64,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            last_timestamp_ms: None,
            dropped: 0,
        }
    }

    fn push(&mut self, sample: SensorSample, step: &'static str) -> Result<()> {
        if let Some(last) = self.last_timestamp_ms {
            if sample.timestamp_ms <= last {
                log::warn!(
                    target: "localization::buffer",
                    "non-monotonic timestamp ({} <= {}), dropping sample",
                    sample.timestamp_ms, last
                );
                return Err(LocalizationError::OrderingViolation { step });
            }
        }
        self.last_timestamp_ms = Some(sample.timestamp_ms);

        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
            self.dropped += 1;
            log::warn!(
                target: "localization::buffer",
                "buffer at capacity ({}/{}), oldest sample dropped",
                self.capacity, self.capacity
            );
        }
        self.samples.push_back(sample);
        Ok(())
    }
}

/// Bounded per-kind ring buffer holding recent sensor samples for the
/// fusion pipeline to drain (`spec.md` §4.A).
pub struct SensorFrameBuffer {
    acc: Ring,
    gyro: Ring,
    mag: Ring,
    baro: Ring,
}

impl SensorFrameBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            acc: Ring::new(capacity),
            gyro: Ring::new(capacity),
            mag: Ring::new(capacity),
            baro: Ring::new(capacity),
        }
    }

    fn ring_mut(&mut self, kind: SensorKind) -> &mut Ring {
        match kind {
            SensorKind::Acc => &mut self.acc,
            SensorKind::Gyro => &mut self.gyro,
            SensorKind::Mag => &mut self.mag,
            SensorKind::Baro => &mut self.baro,
        }
    }

    fn ring(&self, kind: SensorKind) -> &Ring {
        match kind {
            SensorKind::Acc => &self.acc,
            SensorKind::Gyro => &self.gyro,
            SensorKind::Mag => &self.mag,
            SensorKind::Baro => &self.baro,
        }
    }

    /// Push a sample into the ring for its kind. Rejects non-monotonic
    /// timestamps per kind with `OrderingViolation`.
    pub fn push(&mut self, sample: SensorSample) -> Result<()> {
        self.ring_mut(sample.kind).push(sample, "buffer")
    }

    /// Drain all buffered samples for a kind in arrival order.
    pub fn drain(&mut self, kind: SensorKind) -> Vec<SensorSample> {
        self.ring_mut(kind).samples.drain(..).collect()
    }

    pub fn len(&self, kind: SensorKind) -> usize {
        self.ring(kind).samples.len()
    }

    pub fn is_empty(&self, kind: SensorKind) -> bool {
        self.len(kind) == 0
    }

    pub fn dropped_count(&self, kind: SensorKind) -> u64 {
        self.ring(kind).dropped
    }
}

impl Default for SensorFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain_preserves_order() {
        let mut buf = SensorFrameBuffer::new();
        for t in [10, 20, 30] {
            buf.push(SensorSample::acc(t, 0.0, 0.0, 9.8)).unwrap();
        }
        let drained = buf.drain(SensorKind::Acc);
        let timestamps: Vec<u64> = drained.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
        assert!(buf.is_empty(SensorKind::Acc));
    }

    #[test]
    fn non_monotonic_timestamp_is_rejected() {
        let mut buf = SensorFrameBuffer::new();
        buf.push(SensorSample::acc(100, 0.0, 0.0, 9.8)).unwrap();
        let err = buf.push(SensorSample::acc(100, 0.0, 0.0, 9.8)).unwrap_err();
        assert_eq!(err.step(), "buffer");
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let mut buf = SensorFrameBuffer::with_capacity(2);
        for t in [1, 2, 3] {
            buf.push(SensorSample::acc(t, 0.0, 0.0, 9.8)).unwrap();
        }
        assert_eq!(buf.len(SensorKind::Acc), 2);
        assert_eq!(buf.dropped_count(SensorKind::Acc), 1);
        let drained = buf.drain(SensorKind::Acc);
        let timestamps: Vec<u64> = drained.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![2, 3]);
    }

    #[test]
    fn kinds_are_independent() {
        let mut buf = SensorFrameBuffer::new();
        buf.push(SensorSample::acc(10, 0.0, 0.0, 9.8)).unwrap();
        buf.push(SensorSample::gyro(5, 0.0, 0.0, 0.0)).unwrap();
        assert_eq!(buf.len(SensorKind::Acc), 1);
        assert_eq!(buf.len(SensorKind::Gyro), 1);
    }
}
