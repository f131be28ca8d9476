//! End-to-end scenarios driving the public facade with deterministic
//! synthetic sensor streams.

use indoor_pdr::{ActivityMode, LocalizationConfig, LocalizationEvent, LocalizationFacade, SensorSample};
use nalgebra::{Matrix3, Vector3};

type NoSamples = std::iter::Empty<(u64, Vector3<f64>, Vector3<f64>)>;

fn facade_with(config: LocalizationConfig) -> LocalizationFacade {
    let mut facade = LocalizationFacade::initialize(config, None).unwrap();
    facade.start::<NoSamples, _>(Some(Matrix3::identity()), None, |_| {}).unwrap();
    facade
}

fn feed_walk(facade: &mut LocalizationFacade, duration_ms: u64, rate_hz: f64) -> u64 {
    let dt_ms = (1000.0 / rate_hz) as u64;
    let mut t = 0u64;
    let mut last_step = 0u64;

    while t < duration_ms {
        let phase = (t as f64 / 1000.0) * std::f64::consts::TAU;
        let acc_z = 9.81 + 2.0 * phase.sin();
        for event in facade.feed_sample(SensorSample::acc(t, 0.0, 0.0, acc_z)) {
            if let LocalizationEvent::StepDetected { index, .. } = event {
                last_step = index;
            }
        }
        facade.feed_sample(SensorSample::gyro(t, 0.0, 0.0, 0.0));
        if t % 40 == 0 {
            facade.feed_sample(SensorSample::mag(t, 25.0, 0.0, -40.0));
        }
        t += dt_ms;
    }
    last_step
}

#[test]
fn straight_walk_ten_meters() {
    let mut config = LocalizationConfig::default();
    config.user_height_m = 1.80;
    let mut facade = facade_with(config);

    let last_step = feed_walk(&mut facade, 20_000, 25.0);

    assert!(last_step >= 15, "expected close to 20 steps, got {last_step}");
    let (x, _y, _z) = facade.position();
    assert!(x > 5.0, "expected forward progress, got x={x}");
}

#[test]
fn stationary_then_walk() {
    let mut facade = facade_with(LocalizationConfig::default());

    let mut t = 0u64;
    while t < 10_000 {
        facade.feed_sample(SensorSample::acc(t, 0.0, 0.0, 9.81));
        facade.feed_sample(SensorSample::gyro(t, 0.0, 0.0, 0.0));
        t += 40;
    }

    let mut last_step = 0u64;
    let walk_start = t;
    while t < walk_start + 6_000 {
        let phase = ((t - walk_start) as f64 / 1000.0) * std::f64::consts::TAU;
        let acc_z = 9.81 + 2.0 * phase.sin();
        for event in facade.feed_sample(SensorSample::acc(t, 0.0, 0.0, acc_z)) {
            if let LocalizationEvent::StepDetected { index, .. } = event {
                last_step = index;
            }
        }
        facade.feed_sample(SensorSample::gyro(t, 0.0, 0.0, 0.0));
        t += 40;
    }

    assert!(last_step >= 3, "expected a handful of steps, got {last_step}");
}

#[test]
fn excessive_motion_fails_calibration_strict() {
    let config = LocalizationConfig::default();
    let mut facade = LocalizationFacade::initialize(config, None).unwrap();

    let high_variance_samples = (0..1600).map(|i| {
        let t = i as u64 * 20;
        let jitter = ((i as f64) * 0.37).sin() * 6.0;
        (t, nalgebra::Vector3::new(jitter, -jitter, 9.81 + jitter), nalgebra::Vector3::new(jitter, jitter, jitter))
    });

    let result = facade.calibrate(high_variance_samples, |_event| {});
    assert!(result.is_err(), "expected calibration to fail under high-variance input");
}

#[test]
fn zupt_decays_velocity_quickly_after_a_step() {
    let mut facade = facade_with(LocalizationConfig::default());
    facade.set_mode(indoor_pdr::ModeSelection::Manual(ActivityMode::Walking));

    let mut t = 0u64;
    for _ in 0..40 {
        let phase = (t as f64 / 1000.0) * std::f64::consts::TAU;
        facade.feed_sample(SensorSample::acc(t, 0.0, 0.0, 9.81 + 2.0 * phase.sin()));
        facade.feed_sample(SensorSample::gyro(t, 0.0, 0.0, 0.0));
        t += 20;
    }

    let (vx0, vy0, vz0) = facade.velocity();
    let v0 = (vx0 * vx0 + vy0 * vy0 + vz0 * vz0).sqrt();
    assert!(v0 > 1e-6, "expected nonzero velocity right after walking, got {v0}");

    // 20 ticks of 20ms = 0.4s of sub-threshold acceleration; the ZUPT
    // pseudo-measurement should pull velocity down by at least 90%.
    for _ in 0..20 {
        facade.feed_sample(SensorSample::acc(t, 0.0, 0.0, 9.81));
        facade.feed_sample(SensorSample::gyro(t, 0.0, 0.0, 0.0));
        t += 20;
    }

    let (vx1, vy1, vz1) = facade.velocity();
    let v1 = (vx1 * vx1 + vy1 * vy1 + vz1 * vz1).sqrt();
    assert!(v1 <= v0 * 0.1, "expected velocity to decay by at least 90% within 0.4s, {v0} -> {v1}");
}

#[test]
fn reset_position_is_atomic_across_pdr_and_ekf() {
    let mut facade = facade_with(LocalizationConfig::default());
    facade.reset_position(4.0, -2.0, 0.0, 1.0).unwrap();
    let (x, y, _) = facade.position();
    assert!((x - 4.0).abs() < 1e-6);
    assert!((y - (-2.0)).abs() < 1e-6);
}

#[test]
fn upside_down_phone_offset_converges_end_to_end() {
    let mut facade = facade_with(LocalizationConfig::default());

    let mut t = 0u64;
    for _ in 0..300 {
        let phase = (t as f64 / 1000.0) * std::f64::consts::TAU;
        let acc_z = 9.81 + 2.0 * phase.sin();
        facade.feed_sample(SensorSample::acc(t, 0.0, 0.0, acc_z));
        facade.feed_sample(SensorSample::gyro(t, 0.0, 0.0, 0.0));
        // Mag points opposite the walking direction: a phone carried upside down.
        facade.feed_sample(SensorSample::mag(t, -25.0, 0.0, -40.0));
        t += 40;
    }

    let offset = facade
        .calibration_bundle()
        .mag_heading_offset
        .expect("dynamic heading offset should converge end-to-end");
    assert!((offset.abs() - std::f64::consts::PI).abs() < 0.2, "expected offset near pi, got {offset}");
}

#[test]
fn inactivity_then_wake_toggles_energy_status() {
    let mut config = LocalizationConfig::default();
    config.inactivity_timeout_ms = 200;
    let mut facade = facade_with(config);

    let mut low_power_seen = false;
    let mut t = 0u64;
    for _ in 0..40 {
        for event in facade.feed_sample(SensorSample::acc(t, 0.0, 0.0, 0.0)) {
            if let LocalizationEvent::EnergyStatus { low_power: true, .. } = event {
                low_power_seen = true;
            }
        }
        facade.feed_sample(SensorSample::gyro(t, 0.0, 0.0, 0.0));
        t += 40;
    }
    assert!(low_power_seen, "expected low-power regime to engage after sustained inactivity");

    let mut woke = false;
    for _ in 0..5 {
        for event in facade.feed_sample(SensorSample::acc(t, 0.0, 0.0, 12.81)) {
            if let LocalizationEvent::EnergyStatus { low_power: false, .. } = event {
                woke = true;
            }
        }
        facade.feed_sample(SensorSample::gyro(t, 0.0, 0.0, 0.0));
        t += 40;
    }
    assert!(woke, "expected a motion burst to exit low-power regime");
}
