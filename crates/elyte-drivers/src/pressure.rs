//! Volume to pressure calibration and aspiration ramps.
//!
//! Pure functions only; the pipette controller turns a [`PressureRamp`] into
//! register writes and sleeps.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Piecewise-linear volume to pressure curve.
///
/// Below `min_dose_ul` the curve uses the reduced `min_dose_mbar_per_ul`
/// slope: small doses need proportionally less pressure swing or they
/// overshoot. Above it the curve continues from the threshold value with the
/// full `mbar_per_ul` slope, so it is continuous. The per-ingredient aspirate
/// scalar multiplies the whole curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureCurve {
    pub mbar_per_ul: f64,
    pub min_dose_ul: f64,
    pub min_dose_mbar_per_ul: f64,
}

impl Default for PressureCurve {
    fn default() -> Self {
        Self {
            mbar_per_ul: 1.0,
            min_dose_ul: 10.0,
            min_dose_mbar_per_ul: 0.6,
        }
    }
}

impl PressureCurve {
    /// Pressure swing above charge pressure needed to draw `volume_ul`.
    pub fn pressure_for(&self, volume_ul: f64, scalar: f64) -> f64 {
        let volume = volume_ul.max(0.0);
        let base = if volume <= self.min_dose_ul {
            volume * self.min_dose_mbar_per_ul
        } else {
            self.min_dose_ul * self.min_dose_mbar_per_ul
                + (volume - self.min_dose_ul) * self.mbar_per_ul
        };
        base * scalar
    }
}

/// Shape of the setpoint path from charge pressure to aspirate pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RampProfile {
    #[default]
    Linear,
    /// Minimum-jerk quintic: zero velocity and acceleration at both ends.
    Quintic,
}

/// Setpoints to visit, each followed by `step`.
#[derive(Debug, Clone, PartialEq)]
pub struct PressureRamp {
    pub setpoints: Vec<f64>,
    pub step: Duration,
}

impl PressureRamp {
    /// Whether the ramp is a single jump to the target.
    pub fn is_jump(&self) -> bool {
        self.setpoints.len() <= 1
    }
}

/// Nyquist factor applied to the sensor's time resolution.
const SAMPLING_FACTOR: f64 = 2.3;

/// Plan the setpoint path for an aspiration.
///
/// The rise time is `volume / speed`. Setpoints are spaced at no less than
/// `time_resolution`; a zero speed or a rise too short to fit an intermediate
/// point collapses the ramp into a single jump. The last setpoint is `target`
/// exactly.
pub fn plan_ramp(
    start: f64,
    target: f64,
    volume_ul: f64,
    speed_ul_s: f64,
    time_resolution: Duration,
    profile: RampProfile,
) -> PressureRamp {
    let jump = PressureRamp {
        setpoints: vec![target],
        step: Duration::ZERO,
    };
    if speed_ul_s <= 0.0 || volume_ul <= 0.0 {
        return jump;
    }

    let rise = volume_ul / speed_ul_s;
    let resolution = time_resolution.as_secs_f64();
    let n = (rise / (SAMPLING_FACTOR * resolution)).ceil() as usize + 2;
    if n <= 2 {
        return jump;
    }

    let diff = target - start;
    let mut setpoints: Vec<f64> = (0..n)
        .map(|i| {
            let s = i as f64 / (n - 1) as f64;
            match profile {
                RampProfile::Linear => start + diff * s,
                RampProfile::Quintic => {
                    start + diff * (10.0 * s.powi(3) - 15.0 * s.powi(4) + 6.0 * s.powi(5))
                }
            }
        })
        .collect();
    if let Some(last) = setpoints.last_mut() {
        *last = target;
    }

    let step = (rise / (n - 1) as f64).max(resolution);
    PressureRamp {
        setpoints,
        step: Duration::from_secs_f64(step),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: Duration = Duration::from_millis(20);

    #[test]
    fn test_curve_is_continuous_at_threshold() {
        let curve = PressureCurve::default();
        let below = curve.pressure_for(10.0 - 1e-9, 1.0);
        let above = curve.pressure_for(10.0 + 1e-9, 1.0);
        assert!((below - above).abs() < 1e-6);
    }

    #[test]
    fn test_curve_small_doses_use_reduced_slope() {
        let curve = PressureCurve::default();
        assert!((curve.pressure_for(5.0, 1.0) - 3.0).abs() < 1e-12);
        assert!((curve.pressure_for(20.0, 1.0) - 16.0).abs() < 1e-12);
        assert!((curve.pressure_for(20.0, 0.5) - 8.0).abs() < 1e-12);
        assert_eq!(curve.pressure_for(-4.0, 1.0), 0.0);
    }

    #[test]
    fn test_ramp_20ul_at_10ul_per_s() {
        let curve = PressureCurve::default();
        let charge = 30.0;
        let target = charge + curve.pressure_for(20.0, 1.2);

        let ramp = plan_ramp(charge, target, 20.0, 10.0, RES, RampProfile::Linear);

        assert!(ramp.setpoints.len() >= 2);
        assert_eq!(ramp.setpoints.len(), 46);
        assert_eq!(*ramp.setpoints.last().unwrap(), target);
        assert_eq!(ramp.setpoints[0], charge);
        assert!(ramp.step >= RES);
        assert!(ramp.setpoints.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_zero_speed_jumps() {
        let ramp = plan_ramp(30.0, 50.0, 20.0, 0.0, RES, RampProfile::Linear);
        assert!(ramp.is_jump());
        assert_eq!(ramp.setpoints, vec![50.0]);
    }

    #[test]
    fn test_step_never_below_resolution() {
        // A 10 ms rise would want 5 ms steps.
        let ramp = plan_ramp(30.0, 30.1, 0.1, 10.0, RES, RampProfile::Linear);
        assert!(!ramp.is_jump());
        assert!(ramp.step >= RES);
    }

    #[test]
    fn test_quintic_ends_exactly() {
        let ramp = plan_ramp(30.0, 70.0, 40.0, 20.0, RES, RampProfile::Quintic);
        assert_eq!(ramp.setpoints[0], 30.0);
        assert_eq!(*ramp.setpoints.last().unwrap(), 70.0);
        // Slow start relative to linear.
        assert!(ramp.setpoints[1] - 30.0 < 40.0 / (ramp.setpoints.len() - 1) as f64);
    }
}
