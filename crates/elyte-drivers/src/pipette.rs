//! Disc pump pipette controller.
//!
//! The pump board runs an onboard PID loop on its pressure sensor. This
//! controller configures that loop, converts liquid volumes into pressure
//! setpoint trajectories, and verifies each setpoint by reading the sensor back.
//!
//! Protocol: `SmartPump` dialect at 115200 baud.
//!
//! | Register | Meaning                                   |
//! |----------|-------------------------------------------|
//! | R0       | pump enable                               |
//! | R1       | maximum drive power (mW)                  |
//! | R2       | streaming mode                            |
//! | R3/R4/R5 | drive voltage / current / power readback  |
//! | R10      | drive mode (1 = PID)                      |
//! | R12      | setpoint source (0 = register)            |
//! | R13      | PID input (5 = pressure sensor)           |
//! | R14-R17  | Kp, Ki, integral limit, Kd                |
//! | R23      | pressure setpoint (mbar, absolute)        |
//! | R33      | reset PID on enable                       |
//! | R39      | pressure sensor (mbar, absolute)          |
//!
//! All setpoints handed to this controller are relative to the gauge
//! pressure read at startup, so `set_pressure(0.0)` vents the pipette.

use std::time::Duration;

use async_trait::async_trait;
use elyte_core::capabilities::{Aspiration, PressurePipette};
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_core::link::{DeviceLink, Dialect};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::pressure::{plan_ramp, PressureCurve, RampProfile};

const DEVICE: &str = "pipette";

mod reg {
    pub const ENABLE: u16 = 0;
    pub const MAX_POWER: u16 = 1;
    pub const STREAM: u16 = 2;
    pub const VOLTAGE: u16 = 3;
    pub const CURRENT: u16 = 4;
    pub const POWER: u16 = 5;
    pub const DRIVE_MODE: u16 = 10;
    pub const SETPOINT_SOURCE: u16 = 12;
    pub const PID_INPUT: u16 = 13;
    pub const KP: u16 = 14;
    pub const KI: u16 = 15;
    pub const INTEGRAL_LIMIT: u16 = 16;
    pub const KD: u16 = 17;
    pub const SETPOINT: u16 = 23;
    pub const RESET_ON_ENABLE: u16 = 33;
    pub const PRESSURE: u16 = 39;
}

// =============================================================================
// Configuration
// =============================================================================

/// Pipette pump configuration and calibration constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipetteConfig {
    pub port: String,
    pub baud_rate: u32,
    pub simulated: bool,
    /// Acknowledgment timeout per register exchange.
    pub timeout_ms: u64,
    pub max_dose_ul: f64,
    pub max_pressure_mbar: f64,
    pub charge_pressure_mbar: f64,
    pub max_power_mw: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Closed-loop readback tolerance (roughly 2 uL at the default curve).
    pub pressure_tolerance_mbar: f64,
    /// Longest allowed rise or fall before a setpoint is reported unsettled.
    pub settle_timeout_ms: u64,
    /// Pause after convergence before final readings are taken.
    pub settle_delay_ms: u64,
    /// Practical sampling period of the pressure sensor.
    pub time_resolution_ms: u64,
    /// Expected gauge reading; defaults to the charge pressure.
    pub gauge_reference_mbar: Option<f64>,
    /// Allowed fractional deviation of the gauge from its reference.
    pub gauge_tolerance: f64,
    /// How long the blow-out self-test holds charge pressure.
    pub blow_out_ms: u64,
    pub curve: PressureCurve,
    pub ramp_profile: RampProfile,
}

impl Default for PipetteConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            simulated: false,
            timeout_ms: 1000,
            max_dose_ul: 200.0,
            max_pressure_mbar: 160.0,
            charge_pressure_mbar: 30.0,
            max_power_mw: 250.0,
            kp: 2.0,
            ki: 20.0,
            kd: 0.0,
            pressure_tolerance_mbar: 1.0,
            settle_timeout_ms: 5000,
            settle_delay_ms: 2000,
            time_resolution_ms: 20,
            gauge_reference_mbar: None,
            gauge_tolerance: 0.15,
            blow_out_ms: 1000,
            curve: PressureCurve::default(),
            ramp_profile: RampProfile::Linear,
        }
    }
}

impl PipetteConfig {
    pub fn gauge_reference(&self) -> f64 {
        self.gauge_reference_mbar
            .unwrap_or(self.charge_pressure_mbar)
    }

    fn time_resolution(&self) -> Duration {
        Duration::from_millis(self.time_resolution_ms)
    }

    fn gauge_in_tolerance(&self, gauge: f64) -> bool {
        let reference = self.gauge_reference();
        if reference == 0.0 {
            return gauge.abs() <= self.pressure_tolerance_mbar;
        }
        ((gauge - reference) / reference).abs() <= self.gauge_tolerance
    }
}

// =============================================================================
// Pipette
// =============================================================================

/// Controller for the pressure-actuated pipette.
pub struct Pipette {
    link: DeviceLink,
    config: PipetteConfig,
    gauge_mbar: f64,
}

impl Pipette {
    /// Open the configured port (or a simulated link) and run the startup sequence.
    pub async fn connect(config: PipetteConfig) -> ElyteResult<Self> {
        let link = if config.simulated {
            let mut link = DeviceLink::simulated(DEVICE, Dialect::SmartPump);
            link.seed_register(reg::PRESSURE, config.gauge_reference());
            link
        } else {
            DeviceLink::open(
                DEVICE,
                Dialect::SmartPump,
                &config.port,
                config.baud_rate,
                Duration::from_millis(config.timeout_ms),
            )
            .await?
        };
        Self::with_link(link, config).await
    }

    /// Run the startup sequence over an existing link.
    pub async fn with_link(link: DeviceLink, config: PipetteConfig) -> ElyteResult<Self> {
        let mut pipette = Self {
            link,
            config,
            gauge_mbar: 0.0,
        };
        pipette.initialise().await?;
        Ok(pipette)
    }

    pub fn gauge(&self) -> f64 {
        self.gauge_mbar
    }

    pub fn config(&self) -> &PipetteConfig {
        &self.config
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    #[instrument(skip(self), err)]
    async fn initialise(&mut self) -> ElyteResult<()> {
        let max_power = self.config.max_power_mw;

        // Pump registers
        self.link.write_register(reg::ENABLE, 0.0).await?;
        self.link.write_register(reg::MAX_POWER, max_power).await?;
        self.link.write_register(reg::STREAM, 0.0).await?;

        // PID drive on the pressure sensor
        self.link.write_register(reg::DRIVE_MODE, 1.0).await?;
        self.link.write_register(reg::SETPOINT_SOURCE, 0.0).await?;
        self.link.write_register(reg::PID_INPUT, 5.0).await?;
        self.link.write_register(reg::RESET_ON_ENABLE, 1.0).await?;

        self.link.write_register(reg::KP, self.config.kp).await?;
        self.link.write_register(reg::KI, self.config.ki).await?;
        self.link.write_register(reg::INTEGRAL_LIMIT, max_power).await?;
        self.link.write_register(reg::KD, self.config.kd).await?;
        info!(
            kp = self.config.kp,
            ki = self.config.ki,
            kd = self.config.kd,
            "pipette PID configured"
        );

        let mut gauge = self.link.read_register(reg::PRESSURE).await?;
        if !self.config.gauge_in_tolerance(gauge) {
            warn!(
                gauge,
                reference = self.config.gauge_reference(),
                "gauge pressure out of tolerance, running blow-out"
            );
            self.blow_out().await?;
            gauge = self.link.read_register(reg::PRESSURE).await?;
            if !self.config.gauge_in_tolerance(gauge) {
                return Err(ElyteError::hardware(
                    DEVICE,
                    format!(
                        "gauge pressure {} mbar failed to stabilise near {} mbar",
                        gauge,
                        self.config.gauge_reference()
                    ),
                ));
            }
        }

        self.gauge_mbar = gauge;
        info!(gauge_mbar = gauge, "pipette gauge pressure set");
        Ok(())
    }

    /// Briefly charge, then vent, to clear trapped air before re-reading gauge.
    async fn blow_out(&mut self) -> ElyteResult<()> {
        self.link.write_register(reg::ENABLE, 1.0).await?;
        self.link
            .write_register(reg::SETPOINT, self.config.charge_pressure_mbar)
            .await?;
        sleep(Duration::from_millis(self.config.blow_out_ms)).await;
        self.link.write_register(reg::SETPOINT, 0.0).await?;
        self.link.write_register(reg::ENABLE, 0.0).await?;
        sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
        Ok(())
    }

    /// Pressure relative to gauge.
    pub async fn pressure(&mut self) -> ElyteResult<f64> {
        Ok(self.link.read_register(reg::PRESSURE).await? - self.gauge_mbar)
    }

    /// Drive voltage (V) and current (mA) readback.
    pub async fn drive_telemetry(&mut self) -> ElyteResult<(f64, f64)> {
        let voltage_v = self.link.read_register(reg::VOLTAGE).await?;
        let current_ma = self.link.read_register(reg::CURRENT).await?;
        Ok((voltage_v, current_ma))
    }

    /// Drive power, with the airflow-restriction guard applied.
    pub async fn power(&mut self) -> ElyteResult<f64> {
        let power = self.link.read_register(reg::POWER).await?;
        if power.ceil() >= self.config.max_power_mw {
            error!(
                power_mw = power,
                max_power_mw = self.config.max_power_mw,
                "pipette at maximum power, check for airflow restrictions"
            );
            if let Err(e) = self.link.write_register(reg::ENABLE, 0.0).await {
                error!(error = %e, "failed to disable pump after power fault");
            }
            return Err(ElyteError::hardware(
                DEVICE,
                format!("drive power {} mW at limit, airflow restricted", power),
            ));
        }
        Ok(power)
    }

    /// Write a gauge-relative setpoint, clamped to the pump's range.
    ///
    /// Returns the gauge-relative setpoint actually written.
    pub async fn set_pressure(&mut self, value: f64) -> ElyteResult<f64> {
        let requested = ((value + self.gauge_mbar) * 1000.0).round() / 1000.0;
        let applied = requested.clamp(0.0, self.config.max_pressure_mbar);
        if applied != requested {
            let fault = ElyteError::Range {
                quantity: "pressure setpoint (mbar)",
                requested,
                min: 0.0,
                max: self.config.max_pressure_mbar,
                applied,
            };
            warn!(%fault, "pressure setpoint clamped");
        }

        self.link.write_register(reg::SETPOINT, applied).await?;
        debug!(setpoint_mbar = applied - self.gauge_mbar, "pipette setpoint written");
        Ok(applied - self.gauge_mbar)
    }

    /// Poll the sensor until it is within tolerance of `target`.
    ///
    /// Returns `false` if the settle timeout expired; that is logged, not
    /// raised, so the caller can decide what a partial result means. Read
    /// timeouts while polling are tolerated.
    async fn check_pressure(&mut self, target: f64) -> ElyteResult<bool> {
        if self.link.is_simulated() {
            debug!(target_mbar = target, "simulated pipette reached setpoint");
            return Ok(true);
        }

        let poll = self.config.time_resolution() * 10;
        let settle_timeout = Duration::from_millis(self.config.settle_timeout_ms);
        let start = Instant::now();

        let settled = loop {
            match self.pressure().await {
                Ok(p) if (target - p).abs() <= self.config.pressure_tolerance_mbar => {
                    debug!(
                        pressure_mbar = p,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "pipette reached setpoint"
                    );
                    break true;
                }
                Ok(_) => {}
                Err(e) if e.is_timeout() => warn!(error = %e, "pressure read timed out, polling again"),
                Err(e) => return Err(e),
            }

            if start.elapsed() > settle_timeout {
                error!(
                    target_mbar = target,
                    timeout_ms = self.config.settle_timeout_ms,
                    "pipette failed to reach pressure"
                );
                break false;
            }
            sleep(poll).await;
        };

        sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
        let pressure = self.pressure().await?;
        let power = self.power().await?;
        info!(pressure_mbar = pressure, power_mw = power, "pipette final values");
        Ok(settled)
    }
}

#[async_trait]
impl PressurePipette for Pipette {
    fn max_dose_ul(&self) -> f64 {
        self.config.max_dose_ul
    }

    #[instrument(skip(self), err)]
    async fn pump_on(&mut self) -> ElyteResult<()> {
        self.link.write_register(reg::ENABLE, 1.0).await?;
        info!("pipette on");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn pump_off(&mut self) -> ElyteResult<()> {
        self.link.write_register(reg::ENABLE, 0.0).await?;
        info!("pipette off");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn charge(&mut self) -> ElyteResult<()> {
        let charge = self.config.charge_pressure_mbar;
        let target = self.set_pressure(charge).await?;
        self.check_pressure(target).await?;
        info!(charge_mbar = target, "pipette charged");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn aspirate(
        &mut self,
        volume_ul: f64,
        scalar: f64,
        speed_ul_s: f64,
    ) -> ElyteResult<Aspiration> {
        let max_dose = self.config.max_dose_ul;
        let applied_ul = volume_ul.clamp(0.0, max_dose);
        if applied_ul != volume_ul {
            let fault = ElyteError::Range {
                quantity: "aspirate volume (uL)",
                requested: volume_ul,
                min: 0.0,
                max: max_dose,
                applied: applied_ul,
            };
            warn!(%fault, "aspirate volume clamped");
        }

        let charge = self.config.charge_pressure_mbar;
        let target = charge + self.config.curve.pressure_for(applied_ul, scalar);
        let ramp = plan_ramp(
            charge,
            target,
            applied_ul,
            speed_ul_s,
            self.config.time_resolution(),
            self.config.ramp_profile,
        );

        if ramp.is_jump() {
            info!(target_mbar = target, "jumping to aspirate pressure");
            self.set_pressure(target).await?;
        } else {
            info!(
                target_mbar = target,
                charge_mbar = charge,
                steps = ramp.setpoints.len(),
                step_ms = ramp.step.as_millis() as u64,
                "ramping to aspirate pressure"
            );
            for setpoint in &ramp.setpoints {
                self.set_pressure(*setpoint).await?;
                sleep(ramp.step).await;
            }
        }

        let settled = self.check_pressure(target).await?;
        if settled {
            info!(volume_ul = applied_ul, "aspiration complete");
        } else {
            error!(volume_ul = applied_ul, "aspiration did not settle, dose may be partial");
        }

        Ok(Aspiration {
            requested_ul: volume_ul,
            applied_ul,
            target_mbar: target,
            settled,
        })
    }

    #[instrument(skip(self), err)]
    async fn dispense(&mut self) -> ElyteResult<()> {
        self.set_pressure(0.0).await?;
        self.link.write_register(reg::ENABLE, 0.0).await?;
        if !self.check_pressure(0.0).await? {
            error!("pipette did not vent fully");
        }
        let (voltage_v, current_ma) = self.drive_telemetry().await?;
        info!(voltage_v, current_ma, "dispense complete");
        Ok(())
    }

    async fn close(&mut self) -> ElyteResult<()> {
        if !self.link.is_open() {
            return Ok(());
        }
        if let Err(e) = self.link.write_register(reg::ENABLE, 0.0).await {
            warn!(error = %e, "could not switch pipette off while closing");
        }
        info!("closing pipette link");
        self.link.close().await
    }
}
