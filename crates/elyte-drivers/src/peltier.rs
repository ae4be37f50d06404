//! Laird TC-XX-PR-59 thermoelectric regulator.
//!
//! Protocol: `Regulator` dialect at 115200 baud. Commands end in `\r`; the
//! regulator echoes each one after a `> ` prompt and then answers with the
//! written value, a blank line, or a status word.
//!
//! | Register | Meaning                                  |
//! |----------|------------------------------------------|
//! | R0       | setpoint (C)                             |
//! | R1-R3    | Kp, Ki, Kd                               |
//! | R6       | maximum drive, percent                   |
//! | R7       | drive dead band, percent                 |
//! | R13      | regulator mode (6 = PID)                 |
//! | R16/R23  | fan 1/2 mode (4 = follow main output)    |
//! | R22/R29  | fan 1/2 voltage                          |
//! | R45/R46  | supply over/under voltage alarm          |
//! | R47/R48  | main current over/under alarm            |
//! | R49/R51  | fan 1/2 over-current alarm               |
//! | R55/R56  | sensor 1/2 mode                          |
//! | R59-R64  | sensor 1/2 Steinhart-Hart coefficients   |
//! | R71-R74  | sensor 1/2 over/under temperature alarm  |
//! | R100     | sensor 1 (cell) temperature              |
//! | R152     | main current (A)                         |

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use elyte_core::capabilities::{SteadyState, ThermalStage};
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_core::link::{DeviceLink, Dialect};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

const DEVICE: &str = "peltier";
const MODEL: &str = "TC-XX-PR-59";

mod reg {
    pub const SETPOINT: u16 = 0;
    pub const KP: u16 = 1;
    pub const KI: u16 = 2;
    pub const KD: u16 = 3;
    pub const MAX_DRIVE: u16 = 6;
    pub const DEAD_BAND: u16 = 7;
    pub const MODE: u16 = 13;
    pub const FAN1_MODE: u16 = 16;
    pub const FAN1_VOLTAGE: u16 = 22;
    pub const FAN2_MODE: u16 = 23;
    pub const FAN2_VOLTAGE: u16 = 29;
    pub const OVER_VOLTAGE: u16 = 45;
    pub const UNDER_VOLTAGE: u16 = 46;
    pub const OVER_CURRENT: u16 = 47;
    pub const UNDER_CURRENT: u16 = 48;
    pub const FAN1_CURRENT: u16 = 49;
    pub const FAN2_CURRENT: u16 = 51;
    pub const SENSOR1_MODE: u16 = 55;
    pub const SENSOR2_MODE: u16 = 56;
    pub const SENSOR1_STEINHART: u16 = 59;
    pub const SENSOR2_STEINHART: u16 = 62;
    pub const SENSOR1_ALARM_HIGH: u16 = 71;
    pub const SENSOR1_ALARM_LOW: u16 = 72;
    pub const SENSOR2_ALARM_HIGH: u16 = 73;
    pub const SENSOR2_ALARM_LOW: u16 = 74;
    pub const T1: u16 = 100;
    pub const CURRENT: u16 = 152;
}

const PID_MODE: f64 = 6.0;
/// Sensor alarms sit this far outside the operating range.
const ALARM_MARGIN_C: f64 = 5.0;

// =============================================================================
// Configuration
// =============================================================================

/// PID gains and drive ceiling for one direction of heat flow.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalProfile {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub max_drive_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeltierConfig {
    pub port: String,
    pub baud_rate: u32,
    pub simulated: bool,
    pub timeout_ms: u64,
    pub max_temp_c: f64,
    pub min_temp_c: f64,
    /// Targets at or below this use the cooling profile.
    pub threshold_c: f64,
    pub allowable_error_c: f64,
    pub steady_state_s: u64,
    pub timeout_s: u64,
    pub sample_interval_ms: u64,
    pub dead_band_percent: f64,
    pub input_voltage: f64,
    pub max_current_a: f64,
    pub min_current_a: f64,
    pub fan_current_a: f64,
    pub fan_voltage: f64,
    pub fan_mode: f64,
    pub sensor_mode: f64,
    /// Steinhart-Hart A, B, C for the cell thermistor.
    pub cell_steinhart: [f64; 3],
    /// Steinhart-Hart A, B, C for the heat sink thermistor.
    pub sink_steinhart: [f64; 3],
    pub heating: ThermalProfile,
    pub cooling: ThermalProfile,
}

impl Default for PeltierConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB2".into(),
            baud_rate: 115_200,
            simulated: false,
            timeout_ms: 1000,
            max_temp_c: 60.0,
            min_temp_c: -40.0,
            threshold_c: 20.0,
            allowable_error_c: 0.5,
            steady_state_s: 30,
            timeout_s: 7200,
            sample_interval_ms: 1000,
            dead_band_percent: 5.0,
            input_voltage: 12.0,
            max_current_a: 8.0,
            min_current_a: 0.5,
            fan_current_a: 1.6,
            fan_voltage: 12.0,
            fan_mode: 4.0,
            sensor_mode: 12.0,
            cell_steinhart: [1.396917e-3, 2.378257e-4, 9.372652e-8],
            sink_steinhart: [1.0373e-3, 2.3317e-4, 8.3896e-8],
            heating: ThermalProfile {
                kp: 15.0,
                ki: 0.0,
                kd: 0.0,
                max_drive_percent: 80.0,
            },
            cooling: ThermalProfile {
                kp: 20.0,
                ki: 0.0,
                kd: 0.0,
                max_drive_percent: 100.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Heating,
    Cooling,
}

// =============================================================================
// Peltier
// =============================================================================

pub struct Peltier {
    link: DeviceLink,
    config: PeltierConfig,
    mode: Option<Mode>,
    running: bool,
}

impl Peltier {
    pub async fn connect(config: PeltierConfig) -> ElyteResult<Self> {
        let link = if config.simulated {
            let mut link = DeviceLink::simulated(DEVICE, Dialect::Regulator);
            link.simulate_reply("$LI", format!("00000 {} SIM", MODEL));
            link.simulate_reply("$W", "Run");
            link.simulate_reply("$Q", "Stop");
            link
        } else {
            DeviceLink::open(
                DEVICE,
                Dialect::Regulator,
                &config.port,
                config.baud_rate,
                Duration::from_millis(config.timeout_ms),
            )
            .await?
        };
        Self::with_link(link, config).await
    }

    pub async fn with_link(link: DeviceLink, config: PeltierConfig) -> ElyteResult<Self> {
        let mut peltier = Self {
            link,
            config,
            mode: None,
            running: false,
        };
        peltier.initialise().await?;
        Ok(peltier)
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    #[instrument(skip(self), err)]
    async fn initialise(&mut self) -> ElyteResult<()> {
        self.handshake().await?;

        self.link.write_register(reg::MODE, PID_MODE).await?;
        self.apply_profile(Mode::Heating).await?;
        self.link
            .write_register(reg::DEAD_BAND, self.config.dead_band_percent.clamp(0.0, 100.0))
            .await?;
        info!("temperature regulator PID configured");

        // Supply and drive alarms
        let c = &self.config;
        let alarms = [
            (reg::OVER_VOLTAGE, c.input_voltage + 1.0),
            (reg::UNDER_VOLTAGE, c.input_voltage - 1.0),
            (reg::OVER_CURRENT, c.max_current_a),
            (reg::UNDER_CURRENT, c.min_current_a),
            (reg::FAN1_CURRENT, c.fan_current_a),
            (reg::FAN2_CURRENT, c.fan_current_a),
        ];
        for (register, value) in alarms {
            self.link.write_register(register, value).await?;
        }

        // Thermistors
        let c = &self.config;
        let high = c.max_temp_c + ALARM_MARGIN_C;
        let low = c.min_temp_c - ALARM_MARGIN_C;
        let sensors = [
            (reg::SENSOR1_MODE, c.sensor_mode),
            (reg::SENSOR1_ALARM_HIGH, high),
            (reg::SENSOR1_ALARM_LOW, low),
            (reg::SENSOR2_MODE, c.sensor_mode),
            (reg::SENSOR2_ALARM_HIGH, high),
            (reg::SENSOR2_ALARM_LOW, low),
        ];
        let coefficients: Vec<(u16, f64)> = (0u16..3)
            .map(|i| (reg::SENSOR1_STEINHART + i, c.cell_steinhart[usize::from(i)]))
            .chain((0u16..3).map(|i| (reg::SENSOR2_STEINHART + i, c.sink_steinhart[usize::from(i)])))
            .collect();
        for (register, value) in sensors.into_iter().chain(coefficients) {
            self.link.write_register(register, value).await?;
        }
        info!("temperature sensors configured");

        // Fans follow the main output
        let c = &self.config;
        let fans = [
            (reg::FAN1_MODE, c.fan_mode),
            (reg::FAN2_MODE, c.fan_mode),
            (reg::FAN1_VOLTAGE, c.fan_voltage),
            (reg::FAN2_VOLTAGE, c.fan_voltage),
        ];
        for (register, value) in fans {
            self.link.write_register(register, value).await?;
        }
        info!("temperature regulator ready");
        Ok(())
    }

    async fn handshake(&mut self) -> ElyteResult<()> {
        let identity = self.link.command("$LI").await?;
        match identity.split_whitespace().nth(1) {
            Some(MODEL) => {
                info!(identity = %identity, "temperature regulator located");
                Ok(())
            }
            _ => Err(ElyteError::protocol(
                DEVICE,
                format!("unexpected identity {:?}", identity),
            )),
        }
    }

    async fn apply_profile(&mut self, mode: Mode) -> ElyteResult<()> {
        if self.mode == Some(mode) {
            return Ok(());
        }
        let profile = match mode {
            Mode::Heating => self.config.heating,
            Mode::Cooling => self.config.cooling,
        };
        self.link.write_register(reg::KP, profile.kp).await?;
        self.link.write_register(reg::KI, profile.ki).await?;
        self.link.write_register(reg::KD, profile.kd).await?;
        self.link
            .write_register(reg::MAX_DRIVE, profile.max_drive_percent.clamp(0.0, 100.0))
            .await?;
        self.mode = Some(mode);
        info!(?mode, kp = profile.kp, max_drive = profile.max_drive_percent, "thermal profile applied");
        Ok(())
    }

    async fn run_flag(&mut self, on: bool) -> ElyteResult<()> {
        let (command, expected) = if on { ("$W", "Run") } else { ("$Q", "Stop") };
        let reply = self.link.command(command).await?;
        if reply != expected {
            return Err(ElyteError::hardware(
                DEVICE,
                format!("{} answered {:?}, expected {:?}", command, reply, expected),
            ));
        }
        self.running = on;
        debug!(running = on, "run flag updated");
        Ok(())
    }

    async fn main_current(&mut self) -> ElyteResult<f64> {
        self.link.read_register(reg::CURRENT).await
    }

    /// Cell temperature, or `None` if the read timed out.
    async fn poll_temperature(&mut self) -> ElyteResult<Option<f64>> {
        match self.link.read_register(reg::T1).await {
            Ok(t) => Ok(Some(t)),
            Err(e) if e.is_timeout() => {
                warn!(error = %e, "temperature read timed out, polling again");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn window_stats(samples: &[f64]) -> (f64, f64) {
    let n = samples.len().max(1) as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n;
    ((mean * 100.0).round() / 100.0, (var.sqrt() * 1000.0).round() / 1000.0)
}

#[async_trait]
impl ThermalStage for Peltier {
    #[instrument(skip(self), err)]
    async fn set_temperature(&mut self, target_c: f64) -> ElyteResult<()> {
        let (min, max) = (self.config.min_temp_c, self.config.max_temp_c);
        let applied = target_c.clamp(min, max);
        if applied != target_c {
            let fault = ElyteError::Range {
                quantity: "temperature setpoint (C)",
                requested: target_c,
                min,
                max,
                applied,
            };
            warn!(%fault, "temperature setpoint clamped");
        }

        let mode = if applied <= self.config.threshold_c {
            Mode::Cooling
        } else {
            Mode::Heating
        };
        self.apply_profile(mode).await?;
        self.link.write_register(reg::SETPOINT, applied).await?;
        self.run_flag(true).await?;
        info!(target_c = applied, "peltier target temperature set");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn wait_until_temperature(
        &mut self,
        target_c: f64,
        keep_on: bool,
    ) -> ElyteResult<SteadyState> {
        self.set_temperature(target_c).await?;
        let target = target_c.clamp(self.config.min_temp_c, self.config.max_temp_c);

        if self.link.is_simulated() {
            if !keep_on {
                self.stop().await?;
            }
            return Ok(SteadyState {
                target_c: target,
                mean_c: target,
                std_c: 0.0,
            });
        }

        let tolerance = self.config.allowable_error_c;
        let interval = Duration::from_millis(self.config.sample_interval_ms);
        let window = Duration::from_secs(self.config.steady_state_s);
        let timeout = Duration::from_secs(self.config.timeout_s);
        let start = Instant::now();

        while start.elapsed() < timeout {
            let Some(mut temperature) = self.poll_temperature().await? else {
                sleep(interval).await;
                continue;
            };

            if (target - temperature).abs() < tolerance {
                let window_start = Instant::now();
                let mut samples = vec![temperature];
                loop {
                    if window_start.elapsed() >= window {
                        let (mean_c, std_c) = window_stats(&samples);
                        info!(
                            target_c = target,
                            mean_c,
                            std_c,
                            elapsed_s = start.elapsed().as_secs(),
                            "temperature reached steady state"
                        );
                        if !keep_on {
                            self.stop().await?;
                        }
                        return Ok(SteadyState {
                            target_c: target,
                            mean_c,
                            std_c,
                        });
                    }
                    if start.elapsed() >= timeout {
                        debug!(samples = samples.len(), "timeout reached inside steady-state window");
                        break;
                    }
                    sleep(interval).await;
                    if let Some(t) = self.poll_temperature().await? {
                        temperature = t;
                        if (target - temperature).abs() >= tolerance {
                            debug!(temperature_c = temperature, "left steady-state band");
                            break;
                        }
                        samples.push(temperature);
                    }
                }
            }
            sleep(interval).await;
        }

        error!(target_c = target, timeout_s = self.config.timeout_s, "peltier timed out reaching target");
        match self.main_current().await {
            Ok(current) => info!(current_a = current, "final peltier current"),
            Err(e) => warn!(error = %e, "could not read final peltier current"),
        }
        if let Err(e) = self.stop().await {
            error!(error = %e, "failed to clear run flag after timeout");
        }
        Err(ElyteError::timeout(
            DEVICE,
            format!("steady state at {} C", target),
            timeout,
        ))
    }

    async fn stop(&mut self) -> ElyteResult<()> {
        self.run_flag(false).await?;
        info!("peltier run flag cleared");
        Ok(())
    }

    async fn read_temperature(&mut self) -> ElyteResult<f64> {
        self.link.read_register(reg::T1).await
    }

    async fn close(&mut self) -> ElyteResult<()> {
        if !self.link.is_open() {
            return Ok(());
        }
        if self.running {
            if let Err(e) = self.run_flag(false).await {
                warn!(error = %e, "could not stop peltier while closing");
            }
        }
        info!("closing peltier link");
        self.link.close().await
    }
}

// =============================================================================
// Temperature report
// =============================================================================

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct TemperatureRecord {
    #[serde(rename = "Temperature Target")]
    pub target_c: f64,
    #[serde(rename = "Mean Result")]
    pub mean_c: f64,
    #[serde(rename = "STD")]
    pub std_c: f64,
}

impl From<&SteadyState> for TemperatureRecord {
    fn from(s: &SteadyState) -> Self {
        Self {
            target_c: s.target_c,
            mean_c: s.mean_c,
            std_c: s.std_c,
        }
    }
}

/// Append steady-state results to a CSV report, writing the header for a new file.
pub fn append_temperature_report(path: &Path, results: &[SteadyState]) -> ElyteResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let exists = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!exists)
        .from_writer(file);
    for result in results {
        writer.serialize(TemperatureRecord::from(result))?;
    }
    writer.flush()?;
    Ok(())
}
