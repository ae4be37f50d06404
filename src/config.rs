//! Station configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/station.toml`)
//! 2. environment variables prefixed with `ELYTE_`, with `__` separating
//!    nested keys, e.g. `ELYTE_GANTRY__PORT=/dev/ttyACM3` or
//!    `ELYTE_PELTIER__SIMULATED=true`
//!
//! Every section falls back to the reference hardware values, so an empty
//! file is a valid configuration.
//!
//! # Example
//! ```no_run
//! use elyte::config::StationConfig;
//!
//! let config = StationConfig::load_from("config/station.toml")?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::{Path, PathBuf};

use elyte_drivers::{FluidConfig, GantryConfig, MassBalanceConfig, PeltierConfig, PipetteConfig};
use elyte_experiment::{AnalysisConfig, CampaignConfig, RecipeConfig, TuneConfig};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/station.toml";
pub const ENV_PREFIX: &str = "ELYTE_";

/// Top-level station configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub station: StationSection,
    pub logging: LoggingConfig,
    pub pipette: PipetteConfig,
    pub gantry: GantryConfig,
    pub mass_balance: MassBalanceConfig,
    pub peltier: PeltierConfig,
    pub fluid: FluidConfig,
    pub recipe: RecipeConfig,
    pub analysis: AnalysisConfig,
    pub campaign: CampaignConfig,
    pub tuning: TuneConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSection {
    /// Identifies the mixing station in logs.
    pub name: String,
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            name: "mixing-station".into(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line with colours, for the bench
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// For log aggregation
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    pub level: String,
    pub format: OutputFormat,
    /// Plain-text copy of the log, appended across runs. Empty disables it.
    pub file: Option<PathBuf>,
    pub with_span_events: bool,
    pub with_file_and_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: OutputFormat::Pretty,
            file: Some(PathBuf::from("mixing_station.log")),
            with_span_events: false,
            with_file_and_line: false,
        }
    }
}

impl StationConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Run every instrument in simulated mode.
    pub fn simulate_all(&mut self) {
        self.pipette.simulated = true;
        self.gantry.simulated = true;
        self.mass_balance.simulated = true;
        self.peltier.simulated = true;
        self.fluid.simulated = true;
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let pipette = &self.pipette;
        if pipette.max_dose_ul <= 0.0 {
            return Err(format!("pipette.max_dose_ul must be positive, got {}", pipette.max_dose_ul));
        }
        if pipette.charge_pressure_mbar <= 0.0 || pipette.charge_pressure_mbar >= pipette.max_pressure_mbar {
            return Err(format!(
                "pipette.charge_pressure_mbar {} must lie in (0, max_pressure_mbar {})",
                pipette.charge_pressure_mbar, pipette.max_pressure_mbar
            ));
        }
        if pipette.max_power_mw <= 0.0 {
            return Err("pipette.max_power_mw must be positive".into());
        }
        if pipette.time_resolution_ms == 0 {
            return Err("pipette.time_resolution_ms must be at least 1".into());
        }

        let pots = self.gantry.geometry.pots.len();
        if !(1..=10).contains(&pots) {
            return Err(format!("gantry.geometry.pots must list 1 to 10 pots, got {}", pots));
        }
        if self.gantry.geometry.pot_diameter_cm <= 0.0 {
            return Err("gantry.geometry.pot_diameter_cm must be positive".into());
        }

        let thresholds = &self.mass_balance.thresholds;
        if thresholds.minor_percent <= 0.0 || thresholds.minor_percent >= thresholds.critical_percent {
            return Err(format!(
                "mass_balance thresholds must satisfy 0 < minor ({}) < critical ({})",
                thresholds.minor_percent, thresholds.critical_percent
            ));
        }

        let peltier = &self.peltier;
        if peltier.min_temp_c >= peltier.max_temp_c {
            return Err(format!(
                "peltier.min_temp_c {} must be below max_temp_c {}",
                peltier.min_temp_c, peltier.max_temp_c
            ));
        }
        if !(peltier.min_temp_c..=peltier.max_temp_c).contains(&peltier.threshold_c) {
            return Err(format!(
                "peltier.threshold_c {} outside [{}, {}]",
                peltier.threshold_c, peltier.min_temp_c, peltier.max_temp_c
            ));
        }
        if peltier.allowable_error_c <= 0.0 {
            return Err("peltier.allowable_error_c must be positive".into());
        }
        if peltier.sample_interval_ms == 0 {
            return Err("peltier.sample_interval_ms must be at least 1".into());
        }
        if peltier.steady_state_s >= peltier.timeout_s {
            return Err(format!(
                "peltier.steady_state_s {} must be shorter than timeout_s {}",
                peltier.steady_state_s, peltier.timeout_s
            ));
        }

        if self.fluid.tube_length_mm < 0.0 || self.fluid.over_pump <= 0.0 || self.fluid.clean_over_pump <= 0.0 {
            return Err("fluid tube length must be non-negative and over-pump factors positive".into());
        }

        if self.recipe.clean_volume_ul < 0.0 {
            return Err("recipe.clean_volume_ul must be non-negative".into());
        }
        if self.recipe.min_dose_ul < 0.0 || self.recipe.min_dose_ul >= pipette.max_dose_ul {
            return Err(format!(
                "recipe.min_dose_ul {} must lie in [0, pipette.max_dose_ul {})",
                self.recipe.min_dose_ul, pipette.max_dose_ul
            ));
        }

        let analysis = &self.analysis;
        if analysis.sweep_points == 0 {
            return Err("analysis.sweep_points must be at least 1".into());
        }
        for target in [analysis.sweep_start_c, analysis.sweep_end_c] {
            if !(peltier.min_temp_c..=peltier.max_temp_c).contains(&target) {
                return Err(format!(
                    "analysis sweep temperature {} outside peltier limits [{}, {}]",
                    target, peltier.min_temp_c, peltier.max_temp_c
                ));
            }
        }
        if analysis.cell_constant_per_m <= 0.0 {
            return Err("analysis.cell_constant_per_m must be positive".into());
        }

        if self.campaign.iterations == 0 {
            return Err("campaign.iterations must be at least 1".into());
        }
        if let Some([low, high]) = self.campaign.temperature_range_c {
            if low > high || low < peltier.min_temp_c || high > peltier.max_temp_c {
                return Err(format!(
                    "campaign.temperature_range_c [{}, {}] must be ordered and within peltier limits",
                    low, high
                ));
            }
        }

        self.tuning.validate()?;
        if self.tuning.volume_ul < self.recipe.min_dose_ul {
            return Err(format!(
                "tuning.volume_ul {} is below recipe.min_dose_ul {}",
                self.tuning.volume_ul, self.recipe.min_dose_ul
            ));
        }

        Ok(())
    }
}
