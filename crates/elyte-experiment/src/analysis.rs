//! Impedance analysis collaborator.
//!
//! The potentiostat that records the impedance spectrum lives outside the
//! workcell. The scheduler holds the test cell at temperature and calls
//! [`Analyzer::measure`] once per set point.

use std::path::PathBuf;

use async_trait::async_trait;
use elyte_core::error::{ElyteError, ElyteResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Properties extracted from one impedance spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpedanceResult {
    pub ohmic_resistance_ohm: f64,
    pub ionic_conductivity_s_per_m: f64,
}

/// Measurement taken at one thermal set point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemperaturePoint {
    pub target_c: f64,
    pub mean_c: f64,
    pub std_c: f64,
    pub identifier: String,
    pub impedance: ImpedanceResult,
}

#[async_trait]
pub trait Analyzer: Send {
    /// Run one measurement on the filled cell. `identifier` names the dataset.
    async fn measure(&mut self, identifier: &str) -> ElyteResult<ImpedanceResult>;
}

/// How the cell is analysed after synthesis.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisPlan {
    /// Hold one temperature for a single measurement.
    Single { target_c: f64 },
    /// Step through a list of temperatures, measuring at each.
    Sweep { targets_c: Vec<f64> },
}

impl AnalysisPlan {
    pub fn targets(&self) -> &[f64] {
        match self {
            AnalysisPlan::Single { target_c } => std::slice::from_ref(target_c),
            AnalysisPlan::Sweep { targets_c } => targets_c,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Test cell constant (electrode separation over area), 1/m.
    pub cell_constant_per_m: f64,
    /// Default full-range sweep, hottest first.
    pub sweep_start_c: f64,
    pub sweep_end_c: f64,
    pub sweep_points: usize,
    /// Steady-state statistics for sweeps are appended here.
    pub temperature_report: PathBuf,
    /// Resistance range reported by the simulated analyzer.
    pub sim_resistance_ohm: [f64; 2],
    pub sim_seed: Option<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            cell_constant_per_m: 100.0,
            sweep_start_c: 60.0,
            sweep_end_c: -40.0,
            sweep_points: 8,
            temperature_report: PathBuf::from("data/results/temperature_report.csv"),
            sim_resistance_ohm: [5.0, 50.0],
            sim_seed: None,
        }
    }
}

/// Stand-in analyzer for runs without a potentiostat.
pub struct SimulatedAnalyzer {
    rng: ChaCha8Rng,
    cell_constant_per_m: f64,
    resistance_ohm: [f64; 2],
}

impl SimulatedAnalyzer {
    pub fn new(config: &AnalysisConfig) -> ElyteResult<Self> {
        let [low, high] = config.sim_resistance_ohm;
        if low <= 0.0 || high <= low {
            return Err(ElyteError::Config(format!(
                "simulated resistance range [{}, {}] must be positive and increasing",
                low, high
            )));
        }
        let rng = match config.sim_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(Self {
            rng,
            cell_constant_per_m: config.cell_constant_per_m,
            resistance_ohm: config.sim_resistance_ohm,
        })
    }
}

#[async_trait]
impl Analyzer for SimulatedAnalyzer {
    async fn measure(&mut self, identifier: &str) -> ElyteResult<ImpedanceResult> {
        let [low, high] = self.resistance_ohm;
        let resistance = self.rng.gen_range(low..high);
        let result = ImpedanceResult {
            ohmic_resistance_ohm: resistance,
            ionic_conductivity_s_per_m: self.cell_constant_per_m / resistance,
        };
        info!(
            identifier,
            ohmic_resistance_ohm = result.ohmic_resistance_ohm,
            ionic_conductivity_s_per_m = result.ionic_conductivity_s_per_m,
            "simulated impedance measurement"
        );
        Ok(result)
    }
}
