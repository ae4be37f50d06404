//! Optimisation campaign loop.
//!
//! An external optimizer proposes formulations; the workcell synthesises and
//! measures each one and reports `[ionic conductivity, cost]` back. Every
//! report carries a SHA-256 digest of the formulation it was measured on so
//! the optimizer can match results to suggestions.

use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elyte_core::error::{ElyteError, ElyteResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::analysis::AnalysisPlan;
use crate::scheduler::RecipeScheduler;

/// Suggestion parameter holding the analysis temperature.
pub const TEMPERATURE_PARAMETER: &str = "Temperature";
pub const DEFAULT_TEMPERATURE_C: f64 = 25.0;

/// One formulation proposed by the optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    /// Ingredient name to dose volume in uL, plus the optional temperature.
    pub parameters: BTreeMap<String, f64>,
}

impl Suggestion {
    pub fn temperature_c(&self) -> f64 {
        self.parameters
            .get(TEMPERATURE_PARAMETER)
            .copied()
            .unwrap_or(DEFAULT_TEMPERATURE_C)
    }

    pub fn dose_volumes(&self) -> HashMap<String, f64> {
        self.parameters
            .iter()
            .filter(|(name, _)| name.as_str() != TEMPERATURE_PARAMETER)
            .map(|(name, volume)| (name.clone(), *volume))
            .collect()
    }

    /// Identity of this formulation as a hex SHA-256 digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        for (name, value) in &self.parameters {
            hasher.update(format!(";{}={}", name, value).as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// What one cycle produced for the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CampaignResult {
    pub ohmic_resistance_ohm: f64,
    pub ionic_conductivity_s_per_m: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub iteration: usize,
    pub suggestion_id: String,
    pub digest: String,
    pub temperature_c: f64,
    pub result: CampaignResult,
    /// Objective vector: ionic conductivity, cost.
    pub objectives: [f64; 2],
    pub reported_at: DateTime<Utc>,
}

#[async_trait]
pub trait Optimizer: Send {
    async fn suggest(&mut self) -> ElyteResult<Suggestion>;

    async fn report(&mut self, report: &CampaignReport) -> ElyteResult<()>;
}

// =============================================================================
// Random search
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    pub iterations: usize,
    /// Upper bound for each suggested ingredient volume.
    pub max_volume_ul: f64,
    /// Optional temperature range; without it every cycle runs at 25 C.
    pub temperature_range_c: Option<[f64; 2]>,
    /// Reports are appended here as JSON lines.
    pub results_path: PathBuf,
    pub seed: Option<u64>,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            max_volume_ul: 200.0,
            temperature_range_c: None,
            results_path: PathBuf::from("data/results/campaign_results.jsonl"),
            seed: None,
        }
    }
}

/// Uniform random search over ingredient volumes.
pub struct RandomOptimizer {
    rng: ChaCha8Rng,
    ingredients: Vec<String>,
    config: CampaignConfig,
    issued: usize,
}

impl RandomOptimizer {
    pub fn new(ingredients: Vec<String>, config: CampaignConfig) -> ElyteResult<Self> {
        if ingredients.is_empty() {
            return Err(ElyteError::Config("campaign needs at least one ingredient".into()));
        }
        if !config.max_volume_ul.is_finite() || config.max_volume_ul <= 0.0 {
            return Err(ElyteError::Config(format!(
                "campaign max volume {} must be positive",
                config.max_volume_ul
            )));
        }
        if let Some([low, high]) = config.temperature_range_c {
            if low > high {
                return Err(ElyteError::Config(format!(
                    "campaign temperature range [{}, {}] is inverted",
                    low, high
                )));
            }
        }
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(Self {
            rng,
            ingredients,
            config,
            issued: 0,
        })
    }
}

#[async_trait]
impl Optimizer for RandomOptimizer {
    async fn suggest(&mut self) -> ElyteResult<Suggestion> {
        self.issued += 1;
        let mut parameters = BTreeMap::new();
        for name in &self.ingredients {
            let volume = self.rng.gen_range(0.0..=self.config.max_volume_ul);
            parameters.insert(name.clone(), (volume * 10.0).round() / 10.0);
        }
        if let Some([low, high]) = self.config.temperature_range_c {
            let temperature = self.rng.gen_range(low..=high);
            parameters.insert(TEMPERATURE_PARAMETER.to_string(), temperature.round());
        }
        Ok(Suggestion {
            id: format!("random-{}", self.issued),
            parameters,
        })
    }

    async fn report(&mut self, report: &CampaignReport) -> ElyteResult<()> {
        let path = &self.config.results_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(report)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

// =============================================================================
// Campaign loop
// =============================================================================

/// Run `iterations` optimizer-directed cycles.
///
/// A fault in any cycle ends the campaign; the scheduler has already closed
/// the device links by the time the error is returned.
#[instrument(skip(scheduler, optimizer), err)]
pub async fn run_campaign(
    scheduler: &mut RecipeScheduler,
    optimizer: &mut dyn Optimizer,
    iterations: usize,
) -> ElyteResult<Vec<CampaignReport>> {
    let mut reports = Vec::with_capacity(iterations);

    for iteration in 1..=iterations {
        match campaign_iteration(scheduler, optimizer, iteration).await {
            Ok(report) => reports.push(report),
            Err(e) => return Err(scheduler.abort(e).await),
        }
    }

    info!(iterations, "campaign complete");
    Ok(reports)
}

async fn campaign_iteration(
    scheduler: &mut RecipeScheduler,
    optimizer: &mut dyn Optimizer,
    iteration: usize,
) -> ElyteResult<CampaignReport> {
    let suggestion = optimizer.suggest().await?;
    let temperature_c = suggestion.temperature_c();
    info!(
        iteration,
        suggestion = %suggestion.id,
        temperature_c,
        "received optimizer suggestion"
    );

    scheduler.update_dose_volumes(&suggestion.dose_volumes())?;
    let cost = scheduler.calculate_cost();

    let plan = AnalysisPlan::Single {
        target_c: temperature_c,
    };
    let cycle = scheduler.run_cycle(&plan).await?;
    let impedance = cycle
        .analysis
        .first()
        .map(|point| point.impedance)
        .ok_or_else(|| ElyteError::State("cycle produced no measurement".into()))?;

    let result = CampaignResult {
        ohmic_resistance_ohm: impedance.ohmic_resistance_ohm,
        ionic_conductivity_s_per_m: impedance.ionic_conductivity_s_per_m,
        cost,
    };
    let report = CampaignReport {
        iteration,
        suggestion_id: suggestion.id.clone(),
        digest: suggestion.digest(),
        temperature_c,
        result,
        objectives: [result.ionic_conductivity_s_per_m, cost],
        reported_at: Utc::now(),
    };
    optimizer.report(&report).await?;
    info!(
        iteration,
        ionic_conductivity_s_per_m = result.ionic_conductivity_s_per_m,
        cost,
        "measurement reported"
    );
    Ok(report)
}
