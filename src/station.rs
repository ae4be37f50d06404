//! Workcell bootstrap from a [`StationConfig`].
//!
//! Connects every instrument in a fixed order (pipette, gantry, balance,
//! peltier, fluid kit), loads the formulation and wires the scheduler.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use anyhow::{Context, Result};
use elyte_core::capabilities::{FluidTransfer, MassBalance, MotionStage, PressurePipette, ThermalStage};
use elyte_core::error::ElyteResult;
use elyte_drivers::{FluidHandler, Gantry, KernBalance, Peltier, Pipette};
use elyte_experiment::{
    AnalysisConfig, AnalysisPlan, FormulationTable, RandomOptimizer, RecipeScheduler,
    SimulatedAnalyzer, Workcell,
};
use tracing::{error, info, instrument, warn};

use crate::config::StationConfig;

/// Recovery file used when the gantry is simulated, kept apart from the
/// file describing the real machine.
pub const SIM_RECOVERY_FILE: &str = "recovery.sim.json";

/// Close future handed out by an instrument's capability trait.
type Closing<'a> = Pin<Box<dyn Future<Output = ElyteResult<()>> + Send + 'a>>;

/// Open every device link described by `config`.
///
/// If an instrument fails to connect, the ones already open are closed
/// before the error is returned.
#[instrument(skip(config), fields(station = %config.station.name))]
pub async fn connect_workcell(config: &StationConfig) -> Result<Workcell> {
    let analyzer = SimulatedAnalyzer::new(&config.analysis).context("Invalid analysis section")?;

    let mut pipette = Pipette::connect(config.pipette.clone())
        .await
        .with_context(|| format!("Failed to connect pipette on {}", config.pipette.port))?;

    let mut gantry_config = config.gantry.clone();
    if gantry_config.simulated {
        gantry_config.recovery_path = sim_recovery_path(&gantry_config.recovery_path);
        gantry_config.legacy_dir = None;
    }
    let mut gantry = match Gantry::connect(gantry_config).await {
        Ok(gantry) => gantry,
        Err(e) => {
            release(vec![("pipette", pipette.close())]).await;
            return Err(e).with_context(|| format!("Failed to connect gantry on {}", config.gantry.port));
        }
    };

    let mut balance = match KernBalance::connect(&config.mass_balance).await {
        Ok(balance) => balance,
        Err(e) => {
            release(vec![("pipette", pipette.close()), ("gantry", gantry.close())]).await;
            return Err(e)
                .with_context(|| format!("Failed to connect mass balance on {}", config.mass_balance.port));
        }
    };

    let mut thermal = match Peltier::connect(config.peltier.clone()).await {
        Ok(thermal) => thermal,
        Err(e) => {
            release(vec![
                ("pipette", pipette.close()),
                ("gantry", gantry.close()),
                ("mass_balance", balance.close()),
            ])
            .await;
            return Err(e).with_context(|| format!("Failed to connect peltier on {}", config.peltier.port));
        }
    };

    let fluid = match FluidHandler::connect(config.fluid.clone()).await {
        Ok(fluid) => fluid,
        Err(e) => {
            release(vec![
                ("pipette", pipette.close()),
                ("gantry", gantry.close()),
                ("mass_balance", balance.close()),
                ("peltier", thermal.close()),
            ])
            .await;
            return Err(e).with_context(|| format!("Failed to connect fluid kit on {}", config.fluid.port));
        }
    };

    info!("workcell connected");
    Ok(Workcell {
        pipette: Box::new(pipette),
        gantry: Box::new(gantry),
        balance: Box::new(balance),
        thermal: Box::new(thermal),
        fluid: Box::new(fluid),
        analyzer: Box::new(analyzer),
    })
}

/// Close instruments opened before a later one failed, newest first.
async fn release(opened: Vec<(&'static str, Closing<'_>)>) {
    for (device, closing) in opened.into_iter().rev() {
        match closing.await {
            Ok(()) => warn!(device, "closed after failed workcell connect"),
            Err(e) => error!(device, error = %e, "could not close after failed workcell connect"),
        }
    }
}

/// Load a formulation table or a checkpoint written by a previous run.
pub fn load_formulation(path: &Path) -> Result<FormulationTable> {
    let table = FormulationTable::load(path)
        .with_context(|| format!("Failed to load formulation {}", path.display()))?;
    info!(
        path = %path.display(),
        rows = table.rows().len(),
        total_volume_ul = table.total_volume_ul(),
        "formulation loaded"
    );
    Ok(table)
}

/// Connect the workcell and wrap it in a scheduler for `table`.
pub async fn build_scheduler(config: &StationConfig, table: FormulationTable) -> Result<RecipeScheduler> {
    let workcell = connect_workcell(config).await?;
    Ok(RecipeScheduler::new(
        workcell,
        table,
        config.recipe.clone(),
        config.mass_balance.thresholds,
    )
    .with_temperature_report(&config.analysis.temperature_report))
}

/// Single measurement at `temperature_c`, or the configured sweep.
pub fn analysis_plan(analysis: &AnalysisConfig, temperature_c: f64, sweep: bool) -> AnalysisPlan {
    if sweep {
        AnalysisPlan::Sweep {
            targets_c: sweep_targets(analysis.sweep_start_c, analysis.sweep_end_c, analysis.sweep_points),
        }
    } else {
        AnalysisPlan::Single { target_c: temperature_c }
    }
}

/// Evenly spaced setpoints from `start_c` to `end_c` inclusive, rounded to 0.01 C.
pub fn sweep_targets(start_c: f64, end_c: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start_c],
        n => {
            let step = (end_c - start_c) / (n - 1) as f64;
            (0..n)
                .map(|i| ((start_c + step * i as f64) * 100.0).round() / 100.0)
                .collect()
        }
    }
}

/// Random optimizer over every ingredient the gantry can reach.
pub fn campaign_optimizer(config: &StationConfig, table: &FormulationTable) -> Result<RandomOptimizer> {
    let ingredients: Vec<String> = table
        .rows()
        .iter()
        .filter(|row| row.slot().is_some())
        .map(|row| row.name.clone())
        .collect();
    RandomOptimizer::new(ingredients, config.campaign.clone()).context("Invalid campaign section")
}

pub fn sim_recovery_path(path: &Path) -> PathBuf {
    path.with_file_name(SIM_RECOVERY_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn simulated_config(dir: &tempfile::TempDir) -> StationConfig {
        let mut config = StationConfig::default();
        config.simulate_all();
        config.gantry.recovery_path = dir.path().join("recovery.json");
        config.gantry.legacy_dir = None;
        config
    }

    fn released(lines: &[&str]) -> Vec<&'static str> {
        ["pipette", "gantry", "mass_balance", "peltier", "fluid"]
            .into_iter()
            .filter(|device| {
                let field = format!("device=\"{}\"", device);
                lines
                    .iter()
                    .any(|line| line.contains("closed after failed workcell connect") && line.contains(&field))
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failed_peltier_connect_closes_earlier_instruments() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = simulated_config(&dir);
        config.peltier.simulated = false;
        config.peltier.port = dir.path().join("no-such-port").display().to_string();

        let Err(err) = connect_workcell(&config).await else {
            panic!("peltier connected on a missing port");
        };
        assert!(format!("{:#}", err).contains("Failed to connect peltier"));

        logs_assert(|lines: &[&str]| match released(lines).as_slice() {
            ["pipette", "gantry", "mass_balance"] => Ok(()),
            other => Err(format!("released {:?}", other)),
        });
        assert!(!logs_contain("workcell connected"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_failed_fluid_connect_closes_peltier_too() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = simulated_config(&dir);
        config.fluid.simulated = false;
        config.fluid.port = dir.path().join("no-such-port").display().to_string();

        assert!(connect_workcell(&config).await.is_err());
        logs_assert(|lines: &[&str]| match released(lines).as_slice() {
            ["pipette", "gantry", "mass_balance", "peltier"] => Ok(()),
            other => Err(format!("released {:?}", other)),
        });
    }

    #[test]
    fn test_sweep_targets() {
        assert_eq!(sweep_targets(60.0, -40.0, 5), vec![60.0, 35.0, 10.0, -15.0, -40.0]);
        assert_eq!(sweep_targets(25.0, -40.0, 1), vec![25.0]);
        assert!(sweep_targets(25.0, -40.0, 0).is_empty());

        let default = sweep_targets(60.0, -40.0, 8);
        assert_eq!(default.len(), 8);
        assert_eq!(default[1], 45.71);
        assert_eq!(default[7], -40.0);
    }

    #[test]
    fn test_sim_recovery_path_is_sibling() {
        let path = sim_recovery_path(Path::new("data/variables/recovery.json"));
        assert_eq!(path, PathBuf::from("data/variables/recovery.sim.json"));
    }

    #[test]
    fn test_analysis_plan() {
        let analysis = AnalysisConfig::default();
        assert_eq!(
            analysis_plan(&analysis, 30.0, false),
            AnalysisPlan::Single { target_c: 30.0 }
        );
        assert_eq!(analysis_plan(&analysis, 30.0, true).targets().len(), 8);
    }
}
