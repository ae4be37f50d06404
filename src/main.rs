//! CLI entry point for the electrolyte mixing station
//!
//! # Usage
//!
//! ```bash
//! elyte run --recipe data/recipes/electrolyte_recipe.csv --temperature 30
//! elyte resume
//! elyte campaign --iterations 10
//! elyte life-test --repeats 20
//! elyte tune --pot 2 --volume 50 --steps 3
//! elyte --simulate run --sweep
//! elyte check-config
//! ```
//!
//! Exit status is 0 on success, 2 when a fatal fault stopped the workcell
//! (device links are closed first) and 1 for anything else.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use elyte::config::{StationConfig, DEFAULT_CONFIG_PATH};
use elyte::{logging, station};
use elyte_core::ElyteError;
use elyte_experiment::{run_campaign, FormulationTable, RecipeScheduler};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "elyte")]
#[command(about = "Autonomous electrolyte formulation workcell", long_about = None)]
struct Cli {
    /// Station configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run every instrument in simulated mode
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesise, analyse and clean one formulation
    Run {
        /// Recipe or checkpoint CSV; defaults to the configured recipe
        #[arg(long)]
        recipe: Option<PathBuf>,

        /// Analysis temperature in C
        #[arg(long, default_value_t = 25.0, conflicts_with = "sweep")]
        temperature: f64,

        /// Measure across the configured temperature sweep
        #[arg(long)]
        sweep: bool,
    },

    /// Continue from the checkpoint left by an interrupted run
    Resume {
        #[arg(long, default_value_t = 25.0)]
        temperature: f64,
    },

    /// Optimizer-directed formulation campaign
    Campaign {
        /// Overrides campaign.iterations
        #[arg(long)]
        iterations: Option<usize>,

        /// Ingredient table; defaults to the configured recipe
        #[arg(long)]
        recipe: Option<PathBuf>,
    },

    /// Repeat one formulation back to back
    LifeTest {
        /// Recipe CSV; defaults to the configured recipe
        #[arg(long)]
        recipe: Option<PathBuf>,

        #[arg(long, default_value_t = 1)]
        repeats: usize,

        #[arg(long, default_value_t = 25.0)]
        temperature: f64,
    },

    /// Calibrate aspirate scalar and speed against the balance
    Tune {
        /// Overrides tuning.pot
        #[arg(long)]
        pot: Option<u8>,

        /// Overrides tuning.volume_ul
        #[arg(long)]
        volume: Option<f64>,

        /// Overrides tuning.steps
        #[arg(long)]
        steps: Option<usize>,
    },

    /// Home the gantry and park it beside the rack
    Home,

    /// Print the merged configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let fatal = e.downcast_ref::<ElyteError>().is_some_and(ElyteError::is_fatal);
            error!(error = %format!("{:#}", e), fatal, "elyte exited with an error");
            eprintln!("Error: {:#}", e);
            if fatal {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = StationConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    if cli.simulate {
        config.simulate_all();
    }
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;

    if let Commands::CheckConfig = cli.command {
        let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
        println!("{}", rendered);
        return Ok(());
    }

    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    info!(station = %config.station.name, config = %cli.config.display(), "mixing station starting");

    match cli.command {
        Commands::Run {
            recipe,
            temperature,
            sweep,
        } => {
            let path = recipe.unwrap_or_else(|| config.recipe.recipe_path.clone());
            let table = station::load_formulation(&path)?;
            let plan = station::analysis_plan(&config.analysis, temperature, sweep);
            let mut scheduler = station::build_scheduler(&config, table).await?;
            let report = scheduler.run_cycle(&plan).await?;
            info!(
                doses = report.synthesis.doses,
                cost = report.cost,
                measurements = report.analysis.len(),
                "run complete"
            );
            scheduler.shutdown().await?;
        }
        Commands::Resume { temperature } => {
            let path = config.recipe.checkpoint_path.clone();
            let table = station::load_formulation(&path).context("No checkpoint to resume from")?;
            let plan = station::analysis_plan(&config.analysis, temperature, false);
            let mut scheduler = station::build_scheduler(&config, table).await?;
            scheduler.run_cycle(&plan).await?;
            scheduler.shutdown().await?;
        }
        Commands::Campaign { iterations, recipe } => {
            let path = recipe.unwrap_or_else(|| config.recipe.recipe_path.clone());
            let table = station::load_formulation(&path)?;
            let mut optimizer = station::campaign_optimizer(&config, &table)?;
            let iterations = iterations.unwrap_or(config.campaign.iterations);
            let mut scheduler = station::build_scheduler(&config, table).await?;
            let reports = run_campaign(&mut scheduler, &mut optimizer, iterations).await?;
            info!(iterations = reports.len(), "campaign complete");
            scheduler.shutdown().await?;
        }
        Commands::LifeTest {
            recipe,
            repeats,
            temperature,
        } => {
            let path = recipe.unwrap_or_else(|| config.recipe.recipe_path.clone());
            let table = station::load_formulation(&path)?;
            let plan = station::analysis_plan(&config.analysis, temperature, false);
            let mut scheduler = station::build_scheduler(&config, table).await?;
            let reports = scheduler.run_life_test(&plan, repeats).await?;
            info!(mixtures = reports.len(), "life test complete");
            scheduler.shutdown().await?;
        }
        Commands::Tune { pot, volume, steps } => {
            let mut tune = config.tuning.clone();
            tune.pot = pot.unwrap_or(tune.pot);
            tune.volume_ul = volume.unwrap_or(tune.volume_ul);
            tune.steps = steps.unwrap_or(tune.steps);
            tune.validate().map_err(anyhow::Error::msg).context("Invalid tuning options")?;

            let table = FormulationTable::new(Vec::new())?;
            let mut scheduler = station::build_scheduler(&config, table).await?;
            let report = scheduler.tune(&tune).await?;
            if let Some((scalar, speed_ul_s, error_ul)) = report.best() {
                println!(
                    "Minimum error {:+.3} uL at scalar {} and speed {} uL/s ({})",
                    error_ul,
                    scalar,
                    speed_ul_s,
                    tune.results_path.display()
                );
            }
            scheduler.shutdown().await?;
        }
        Commands::Home => {
            let table = FormulationTable::new(Vec::new())?;
            let mut scheduler = station::build_scheduler(&config, table).await?;
            home(&mut scheduler).await?;
        }
        Commands::CheckConfig => {}
    }

    Ok(())
}

async fn home(scheduler: &mut RecipeScheduler) -> Result<()> {
    let homed = scheduler.home().await;
    let closed = scheduler.shutdown().await;
    homed.context("Homing failed")?;
    closed.context("Failed to close device links")?;
    Ok(())
}
