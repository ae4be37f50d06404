//! RecipeScheduler - sequences one synthesise → analyse → clean cycle.
//!
//! The scheduler owns one handle per instrument (a [`Workcell`]) and drives
//! them strictly one at a time: motion, dosing, thermal and fluid operations
//! share the headspace above the mixing chamber and test cell.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐    ┌───────┐    ┌──────┐    ┌──────┐    ┌─────────┐
//! │ Idle │───▶│ Start │───▶│ Pick │───▶│ Dose │───▶│ Deliver │──┐
//! └──────┘    └───────┘    └──────┘    └──────┘    └─────────┘  │
//!                              ▲           ▲    next sub-dose   │
//!                              │           └────────────────────┤
//!                              │           next ingredient      │
//!                              └────────────────────────────────┤
//!                                                               ▼
//! ┌──────┐    ┌───────┐    ┌──────────┐    ┌───────────┐    ┌─────┐
//! │ Done │◀───│ Clean │◀───│ Analysis │◀───│ MassCheck │◀───│ Mix │
//! └──────┘    └───────┘    └──────────┘    └───────────┘    └─────┘
//!
//!        any state ──fault──▶ Fault (device links closed)
//! ```
//!
//! After every delivered sub-dose the formulation table, with the pot's
//! remaining volume decremented, is written to the checkpoint file. That
//! write is the unit of crash safety: a resumed run loads the checkpoint in
//! place of the recipe.

use std::collections::HashMap;
use std::path::PathBuf;

use elyte_core::capabilities::{
    FluidTransfer, MassBalance, MotionStage, PressurePipette, SlotId, Station, SteadyState,
    ThermalStage,
};
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_drivers::mass_balance::{check_mass_change, MassCheck, MassThresholds};
use elyte_drivers::peltier::append_temperature_report;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, instrument, warn};

use crate::analysis::{AnalysisPlan, Analyzer, TemperaturePoint};
use crate::dose_plan::plan_doses;
use crate::recipe::{FormulationRow, FormulationTable};
use crate::tuning::{TuneConfig, TuningReport};

// =============================================================================
// Cycle state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Start,
    Pick,
    Dose,
    Deliver,
    Mix,
    MassCheck,
    Analysis,
    Clean,
    Done,
    Fault,
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleState::Idle => write!(f, "idle"),
            CycleState::Start => write!(f, "start"),
            CycleState::Pick => write!(f, "pick"),
            CycleState::Dose => write!(f, "dose"),
            CycleState::Deliver => write!(f, "deliver"),
            CycleState::Mix => write!(f, "mix"),
            CycleState::MassCheck => write!(f, "mass_check"),
            CycleState::Analysis => write!(f, "analysis"),
            CycleState::Clean => write!(f, "clean"),
            CycleState::Done => write!(f, "done"),
            CycleState::Fault => write!(f, "fault"),
        }
    }
}

// =============================================================================
// Configuration and reports
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeConfig {
    /// Recipe used by a fresh run.
    pub recipe_path: PathBuf,
    /// Checkpoint rewritten after every dose and used by a resumed run.
    pub checkpoint_path: PathBuf,
    pub mix_count: u32,
    pub mix_delay_ms: u32,
    /// Pause between mixing and the starting mass reading.
    pub settle_ms: u64,
    /// Cleaning solution pumped through the cell after analysis.
    pub clean_volume_ul: f64,
    /// Remainders smaller than this are below the pump's resolution and
    /// are not dosed.
    pub min_dose_ul: f64,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            recipe_path: PathBuf::from("data/recipes/electrolyte_recipe.csv"),
            checkpoint_path: PathBuf::from("data/recipes/current_state.csv"),
            mix_count: 25,
            mix_delay_ms: 100,
            settle_ms: 1000,
            clean_volume_ul: 3000.0,
            min_dose_ul: 1.0,
        }
    }
}

/// Outcome of the synthesis half of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisReport {
    /// Aspirate/dispense cycles performed.
    pub doses: usize,
    pub checkpoints: usize,
    pub total_volume_ul: f64,
    pub mass_check: MassCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub synthesis: SynthesisReport,
    pub analysis: Vec<TemperaturePoint>,
    pub cost: f64,
}

// =============================================================================
// Workcell
// =============================================================================

/// One owned handle per instrument.
pub struct Workcell {
    pub pipette: Box<dyn PressurePipette>,
    pub gantry: Box<dyn MotionStage>,
    pub balance: Box<dyn MassBalance>,
    pub thermal: Box<dyn ThermalStage>,
    pub fluid: Box<dyn FluidTransfer>,
    pub analyzer: Box<dyn Analyzer>,
}

impl Workcell {
    /// Close every device link, continuing past failures.
    ///
    /// Returns the first failure, if any.
    pub async fn close(&mut self) -> ElyteResult<()> {
        let results = [
            ("pipette", self.pipette.close().await),
            ("gantry", self.gantry.close().await),
            ("mass_balance", self.balance.close().await),
            ("peltier", self.thermal.close().await),
            ("fluid", self.fluid.close().await),
        ];

        let mut first = None;
        for (device, result) in results {
            if let Err(e) = result {
                warn!(device, error = %e, "failed to close device link");
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct RecipeScheduler {
    workcell: Workcell,
    table: FormulationTable,
    config: RecipeConfig,
    thresholds: MassThresholds,
    temperature_report: Option<PathBuf>,
    state: CycleState,
    history: Vec<CycleState>,
}

impl RecipeScheduler {
    pub fn new(
        workcell: Workcell,
        table: FormulationTable,
        config: RecipeConfig,
        thresholds: MassThresholds,
    ) -> Self {
        Self {
            workcell,
            table,
            config,
            thresholds,
            temperature_report: None,
            state: CycleState::Idle,
            history: vec![CycleState::Idle],
        }
    }

    /// Append steady-state statistics of every analysis to `path`.
    pub fn with_temperature_report(mut self, path: impl Into<PathBuf>) -> Self {
        self.temperature_report = Some(path.into());
        self
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// States entered by the current or most recent cycle, oldest first.
    pub fn history(&self) -> &[CycleState] {
        &self.history
    }

    pub fn table(&self) -> &FormulationTable {
        &self.table
    }

    /// Replace the formulation with optimizer-supplied dose volumes and
    /// checkpoint it.
    pub fn update_dose_volumes(&mut self, volumes: &HashMap<String, f64>) -> ElyteResult<()> {
        self.table.update_dose_volumes(volumes);
        self.table.save(&self.config.checkpoint_path)
    }

    pub fn calculate_cost(&self) -> f64 {
        self.table.calculate_cost()
    }

    fn transition(&mut self, next: CycleState) {
        if next != self.state {
            info!(from = %self.state, to = %next, "cycle state transition");
        }
        self.state = next;
        self.history.push(next);
    }

    /// Run a full cycle: pre-heat, synthesise, analyse, clean.
    ///
    /// Any fault closes every device link before it is returned.
    pub async fn run_cycle(&mut self, plan: &AnalysisPlan) -> ElyteResult<CycleReport> {
        self.history.clear();
        self.history.push(self.state);
        info!(
            ingredients = self.table.dosed_rows().count(),
            total_volume_ul = self.table.total_volume_ul(),
            "beginning electrolyte cycle"
        );
        match self.cycle(plan).await {
            Ok(report) => {
                self.transition(CycleState::Done);
                info!(cost = report.cost, "cycle complete");
                Ok(report)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn cycle(&mut self, plan: &AnalysisPlan) -> ElyteResult<CycleReport> {
        if let Some(&first) = plan.targets().first() {
            info!(target_c = first, "pre-heating test cell");
            self.workcell.thermal.set_temperature(first).await?;
        }
        let cost = self.calculate_cost();
        let synthesis = self.synthesise().await?;
        let analysis = self.analyse(plan).await?;
        self.clean(synthesis.total_volume_ul).await?;
        Ok(CycleReport {
            synthesis,
            analysis,
            cost,
        })
    }

    /// Run the loaded formulation `repeats` times back to back.
    ///
    /// Pot levels carry over between cycles through the checkpoint. The first
    /// fault stops the run with every device link closed.
    #[instrument(skip(self, plan), err)]
    pub async fn run_life_test(&mut self, plan: &AnalysisPlan, repeats: usize) -> ElyteResult<Vec<CycleReport>> {
        info!(repeats, "beginning life test");
        let mut reports = Vec::with_capacity(repeats);
        for mixture in 1..=repeats {
            info!(mixture, repeats, "creating electrolyte mixture");
            reports.push(self.run_cycle(plan).await?);
        }
        info!(repeats, "life test complete");
        Ok(reports)
    }

    /// Calibrate aspiration against the balance over a scalar × speed grid.
    ///
    /// Every grid point doses `volume_ul` from one pot and compares the
    /// weighed mass change with the expected volume. The grid is saved after
    /// each point. Any fault closes every device link.
    #[instrument(skip(self, tune), fields(pot = tune.pot, volume_ul = tune.volume_ul), err)]
    pub async fn tune(&mut self, tune: &TuneConfig) -> ElyteResult<TuningReport> {
        self.history.clear();
        self.history.push(self.state);
        match self.tuning(tune).await {
            Ok(report) => {
                self.transition(CycleState::Done);
                if let Some((scalar, speed_ul_s, error_ul)) = report.best() {
                    info!(scalar, speed_ul_s, error_ul, "minimum aspiration error");
                }
                Ok(report)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn tuning(&mut self, tune: &TuneConfig) -> ElyteResult<TuningReport> {
        tune.validate().map_err(ElyteError::Config)?;
        let slot = SlotId::try_from(tune.pot).map_err(ElyteError::Config)?;
        let plan = plan_doses(
            tune.volume_ul,
            self.workcell.pipette.max_dose_ul(),
            self.config.min_dose_ul,
        )?;
        let mut report = TuningReport::new(tune.scalars(), tune.speeds());
        info!(
            aspirations = report.scalars.len() * report.speeds_ul_s.len(),
            doses_per_point = plan.len(),
            "beginning aspiration tuning"
        );

        self.transition(CycleState::Start);
        self.return_pipette().await?;
        self.workcell.gantry.move_to_start().await?;
        self.transition(CycleState::Pick);
        self.workcell.pipette.pump_off().await?;
        self.workcell.gantry.pick_pipette(slot).await?;

        let expected_ul = if tune.transfer_to_cell {
            tune.volume_ul - self.thresholds.correction_g * 1e3 / tune.density_g_per_ml
        } else {
            tune.volume_ul
        };
        let mut level_ml = tune.container_volume_ml;
        let scalars = report.scalars.clone();
        let speeds = report.speeds_ul_s.clone();

        for (i, &scalar) in scalars.iter().enumerate() {
            for (j, &speed) in speeds.iter().enumerate() {
                info!(scalar, speed_ul_s = speed, volume_ul = tune.volume_ul, "tuning point");
                let row = FormulationRow {
                    pot: tune.pot,
                    name: format!("tuning pot {}", tune.pot),
                    dose_volume_ul: tune.volume_ul,
                    container_volume_ml: level_ml,
                    density_g_per_ml: tune.density_g_per_ml,
                    aspirate_scalar: scalar,
                    aspirate_speed_ul_s: speed,
                    cost_per_ul: 0.0,
                };

                let starting_g = self.workcell.balance.get_mass().await?;
                for &dose in &plan {
                    self.transition(CycleState::Dose);
                    level_ml = self.collect(&row, dose, level_ml).await?;
                    self.transition(CycleState::Deliver);
                    self.deliver().await?;
                }
                if tune.transfer_to_cell {
                    self.workcell.fluid.add_electrolyte(tune.volume_ul).await?;
                }

                self.transition(CycleState::MassCheck);
                let delivered_ul = 1e3 * (self.workcell.balance.get_mass().await? - starting_g)
                    / tune.density_g_per_ml;
                let error_ul = ((delivered_ul - expected_ul) * 1000.0).round() / 1000.0;
                info!(scalar, speed_ul_s = speed, delivered_ul, error_ul, "aspiration error");
                if tune.transfer_to_cell {
                    self.workcell.fluid.empty_cell(tune.volume_ul).await?;
                }

                report.errors_ul[i][j] = Some(error_ul);
                report.save(&tune.results_path)?;
            }
        }

        self.return_pipette().await?;
        self.workcell.gantry.move_to_start().await?;
        Ok(report)
    }

    /// Put the workcell into `Fault` for an error raised outside a cycle.
    ///
    /// Closes every device link and hands `e` back. A scheduler already in
    /// `Fault` has closed its links, so the error is returned untouched.
    pub async fn abort(&mut self, e: ElyteError) -> ElyteError {
        if self.state == CycleState::Fault {
            return e;
        }
        self.fail(e).await
    }

    async fn fail(&mut self, e: ElyteError) -> ElyteError {
        error!(fault = %e.kind(), error = %e, state = %self.state, "fatal fault, closing device links");
        self.transition(CycleState::Fault);
        if let Err(close) = self.workcell.close().await {
            error!(error = %close, "device links did not close cleanly");
        }
        e
    }

    /// Dose every ingredient into the mixing chamber, mix, transfer to the
    /// test cell and verify the transferred mass.
    #[instrument(skip(self), err)]
    pub async fn synthesise(&mut self) -> ElyteResult<SynthesisReport> {
        self.transition(CycleState::Start);
        let max_dose = self.workcell.pipette.max_dose_ul();

        self.return_pipette().await?;
        self.workcell.gantry.move_to_start().await?;

        let mut doses = 0;
        let mut checkpoints = 0;
        let dosed: Vec<usize> = self.table.dosed_rows().collect();

        for index in dosed {
            let row = self.table.rows()[index].clone();
            let slot = row.slot().ok_or_else(|| {
                ElyteError::Config(format!("{}: pot {} has no pipette slot", row.name, row.pot))
            })?;
            let plan = plan_doses(row.dose_volume_ul, max_dose, self.config.min_dose_ul)?;
            info!(
                ingredient = %row.name,
                volume_ul = row.dose_volume_ul,
                doses = plan.len(),
                "dosing ingredient"
            );

            self.transition(CycleState::Pick);
            self.return_pipette().await?;
            self.workcell.pipette.pump_off().await?;
            self.workcell.gantry.pick_pipette(slot).await?;

            let mut level_ml = row.container_volume_ml;
            for dose in plan {
                self.transition(CycleState::Dose);
                level_ml = self.collect(&row, dose, level_ml).await?;

                self.transition(CycleState::Deliver);
                self.deliver().await?;
                doses += 1;

                if let Some(stored) = self.table.row_mut(index) {
                    stored.container_volume_ml = level_ml;
                }
                self.table.save(&self.config.checkpoint_path)?;
                checkpoints += 1;
            }
        }

        self.return_pipette().await?;

        self.transition(CycleState::Mix);
        self.workcell
            .gantry
            .mix(self.config.mix_count, self.config.mix_delay_ms)
            .await?;
        sleep(Duration::from_millis(self.config.settle_ms)).await;

        self.transition(CycleState::MassCheck);
        self.workcell.balance.tare().await?;
        let starting_g = self.workcell.balance.get_mass().await?;
        let total_volume_ul = self.table.total_volume_ul();
        self.workcell.fluid.add_electrolyte(total_volume_ul).await?;
        let mass_check = check_mass_change(
            self.workcell.balance.as_mut(),
            self.table.expected_mass_g(),
            starting_g,
            &self.thresholds,
        )
        .await?;

        Ok(SynthesisReport {
            doses,
            checkpoints,
            total_volume_ul,
            mass_check,
        })
    }

    /// Hold the cell at each target temperature and measure.
    ///
    /// The thermal stage stays energised through each measurement and is
    /// released once the plan is complete.
    #[instrument(skip(self), err)]
    pub async fn analyse(&mut self, plan: &AnalysisPlan) -> ElyteResult<Vec<TemperaturePoint>> {
        self.transition(CycleState::Analysis);

        let mut points = Vec::with_capacity(plan.targets().len());
        let mut steady_states: Vec<SteadyState> = Vec::with_capacity(points.capacity());
        for (i, &target_c) in plan.targets().iter().enumerate() {
            let steady = self
                .workcell
                .thermal
                .wait_until_temperature(target_c, true)
                .await?;
            let identifier = dataset_identifier(i + 1);
            let impedance = self.workcell.analyzer.measure(&identifier).await?;
            info!(
                target_c,
                mean_c = steady.mean_c,
                std_c = steady.std_c,
                %identifier,
                ohmic_resistance_ohm = impedance.ohmic_resistance_ohm,
                ionic_conductivity_s_per_m = impedance.ionic_conductivity_s_per_m,
                "measurement complete"
            );
            steady_states.push(steady);
            points.push(TemperaturePoint {
                target_c,
                mean_c: steady.mean_c,
                std_c: steady.std_c,
                identifier,
                impedance,
            });
        }
        self.workcell.thermal.stop().await?;

        if let Some(path) = &self.temperature_report {
            append_temperature_report(path, &steady_states)?;
        }
        Ok(points)
    }

    /// Drain the test cell and run a cleaning flush.
    #[instrument(skip(self), err)]
    pub async fn clean(&mut self, volume_ul: f64) -> ElyteResult<()> {
        self.transition(CycleState::Clean);
        self.workcell.fluid.empty_cell(volume_ul).await?;
        self.workcell
            .fluid
            .clean_cell(self.config.clean_volume_ul)
            .await
    }

    /// Home the gantry and park it beside the rack.
    pub async fn home(&mut self) -> ElyteResult<()> {
        self.return_pipette().await?;
        self.workcell.gantry.home().await?;
        self.workcell.gantry.move_to_start().await
    }

    /// Close every device link.
    pub async fn shutdown(&mut self) -> ElyteResult<()> {
        info!("shutting down workcell");
        self.workcell.close().await
    }

    async fn return_pipette(&mut self) -> ElyteResult<()> {
        if self.workcell.gantry.active_pipette().is_none() {
            return Ok(());
        }
        self.workcell.pipette.pump_off().await?;
        self.workcell.gantry.return_pipette().await?;
        Ok(())
    }

    /// Aspirate one sub-dose. Returns the pot level after the withdrawal.
    async fn collect(&mut self, row: &FormulationRow, dose_ul: f64, level_ml: f64) -> ElyteResult<f64> {
        let remaining_ml = ((level_ml - dose_ul * 1e-3) * 1e4).round() / 1e4;
        if remaining_ml < 0.0 {
            warn!(ingredient = %row.name, remaining_ml, "pot volume exhausted");
        }
        let pot = Station::Pot {
            pot: row.pot,
            level_ml: remaining_ml,
        };

        let gantry = &mut self.workcell.gantry;
        let pipette = &mut self.workcell.pipette;

        gantry.approach(pot).await?;
        pipette.pump_on().await?;
        pipette.charge().await?;
        gantry.descend(pot).await?;
        let aspiration = pipette
            .aspirate(dose_ul, row.aspirate_scalar, row.aspirate_speed_ul_s)
            .await?;
        if !aspiration.settled {
            warn!(
                ingredient = %row.name,
                requested_ul = aspiration.requested_ul,
                "aspiration pressure did not settle, dose may be partial"
            );
        }
        gantry.lift().await?;

        debug!(
            ingredient = %row.name,
            dose_ul = aspiration.applied_ul,
            remaining_ml,
            "aspiration complete"
        );
        Ok(remaining_ml)
    }

    async fn deliver(&mut self) -> ElyteResult<()> {
        let gantry = &mut self.workcell.gantry;
        gantry.approach(Station::MixingChamber).await?;
        gantry.descend(Station::MixingChamber).await?;
        self.workcell.pipette.dispense().await?;
        self.workcell.gantry.lift().await
    }
}

/// Dataset name handed to the analyzer, unique within a sweep.
fn dataset_identifier(point: usize) -> String {
    let now = chrono::Local::now();
    format!("ID_{}_{}", now.format("%d-%m-%Y_%H-%M-%S"), point)
}
