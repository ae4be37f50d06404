//! Recording mock instruments shared by the scheduler integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use elyte_core::capabilities::{
    Aspiration, FluidTransfer, MassBalance, MotionStage, Position, PressurePipette, SlotId,
    Station, SteadyState, ThermalStage,
};
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_experiment::analysis::{Analyzer, ImpedanceResult};
use elyte_experiment::recipe::{FormulationRow, FormulationTable};
use elyte_experiment::scheduler::Workcell;

/// Every instrument call, in the order the scheduler issued it.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    PumpOn,
    PumpOff,
    Charge,
    Aspirate(f64),
    Dispense,
    MoveToStart,
    Approach(Station),
    Descend(Station),
    Lift,
    Pick(u8),
    Return(u8),
    Mix(u32, u32),
    Home,
    Tare,
    GetMass,
    SetTemperature(f64),
    Wait(f64, bool),
    StopThermal,
    AddElectrolyte(f64),
    EmptyCell(f64),
    CleanCell(f64),
    Measure,
    Close(&'static str),
}

pub type OpLog = Arc<Mutex<Vec<Op>>>;

fn record(log: &OpLog, op: Op) {
    log.lock().unwrap().push(op);
}

pub fn ops(log: &OpLog) -> Vec<Op> {
    log.lock().unwrap().clone()
}

// =============================================================================
// Instruments
// =============================================================================

pub struct MockPipette {
    pub log: OpLog,
    pub max_dose: f64,
}

#[async_trait]
impl PressurePipette for MockPipette {
    fn max_dose_ul(&self) -> f64 {
        self.max_dose
    }

    async fn pump_on(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::PumpOn);
        Ok(())
    }

    async fn pump_off(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::PumpOff);
        Ok(())
    }

    async fn charge(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Charge);
        Ok(())
    }

    async fn aspirate(&mut self, volume_ul: f64, _scalar: f64, _speed: f64) -> ElyteResult<Aspiration> {
        record(&self.log, Op::Aspirate(volume_ul));
        Ok(Aspiration {
            requested_ul: volume_ul,
            applied_ul: volume_ul,
            target_mbar: 30.0 + volume_ul * 0.5,
            settled: true,
        })
    }

    async fn dispense(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Dispense);
        Ok(())
    }

    async fn close(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Close("pipette"));
        Ok(())
    }
}

pub struct MockGantry {
    pub log: OpLog,
    pub attached: Option<SlotId>,
}

#[async_trait]
impl MotionStage for MockGantry {
    async fn move_to(&mut self, _target: Position) -> ElyteResult<()> {
        Ok(())
    }

    async fn move_to_start(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::MoveToStart);
        Ok(())
    }

    async fn approach(&mut self, station: Station) -> ElyteResult<()> {
        record(&self.log, Op::Approach(station));
        Ok(())
    }

    async fn descend(&mut self, station: Station) -> ElyteResult<()> {
        record(&self.log, Op::Descend(station));
        Ok(())
    }

    async fn lift(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Lift);
        Ok(())
    }

    async fn pick_pipette(&mut self, slot: SlotId) -> ElyteResult<()> {
        if self.attached.is_some() {
            return Err(ElyteError::State("pipette already attached".into()));
        }
        record(&self.log, Op::Pick(slot.get()));
        self.attached = Some(slot);
        Ok(())
    }

    async fn return_pipette(&mut self) -> ElyteResult<bool> {
        match self.attached.take() {
            Some(slot) => {
                record(&self.log, Op::Return(slot.get()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn active_pipette(&self) -> Option<SlotId> {
        self.attached
    }

    async fn mix(&mut self, count: u32, delay_ms: u32) -> ElyteResult<()> {
        record(&self.log, Op::Mix(count, delay_ms));
        Ok(())
    }

    async fn home(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Home);
        Ok(())
    }

    async fn close(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Close("gantry"));
        Ok(())
    }
}

/// Returns queued readings in order, then repeats the last one.
pub struct MockBalance {
    pub log: OpLog,
    pub readings: VecDeque<f64>,
    pub last: f64,
    pub simulated: bool,
}

#[async_trait]
impl MassBalance for MockBalance {
    async fn tare(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Tare);
        Ok(())
    }

    async fn get_mass(&mut self) -> ElyteResult<f64> {
        record(&self.log, Op::GetMass);
        if let Some(next) = self.readings.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }

    fn is_simulated(&self) -> bool {
        self.simulated
    }

    async fn close(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Close("mass_balance"));
        Ok(())
    }
}

pub struct MockThermal {
    pub log: OpLog,
    /// Fail every wait with a timeout.
    pub never_settles: bool,
}

#[async_trait]
impl ThermalStage for MockThermal {
    async fn set_temperature(&mut self, target_c: f64) -> ElyteResult<()> {
        record(&self.log, Op::SetTemperature(target_c));
        Ok(())
    }

    async fn wait_until_temperature(&mut self, target_c: f64, keep_on: bool) -> ElyteResult<SteadyState> {
        record(&self.log, Op::Wait(target_c, keep_on));
        if self.never_settles {
            return Err(ElyteError::timeout(
                "peltier",
                "steady state",
                Duration::from_secs(7200),
            ));
        }
        Ok(SteadyState {
            target_c,
            mean_c: target_c + 0.02,
            std_c: 0.01,
        })
    }

    async fn stop(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::StopThermal);
        Ok(())
    }

    async fn read_temperature(&mut self) -> ElyteResult<f64> {
        Ok(25.0)
    }

    async fn close(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Close("peltier"));
        Ok(())
    }
}

pub struct MockFluid {
    pub log: OpLog,
}

#[async_trait]
impl FluidTransfer for MockFluid {
    async fn add_electrolyte(&mut self, volume_ul: f64) -> ElyteResult<()> {
        record(&self.log, Op::AddElectrolyte(volume_ul));
        Ok(())
    }

    async fn empty_cell(&mut self, volume_ul: f64) -> ElyteResult<()> {
        record(&self.log, Op::EmptyCell(volume_ul));
        Ok(())
    }

    async fn clean_cell(&mut self, volume_ul: f64) -> ElyteResult<()> {
        record(&self.log, Op::CleanCell(volume_ul));
        Ok(())
    }

    async fn close(&mut self) -> ElyteResult<()> {
        record(&self.log, Op::Close("fluid"));
        Ok(())
    }
}

pub struct MockAnalyzer {
    pub log: OpLog,
    pub result: ImpedanceResult,
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn measure(&mut self, _identifier: &str) -> ElyteResult<ImpedanceResult> {
        record(&self.log, Op::Measure);
        Ok(self.result)
    }
}

// =============================================================================
// Bench assembly
// =============================================================================

pub struct Bench {
    pub log: OpLog,
    pub max_dose: f64,
    pub attached: Option<SlotId>,
    pub readings: Vec<f64>,
    pub simulated_balance: bool,
    pub never_settles: bool,
}

impl Default for Bench {
    fn default() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            max_dose: 100.0,
            attached: None,
            readings: Vec::new(),
            simulated_balance: false,
            never_settles: false,
        }
    }
}

impl Bench {
    pub fn workcell(&self) -> Workcell {
        Workcell {
            pipette: Box::new(MockPipette {
                log: self.log.clone(),
                max_dose: self.max_dose,
            }),
            gantry: Box::new(MockGantry {
                log: self.log.clone(),
                attached: self.attached,
            }),
            balance: Box::new(MockBalance {
                log: self.log.clone(),
                readings: self.readings.iter().copied().collect(),
                last: 0.0,
                simulated: self.simulated_balance,
            }),
            thermal: Box::new(MockThermal {
                log: self.log.clone(),
                never_settles: self.never_settles,
            }),
            fluid: Box::new(MockFluid {
                log: self.log.clone(),
            }),
            analyzer: Box::new(MockAnalyzer {
                log: self.log.clone(),
                result: ImpedanceResult {
                    ohmic_resistance_ohm: 12.5,
                    ionic_conductivity_s_per_m: 8.0,
                },
            }),
        }
    }
}

pub fn row(pot: u8, name: &str, dose_ul: f64) -> FormulationRow {
    FormulationRow {
        pot,
        name: name.to_string(),
        dose_volume_ul: dose_ul,
        container_volume_ml: 40.0,
        density_g_per_ml: 1.2,
        aspirate_scalar: 1.0,
        aspirate_speed_ul_s: 50.0,
        cost_per_ul: 0.01,
    }
}

/// `A` 50 uL, `B` nothing, `C` 120 uL.
pub fn three_row_table() -> FormulationTable {
    FormulationTable::new(vec![row(1, "A", 50.0), row(2, "B", 0.0), row(3, "C", 120.0)])
        .unwrap()
}
