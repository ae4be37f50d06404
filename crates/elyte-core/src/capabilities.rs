//! Capability traits for the workcell instruments.
//!
//! The recipe scheduler drives instruments only through these traits, so each
//! can be backed by a live controller, a simulated one, or a recording mock in
//! tests. Operations take `&mut self`: every instrument is owned by exactly one
//! holder and commands are strictly sequential.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ElyteResult;

// =============================================================================
// Shared value types
// =============================================================================

/// Gantry head coordinates in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const ORIGIN: Position = Position {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Same x/y at a different height.
    pub fn at_height(self, z: f64) -> Self {
        Self { z, ..self }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3},{:.3},{:.3}", self.x, self.y, self.z)
    }
}

/// Disposable pipette rack slot, 1 through 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlotId(u8);

impl SlotId {
    pub const MAX: u8 = 9;

    /// `None` for 0 (no pipette) or anything past the last rack slot.
    pub fn new(slot: u8) -> Option<Self> {
        (1..=Self::MAX).contains(&slot).then_some(Self(slot))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for SlotId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        SlotId::new(value).ok_or_else(|| format!("pipette slot {} outside 1..={}", value, Self::MAX))
    }
}

impl From<SlotId> for u8 {
    fn from(slot: SlotId) -> u8 {
        slot.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Places the pipette head works at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Station {
    /// Ingredient pot (1-based), with the liquid level left after the
    /// upcoming withdrawal.
    Pot { pot: u8, level_ml: f64 },
    /// Mixing chamber above the test cell feed.
    MixingChamber,
}

/// Outcome of one aspiration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aspiration {
    /// Volume requested by the caller.
    pub requested_ul: f64,
    /// Volume actually commanded after clamping to the pump's dose limit.
    pub applied_ul: f64,
    /// Final pressure setpoint relative to gauge.
    pub target_mbar: f64,
    /// Whether closed-loop readback converged before the settle timeout.
    pub settled: bool,
}

/// Statistics collected over a thermal steady-state window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SteadyState {
    pub target_c: f64,
    pub mean_c: f64,
    pub std_c: f64,
}

// =============================================================================
// Instrument capabilities
// =============================================================================

/// Pressure-actuated pipette pump.
#[async_trait]
pub trait PressurePipette: Send {
    /// Largest volume a single dose can hold.
    fn max_dose_ul(&self) -> f64;

    async fn pump_on(&mut self) -> ElyteResult<()>;

    async fn pump_off(&mut self) -> ElyteResult<()>;

    /// Drive to the charge pressure and wait for it to settle.
    async fn charge(&mut self) -> ElyteResult<()>;

    async fn aspirate(
        &mut self,
        volume_ul: f64,
        scalar: f64,
        speed_ul_s: f64,
    ) -> ElyteResult<Aspiration>;

    /// Vent to zero differential and switch the pump off.
    async fn dispense(&mut self) -> ElyteResult<()>;

    async fn close(&mut self) -> ElyteResult<()>;
}

/// Cartesian gantry carrying the pipette head.
#[async_trait]
pub trait MotionStage: Send {
    async fn move_to(&mut self, target: Position) -> ElyteResult<()>;

    /// Park beside the pipette rack.
    async fn move_to_start(&mut self) -> ElyteResult<()>;

    /// Move above a station at head height.
    async fn approach(&mut self, station: Station) -> ElyteResult<()>;

    /// Drop to the working height of a station.
    async fn descend(&mut self, station: Station) -> ElyteResult<()>;

    /// Raise to head height without moving in x/y.
    async fn lift(&mut self) -> ElyteResult<()>;

    async fn pick_pipette(&mut self, slot: SlotId) -> ElyteResult<()>;

    /// Return the attached pipette. `Ok(false)` when none was attached.
    async fn return_pipette(&mut self) -> ElyteResult<bool>;

    fn active_pipette(&self) -> Option<SlotId>;

    async fn mix(&mut self, count: u32, delay_ms: u32) -> ElyteResult<()>;

    async fn home(&mut self) -> ElyteResult<()>;

    async fn close(&mut self) -> ElyteResult<()>;
}

/// Laboratory balance under the test cell.
#[async_trait]
pub trait MassBalance: Send {
    async fn tare(&mut self) -> ElyteResult<()>;

    /// Current reading in grams.
    async fn get_mass(&mut self) -> ElyteResult<f64>;

    /// Simulated balances report noise, not liquid.
    fn is_simulated(&self) -> bool;

    async fn close(&mut self) -> ElyteResult<()>;
}

/// Thermoelectric stage holding the test cell.
#[async_trait]
pub trait ThermalStage: Send {
    /// Select the heating or cooling profile, write the setpoint and assert run.
    async fn set_temperature(&mut self, target_c: f64) -> ElyteResult<()>;

    /// Block until the stage holds `target_c` for a full steady-state window.
    ///
    /// The run flag is cleared afterwards unless `keep_on` is set.
    async fn wait_until_temperature(
        &mut self,
        target_c: f64,
        keep_on: bool,
    ) -> ElyteResult<SteadyState>;

    /// Clear the run flag.
    async fn stop(&mut self) -> ElyteResult<()>;

    async fn read_temperature(&mut self) -> ElyteResult<f64>;

    async fn close(&mut self) -> ElyteResult<()>;
}

/// Pumps moving electrolyte between the mixing chamber, test cell and waste.
#[async_trait]
pub trait FluidTransfer: Send {
    async fn add_electrolyte(&mut self, volume_ul: f64) -> ElyteResult<()>;

    async fn empty_cell(&mut self, volume_ul: f64) -> ElyteResult<()>;

    /// Flush with cleaning solution, then empty to waste.
    async fn clean_cell(&mut self, volume_ul: f64) -> ElyteResult<()>;

    async fn close(&mut self) -> ElyteResult<()>;
}
