//! Instrument controllers for the elyte workcell.
//!
//! This crate provides one controller per instrument, each owning its
//! [`DeviceLink`](elyte_core::DeviceLink) and implementing the matching
//! capability trait from `elyte-core`:
//! - [`pipette`]: disc pump pipette ([`PressurePipette`](elyte_core::PressurePipette))
//! - [`gantry`]: cartesian gantry with pipette exchange ([`MotionStage`](elyte_core::MotionStage))
//! - [`mass_balance`]: Kern balance and the dispensed-mass check ([`MassBalance`](elyte_core::MassBalance))
//! - [`peltier`]: thermoelectric regulator ([`ThermalStage`](elyte_core::ThermalStage))
//! - [`fluid`]: fluid handling kit ([`FluidTransfer`](elyte_core::FluidTransfer))
//!
//! Every controller has a simulated mode that performs no I/O, selected by the
//! `simulated` flag in its configuration section.

pub mod fluid;
pub mod gantry;
pub mod mass_balance;
pub mod peltier;
pub mod pipette;
pub mod pressure;
pub mod recovery;

pub use fluid::{FluidConfig, FluidHandler};
pub use gantry::{Gantry, GantryConfig, GantryGeometry, GantryState};
pub use mass_balance::{check_mass_change, KernBalance, MassBalanceConfig, MassCheck, MassThresholds, MassTier};
pub use peltier::{Peltier, PeltierConfig, ThermalProfile};
pub use pipette::{Pipette, PipetteConfig};
pub use pressure::{PressureCurve, RampProfile};
pub use recovery::{RecoveryState, RecoveryStore};
