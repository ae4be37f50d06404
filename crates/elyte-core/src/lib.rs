//! Core building blocks for the elyte workcell.
//!
//! - [`error`]: fault taxonomy shared by every controller
//! - [`serial`]: serial port plumbing
//! - [`link`]: the register/command transport every instrument speaks
//! - [`capabilities`]: instrument traits the scheduler is written against
//! - [`persist`]: atomic flat-file writes for checkpoints and recovery state

pub mod capabilities;
pub mod error;
pub mod link;
pub mod persist;
pub mod serial;

pub use capabilities::{
    Aspiration, FluidTransfer, MassBalance, MotionStage, Position, PressurePipette, SlotId,
    Station, SteadyState, ThermalStage,
};
pub use error::{ElyteError, ElyteResult, FaultKind};
pub use link::{DeviceLink, Dialect};
