//! # Elyte station
//!
//! Host-side glue for the electrolyte mixing station. The instrument
//! controllers live in `elyte-drivers` and the recipe state machine in
//! `elyte-experiment`; this crate turns a configuration file into a running
//! workcell.
//!
//! - **`config`**: layered TOML + environment configuration with validation
//! - **`logging`**: tracing subscriber setup (stdout format, optional log file)
//! - **`station`**: connects the instruments and builds the scheduler

pub mod config;
pub mod logging;
pub mod station;

pub use config::StationConfig;
