//! Error taxonomy for the workcell.
//!
//! Every instrument controller and the recipe scheduler report failures through
//! [`ElyteError`]. Variants map onto the fault classes the workcell reasons
//! about when deciding whether a physical operation may continue:
//!
//! - **`Protocol`**: echo or acknowledgment mismatch, or an "unknown command"
//!   reply. Protocol integrity can no longer be trusted, so this is always fatal.
//! - **`Timeout`**: a bounded wait was exceeded. Fatal for motion, dosing and
//!   thermal operations. Telemetry pollers catch it locally and keep polling.
//! - **`Range`**: a requested volume, pressure or temperature was outside its
//!   calibrated bounds. Controllers clamp and log it; it is never propagated.
//! - **`MassDeviation`**: only raised for the critical tier of the mass check.
//! - **`State`**: an operation was requested in a state where it makes no
//!   sense (e.g. returning a pipette while none is attached). Logged and skipped.
//! - **`Hardware`**: an instrument reported a physical failure (homing failed,
//!   airflow restriction, unstable gauge pressure).
//!
//! The remaining variants wrap persistence and parsing failures.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Fault classification
// =============================================================================

/// Coarse classification of an [`ElyteError`], used for logging and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Protocol,
    Timeout,
    Range,
    MassDeviation,
    State,
    Hardware,
    Config,
    Persistence,
    Parse,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FaultKind::Protocol => "protocol",
            FaultKind::Timeout => "timeout",
            FaultKind::Range => "range",
            FaultKind::MassDeviation => "mass_deviation",
            FaultKind::State => "state",
            FaultKind::Hardware => "hardware",
            FaultKind::Config => "config",
            FaultKind::Persistence => "persistence",
            FaultKind::Parse => "parse",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using the workcell error type.
pub type ElyteResult<T> = std::result::Result<T, ElyteError>;

/// Primary error type for the workcell.
#[derive(Error, Debug)]
pub enum ElyteError {
    /// The instrument did not echo the command, or replied "unknown command".
    #[error("{device} protocol fault: {message}")]
    Protocol { device: String, message: String },

    /// No reply arrived inside the operation's bounded wait.
    #[error("{device} timed out during {operation} after {after:?}")]
    Timeout {
        device: String,
        operation: String,
        after: Duration,
    },

    /// Requested value was outside calibrated bounds and has been clamped.
    #[error("{quantity} of {requested} outside [{min}, {max}], clamped to {applied}")]
    Range {
        quantity: &'static str,
        requested: f64,
        min: f64,
        max: f64,
        applied: f64,
    },

    /// Measured mass differs from the expected mass by at least the critical threshold.
    #[error(
        "mass deviation of {percent_error:.1}% (expected {expected:.4} g, measured {actual:.4} g)"
    )]
    MassDeviation {
        expected: f64,
        actual: f64,
        percent_error: f64,
    },

    #[error("invalid state: {0}")]
    State(String),

    /// The instrument reported or exhibited a physical failure.
    #[error("{device} hardware fault: {message}")]
    Hardware { device: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] csv::Error),

    #[error("recovery state error: {0}")]
    Recovery(#[from] serde_json::Error),

    #[error("could not parse {what} from {raw:?}")]
    Parse { what: &'static str, raw: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ElyteError {
    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn hardware(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hardware {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn timeout(device: impl Into<String>, operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            device: device.into(),
            operation: operation.into(),
            after,
        }
    }

    /// Fault class of this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            ElyteError::Protocol { .. } => FaultKind::Protocol,
            ElyteError::Timeout { .. } => FaultKind::Timeout,
            ElyteError::Range { .. } => FaultKind::Range,
            ElyteError::MassDeviation { .. } => FaultKind::MassDeviation,
            ElyteError::State(_) => FaultKind::State,
            ElyteError::Hardware { .. } => FaultKind::Hardware,
            ElyteError::Config(_) => FaultKind::Config,
            ElyteError::Checkpoint(_) | ElyteError::Recovery(_) | ElyteError::Io(_) => {
                FaultKind::Persistence
            }
            ElyteError::Parse { .. } => FaultKind::Parse,
        }
    }

    /// Whether this fault must stop the run.
    ///
    /// Range and state faults are logged by the controller that detected them
    /// and never abort a cycle. Everything else crossing the scheduler boundary
    /// ends the process after the device links are closed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), FaultKind::Range | FaultKind::State)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ElyteError::Timeout { .. })
    }
}
