//! Power-loss recovery state for the gantry.
//!
//! The gantry cannot trust its own homing state after an ungraceful shutdown,
//! and the head may still be carrying a disposable pipette. Both facts are kept
//! in one [`RecoveryState`] that is rewritten atomically on every mutation and
//! loaded once at startup.
//!
//! Stations that predate the JSON file kept two flat files instead
//! (`active_pipette.txt` holding `0..9`, `location_recovery.txt` holding
//! `x,y,z`). When no JSON file exists those are imported once.

use std::fs;
use std::path::{Path, PathBuf};

use elyte_core::capabilities::{Position, SlotId};
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_core::persist::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const LEGACY_PIPETTE_FILE: &str = "active_pipette.txt";
pub const LEGACY_LOCATION_FILE: &str = "location_recovery.txt";

/// What the gantry must know after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub active_pipette: Option<SlotId>,
    pub last_position: Option<Position>,
}

/// File-backed [`RecoveryState`].
#[derive(Debug)]
pub struct RecoveryStore {
    path: PathBuf,
    state: RecoveryState,
}

impl RecoveryStore {
    /// Load the state at `path`, importing legacy files from `legacy_dir` if
    /// the JSON file does not exist yet.
    pub fn load(path: impl Into<PathBuf>, legacy_dir: Option<&Path>) -> ElyteResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else if let Some(dir) = legacy_dir {
            import_legacy(dir)?
        } else {
            RecoveryState::default()
        };

        debug!(path = %path.display(), ?state, "recovery state loaded");
        Ok(Self { path, state })
    }

    pub fn state(&self) -> &RecoveryState {
        &self.state
    }

    pub fn active_pipette(&self) -> Option<SlotId> {
        self.state.active_pipette
    }

    pub fn last_position(&self) -> Option<Position> {
        self.state.last_position
    }

    pub fn set_position(&mut self, position: Position) -> ElyteResult<()> {
        self.state.last_position = Some(position);
        self.save()
    }

    pub fn set_active_pipette(&mut self, slot: Option<SlotId>) -> ElyteResult<()> {
        self.state.active_pipette = slot;
        self.save()
    }

    fn save(&self) -> ElyteResult<()> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }
}

fn import_legacy(dir: &Path) -> ElyteResult<RecoveryState> {
    let mut state = RecoveryState::default();

    let pipette_file = dir.join(LEGACY_PIPETTE_FILE);
    if pipette_file.exists() {
        let raw = fs::read_to_string(&pipette_file)?;
        let slot: u8 = raw.trim().parse().map_err(|_| ElyteError::Parse {
            what: "active pipette slot",
            raw: raw.clone(),
        })?;
        state.active_pipette = match slot {
            0 => None,
            n => Some(SlotId::try_from(n).map_err(|e| {
                ElyteError::Config(format!("{}: {}", pipette_file.display(), e))
            })?),
        };
    }

    let location_file = dir.join(LEGACY_LOCATION_FILE);
    if location_file.exists() {
        let raw = fs::read_to_string(&location_file)?;
        state.last_position = Some(parse_position(&raw)?);
    }

    if state != RecoveryState::default() {
        info!(dir = %dir.display(), ?state, "imported legacy recovery files");
    }
    Ok(state)
}

fn parse_position(raw: &str) -> ElyteResult<Position> {
    let invalid = || ElyteError::Parse {
        what: "recovery position",
        raw: raw.to_string(),
    };
    let coords: Vec<f64> = raw
        .trim()
        .split(',')
        .map(|c| c.trim().parse::<f64>().map_err(|_| invalid()))
        .collect::<ElyteResult<_>>()?;
    match coords.as_slice() {
        [x, y, z] => Ok(Position::new(*x, *y, *z)),
        _ => Err(invalid()),
    }
}
