//! Formulation table and its on-disk checkpoint.
//!
//! A recipe is a CSV file with one row per ingredient pot:
//!
//! ```text
//! #,Name,Dose Volume (uL),Container Volume (mL),Density (g/mL),Aspirate Scalar,Aspirate Speed (uL/s),Cost (/uL)
//! 1,EC,120,40,1.32,1.0,50,0.002
//! ```
//!
//! The same layout is used for the checkpoint (`current_state.csv`), which is
//! the table re-serialised after every delivered dose with the container
//! volumes decremented. Resuming a run simply loads the checkpoint in place of
//! the original recipe.

use std::collections::HashMap;
use std::path::Path;

use elyte_core::capabilities::SlotId;
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_core::persist::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Number of ingredient pots on the deck.
pub const POT_COUNT: u8 = 10;

/// Default checkpoint file name, written next to the recipe.
pub const CHECKPOINT_FILE: &str = "current_state.csv";

/// One ingredient pot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulationRow {
    /// Pot number, 1-based. Also selects the pipette rack slot.
    #[serde(rename = "#")]
    pub pot: u8,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Dose Volume (uL)")]
    pub dose_volume_ul: f64,
    /// Liquid remaining in the pot.
    #[serde(rename = "Container Volume (mL)")]
    pub container_volume_ml: f64,
    #[serde(rename = "Density (g/mL)")]
    pub density_g_per_ml: f64,
    #[serde(rename = "Aspirate Scalar")]
    pub aspirate_scalar: f64,
    /// Zero jumps straight to the target pressure.
    #[serde(rename = "Aspirate Speed (uL/s)")]
    pub aspirate_speed_ul_s: f64,
    #[serde(rename = "Cost (/uL)")]
    pub cost_per_ul: f64,
}

impl FormulationRow {
    /// Rack slot holding this ingredient's pipette.
    pub fn slot(&self) -> Option<SlotId> {
        SlotId::new(self.pot)
    }

    pub fn expected_mass_g(&self) -> f64 {
        self.density_g_per_ml * self.dose_volume_ul / 1000.0
    }
}

/// Ordered ingredient rows, one per pot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormulationTable {
    rows: Vec<FormulationRow>,
}

impl FormulationTable {
    pub fn new(rows: Vec<FormulationRow>) -> ElyteResult<Self> {
        let table = Self { rows };
        table.validate()?;
        Ok(table)
    }

    /// Read a recipe or checkpoint CSV.
    pub fn load(path: &Path) -> ElyteResult<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let rows = reader
            .deserialize()
            .collect::<Result<Vec<FormulationRow>, _>>()?;
        let table = Self::new(rows)?;

        info!(
            path = %path.display(),
            ingredients = table.rows.len(),
            total_volume_ml = table.total_volume_ul() / 1000.0,
            "formulation loaded"
        );
        Ok(table)
    }

    /// Atomically write the table to `path`.
    pub fn save(&self, path: &Path) -> ElyteResult<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in &self.rows {
            writer.serialize(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| ElyteError::Io(e.into_error()))?;
        write_atomic(path, &bytes)?;
        debug!(path = %path.display(), "formulation checkpoint written");
        Ok(())
    }

    fn validate(&self) -> ElyteResult<()> {
        let mut seen = HashMap::new();
        for row in &self.rows {
            if !(1..=POT_COUNT).contains(&row.pot) {
                return Err(ElyteError::Config(format!(
                    "{}: pot {} outside 1..={}",
                    row.name, row.pot, POT_COUNT
                )));
            }
            if let Some(other) = seen.insert(row.pot, row.name.as_str()) {
                return Err(ElyteError::Config(format!(
                    "pot {} assigned to both {} and {}",
                    row.pot, other, row.name
                )));
            }
            if !row.dose_volume_ul.is_finite() || row.dose_volume_ul < 0.0 {
                return Err(ElyteError::Config(format!(
                    "{}: dose volume {} must be a non-negative number",
                    row.name, row.dose_volume_ul
                )));
            }
            if row.dose_volume_ul > 0.0 && row.slot().is_none() {
                return Err(ElyteError::Config(format!(
                    "{}: pot {} has no pipette rack slot",
                    row.name, row.pot
                )));
            }
        }
        Ok(())
    }

    pub fn rows(&self) -> &[FormulationRow] {
        &self.rows
    }

    pub fn row_mut(&mut self, index: usize) -> Option<&mut FormulationRow> {
        self.rows.get_mut(index)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Indices of rows that will actually be dosed, in table order.
    pub fn dosed_rows(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.dose_volume_ul > 0.0)
            .map(|(i, _)| i)
    }

    pub fn total_volume_ul(&self) -> f64 {
        self.rows.iter().map(|r| r.dose_volume_ul).sum()
    }

    /// Mass the mixture should add to the balance, in grams.
    pub fn expected_mass_g(&self) -> f64 {
        self.rows.iter().map(FormulationRow::expected_mass_g).sum()
    }

    pub fn calculate_cost(&self) -> f64 {
        self.rows
            .iter()
            .map(|r| r.dose_volume_ul * r.cost_per_ul)
            .sum()
    }

    /// Overwrite dose volumes by ingredient name.
    ///
    /// Ingredients missing from `volumes` are set to zero with a warning.
    /// Negative suggestions are clamped to zero.
    pub fn update_dose_volumes(&mut self, volumes: &HashMap<String, f64>) {
        for row in &mut self.rows {
            match volumes.get(&row.name) {
                Some(&volume) if volume.is_finite() && volume >= 0.0 => {
                    row.dose_volume_ul = volume;
                    info!(ingredient = %row.name, volume_ul = volume, "dose volume updated");
                }
                Some(&volume) => {
                    warn!(
                        ingredient = %row.name,
                        requested = volume,
                        "invalid dose volume suggested, using zero"
                    );
                    row.dose_volume_ul = 0.0;
                }
                None => {
                    warn!(ingredient = %row.name, "no dose volume supplied, using zero");
                    row.dose_volume_ul = 0.0;
                }
            }
        }

        for name in volumes.keys() {
            if !self.rows.iter().any(|r| &r.name == name) {
                warn!(ingredient = %name, "suggested ingredient not in recipe, ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const RECIPE: &str = "\
#,Name,Dose Volume (uL),Container Volume (mL),Density (g/mL),Aspirate Scalar,Aspirate Speed (uL/s),Cost (/uL)
1,EC,120,40,1.32,1.0,50,0.002
2,DMC,0,40,1.07,1.1,0,0.001
3,LiPF6,35.5,12.5,1.5,0.9,25,0.01
";

    fn sample() -> FormulationTable {
        let mut reader = csv::Reader::from_reader(RECIPE.as_bytes());
        let rows = reader.deserialize().map(|r| r.unwrap()).collect();
        FormulationTable::new(rows).unwrap()
    }

    #[test]
    fn test_aggregates() {
        let table = sample();
        assert_eq!(table.rows().len(), 3);
        assert_eq!(table.total_volume_ul(), 155.5);
        assert!((table.expected_mass_g() - (0.1584 + 0.05325)).abs() < 1e-12);
        assert!((table.calculate_cost() - (0.24 + 0.355)).abs() < 1e-12);
        assert_eq!(table.dosed_rows().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);

        let mut table = sample();
        table.row_mut(2).unwrap().container_volume_ml = 12.4645;
        table.save(&path).unwrap();

        let reloaded = FormulationTable::load(&path).unwrap();
        let pairs = |t: &FormulationTable| {
            t.rows()
                .iter()
                .map(|r| (r.name.clone(), r.container_volume_ml))
                .collect::<Vec<_>>()
        };
        assert_eq!(pairs(&reloaded), pairs(&table));
        assert_eq!(reloaded, table);

        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("#,Name,Dose Volume (uL),Container Volume (mL)"));
    }

    #[test]
    fn test_rejects_bad_rows() {
        let mut row = sample().rows()[0].clone();
        row.dose_volume_ul = -1.0;
        assert!(FormulationTable::new(vec![row.clone()]).is_err());

        row.dose_volume_ul = 10.0;
        row.pot = 11;
        assert!(FormulationTable::new(vec![row.clone()]).is_err());

        // pot 10 exists but has no pipette slot
        row.pot = 10;
        assert!(FormulationTable::new(vec![row.clone()]).is_err());
        row.dose_volume_ul = 0.0;
        assert!(FormulationTable::new(vec![row.clone()]).is_ok());

        let mut twin = row.clone();
        twin.name = "twin".into();
        assert!(FormulationTable::new(vec![row, twin]).is_err());
    }

    #[test]
    #[traced_test]
    fn test_missing_suggestion_is_zero_dose() {
        let mut table = sample();
        let volumes = HashMap::from([
            ("EC".to_string(), 80.0),
            ("DMC".to_string(), 60.0),
            ("water".to_string(), 5.0),
        ]);
        table.update_dose_volumes(&volumes);

        let doses: Vec<f64> = table.rows().iter().map(|r| r.dose_volume_ul).collect();
        assert_eq!(doses, vec![80.0, 60.0, 0.0]);
        assert!(logs_contain("no dose volume supplied, using zero"));
        assert!(logs_contain("suggested ingredient not in recipe, ignored"));
    }
}
