//! Aspiration calibration grid.
//!
//! A tuning run doses one pot repeatedly over a grid of aspirate scalars and
//! aspirate speeds, weighing every delivery on the balance. The error grid is
//! rewritten to a CSV after each point so an interrupted run keeps what it
//! measured. The grid is driven by [`RecipeScheduler::tune`].
//!
//! [`RecipeScheduler::tune`]: crate::scheduler::RecipeScheduler::tune

use std::path::{Path, PathBuf};

use elyte_core::capabilities::SlotId;
use elyte_core::error::{ElyteError, ElyteResult};
use elyte_core::persist::write_atomic;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    /// Pot holding the calibration liquid; its pipette sits in the same slot.
    pub pot: u8,
    /// Volume delivered at every grid point.
    pub volume_ul: f64,
    pub container_volume_ml: f64,
    pub density_g_per_ml: f64,
    /// Inclusive `[low, high]` range of aspirate scalars.
    pub scalar_range: [f64; 2],
    /// Inclusive `[low, high]` range of aspirate speeds, uL/s.
    pub speed_range_ul_s: [f64; 2],
    /// Points per axis.
    pub steps: usize,
    /// Pump each delivery on into the test cell before weighing, then drain it.
    pub transfer_to_cell: bool,
    pub results_path: PathBuf,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            pot: 1,
            volume_ul: 100.0,
            container_volume_ml: 50.0,
            density_g_per_ml: 1.0,
            scalar_range: [0.8, 1.2],
            speed_range_ul_s: [10.0, 100.0],
            steps: 5,
            transfer_to_cell: false,
            results_path: PathBuf::from("data/results/aspiration_tuning_results.csv"),
        }
    }
}

impl TuneConfig {
    pub fn validate(&self) -> Result<(), String> {
        if SlotId::new(self.pot).is_none() {
            return Err(format!("tuning.pot {} has no pipette slot", self.pot));
        }
        if self.volume_ul.is_nan() || self.volume_ul <= 0.0 {
            return Err("tuning.volume_ul must be positive".into());
        }
        if self.density_g_per_ml.is_nan() || self.density_g_per_ml <= 0.0 {
            return Err("tuning.density_g_per_ml must be positive".into());
        }
        if self.container_volume_ml < 0.0 {
            return Err("tuning.container_volume_ml must be non-negative".into());
        }
        if self.steps == 0 {
            return Err("tuning.steps must be at least 1".into());
        }
        for (name, [low, high]) in [
            ("scalar_range", self.scalar_range),
            ("speed_range_ul_s", self.speed_range_ul_s),
        ] {
            if !low.is_finite() || !high.is_finite() || low <= 0.0 || low > high {
                return Err(format!(
                    "tuning.{} [{}, {}] must be positive and ordered",
                    name, low, high
                ));
            }
        }
        Ok(())
    }

    pub fn scalars(&self) -> Vec<f64> {
        linspace(self.scalar_range, self.steps)
    }

    pub fn speeds(&self) -> Vec<f64> {
        linspace(self.speed_range_ul_s, self.steps)
    }
}

/// Volume errors over the scalar × speed grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuningReport {
    pub scalars: Vec<f64>,
    pub speeds_ul_s: Vec<f64>,
    /// `errors_ul[i][j]` is delivered minus expected volume for scalar `i`
    /// and speed `j`. `None` marks a point not yet measured.
    pub errors_ul: Vec<Vec<Option<f64>>>,
}

impl TuningReport {
    pub fn new(scalars: Vec<f64>, speeds_ul_s: Vec<f64>) -> Self {
        let errors_ul = vec![vec![None; speeds_ul_s.len()]; scalars.len()];
        Self {
            scalars,
            speeds_ul_s,
            errors_ul,
        }
    }

    /// `(scalar, speed, error)` of the smallest absolute error measured.
    pub fn best(&self) -> Option<(f64, f64, f64)> {
        let mut best: Option<(f64, f64, f64)> = None;
        for (i, row) in self.errors_ul.iter().enumerate() {
            for (j, error) in row.iter().enumerate() {
                let Some(error) = *error else { continue };
                let better = match best {
                    Some((_, _, b)) => error.abs() < b.abs(),
                    None => true,
                };
                if better {
                    best = Some((self.scalars[i], self.speeds_ul_s[j], error));
                }
            }
        }
        best
    }

    /// Write the grid as CSV: one row per scalar, one column per speed.
    pub fn save(&self, path: &Path) -> ElyteResult<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let header = std::iter::once("aspirate_scalar".to_string())
            .chain(self.speeds_ul_s.iter().map(f64::to_string));
        writer.write_record(header)?;
        for (scalar, row) in self.scalars.iter().zip(&self.errors_ul) {
            let cells = std::iter::once(scalar.to_string()).chain(
                row.iter()
                    .map(|error| error.map(|e| e.to_string()).unwrap_or_default()),
            );
            writer.write_record(cells)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| ElyteError::Io(e.into_error()))?;
        write_atomic(path, &bytes)?;
        Ok(())
    }
}

/// `steps` values evenly spaced over `[low, high]` inclusive, rounded to 0.001.
pub fn linspace([low, high]: [f64; 2], steps: usize) -> Vec<f64> {
    match steps {
        0 => Vec::new(),
        1 => vec![low],
        n => (0..n)
            .map(|i| ((low + (high - low) * i as f64 / (n - 1) as f64) * 1000.0).round() / 1000.0)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linspace() {
        assert_eq!(linspace([0.8, 1.2], 5), vec![0.8, 0.9, 1.0, 1.1, 1.2]);
        assert_eq!(linspace([10.0, 100.0], 1), vec![10.0]);
        assert!(linspace([1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn test_best_ignores_unmeasured_points() {
        let mut report = TuningReport::new(vec![0.9, 1.1], vec![20.0, 40.0]);
        assert_eq!(report.best(), None);

        report.errors_ul[0][1] = Some(-3.0);
        report.errors_ul[1][0] = Some(1.5);
        assert_eq!(report.best(), Some((1.1, 20.0, 1.5)));
    }

    #[test]
    fn test_partial_grid_saved_with_blank_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("tuning.csv");
        let mut report = TuningReport::new(vec![0.9, 1.1], vec![20.0, 40.0]);
        report.errors_ul[0][0] = Some(-2.5);
        report.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["aspirate_scalar,20,40", "0.9,-2.5,", "1.1,,"]);
    }

    #[test]
    fn test_validate() {
        assert!(TuneConfig::default().validate().is_ok());
        for broken in [
            TuneConfig { pot: 10, ..Default::default() },
            TuneConfig { steps: 0, ..Default::default() },
            TuneConfig { volume_ul: 0.0, ..Default::default() },
            TuneConfig { scalar_range: [1.2, 0.8], ..Default::default() },
            TuneConfig { speed_range_ul_s: [0.0, 50.0], ..Default::default() },
        ] {
            assert!(broken.validate().is_err());
        }
    }
}
