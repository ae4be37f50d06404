//! Recipe execution for the elyte workcell.
//!
//! - [`recipe`]: formulation table and checkpoint file
//! - [`dose_plan`]: splitting ingredient volumes into pipette-sized doses
//! - [`scheduler`]: the synthesise → analyse → clean state machine
//! - [`analysis`]: impedance analyzer collaborator
//! - [`campaign`]: optimizer collaborator and the campaign loop
//! - [`tuning`]: aspiration calibration grid

pub mod analysis;
pub mod campaign;
pub mod dose_plan;
pub mod recipe;
pub mod scheduler;
pub mod tuning;

pub use analysis::{AnalysisConfig, AnalysisPlan, Analyzer, ImpedanceResult, SimulatedAnalyzer};
pub use campaign::{
    run_campaign, CampaignConfig, CampaignReport, CampaignResult, Optimizer, RandomOptimizer,
    Suggestion,
};
pub use dose_plan::plan_doses;
pub use recipe::{FormulationRow, FormulationTable};
pub use scheduler::{CycleReport, CycleState, RecipeConfig, RecipeScheduler, SynthesisReport, Workcell};
pub use tuning::{TuneConfig, TuningReport};
