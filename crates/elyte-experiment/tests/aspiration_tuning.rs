mod common;

use common::{ops, Bench, Op};
use elyte_core::capabilities::Station;
use elyte_core::error::ElyteError;
use elyte_drivers::mass_balance::MassThresholds;
use elyte_experiment::recipe::{FormulationTable, CHECKPOINT_FILE};
use elyte_experiment::scheduler::{CycleState, RecipeConfig, RecipeScheduler};
use elyte_experiment::tuning::TuneConfig;

fn scheduler(bench: &Bench, dir: &tempfile::TempDir) -> RecipeScheduler {
    RecipeScheduler::new(
        bench.workcell(),
        FormulationTable::new(Vec::new()).unwrap(),
        RecipeConfig {
            checkpoint_path: dir.path().join(CHECKPOINT_FILE),
            ..Default::default()
        },
        MassThresholds::default(),
    )
}

fn two_by_two(dir: &tempfile::TempDir) -> TuneConfig {
    TuneConfig {
        pot: 2,
        volume_ul: 100.0,
        container_volume_ml: 50.0,
        density_g_per_ml: 1.0,
        scalar_range: [0.8, 1.2],
        speed_range_ul_s: [10.0, 100.0],
        steps: 2,
        transfer_to_cell: false,
        results_path: dir.path().join("results").join("aspiration_tuning_results.csv"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_tuning_grid_weighs_every_point() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        // start/end pairs: 98, 102, 100.5 and 101 uL delivered
        readings: vec![0.0, 0.098, 0.098, 0.2, 0.2, 0.3005, 0.3005, 0.4015],
        ..Default::default()
    };
    let mut scheduler = scheduler(&bench, &dir);
    let tune = two_by_two(&dir);

    let report = scheduler.tune(&tune).await.unwrap();

    assert_eq!(report.scalars, vec![0.8, 1.2]);
    assert_eq!(report.speeds_ul_s, vec![10.0, 100.0]);
    let errors: Vec<f64> = report.errors_ul.iter().flatten().map(|e| e.unwrap()).collect();
    let expected = [-2.0, 2.0, 0.5, 1.0];
    for (error, want) in errors.iter().zip(expected) {
        assert!((error - want).abs() < 1e-9, "{:?}", errors);
    }
    let (scalar, speed, error) = report.best().unwrap();
    assert_eq!((scalar, speed), (1.2, 10.0));
    assert!((error - 0.5).abs() < 1e-9);
    assert_eq!(scheduler.state(), CycleState::Done);

    let log = ops(&bench.log);
    assert_eq!(log.iter().filter(|op| **op == Op::GetMass).count(), 8);
    let levels: Vec<f64> = log
        .iter()
        .filter_map(|op| match op {
            Op::Descend(Station::Pot { pot: 2, level_ml }) => Some(*level_ml),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec![49.9, 49.8, 49.7, 49.6]);
    assert_eq!(&log[..3], &[Op::MoveToStart, Op::PumpOff, Op::Pick(2)]);
    assert_eq!(&log[log.len() - 3..], &[Op::PumpOff, Op::Return(2), Op::MoveToStart]);
    assert!(!log.iter().any(|op| matches!(op, Op::AddElectrolyte(_) | Op::Close(_))));

    let text = std::fs::read_to_string(&tune.results_path).unwrap();
    assert_eq!(text.lines().next(), Some("aspirate_scalar,10,100"));
    assert_eq!(text.lines().count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_tuning_through_cell_drains_each_point() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        readings: vec![0.0, 0.1],
        ..Default::default()
    };
    let mut scheduler = scheduler(&bench, &dir);
    let tune = TuneConfig {
        steps: 1,
        transfer_to_cell: true,
        ..two_by_two(&dir)
    };

    let report = scheduler.tune(&tune).await.unwrap();
    assert_eq!(report.errors_ul, vec![vec![Some(0.0)]]);

    let log = ops(&bench.log);
    let add = log.iter().position(|op| *op == Op::AddElectrolyte(100.0)).unwrap();
    assert_eq!(&log[add + 1..add + 3], &[Op::GetMass, Op::EmptyCell(100.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_tuning_grid_faults_the_workcell() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::default();
    let mut scheduler = scheduler(&bench, &dir);
    let tune = TuneConfig {
        pot: 10,
        ..two_by_two(&dir)
    };

    let err = scheduler.tune(&tune).await.unwrap_err();
    assert!(matches!(err, ElyteError::Config(_)));
    assert_eq!(scheduler.state(), CycleState::Fault);
    let log = ops(&bench.log);
    assert!(!log.iter().any(|op| matches!(op, Op::Aspirate(_))));
    assert!(log.contains(&Op::Close("gantry")));
    assert!(!tune.results_path.exists());
}
