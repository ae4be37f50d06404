mod common;

use common::{ops, row, three_row_table, Bench, Op};
use elyte_core::capabilities::{SlotId, Station};
use elyte_core::error::FaultKind;
use elyte_drivers::mass_balance::{MassThresholds, MassTier};
use elyte_experiment::analysis::AnalysisPlan;
use elyte_experiment::recipe::{FormulationTable, CHECKPOINT_FILE};
use elyte_experiment::scheduler::{CycleState, RecipeConfig, RecipeScheduler};

fn config(dir: &tempfile::TempDir) -> RecipeConfig {
    RecipeConfig {
        checkpoint_path: dir.path().join(CHECKPOINT_FILE),
        ..Default::default()
    }
}

fn pot(pot: u8, level_ml: f64) -> Station {
    Station::Pot { pot, level_ml }
}

fn dose_ops(station: Station, volume: f64) -> Vec<Op> {
    vec![
        Op::Approach(station),
        Op::PumpOn,
        Op::Charge,
        Op::Descend(station),
        Op::Aspirate(volume),
        Op::Lift,
        Op::Approach(Station::MixingChamber),
        Op::Descend(Station::MixingChamber),
        Op::Dispense,
        Op::Lift,
    ]
}

#[tokio::test(start_paused = true)]
async fn test_three_row_formulation_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        readings: vec![100.0, 100.204],
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        three_row_table(),
        config(&dir),
        MassThresholds::default(),
    );

    let report = scheduler
        .run_cycle(&AnalysisPlan::Single { target_c: 25.0 })
        .await
        .unwrap();

    let mut expected = vec![
        Op::SetTemperature(25.0),
        Op::MoveToStart,
        Op::PumpOff,
        Op::Pick(1),
    ];
    expected.extend(dose_ops(pot(1, 39.95), 50.0));
    expected.extend([Op::PumpOff, Op::Return(1), Op::PumpOff, Op::Pick(3)]);
    expected.extend(dose_ops(pot(3, 39.9), 100.0));
    expected.extend(dose_ops(pot(3, 39.88), 20.0));
    expected.extend([
        Op::PumpOff,
        Op::Return(3),
        Op::Mix(25, 100),
        Op::Tare,
        Op::GetMass,
        Op::AddElectrolyte(170.0),
        Op::GetMass,
        Op::Wait(25.0, true),
        Op::Measure,
        Op::StopThermal,
        Op::EmptyCell(170.0),
        Op::CleanCell(3000.0),
    ]);
    assert_eq!(ops(&bench.log), expected);

    assert_eq!(report.synthesis.doses, 3);
    assert_eq!(report.synthesis.checkpoints, 3);
    assert_eq!(report.synthesis.total_volume_ul, 170.0);
    assert_eq!(report.synthesis.mass_check.tier, MassTier::Nominal);
    assert!((report.cost - 1.7).abs() < 1e-12);
    assert_eq!(report.analysis.len(), 1);
    assert_eq!(report.analysis[0].impedance.ionic_conductivity_s_per_m, 8.0);
    assert_eq!(scheduler.state(), CycleState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_zero_dose_row_is_never_touched() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        readings: vec![0.0, 0.204],
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        three_row_table(),
        config(&dir),
        MassThresholds::default(),
    );
    scheduler.synthesise().await.unwrap();

    let touched_pot_two = ops(&bench.log).iter().any(|op| {
        matches!(
            op,
            Op::Pick(2)
                | Op::Approach(Station::Pot { pot: 2, .. })
                | Op::Descend(Station::Pot { pot: 2, .. })
        )
    });
    assert!(!touched_pot_two);
    let aspirations: Vec<f64> = ops(&bench.log)
        .into_iter()
        .filter_map(|op| match op {
            Op::Aspirate(v) => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(aspirations, vec![50.0, 100.0, 20.0]);
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_tracks_remaining_volume() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        readings: vec![0.0, 0.204],
        ..Default::default()
    };
    let config = config(&dir);
    let checkpoint = config.checkpoint_path.clone();
    let mut scheduler =
        RecipeScheduler::new(bench.workcell(), three_row_table(), config, MassThresholds::default());
    scheduler.synthesise().await.unwrap();

    let resumed = FormulationTable::load(&checkpoint).unwrap();
    let remaining: Vec<(String, f64)> = resumed
        .rows()
        .iter()
        .map(|r| (r.name.clone(), r.container_volume_ml))
        .collect();
    assert_eq!(
        remaining,
        vec![
            ("A".to_string(), 39.95),
            ("B".to_string(), 40.0),
            ("C".to_string(), 39.88),
        ]
    );
    assert_eq!(resumed.rows()[2].dose_volume_ul, 120.0);
}

#[tokio::test(start_paused = true)]
async fn test_attached_pipette_returned_before_anything_else() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        attached: SlotId::new(4),
        readings: vec![0.0, 0.204],
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        three_row_table(),
        config(&dir),
        MassThresholds::default(),
    );
    scheduler.synthesise().await.unwrap();

    let log = ops(&bench.log);
    assert_eq!(&log[..3], &[Op::PumpOff, Op::Return(4), Op::MoveToStart]);
}

#[tokio::test(start_paused = true)]
async fn test_critical_mass_deviation_closes_every_link() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        readings: vec![0.0, 0.05],
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        three_row_table(),
        config(&dir),
        MassThresholds::default(),
    );

    let err = scheduler
        .run_cycle(&AnalysisPlan::Single { target_c: 25.0 })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::MassDeviation);
    assert_eq!(scheduler.state(), CycleState::Fault);

    let log = ops(&bench.log);
    for device in ["pipette", "gantry", "mass_balance", "peltier", "fluid"] {
        assert!(log.contains(&Op::Close(device)), "{} not closed", device);
    }
    assert!(!log.iter().any(|op| matches!(op, Op::Measure | Op::EmptyCell(_))));
}

#[tokio::test(start_paused = true)]
async fn test_thermal_timeout_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        readings: vec![0.0, 0.204],
        never_settles: true,
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        three_row_table(),
        config(&dir),
        MassThresholds::default(),
    );

    let err = scheduler
        .run_cycle(&AnalysisPlan::Single { target_c: 40.0 })
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(scheduler.history().last(), Some(&CycleState::Fault));
    assert!(scheduler.history().contains(&CycleState::Analysis));
    assert!(!ops(&bench.log).contains(&Op::Measure));
}

#[tokio::test(start_paused = true)]
async fn test_sweep_measures_each_point_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let report_path = dir.path().join("results").join("temperature_report.csv");
    let bench = Bench::default();
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        FormulationTable::new(vec![row(1, "A", 10.0)]).unwrap(),
        config(&dir),
        MassThresholds::default(),
    )
    .with_temperature_report(&report_path);

    let points = scheduler
        .analyse(&AnalysisPlan::Sweep {
            targets_c: vec![60.0, 20.0, -20.0],
        })
        .await
        .unwrap();

    assert_eq!(points.len(), 3);
    assert_eq!(
        ops(&bench.log),
        vec![
            Op::Wait(60.0, true),
            Op::Measure,
            Op::Wait(20.0, true),
            Op::Measure,
            Op::Wait(-20.0, true),
            Op::Measure,
            Op::StopThermal,
        ]
    );
    assert_ne!(points[0].identifier, points[1].identifier);

    let report = std::fs::read_to_string(&report_path).unwrap();
    assert_eq!(report.lines().next(), Some("Temperature Target,Mean Result,STD"));
    assert_eq!(report.lines().count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_state_history_follows_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        readings: vec![0.0, 0.204],
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        three_row_table(),
        config(&dir),
        MassThresholds::default(),
    );
    scheduler
        .run_cycle(&AnalysisPlan::Single { target_c: 25.0 })
        .await
        .unwrap();

    use CycleState::*;
    assert_eq!(
        scheduler.history(),
        &[
            Idle, Start, Pick, Dose, Deliver, Pick, Dose, Deliver, Dose, Deliver, Mix, MassCheck,
            Analysis, Clean, Done
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_history_holds_only_latest_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        simulated_balance: true,
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        FormulationTable::new(vec![row(1, "A", 50.0)]).unwrap(),
        config(&dir),
        MassThresholds::default(),
    );

    let plan = AnalysisPlan::Single { target_c: 25.0 };
    for _ in 0..3 {
        scheduler.run_cycle(&plan).await.unwrap();
    }

    use CycleState::*;
    assert_eq!(
        scheduler.history(),
        &[Done, Start, Pick, Dose, Deliver, Mix, MassCheck, Analysis, Clean, Done]
    );
}

#[tokio::test(start_paused = true)]
async fn test_balance_tared_before_starting_mass() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        readings: vec![0.0, 0.204],
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        three_row_table(),
        config(&dir),
        MassThresholds::default(),
    );
    scheduler.synthesise().await.unwrap();

    let log = ops(&bench.log);
    let mix = log.iter().position(|op| matches!(op, Op::Mix(..))).unwrap();
    assert_eq!(&log[mix + 1..mix + 4], &[Op::Tare, Op::GetMass, Op::AddElectrolyte(170.0)]);
    assert_eq!(log.iter().filter(|op| **op == Op::Tare).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sub_resolution_remainder_is_not_dosed() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        simulated_balance: true,
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        FormulationTable::new(vec![row(1, "A", 100.5)]).unwrap(),
        config(&dir),
        MassThresholds::default(),
    );
    let report = scheduler.synthesise().await.unwrap();

    assert_eq!(report.doses, 1);
    let aspirations: Vec<Op> = ops(&bench.log)
        .into_iter()
        .filter(|op| matches!(op, Op::Aspirate(_)))
        .collect();
    assert_eq!(aspirations, vec![Op::Aspirate(100.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_life_test_repeats_formulation() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        simulated_balance: true,
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        FormulationTable::new(vec![row(1, "A", 50.0)]).unwrap(),
        config(&dir),
        MassThresholds::default(),
    );

    let reports = scheduler
        .run_life_test(&AnalysisPlan::Single { target_c: 25.0 }, 3)
        .await
        .unwrap();

    assert_eq!(reports.len(), 3);
    assert_eq!(scheduler.state(), CycleState::Done);
    let log = ops(&bench.log);
    assert_eq!(log.iter().filter(|op| matches!(op, Op::Measure)).count(), 3);
    let levels: Vec<f64> = log
        .iter()
        .filter_map(|op| match op {
            Op::Descend(Station::Pot { level_ml, .. }) => Some(*level_ml),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec![39.95, 39.9, 39.85]);

    let checkpoint = FormulationTable::load(&dir.path().join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(checkpoint.rows()[0].container_volume_ml, 39.85);
}

#[tokio::test(start_paused = true)]
async fn test_life_test_stops_at_first_fault() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench {
        simulated_balance: true,
        never_settles: true,
        ..Default::default()
    };
    let mut scheduler = RecipeScheduler::new(
        bench.workcell(),
        FormulationTable::new(vec![row(1, "A", 50.0)]).unwrap(),
        config(&dir),
        MassThresholds::default(),
    );

    let err = scheduler
        .run_life_test(&AnalysisPlan::Single { target_c: 25.0 }, 3)
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(scheduler.state(), CycleState::Fault);
    let log = ops(&bench.log);
    assert_eq!(log.iter().filter(|op| matches!(op, Op::Aspirate(_))).count(), 1);
    assert_eq!(log.iter().filter(|op| **op == Op::Close("peltier")).count(), 1);
}
