#![forbid(unsafe_code)]

use serde_json::Value;
use snap_harness::{StressConfig, run_stress};

fn small(seed: u64) -> StressConfig {
    StressConfig {
        seed,
        rounds: 120,
        reader_threads: 3,
        keys: 12,
        abort_every: 4,
        collect_min_gen_delta: 2,
    }
}

#[test]
fn stress_run_passes_and_counts_rounds() {
    let report = run_stress(&small(11)).expect("stress run");
    assert!(report.passed, "violations: {:?}", report.violations);
    assert_eq!(report.commits + report.aborts, 120);
    assert_eq!(report.aborts, 30);
    assert_eq!(report.final_round, 119);
    assert!(!report.diagnostics.locked);
    assert_eq!(report.diagnostics.key_count, 12);
    assert_eq!(report.diagnostics.snap_count, 0);
}

#[test]
fn stress_without_aborts_ends_on_last_round() {
    let config = StressConfig {
        abort_every: 0,
        ..small(5)
    };
    let report = run_stress(&config).expect("stress run");
    assert!(report.passed, "violations: {:?}", report.violations);
    assert_eq!(report.aborts, 0);
    assert_eq!(report.final_round, 120);
}

#[test]
fn report_serializes_for_ci() {
    let report = run_stress(&small(2)).expect("stress run");
    let json: Value = serde_json::to_value(&report).expect("serialize");
    assert_eq!(json["seed"], 2);
    assert_eq!(json["passed"], true);
    assert!(json["collect"]["horizon"].is_number());
    assert!(json["diagnostics"]["live_gen"].is_number());
}

#[test]
fn config_fills_missing_fields_from_defaults() {
    let config: StressConfig = serde_json::from_str(r#"{"seed": 77, "keys": 3}"#).expect("parse");
    assert_eq!(config.seed, 77);
    assert_eq!(config.keys, 3);
    assert_eq!(config.rounds, StressConfig::default().rounds);
}
