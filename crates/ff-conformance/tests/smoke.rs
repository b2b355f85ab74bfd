use std::path::Path;

use ff_api::FrankenFlowSession;
use ff_conformance::{HarnessConfig, emit_case_logs_jsonl, run_tensor_array_conformance};
use ff_core::{DType, ExecutionMode};
use ff_runtime::EvidenceKind;
use serde_json::Value;

#[test]
fn tensor_array_fixture_exists() {
    let cfg = HarnessConfig::default_paths();
    let fixture_path = cfg.fixture_root.join("tensor_array_cases.json");
    assert!(Path::new(&fixture_path).exists());
}

#[test]
fn tensor_array_fixture_is_green() {
    let cfg = HarnessConfig::default_paths();
    for mode in [ExecutionMode::Strict, ExecutionMode::Hardened] {
        let (report, cases) =
            run_tensor_array_conformance(&cfg, mode).expect("tensor-array conformance should run");

        let failures: Vec<_> = cases
            .iter()
            .filter(|case| !case.passed())
            .map(|case| format!("{}: {:?}", case.name, case.mismatches))
            .collect();
        assert!(failures.is_empty(), "mode {mode:?} failures: {failures:#?}");
        assert_eq!(report.suite, "tensor_array");
        assert_eq!(report.cases_total, cases.len());
        assert_eq!(report.cases_total, report.cases_passed);
        assert_eq!(report.strict_mode, mode == ExecutionMode::Strict);
    }
}

#[test]
fn mode_specific_cases_run_only_in_their_mode() {
    let cfg = HarnessConfig::default_paths();
    let (_, strict) =
        run_tensor_array_conformance(&cfg, ExecutionMode::Strict).expect("strict should run");
    let (_, hardened) =
        run_tensor_array_conformance(&cfg, ExecutionMode::Hardened).expect("hardened should run");

    let names = |cases: &[ff_conformance::TensorArrayCaseReport]| {
        cases.iter().map(|case| case.name.clone()).collect::<Vec<_>>()
    };
    assert!(names(&strict).contains(&"scatter_arity_mismatch_is_rejected".to_string()));
    assert!(!names(&strict).contains(&"scatter_arity_mismatch_zips_when_hardened".to_string()));
    assert!(names(&hardened).contains(&"scatter_arity_mismatch_zips_when_hardened".to_string()));
    assert_eq!(strict.len(), hardened.len());
}

#[test]
fn case_logs_carry_runtime_evidence() {
    let cfg = HarnessConfig::default_paths();
    let (_, cases) = run_tensor_array_conformance(&cfg, ExecutionMode::Hardened)
        .expect("hardened conformance should run");

    let jsonl = emit_case_logs_jsonl(&cases).expect("case logs should serialize");
    let lines: Vec<Value> = jsonl
        .lines()
        .map(|line| serde_json::from_str(line).expect("each log line is json"))
        .collect();
    assert_eq!(lines.len(), cases.len());

    let zipped = lines
        .iter()
        .find(|line| line["case_name"] == "scatter_arity_mismatch_zips_when_hardened")
        .expect("hardened scatter case should be logged");
    assert_eq!(zipped["mode"], "hardened");
    assert_eq!(zipped["reason_code"], "parity_ok");
    assert!(
        zipped["runtime_evidence"]["entries"]
            .as_array()
            .expect("evidence entries array")
            .iter()
            .any(|entry| entry["kind"] == "policy"
                && entry["summary"]
                    .as_str()
                    .is_some_and(|summary| summary.contains("scatter arity mismatch")))
    );
    assert!(
        lines
            .iter()
            .all(|line| line["replay_command"]
                .as_str()
                .is_some_and(|command| command.starts_with("cargo test -p ff-conformance")))
    );
}

#[test]
fn session_built_array_records_transitions() {
    let mut session = FrankenFlowSession::new(ExecutionMode::Strict);
    let options = ff_api::TensorArrayOptions::default().with_dynamic_size(true);
    let mut array = session
        .tensor_array(DType::Float32, 0, options)
        .expect("array should build");

    array.write(1, vec![1.0, 2.0]).expect("dynamic write");
    array.read(1).expect("read");
    let err = array.read(1).expect_err("second read is rejected");

    let ledger = array.runtime().ledger();
    assert_eq!(ledger.count(EvidenceKind::Grow), 1);
    assert_eq!(ledger.count(EvidenceKind::Write), 1);
    assert_eq!(ledger.count(EvidenceKind::Clear), 1);
    assert!(
        ledger
            .last(EvidenceKind::Rejection)
            .is_some_and(|entry| entry.summary.contains(&err.to_string()))
    );
    assert_eq!(session.evidence_len(), 2);
}
