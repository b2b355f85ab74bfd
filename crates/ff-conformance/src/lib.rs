#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ff_api::FrankenFlowSession;
use ff_array::{ArrayValue, ErrorKind, TensorArray, TensorArrayError, TensorArrayOptions};
use ff_core::{DType, DenseTensor, ExecutionMode, PartialShape};
use ff_runtime::EvidenceEntry;
use serde::Deserialize;
use serde_json::{Value, json};

pub use logging::{StructuredCaseLog, mode_label};

const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const TENSOR_ARRAY_FIXTURE: &str = "tensor_array_cases.json";
const REPLAY_TEST: &str = "tensor_array_fixture_is_green";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub strict_mode: bool,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorArrayCaseReport {
    pub name: String,
    pub mode: ExecutionMode,
    pub steps_total: usize,
    pub mismatches: Vec<String>,
    pub forensic_log: StructuredCaseLog,
}

impl TensorArrayCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TensorArrayFixtureFile {
    cases: Vec<TensorArrayCase>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TensorArrayCase {
    name: String,
    dtype: DType,
    size: i64,
    #[serde(default)]
    options: TensorArrayOptions,
    #[serde(default)]
    modes: Option<Vec<ExecutionMode>>,
    #[serde(default)]
    expect_create_error: Option<ErrorKind>,
    #[serde(default)]
    steps: Vec<Step>,
}

impl TensorArrayCase {
    fn runs_in(&self, mode: ExecutionMode) -> bool {
        self.modes
            .as_ref()
            .is_none_or(|modes| modes.contains(&mode))
    }
}

/// Tensor literal in a fixture. Without a dtype it is written as a host
/// literal and cast by the array.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TensorFixture {
    shape: Vec<usize>,
    data: Vec<f64>,
    #[serde(default)]
    dtype: Option<DType>,
}

impl TensorFixture {
    fn to_value(&self) -> Result<ArrayValue, String> {
        match self.dtype {
            Some(dtype) => DenseTensor::new(self.shape.clone(), self.data.clone(), dtype)
                .map(ArrayValue::Tensor)
                .map_err(|error| format!("invalid fixture tensor: {error}")),
            None => Ok(ArrayValue::literal(self.shape.clone(), self.data.clone())),
        }
    }

    fn matches(&self, actual: &DenseTensor) -> bool {
        actual.shape() == self.shape.as_slice()
            && actual.data() == self.data.as_slice()
            && self.dtype.is_none_or(|dtype| dtype == actual.dtype())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
enum Step {
    Write {
        index: i64,
        value: TensorFixture,
        #[serde(default)]
        expect_error: Option<ErrorKind>,
    },
    Read {
        index: i64,
        #[serde(default)]
        expect: Option<TensorFixture>,
        #[serde(default)]
        expect_error: Option<ErrorKind>,
    },
    Stack {
        #[serde(default)]
        expect: Option<TensorFixture>,
        #[serde(default)]
        expect_shape: Option<Vec<usize>>,
        #[serde(default)]
        expect_error: Option<ErrorKind>,
    },
    Gather {
        indices: Vec<i64>,
        #[serde(default)]
        expect: Option<TensorFixture>,
        #[serde(default)]
        expect_error: Option<ErrorKind>,
    },
    Concat {
        #[serde(default)]
        expect: Option<TensorFixture>,
        #[serde(default)]
        expect_shape: Option<Vec<usize>>,
        #[serde(default)]
        expect_error: Option<ErrorKind>,
    },
    Unstack {
        value: TensorFixture,
        #[serde(default)]
        expect_error: Option<ErrorKind>,
    },
    Scatter {
        indices: Vec<i64>,
        value: TensorFixture,
        #[serde(default)]
        expect_error: Option<ErrorKind>,
    },
    Split {
        value: TensorFixture,
        lengths: Vec<usize>,
        #[serde(default)]
        expect_error: Option<ErrorKind>,
    },
    Size {
        expect: usize,
    },
    ElementShape {
        expect: Option<PartialShape>,
    },
    Close,
    Grad {
        expect_error: ErrorKind,
    },
}

pub fn run_tensor_array_conformance(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(HarnessReport, Vec<TensorArrayCaseReport>), String> {
    let fixture_path = config.fixture_root.join(TENSOR_ARRAY_FIXTURE);
    let fixture: TensorArrayFixtureFile = load_fixture(&fixture_path)?;
    run_tensor_array_conformance_with_fixture(mode, &fixture)
}

fn run_tensor_array_conformance_with_fixture(
    mode: ExecutionMode,
    fixture: &TensorArrayFixtureFile,
) -> Result<(HarnessReport, Vec<TensorArrayCaseReport>), String> {
    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in fixture.cases.iter().filter(|case| case.runs_in(mode)) {
        case_reports.push(run_tensor_array_case(case, mode)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(TensorArrayCaseReport::passed));

    let report = HarnessReport {
        suite: "tensor_array",
        fixture_count: 1,
        strict_mode: mode == ExecutionMode::Strict,
        cases_total,
        cases_passed,
    };

    Ok((report, case_reports))
}

/// Serializes every case log as one JSON line.
pub fn emit_case_logs_jsonl(reports: &[TensorArrayCaseReport]) -> Result<String, String> {
    let mut out = String::new();
    for report in reports {
        let line = report
            .forensic_log
            .to_json_line()
            .map_err(|error| format!("failed serializing log for '{}': {error}", report.name))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

fn run_tensor_array_case(
    case: &TensorArrayCase,
    mode: ExecutionMode,
) -> Result<TensorArrayCaseReport, String> {
    let mut session = FrankenFlowSession::new(mode);
    let mut mismatches = Vec::new();

    let created = session.tensor_array(case.dtype, case.size, case.options.clone());
    let mut array = match (created, case.expect_create_error) {
        (Ok(array), None) => Some(array),
        (Ok(_), Some(kind)) => {
            mismatches.push(format!("create: expected {kind:?} error, got success"));
            None
        }
        (Err(error), expected) => {
            if expected != Some(error.kind()) {
                mismatches.push(format!("create: unexpected error {error}"));
            }
            None
        }
    };

    if let Some(array) = array.as_mut() {
        for (position, step) in case.steps.iter().enumerate() {
            if let Some(mismatch) = run_step(array, step)? {
                mismatches.push(format!("step {position}: {mismatch}"));
            }
        }
    }

    let outcome = if mismatches.is_empty() { "pass" } else { "fail" };
    let reason_code = if outcome == "pass" {
        "parity_ok"
    } else {
        "tensor_array_behavior_mismatch"
    };

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("steps_total".to_string(), json!(case.steps.len()));
    extra_fields.insert("mismatches".to_string(), json!(mismatches));
    if let Some(array) = array.as_ref() {
        extra_fields.insert(
            "runtime_evidence".to_string(),
            runtime_evidence_field(array.evidence()),
        );
    }
    extra_fields.insert(
        "session_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    Ok(TensorArrayCaseReport {
        name: case.name.clone(),
        mode,
        steps_total: case.steps.len(),
        mismatches,
        forensic_log: StructuredCaseLog::new(
            "tensor_array",
            TENSOR_ARRAY_FIXTURE,
            case.name.as_str(),
            mode,
            vec![format!("crates/ff-conformance/fixtures/{TENSOR_ARRAY_FIXTURE}")],
            format!(
                "cargo test -p ff-conformance {REPLAY_TEST} -- --nocapture # mode={}",
                mode_label(mode)
            ),
            outcome,
            reason_code,
        )
        .with_extra_fields(extra_fields),
    })
}

/// Executes one step; `Ok(Some(_))` describes a behavioral mismatch,
/// `Err(_)` a broken fixture.
fn run_step(array: &mut TensorArray, step: &Step) -> Result<Option<String>, String> {
    let mismatch = match step {
        Step::Write {
            index,
            value,
            expect_error,
        } => {
            let value = value.to_value()?;
            check_unit(
                "write",
                array.write(*index, value).map(|_| ()),
                *expect_error,
            )
        }
        Step::Read {
            index,
            expect,
            expect_error,
        } => check_tensor("read", array.read(*index), expect.as_ref(), None, *expect_error),
        Step::Stack {
            expect,
            expect_shape,
            expect_error,
        } => check_tensor(
            "stack",
            array.stack(),
            expect.as_ref(),
            expect_shape.as_deref(),
            *expect_error,
        ),
        Step::Gather {
            indices,
            expect,
            expect_error,
        } => check_tensor(
            "gather",
            array.gather(indices),
            expect.as_ref(),
            None,
            *expect_error,
        ),
        Step::Concat {
            expect,
            expect_shape,
            expect_error,
        } => check_tensor(
            "concat",
            array.concat(),
            expect.as_ref(),
            expect_shape.as_deref(),
            *expect_error,
        ),
        Step::Unstack {
            value,
            expect_error,
        } => {
            let value = value.to_value()?;
            check_unit("unstack", array.unstack(value).map(|_| ()), *expect_error)
        }
        Step::Scatter {
            indices,
            value,
            expect_error,
        } => {
            let value = value.to_value()?;
            check_unit(
                "scatter",
                array.scatter(indices, value).map(|_| ()),
                *expect_error,
            )
        }
        Step::Split {
            value,
            lengths,
            expect_error,
        } => {
            let value = value.to_value()?;
            check_unit(
                "split",
                array.split(value, lengths).map(|_| ()),
                *expect_error,
            )
        }
        Step::Size { expect } => (array.size() != *expect)
            .then(|| format!("size: expected {expect}, got {}", array.size())),
        Step::ElementShape { expect } => (array.element_shape() != expect.as_ref()).then(|| {
            format!(
                "element_shape: expected {expect:?}, got {:?}",
                array.element_shape()
            )
        }),
        Step::Close => {
            array.close();
            None
        }
        Step::Grad { expect_error } => {
            check_unit("grad", array.grad("fixture").map(|_| ()), Some(*expect_error))
        }
    };
    Ok(mismatch)
}

fn check_unit(
    op: &str,
    result: Result<(), TensorArrayError>,
    expect_error: Option<ErrorKind>,
) -> Option<String> {
    match (result, expect_error) {
        (Ok(()), None) => None,
        (Ok(()), Some(kind)) => Some(format!("{op}: expected {kind:?} error, got success")),
        (Err(error), expected) => check_error(op, &error, expected),
    }
}

fn check_tensor(
    op: &str,
    result: Result<DenseTensor, TensorArrayError>,
    expect: Option<&TensorFixture>,
    expect_shape: Option<&[usize]>,
    expect_error: Option<ErrorKind>,
) -> Option<String> {
    match (result, expect_error) {
        (Ok(actual), None) => {
            if let Some(expected) = expect.filter(|expected| !expected.matches(&actual)) {
                return Some(format!("{op}: expected {expected:?}, got {actual}"));
            }
            expect_shape
                .filter(|shape| actual.shape() != *shape)
                .map(|shape| {
                    format!("{op}: expected shape {shape:?}, got {:?}", actual.shape())
                })
        }
        (Ok(actual), Some(kind)) => Some(format!("{op}: expected {kind:?} error, got {actual}")),
        (Err(error), expected) => check_error(op, &error, expected),
    }
}

fn check_error(op: &str, error: &TensorArrayError, expected: Option<ErrorKind>) -> Option<String> {
    match expected {
        Some(kind) if kind == error.kind() => None,
        Some(kind) => Some(format!("{op}: expected {kind:?} error, got {error}")),
        None => Some(format!("{op}: unexpected error {error}")),
    }
}

fn runtime_evidence_field(entries: &[EvidenceEntry]) -> Value {
    let mut kind_counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for entry in entries {
        *kind_counts.entry(entry.kind.label()).or_insert(0) += 1;
    }

    json!({
        "total_entries": entries.len(),
        "kind_counts": kind_counts,
        "entries": entries
            .iter()
            .map(|entry| {
                json!({
                    "ts_unix_ms": entry.ts_unix_ms,
                    "kind": entry.kind.label(),
                    "summary": entry.summary,
                })
            })
            .collect::<Vec<_>>(),
    })
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}
