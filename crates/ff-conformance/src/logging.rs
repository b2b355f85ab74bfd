use std::collections::BTreeMap;

use ff_core::ExecutionMode;
use serde::Serialize;
use serde_json::Value;

/// Forensic record emitted for every conformance case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub suite_id: String,
    pub fixture_id: String,
    pub scenario_id: String,
    pub case_name: String,
    pub mode: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        fixture_id: &str,
        case_name: &str,
        mode: ExecutionMode,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        let mode = mode_label(mode);
        Self {
            suite_id: suite_id.to_string(),
            fixture_id: fixture_id.to_string(),
            scenario_id: format!("{suite_id}/{mode}:{case_name}"),
            case_name: case_name.to_string(),
            mode: mode.to_string(),
            artifact_refs,
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(extra_fields);
        self
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}
