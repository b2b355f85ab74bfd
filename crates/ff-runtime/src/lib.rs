#![forbid(unsafe_code)]

use std::fmt;

use ff_core::ExecutionMode;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Dispatch,
    Write,
    Read,
    Materialize,
    Grow,
    Clear,
    Replace,
    Close,
    Policy,
    Rejection,
}

impl EvidenceKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Write => "write",
            Self::Read => "read",
            Self::Materialize => "materialize",
            Self::Grow => "grow",
            Self::Clear => "clear",
            Self::Replace => "replace",
            Self::Close => "close",
            Self::Policy => "policy",
            Self::Rejection => "rejection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Append-only record of state transitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn count(&self, kind: EvidenceKind) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }

    #[must_use]
    pub fn last(&self, kind: EvidenceKind) -> Option<&EvidenceEntry> {
        self.entries.iter().rev().find(|entry| entry.kind == kind)
    }

    /// One JSON object per line, in record order.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {mode:?}"),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode:?}"));
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.ledger.record(kind, summary);
    }

    pub fn record_rejection<E>(&mut self, op: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger
            .record(EvidenceKind::Rejection, format!("op={op} rejected: {error}"));
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(ExecutionMode::default())
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
