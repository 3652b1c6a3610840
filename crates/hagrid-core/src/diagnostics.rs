//! Per-run diagnostics.
//!
//! Every recoverable problem found during a scheduling run is logged and
//! also recorded here, so the caller can hand the full list to operators
//! together with the computed transition.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::score::{self, MINUS_INFINITY, Score, ScoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Malformed or contradictory configuration; the offending item was dropped.
    Config,
    /// A mandatory constraint that the final placement does not satisfy.
    Inconsistency,
    /// A score change that was undone to keep a resource placeable.
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Id of the constraint, resource or node concerned.
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
    infinite_conflict_seen: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_error(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        let subject = subject.into();
        let message = message.into();
        error!(subject = %subject, "{message}");
        self.push(DiagnosticKind::Config, subject, message);
    }

    /// Configuration problem that is corrected rather than dropped.
    pub fn config_warning(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        let subject = subject.into();
        let message = message.into();
        warn!(subject = %subject, "{message}");
        self.push(DiagnosticKind::Config, subject, message);
    }

    pub fn inconsistency(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        let subject = subject.into();
        let message = message.into();
        error!(subject = %subject, "{message}");
        self.push(DiagnosticKind::Inconsistency, subject, message);
    }

    pub fn rollback(&mut self, subject: impl Into<String>, message: impl Into<String>) {
        let subject = subject.into();
        let message = message.into();
        info!(subject = %subject, "{message}");
        self.push(DiagnosticKind::Rollback, subject, message);
    }

    /// Add two scores, resolving `+INFINITY + -INFINITY` to `-INFINITY`.
    ///
    /// The first conflict of a run is recorded as a configuration error;
    /// later ones are only logged.
    pub fn add_scores(&mut self, a: Score, b: Score) -> Score {
        match score::add_scores(a, b) {
            Ok(sum) => sum,
            Err(ScoreError::InfiniteConflict) => {
                if self.infinite_conflict_seen {
                    debug!("treating +INFINITY + -INFINITY as -INFINITY");
                } else {
                    self.infinite_conflict_seen = true;
                    self.config_error(
                        "scores",
                        "constraints combine +INFINITY with -INFINITY; forbidding wins",
                    );
                }
                MINUS_INFINITY
            }
        }
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<Diagnostic> {
        self.entries
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, kind: DiagnosticKind, subject: String, message: String) {
        self.entries.push(Diagnostic {
            kind,
            subject,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::INFINITY;

    #[test]
    fn infinite_conflict_reported_once() {
        let mut diags = Diagnostics::new();
        assert_eq!(diags.add_scores(INFINITY, MINUS_INFINITY), MINUS_INFINITY);
        assert_eq!(diags.add_scores(MINUS_INFINITY, INFINITY), MINUS_INFINITY);
        assert_eq!(diags.count(DiagnosticKind::Config), 1);
    }

    #[test]
    fn ordinary_sums_are_silent() {
        let mut diags = Diagnostics::new();
        assert_eq!(diags.add_scores(10, 20), 30);
        assert_eq!(diags.add_scores(INFINITY, -5), INFINITY);
        assert!(diags.is_empty());
    }

    #[test]
    fn records_each_kind() {
        let mut diags = Diagnostics::new();
        diags.config_error("c1", "missing resource");
        diags.inconsistency("c2", "not colocated");
        diags.rollback("rsc1", "kept previous scores");
        assert_eq!(diags.entries().len(), 3);
        assert_eq!(diags.count(DiagnosticKind::Rollback), 1);
    }
}
