//! Diagnostics surfaced for a note.
//!
//! Diagnostics are the only channel through which parse and reference problems reach the user.
//! They are computed on demand from the committed snapshot, never stored.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use crate::extract::{LabelDecl, Position, ScanIssue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// The reference target matches no note and is not an external file
    BrokenReference,
    /// The target note exists but owns no label with the requested name
    MissingLabel,
    /// Several notes share the referenced title
    AmbiguousReference,
    /// An explicit label name declared more than once in the note
    DuplicateLabel,
    /// Two headings derive the same implicit label name
    DuplicateHeadingLabel,
    /// Malformed `[[...]]` syntax
    InvalidReference,
    /// The latest content failed to parse; queries see the last good snapshot
    ParseFailure,
}

impl DiagnosticKind {
    pub fn severity(&self) -> Severity {
        match self {
            DiagnosticKind::BrokenReference
            | DiagnosticKind::MissingLabel
            | DiagnosticKind::InvalidReference
            | DiagnosticKind::ParseFailure => Severity::Error,
            DiagnosticKind::AmbiguousReference | DiagnosticKind::DuplicateLabel => {
                Severity::Warning
            }
            DiagnosticKind::DuplicateHeadingLabel => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub path: PathBuf,
    /// Absent for file-level diagnostics such as parse failures
    pub position: Option<Position>,
    pub message: String,
}

impl Diagnostic {
    pub fn new(
        kind: DiagnosticKind,
        path: PathBuf,
        position: Option<Position>,
        message: impl Into<String>,
    ) -> Self {
        Diagnostic {
            kind,
            path,
            position,
            message: message.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        if let Some(position) = self.position {
            write!(f, ":{}:{}", position.line, position.column)?;
        }
        write!(f, ": {:?}: {}", self.kind, self.message)
    }
}

/// Duplicate-label diagnostics for one note: one per explicit name declared more than once
/// (reported at the second declaration), and one per heading-derived name shared by several
/// headings.
pub fn label_diagnostics(path: &Path, labels: &[LabelDecl]) -> Vec<Diagnostic> {
    let mut explicit: BTreeMap<&str, Vec<Position>> = BTreeMap::new();
    let mut implicit: BTreeMap<&str, Vec<Position>> = BTreeMap::new();
    for label in labels {
        let bucket = if label.is_implicit {
            &mut implicit
        } else {
            &mut explicit
        };
        bucket
            .entry(label.name.as_str())
            .or_default()
            .push(label.position);
    }

    let mut diagnostics = Vec::new();
    for (name, positions) in explicit.iter().filter(|(_, p)| p.len() > 1) {
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::DuplicateLabel,
            path.to_path_buf(),
            positions.get(1).copied(),
            format!("label <{name}> is declared {} times", positions.len()),
        ));
    }
    for (name, positions) in implicit.iter().filter(|(_, p)| p.len() > 1) {
        let lines = positions
            .iter()
            .map(|p| p.line.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::DuplicateHeadingLabel,
            path.to_path_buf(),
            positions.get(1).copied(),
            format!("headings on lines {lines} all derive the label `{name}`"),
        ));
    }
    diagnostics
}

pub fn scan_issue_diagnostics(path: &Path, issues: &[ScanIssue]) -> Vec<Diagnostic> {
    issues
        .iter()
        .map(|issue| {
            Diagnostic::new(
                DiagnosticKind::InvalidReference,
                path.to_path_buf(),
                Some(issue.position),
                issue.message.clone(),
            )
        })
        .collect()
}
