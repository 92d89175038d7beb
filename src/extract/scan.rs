//! Direct text scanning for labels and cross-references. No collaborator involved.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{LabelDecl, Position, RefOccurrence, ScanIssue};
use crate::{error::IndexError, paths::to_label_name};

static EXPLICIT_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([A-Za-z0-9_:-]+)>").expect("literal label pattern"));

static HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(=+)\s+(.+)$").expect("literal heading pattern"));

static TRAILING_LABELS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\s*<[A-Za-z0-9_:-]+>)+\s*$").expect("literal trailing label pattern")
});

const OPEN: &str = "[[";
const CLOSE: &str = "]]";
const FENCE: &str = "```";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutput {
    pub labels: Vec<LabelDecl>,
    pub references: Vec<RefOccurrence>,
    pub issues: Vec<ScanIssue>,
}

/// Scan note text for explicit labels, heading-derived labels, and wiki-style references.
///
/// Lines inside fenced raw blocks are skipped. Malformed references are collected as issues and
/// never stop the scan.
pub fn scan(content: &str) -> ScanOutput {
    let mut output = ScanOutput::default();
    let mut in_fence = false;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx as u32 + 1;
        if line.trim_start().starts_with(FENCE) {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        for cap in EXPLICIT_LABEL.captures_iter(line) {
            let (Some(full), Some(name)) = (cap.get(0), cap.get(1)) else {
                continue;
            };
            output.labels.push(LabelDecl {
                name: name.as_str().to_string(),
                position: Position::new(line_no, char_column(line, full.start())),
                is_implicit: false,
            });
        }

        if let Some(text) = HEADING.captures(line).and_then(|cap| cap.get(2)) {
            let heading = TRAILING_LABELS.replace(text.as_str(), "");
            let name = to_label_name(&heading);
            if !name.is_empty() {
                output.labels.push(LabelDecl {
                    name,
                    position: Position::new(line_no, 1),
                    is_implicit: true,
                });
            }
        }

        scan_references(line, line_no, &mut output);
    }

    output
}

fn char_column(line: &str, byte_offset: usize) -> u32 {
    line[..byte_offset].chars().count() as u32 + 1
}

fn scan_references(line: &str, line_no: u32, output: &mut ScanOutput) {
    let mut cursor = 0;
    while let Some(rel_start) = line[cursor..].find(OPEN) {
        let start = cursor + rel_start;
        let body_start = start + OPEN.len();
        let position = Position::new(line_no, char_column(line, start));

        let next_close = line[body_start..].find(CLOSE).map(|i| body_start + i);
        let next_open = line[body_start..].find(OPEN).map(|i| body_start + i);
        let close = match (next_close, next_open) {
            (Some(close), Some(open)) if open < close => None,
            (close, _) => close,
        };
        let Some(close) = close else {
            output.issues.push(ScanIssue {
                message: IndexError::InvalidReference("unclosed `[[` without matching `]]`".into())
                    .to_string(),
                position,
            });
            cursor = next_open.unwrap_or(line.len());
            continue;
        };

        let end = close + CLOSE.len();
        match parse_reference_body(&line[body_start..close]) {
            Ok((target, label, alias)) => output.references.push(RefOccurrence {
                target,
                label,
                alias,
                position,
                width: line[start..end].chars().count() as u32,
            }),
            Err(e) => output.issues.push(ScanIssue {
                message: e.to_string(),
                position,
            }),
        }
        cursor = end;
    }
}

type ReferenceParts = (String, Option<String>, Option<String>);

/// Split `target[:label][|alias]`.
fn parse_reference_body(body: &str) -> Result<ReferenceParts, IndexError> {
    let invalid = |problem: &str| IndexError::InvalidReference(format!("`[[{body}]]` {problem}"));
    let mut pipe_parts = body.split('|');
    let head = pipe_parts.next().unwrap_or_default();
    let alias = pipe_parts.next();
    if pipe_parts.next().is_some() {
        return Err(invalid("has more than one `|`"));
    }
    let alias = match alias {
        Some(alias) if alias.trim().is_empty() => {
            return Err(invalid("has an empty alias"));
        }
        Some(alias) => Some(alias.to_string()),
        None => None,
    };

    let (target, label) = match head.split_once(':') {
        Some((target, label)) => (target, Some(label.trim())),
        None => (head, None),
    };
    if target.trim().is_empty() {
        return Err(invalid("has an empty target"));
    }
    if matches!(label, Some("")) {
        return Err(invalid("has an empty label"));
    }
    Ok((target.to_string(), label.map(str::to_string), alias))
}
