use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// A change observed on disk, as delivered by the file-watch collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    /// Old path, new path
    Renamed(PathBuf, PathBuf),
}

impl FileEvent {
    /// Split the event into the per-path operations the coordinator applies. A rename is a
    /// removal of the old path followed by a creation of the new one.
    pub fn into_ops(self) -> Vec<(PathBuf, PathOp)> {
        match self {
            FileEvent::Created(path) | FileEvent::Modified(path) => vec![(path, PathOp::Parse)],
            FileEvent::Removed(path) => vec![(path, PathOp::Remove)],
            FileEvent::Renamed(from, to) => {
                vec![(from, PathOp::Remove), (to, PathOp::Parse)]
            }
        }
    }

    pub fn paths(&self) -> Vec<&PathBuf> {
        match self {
            FileEvent::Created(p) | FileEvent::Modified(p) | FileEvent::Removed(p) => vec![p],
            FileEvent::Renamed(from, to) => vec![from, to],
        }
    }
}

/// What the coordinator does with one path in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathOp {
    Parse,
    Remove,
}

/// Notifications emitted by the coordinator once a change has been committed (or abandoned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexEvent {
    /// File content committed to the store at this revision
    FileIndexed { path: PathBuf, revision: u64 },
    FileRemoved { path: PathBuf },
    /// Metadata extraction failed; the previous snapshot is retained
    ParseFailed { path: PathBuf, message: String },
    /// A parse finished after a newer event for the same path and was discarded
    Superseded { path: PathBuf, revision: u64 },
    /// Source files whose outgoing reference resolution changed with the last commit
    ReferencesInvalidated { sources: Vec<PathBuf> },
    /// Store retries were exhausted; existing cache state was left untouched
    StoreFailed { path: PathBuf, message: String },
    ScanComplete { indexed: usize, skipped: usize },
}

impl Display for IndexEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            IndexEvent::FileIndexed { path, revision } => {
                write!(f, "FileIndexed({}@{revision})", path.display())
            }
            IndexEvent::FileRemoved { path } => write!(f, "FileRemoved({})", path.display()),
            IndexEvent::ParseFailed { path, .. } => write!(f, "ParseFailed({})", path.display()),
            IndexEvent::Superseded { path, revision } => {
                write!(f, "Superseded({}@{revision})", path.display())
            }
            IndexEvent::ReferencesInvalidated { sources } => {
                write!(f, "ReferencesInvalidated({} sources)", sources.len())
            }
            IndexEvent::StoreFailed { path, .. } => write!(f, "StoreFailed({})", path.display()),
            IndexEvent::ScanComplete { indexed, skipped } => {
                write!(f, "ScanComplete(indexed: {indexed}, skipped: {skipped})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_rename_is_remove_then_create() {
        let ops = FileEvent::Renamed(PathBuf::from("/w/a.typ"), PathBuf::from("/w/b.typ"))
            .into_ops();
        assert_eq!(
            ops,
            vec![
                (PathBuf::from("/w/a.typ"), PathOp::Remove),
                (PathBuf::from("/w/b.typ"), PathOp::Parse)
            ]
        );
    }
}
