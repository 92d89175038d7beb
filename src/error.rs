use std::{io, path::StripPrefixError};

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use sqlx::{migrate::MigrateError, Error as SqlxError};
use thiserror::Error;

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum IndexError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Custom error: {0}")]
    Custom(String),
    /// The metadata collaborator rejected the file content. Non-fatal: the previous good
    /// snapshot of the file is retained.
    #[error("Metadata extraction failed: {0}")]
    Extraction(String),
    #[error("Invalid reference: {0}")]
    InvalidReference(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Path {0} is not inside the workspace")]
    OutsideWorkspace(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    /// The persisted cache is unavailable. Fatal to the affected operation only.
    #[error("Index store error: {0}")]
    Store(String),
    #[error("File watcher error: {0}")]
    Watch(String),
}

impl IndexError {
    /// Whether the coordinator should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Store(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::NotFound(_))
    }
}

impl From<StripPrefixError> for IndexError {
    fn from(src: StripPrefixError) -> IndexError {
        IndexError::OutsideWorkspace(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for IndexError {
    fn from(src: toml::de::Error) -> IndexError {
        IndexError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for IndexError {
    fn from(src: toml::ser::Error) -> IndexError {
        IndexError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for IndexError {
    fn from(src: JsonError) -> IndexError {
        IndexError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for IndexError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => IndexError::NotFound(format!("{x}")),
            _ => IndexError::Io(format!("IOError ({}): {x}", x.kind())),
        }
    }
}

impl From<SqlxError> for IndexError {
    fn from(db_error: SqlxError) -> Self {
        IndexError::Store(format!("database error: {db_error:?}"))
    }
}

impl From<MigrateError> for IndexError {
    fn from(migrate_error: MigrateError) -> Self {
        IndexError::Store(format!("database migration error: {migrate_error}"))
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for IndexError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => IndexError::Watch(format!(
                "notify-debouncer: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => IndexError::Watch(format!(
                "notify-debouncer: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => IndexError::NotFound(format!(
                "notify-debouncer: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => IndexError::NotFound(format!(
                "notify-debouncer: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                IndexError::Watch("notify-debouncer invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                IndexError::Watch("notify-debouncer max file watch limit reached".to_string())
            }
        }
    }
}
