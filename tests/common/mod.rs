//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use typst_oxide::{
    config::IndexConfig, coordinator::Coordinator, event::IndexEvent,
    extract::ConfiguredMetadata, query::QueryService,
};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A throwaway notes directory. The root is canonical so paths compare equal to the ones the
/// index reports.
#[allow(dead_code)]
pub struct Notes {
    pub dir: TempDir,
    pub root: PathBuf,
}

#[allow(dead_code)]
impl Notes {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        Notes { dir, root }
    }

    pub fn path(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    pub fn write(&self, rel_path: &str, content: &str) -> PathBuf {
        let path = self.path(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn remove(&self, path: &Path) {
        std::fs::remove_file(path).unwrap();
    }

    pub async fn open(
        &self,
        events: Option<tokio::sync::mpsc::UnboundedSender<IndexEvent>>,
    ) -> (Coordinator<ConfiguredMetadata>, QueryService) {
        let coordinator = Coordinator::open(&self.root, IndexConfig::default(), events)
            .await
            .unwrap();
        let query = QueryService::new(coordinator.store().clone());
        (coordinator, query)
    }
}

/// The two-note workspace used throughout: `a.typ` ("Alpha") references `[[Beta]]`, and
/// `b.typ` is titled "Beta".
#[allow(dead_code)]
pub fn alpha_beta(notes: &Notes) -> (PathBuf, PathBuf) {
    let a = notes.write("a.typ", "#meta(title: \"Alpha\")\n\nSee [[Beta]].\n");
    let b = notes.write("b.typ", "#meta(title: \"Beta\")\n\n= Beta\n");
    (a, b)
}
