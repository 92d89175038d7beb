//! Shared test utilities for the coordinator and query tests

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempDir;
use tokio::sync::{mpsc::UnboundedSender, Notify};

use crate::{
    config::IndexConfig,
    coordinator::Coordinator,
    error::IndexError,
    event::IndexEvent,
    extract::{ConfiguredMetadata, InlineMeta, MetadataMap, MetadataSource},
    store::IndexStore,
};

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A temporary workspace directory with a canonical root.
pub struct Workspace {
    _dir: TempDir,
    root: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp workspace");
        let root = dir.path().canonicalize().expect("canonicalize temp workspace");
        Workspace { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a note, creating parent directories. Returns its absolute path.
    pub fn write(&self, rel_path: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create note directory");
        }
        fs::write(&path, content).expect("write note");
        path
    }

    pub async fn coordinator(
        &self,
        events: Option<UnboundedSender<IndexEvent>>,
    ) -> Coordinator<ConfiguredMetadata> {
        Coordinator::open(&self.root, IndexConfig::default(), events)
            .await
            .expect("open coordinator")
    }

    pub async fn coordinator_with<M: MetadataSource + 'static>(&self, source: M) -> Coordinator<M> {
        let config = IndexConfig::default();
        let store = IndexStore::open(&self.root, &config)
            .await
            .expect("open store");
        Coordinator::new(Arc::new(store), config, source, None)
    }
}

/// Lets a test hold a parse in the middle of extraction.
#[derive(Default)]
pub struct Gate {
    /// Signalled once a parse of content containing `BLOCK` is extracting
    pub entered: Notify,
    pub release: Notify,
}

/// Inline metadata, except that content containing `BLOCK` waits on [Gate::release].
pub struct GatedSource {
    gate: Arc<Gate>,
}

impl GatedSource {
    pub fn new() -> (GatedSource, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        (GatedSource { gate: gate.clone() }, gate)
    }
}

impl MetadataSource for GatedSource {
    async fn extract(&self, _path: &Path, content: &str) -> Result<MetadataMap, IndexError> {
        if content.contains("BLOCK") {
            self.gate.entered.notify_one();
            self.gate.release.notified().await;
        }
        InlineMeta::parse(content)
    }
}
