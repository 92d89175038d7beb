//! # Watch Service
//!
//! [`WatchService`] keeps the index of one workspace in sync with the filesystem. It owns a tokio
//! runtime, the workspace's [`Coordinator`], and, while started, a `notify-debouncer-full`
//! debouncer over the workspace root.
//!
//! ## Lifecycle
//!
//! - [`WatchService::new`] loads `.typst-oxide.toml`, opens (or rebuilds) the cache.
//! - [`WatchService::start`] begins watching and spawns two tasks on the service runtime: the
//!   coordinator loop consuming debounced [`FileEvent`]s, and the initial background scan.
//!   Live edits take priority over the scan.
//! - [`WatchService::stop`] unwatches the root and aborts both tasks. Committed updates stay
//!   committed; an aborted scan simply resumes on the next start.
//!
//! ## Event mapping
//!
//! | notify event                        | [`FileEvent`]                |
//! |-------------------------------------|------------------------------|
//! | `Create`                            | `Created(path)`              |
//! | `Modify` (data, metadata, any)      | `Modified(path)`             |
//! | `Modify(Name(Both))`                | `Renamed(old, new)`          |
//! | `Modify(Name(From))`, `Remove`      | `Removed(path)`              |
//! | `Modify(Name(To))`                  | `Created(path)`              |
//!
//! Hidden paths (any component below the root starting with `.`, which includes the cache
//! itself) are dropped when `ignore_hidden` is set. Files with an unmanaged extension are
//! dropped; directories pass through so the coordinator can expand them.
//!
//! ```rust,no_run
//! use typst_oxide::watch::WatchService;
//! use std::path::PathBuf;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let service = WatchService::new(PathBuf::from("/path/to/notes"), Some(tx))?;
//! service.start()?;
//! while let Some(event) = rx.blocking_recv() {
//!     println!("{event}");
//! }
//! # Ok::<(), typst_oxide::IndexError>(())
//! ```

use notify_debouncer_full::{
    new_debouncer,
    notify::{
        event::{ModifyKind, RenameMode},
        Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    },
    DebounceEventResult, Debouncer, FileIdMap,
};
use parking_lot::Mutex;
use std::{
    future::Future,
    path::{Path, PathBuf},
};
use tokio::{
    runtime::Runtime,
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinHandle,
};

use crate::{
    config::{ConfigProvider, IndexConfig, TomlConfigProvider},
    coordinator::Coordinator,
    error::IndexError,
    event::{FileEvent, IndexEvent},
    extract::ConfiguredMetadata,
    paths::is_hidden_path,
    query::QueryService,
};

type WorkspaceWatcher = Debouncer<RecommendedWatcher, FileIdMap>;

struct ActiveWatch {
    debouncer: WorkspaceWatcher,
    runner: JoinHandle<()>,
    scan: JoinHandle<()>,
}

pub struct WatchService {
    root: PathBuf,
    coordinator: Coordinator<ConfiguredMetadata>,
    runtime: Runtime,
    active: Mutex<Option<ActiveWatch>>,
}

impl WatchService {
    pub fn new(
        root: PathBuf,
        events: Option<UnboundedSender<IndexEvent>>,
    ) -> Result<Self, IndexError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()?;
        let provider = TomlConfigProvider::for_workspace(&root);
        tracing::debug!("Loading configuration from {:?}", provider.path());
        let config = provider.load()?;
        let coordinator = runtime.block_on(Coordinator::open(&root, config, events))?;
        Ok(WatchService {
            root: coordinator.root().to_path_buf(),
            coordinator,
            runtime,
            active: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn coordinator(&self) -> &Coordinator<ConfiguredMetadata> {
        &self.coordinator
    }

    pub fn query(&self) -> QueryService {
        QueryService::new(self.coordinator.store().clone())
    }

    /// Run a future (typically a query) on the service runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Start watching the workspace and run the initial scan in the background.
    pub fn start(&self) -> Result<(), IndexError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(IndexError::Custom(format!(
                "Already watching workspace {:?}",
                self.root
            )));
        }

        let (file_tx, file_rx) = unbounded_channel::<FileEvent>();
        let runner = {
            let coordinator = self.coordinator.clone();
            self.runtime
                .spawn(async move { coordinator.run(file_rx).await })
        };

        let root = self.root.clone();
        let config = self.coordinator.config().clone();
        let mut debouncer = new_debouncer(
            config.debounce(),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events.iter() {
                        for file_event in to_file_events(&root, &config, &event.event) {
                            tracing::debug!("[Debouncer] {file_event:?}");
                            if let Err(e) = file_tx.send(file_event) {
                                tracing::warn!("[Debouncer] Coordinator is gone: {e}");
                                return;
                            }
                        }
                    }
                }
                Err(errors) => {
                    tracing::error!("Notify debouncer returned errors: {:?}", errors);
                }
            },
        )?;
        debouncer
            .watcher()
            .watch(&self.root, RecursiveMode::Recursive)?;

        let scan = {
            let coordinator = self.coordinator.clone();
            self.runtime.spawn(async move {
                if let Err(e) = coordinator.scan(false).await {
                    tracing::warn!("Initial scan finished with errors: {e}");
                }
            })
        };

        tracing::info!("Watching {:?}", self.root);
        *active = Some(ActiveWatch {
            debouncer,
            runner,
            scan,
        });
        Ok(())
    }

    /// Stop watching. A no-op when not started.
    pub fn stop(&self) -> Result<(), IndexError> {
        if let Some(mut active) = self.active.lock().take() {
            let unwatch_res = active.debouncer.watcher().unwatch(&self.root);
            active.runner.abort();
            active.scan.abort();
            tracing::debug!("Unwatch_res(path: {:?}) = {:?}", self.root, unwatch_res);
            unwatch_res?;
        }
        Ok(())
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Failed to stop watching {:?}: {e}", self.root);
        }
    }
}

/// Whether a watcher path can matter to the index: a managed note, or something without an
/// extension that may be a directory.
fn is_relevant(root: &Path, config: &IndexConfig, path: &Path) -> bool {
    if config.ignore_hidden && is_hidden_path(root, path) {
        return false;
    }
    config.is_managed_path(root, path) || path.is_dir() || path.extension().is_none()
}

/// Translate one notify event into the coordinator's input events.
pub fn to_file_events(root: &Path, config: &IndexConfig, event: &NotifyEvent) -> Vec<FileEvent> {
    let relevant = |p: &&PathBuf| is_relevant(root, config, p);
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let (old, new) = (&event.paths[0], &event.paths[1]);
            match (relevant(&old), relevant(&new)) {
                (true, true) => vec![FileEvent::Renamed(old.clone(), new.clone())],
                (true, false) => vec![FileEvent::Removed(old.clone())],
                (false, true) => vec![FileEvent::Created(new.clone())],
                (false, false) => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => event
            .paths
            .iter()
            .filter(relevant)
            .map(|p| FileEvent::Removed(p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Create(_) => event
            .paths
            .iter()
            .filter(relevant)
            .map(|p| FileEvent::Created(p.clone()))
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(relevant)
            .map(|p| FileEvent::Modified(p.clone()))
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
