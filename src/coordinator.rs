//! The update coordinator: turns file-change events into committed index updates.
//!
//! Every path has a slot holding its [Phase] and a monotonically increasing revision counter.
//! Registering an event bumps the counter synchronously, in event order. Processing then reads
//! and extracts the file without holding any lock, takes the path's commit gate, and commits only
//! if its revision is still the latest one registered for the path. A parse that lost the race
//! to a newer event is dropped as [UpdateOutcome::Superseded], so commits for one path always
//! happen in event order no matter in which order the parses finish.
//!
//! A removed path's slot is dropped once its removal commits and no other ticket for it is
//! outstanding, so the path reads as [Phase::Unseen] again and the slot table only holds paths
//! that are indexed or in flight.
//!
//! Live events take priority over the background scan: the scan waits whenever live work is in
//! flight, and skips paths that a live event has handled since the scan started.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc::UnboundedReceiver, mpsc::UnboundedSender, Notify};
use walkdir::WalkDir;

use crate::{
    config::IndexConfig,
    error::IndexError,
    event::{FileEvent, IndexEvent, PathOp},
    extract::{ConfiguredMetadata, Extractor, MetadataSource},
    paths::{normalize_file_path, relative_path_string},
    store::{FileTimes, IndexStore},
};

/// Lifecycle of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Unseen,
    Parsing,
    Indexed,
    /// The cached facts do not reflect the latest content
    Stale,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOutcome {
    Indexed { revision: u64 },
    /// The previous snapshot was kept
    ParseFailed { message: String },
    Removed,
    /// A newer event for the path was registered before this one could commit
    Superseded { revision: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Cached notes no longer on disk
    pub removed: usize,
}

struct PathSlot {
    phase: Phase,
    latest: u64,
    committed: u64,
    /// Serializes commits for the path
    gate: Arc<tokio::sync::Mutex<()>>,
    /// Touched by a live event since the current scan started
    live: bool,
}

impl Default for PathSlot {
    fn default() -> Self {
        PathSlot {
            phase: Phase::Unseen,
            latest: 0,
            committed: 0,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            live: false,
        }
    }
}

/// Count of live tickets not yet processed.
#[derive(Default)]
struct LiveWork {
    pending: AtomicUsize,
    idle: Notify,
}

struct LiveGuard(Arc<LiveWork>);

impl LiveGuard {
    fn new(work: &Arc<LiveWork>) -> Self {
        work.pending.fetch_add(1, Ordering::SeqCst);
        LiveGuard(work.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// A registered operation on one path, waiting to be processed.
pub struct Ticket {
    pub path: PathBuf,
    pub op: PathOp,
    pub revision: u64,
    gate: Arc<tokio::sync::Mutex<()>>,
    _live: Option<LiveGuard>,
}

struct Shared<M> {
    root: PathBuf,
    config: IndexConfig,
    store: Arc<IndexStore>,
    extractor: Extractor<M>,
    slots: Mutex<HashMap<PathBuf, PathSlot>>,
    live: Arc<LiveWork>,
    events: Option<UnboundedSender<IndexEvent>>,
}

pub struct Coordinator<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for Coordinator<M> {
    fn clone(&self) -> Self {
        Coordinator {
            shared: self.shared.clone(),
        }
    }
}

impl Coordinator<ConfiguredMetadata> {
    /// Open the workspace at `root`: canonicalize it, open its cache, and pick the metadata
    /// collaborator named in `config`.
    pub async fn open(
        root: &Path,
        config: IndexConfig,
        events: Option<UnboundedSender<IndexEvent>>,
    ) -> Result<Self, IndexError> {
        let root = root.canonicalize()?;
        let store = Arc::new(IndexStore::open(&root, &config).await?);
        let source = ConfiguredMetadata::from_config(&config, &root);
        Ok(Coordinator::new(store, config, source, events))
    }
}

impl<M: MetadataSource + 'static> Coordinator<M> {
    pub fn new(
        store: Arc<IndexStore>,
        config: IndexConfig,
        source: M,
        events: Option<UnboundedSender<IndexEvent>>,
    ) -> Self {
        Coordinator {
            shared: Arc::new(Shared {
                root: store.root().to_path_buf(),
                config,
                store,
                extractor: Extractor::new(source),
                slots: Mutex::new(HashMap::new()),
                live: Arc::new(LiveWork::default()),
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.shared.store
    }

    pub fn config(&self) -> &IndexConfig {
        &self.shared.config
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    fn emit(&self, event: IndexEvent) {
        if let Some(tx) = &self.shared.events {
            if let Err(e) = tx.send(event) {
                tracing::debug!("Index event receiver is gone: {e}");
            }
        }
    }

    pub async fn phase(&self, path: &Path) -> Phase {
        let path = normalize_file_path(&self.shared.root, path);
        let phase = self.shared.slots.lock().get(&path).map(|slot| slot.phase);
        if let Some(phase) = phase {
            return phase;
        }
        if self.shared.store.read().await.contains(&path) {
            Phase::Indexed
        } else {
            Phase::Unseen
        }
    }

    /// Revision of the last commit for `path`, 0 if none happened in this session.
    pub fn committed_revision(&self, path: &Path) -> u64 {
        let path = normalize_file_path(&self.shared.root, path);
        self.shared
            .slots
            .lock()
            .get(&path)
            .map(|slot| slot.committed)
            .unwrap_or_default()
    }

    /// Register one operation, bumping the path's revision. Must be called in event order.
    pub fn begin(&self, path: &Path, op: PathOp, live: bool) -> Result<Ticket, IndexError> {
        let path = normalize_file_path(&self.shared.root, path);
        relative_path_string(&self.shared.root, &path)?;
        let mut slots = self.shared.slots.lock();
        let slot = slots.entry(path.clone()).or_default();
        slot.latest += 1;
        slot.live |= live;
        if op == PathOp::Parse && matches!(slot.phase, Phase::Indexed | Phase::Parsing) {
            slot.phase = Phase::Stale;
        }
        Ok(Ticket {
            path,
            op,
            revision: slot.latest,
            gate: slot.gate.clone(),
            _live: live.then(|| LiveGuard::new(&self.shared.live)),
        })
    }

    /// Register every operation a file event implies. Directories are expanded: removing one
    /// removes every indexed note below it, creating one indexes every note inside it.
    pub async fn register(&self, event: FileEvent) -> Vec<Result<Ticket, IndexError>> {
        let mut tickets = Vec::new();
        for (path, op) in event.into_ops() {
            let path = normalize_file_path(&self.shared.root, &path);
            if self.shared.config.is_managed_path(&self.shared.root, &path) {
                tickets.push(self.begin(&path, op, true));
                continue;
            }
            match op {
                PathOp::Remove => {
                    let below: Vec<PathBuf> = {
                        let reader = self.shared.store.read().await;
                        reader
                            .files()
                            .map(|(p, _)| p.clone())
                            .filter(|p| p.starts_with(&path))
                            .collect()
                    };
                    for note in below {
                        tickets.push(self.begin(&note, PathOp::Remove, true));
                    }
                }
                PathOp::Parse if path.is_dir() => {
                    for note in self.managed_files_under(&path) {
                        tickets.push(self.begin(&note, PathOp::Parse, true));
                    }
                }
                PathOp::Parse => tracing::trace!("Ignoring unmanaged path {path:?}"),
            }
        }
        tickets
    }

    /// Register and process one event. Operations are processed in order; the first error is
    /// returned after all of them ran.
    #[tracing::instrument(skip(self))]
    pub async fn handle_event(&self, event: FileEvent) -> Result<Vec<UpdateOutcome>, IndexError> {
        let mut outcomes = Vec::new();
        let mut first_error = None;
        for ticket in self.register(event).await {
            let result = match ticket {
                Ok(ticket) => self.process(ticket).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    tracing::warn!("Update failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Consume file events until the channel closes. Each registered operation is processed on
    /// its own task; operations on different paths proceed concurrently.
    pub async fn run(&self, mut events: UnboundedReceiver<FileEvent>) {
        while let Some(event) = events.recv().await {
            tracing::debug!("Received {event:?}");
            for ticket in self.register(event).await {
                match ticket {
                    Ok(ticket) => {
                        let coordinator = self.clone();
                        tokio::spawn(async move {
                            let path = ticket.path.clone();
                            if let Err(e) = coordinator.process(ticket).await {
                                tracing::warn!("Update of {path:?} failed: {e}");
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Rejected file event: {e}"),
                }
            }
        }
        tracing::debug!("File event channel closed");
    }

    fn is_latest(&self, path: &Path, revision: u64) -> bool {
        self.shared
            .slots
            .lock()
            .get(path)
            .is_some_and(|slot| slot.latest == revision)
    }

    fn set_phase(&self, path: &Path, revision: u64, phase: Phase, committed: bool) {
        if let Some(slot) = self.shared.slots.lock().get_mut(path) {
            if committed {
                slot.committed = revision;
            }
            if slot.latest == revision {
                slot.phase = phase;
            }
        }
    }

    fn superseded(&self, ticket: &Ticket) -> UpdateOutcome {
        tracing::debug!(
            "Dropping revision {} of {:?}, a newer event exists",
            ticket.revision,
            ticket.path
        );
        self.emit(IndexEvent::Superseded {
            path: ticket.path.clone(),
            revision: ticket.revision,
        });
        UpdateOutcome::Superseded {
            revision: ticket.revision,
        }
    }

    /// Process a registered operation.
    #[tracing::instrument(skip_all, fields(path = ?ticket.path, revision = ticket.revision))]
    pub async fn process(&self, ticket: Ticket) -> Result<UpdateOutcome, IndexError> {
        match ticket.op {
            PathOp::Parse => self.process_parse(ticket).await,
            PathOp::Remove => self.process_remove(ticket).await,
        }
    }

    async fn process_parse(&self, ticket: Ticket) -> Result<UpdateOutcome, IndexError> {
        if !self.is_latest(&ticket.path, ticket.revision) {
            return Ok(self.superseded(&ticket));
        }
        // Timestamps before content: a racing write can only leave the cached mtime stale
        let times = tokio::fs::metadata(&ticket.path)
            .await
            .map(|m| FileTimes::from_metadata(&m))
            .unwrap_or_default();
        let content = match tokio::fs::read_to_string(&ticket.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("{:?} vanished before it could be parsed", ticket.path);
                return self.process_remove(ticket).await;
            }
            Err(e) => {
                return self
                    .commit_failure(ticket, times, format!("unreadable: {e}"))
                    .await
            }
        };
        if !self.is_latest(&ticket.path, ticket.revision) {
            return Ok(self.superseded(&ticket));
        }
        self.set_phase(&ticket.path, ticket.revision, Phase::Parsing, false);

        let extraction = match self
            .shared
            .extractor
            .extract(&ticket.path, &content)
            .await
        {
            Ok(extraction) => extraction,
            Err(e) => {
                let message = match e {
                    IndexError::Extraction(message) => message,
                    other => other.to_string(),
                };
                return self.commit_failure(ticket, times, message).await;
            }
        };

        let _gate = ticket.gate.lock().await;
        if !self.is_latest(&ticket.path, ticket.revision) {
            return Ok(self.superseded(&ticket));
        }
        let (store, path, extraction) = (&self.shared.store, ticket.path.as_path(), &extraction);
        let invalidated = self
            .with_retry(path, move || store.replace_file(path, times, extraction))
            .await?;
        self.set_phase(&ticket.path, ticket.revision, Phase::Indexed, true);
        tracing::debug!("Indexed {:?} at revision {}", ticket.path, ticket.revision);
        self.emit(IndexEvent::FileIndexed {
            path: ticket.path.clone(),
            revision: ticket.revision,
        });
        self.emit_invalidated(invalidated);
        Ok(UpdateOutcome::Indexed {
            revision: ticket.revision,
        })
    }

    /// Keep the previous snapshot, record the failure, and surface it.
    async fn commit_failure(
        &self,
        ticket: Ticket,
        times: FileTimes,
        message: String,
    ) -> Result<UpdateOutcome, IndexError> {
        let _gate = ticket.gate.lock().await;
        if !self.is_latest(&ticket.path, ticket.revision) {
            return Ok(self.superseded(&ticket));
        }
        tracing::warn!("Failed to parse {:?}: {message}", ticket.path);
        let (store, path, reason) = (&self.shared.store, ticket.path.as_path(), message.as_str());
        let invalidated = self
            .with_retry(path, move || store.record_parse_failure(path, times, reason))
            .await?;
        self.set_phase(&ticket.path, ticket.revision, Phase::Stale, true);
        self.emit(IndexEvent::ParseFailed {
            path: ticket.path.clone(),
            message: message.clone(),
        });
        self.emit_invalidated(invalidated);
        Ok(UpdateOutcome::ParseFailed { message })
    }

    async fn process_remove(&self, ticket: Ticket) -> Result<UpdateOutcome, IndexError> {
        let _gate = ticket.gate.lock().await;
        if !self.is_latest(&ticket.path, ticket.revision) {
            return Ok(self.superseded(&ticket));
        }
        let (store, path) = (&self.shared.store, ticket.path.as_path());
        let removed = self
            .with_retry(path, move || store.remove_file(path))
            .await?;
        self.set_phase(&ticket.path, ticket.revision, Phase::Removed, true);
        self.release_slot(&ticket);
        if let Some(invalidated) = removed {
            tracing::debug!("Removed {:?}", ticket.path);
            self.emit(IndexEvent::FileRemoved {
                path: ticket.path.clone(),
            });
            self.emit_invalidated(invalidated);
        }
        Ok(UpdateOutcome::Removed)
    }

    /// Drop the slot of a removed path. Only the slot and `ticket` may still hold the gate: any
    /// other holder is an outstanding ticket whose revision must not be reused.
    fn release_slot(&self, ticket: &Ticket) {
        let mut slots = self.shared.slots.lock();
        let idle = slots.get(&ticket.path).is_some_and(|slot| {
            slot.latest == ticket.revision && Arc::strong_count(&slot.gate) == 2
        });
        if idle {
            slots.remove(&ticket.path);
        }
    }

    fn emit_invalidated(&self, sources: BTreeSet<PathBuf>) {
        if !sources.is_empty() {
            self.emit(IndexEvent::ReferencesInvalidated {
                sources: sources.into_iter().collect(),
            });
        }
    }

    /// Run a store operation, retrying store errors with exponential backoff. Exhaustion is
    /// surfaced as [IndexEvent::StoreFailed]; the cache is left as it was.
    async fn with_retry<T, F, Fut>(&self, path: &Path, mut op: F) -> Result<T, IndexError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, IndexError>>,
    {
        let retry = self.shared.config.store_retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = retry.backoff(attempt);
                    tracing::warn!(
                        "Store operation for {path:?} failed (attempt {}/{max_attempts}), \
                         retrying in {delay:?}: {e}",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(
                            "Store operation for {path:?} failed after {max_attempts} attempts: {e}"
                        );
                        self.emit(IndexEvent::StoreFailed {
                            path: path.to_path_buf(),
                            message: e.to_string(),
                        });
                    }
                    return Err(e);
                }
            }
        }
    }

    fn managed_files_under(&self, dir: &Path) -> Vec<PathBuf> {
        let ignore_hidden = self.shared.config.ignore_hidden;
        WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !ignore_hidden
                    || !entry.file_name().to_string_lossy().starts_with('.')
            })
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {e}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| self.shared.config.is_managed_path(&self.shared.root, path))
            .collect()
    }

    async fn wait_for_live_idle(&self) {
        loop {
            let idle = self.shared.live.idle.notified();
            if self.shared.live.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Background (re-)index of the whole workspace.
    ///
    /// Unless `force` is set (or the cache was just rebuilt), notes whose cached modification
    /// time matches the file on disk and that parsed cleanly are skipped. Cached notes that no
    /// longer exist are removed. Each note is committed on its own, so an interrupted scan can
    /// simply be run again.
    #[tracing::instrument(skip(self))]
    pub async fn scan(&self, force: bool) -> Result<ScanSummary, IndexError> {
        let force = force || self.shared.store.rebuilt();
        {
            let mut slots = self.shared.slots.lock();
            slots.retain(|_, slot| {
                Arc::strong_count(&slot.gate) > 1
                    || !matches!(slot.phase, Phase::Removed | Phase::Unseen)
            });
            for slot in slots.values_mut() {
                slot.live = false;
            }
        }
        let cached = self.shared.store.cached_states().await?;
        let on_disk = self.managed_files_under(&self.shared.root);
        let on_disk_set: BTreeSet<&PathBuf> = on_disk.iter().collect();
        tracing::info!(
            "Scanning {:?}: {} notes on disk, {} cached",
            self.shared.root,
            on_disk.len(),
            cached.len()
        );

        let mut summary = ScanSummary::default();
        let mut first_error = None;
        for path in cached.keys().filter(|p| !on_disk_set.contains(p)) {
            self.wait_for_live_idle().await;
            if self.touched_live(path) {
                continue;
            }
            let result = match self.begin(path, PathOp::Remove, false) {
                Ok(ticket) => self.process(ticket).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => summary.removed += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        for path in &on_disk {
            self.wait_for_live_idle().await;
            if self.touched_live(path) {
                summary.skipped += 1;
                continue;
            }
            if !force {
                if let Some(state) = cached.get(path) {
                    let mtime = FileTimes::of(path).modified_at;
                    if !state.has_parse_error && mtime.is_some() && state.modified_at == mtime {
                        summary.skipped += 1;
                        continue;
                    }
                }
            }
            let result = match self.begin(path, PathOp::Parse, false) {
                Ok(ticket) => self.process(ticket).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(UpdateOutcome::Indexed { .. }) => summary.indexed += 1,
                Ok(UpdateOutcome::ParseFailed { .. }) => summary.failed += 1,
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            "Scan complete: {} indexed, {} skipped, {} failed, {} removed",
            summary.indexed,
            summary.skipped,
            summary.failed,
            summary.removed
        );
        self.emit(IndexEvent::ScanComplete {
            indexed: summary.indexed,
            skipped: summary.skipped,
        });
        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn touched_live(&self, path: &Path) -> bool {
        self.shared
            .slots
            .lock()
            .get(path)
            .is_some_and(|slot| slot.live)
    }
}
