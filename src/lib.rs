//! # typst-oxide
//!
//! An incrementally-updated knowledge index over a directory of interlinked Typst notes.
//!
//! ## Overview
//!
//! typst-oxide extracts structured facts from every note in a workspace (document metadata,
//! explicit `<label>`s and heading-derived labels, and `[[wiki-style]]` cross-references),
//! persists them in a SQLite cache, keeps that cache consistent as files are created, edited,
//! renamed or deleted, and answers navigation queries against it: forward links, backlinks,
//! definitions, completions, link graphs and diagnostics.
//!
//! ### Key Features
//!
//! - **Incremental**: a change to one note re-resolves only the references that could name it
//! - **Last writer wins**: per-path revisions guarantee that a slow, superseded parse never
//!   overwrites a newer one, whatever order the parses finish in
//! - **Stale but available**: a note that fails to parse keeps its last good facts, and a
//!   diagnostic says so
//! - **Snapshot reads**: queries always see one committed state, never half of a write
//! - **Restart friendly**: the cache survives restarts; unchanged notes are skipped by mtime, and
//!   a corrupt cache is rebuilt from scratch
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **[`extract`]**: content → [`extract::Extraction`]. Labels and references are scanned
//!   directly; metadata comes from a [`extract::MetadataSource`] (inline `#meta(...)` parsing, or
//!   `typst query`).
//! - **[`store`]**: the four cache tables (`files`, `metadata`, `labels`, `cross_references`) and
//!   the in-memory [`resolver::ResolutionIndex`] derived from them, updated together under one
//!   lock.
//! - **[`resolver`]**: maps reference targets to notes and labels, and maintains the inverted
//!   index backlinks are read from.
//! - **[`coordinator`]**: consumes [`event::FileEvent`]s, re-extracts dirty notes, and commits
//!   them in event order. Also runs the background workspace scan.
//! - **[`query`]**: read-only façade over the committed snapshot.
//! - **`watch`** (feature `service`): filesystem watching via `notify-debouncer-full`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use typst_oxide::{config::IndexConfig, coordinator::Coordinator, query::QueryService};
//! use std::path::Path;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let coordinator = Coordinator::open(Path::new("./notes"), IndexConfig::default(), None).await?;
//!     let summary = coordinator.scan(false).await?;
//!     println!("{} notes indexed, {} unchanged", summary.indexed, summary.skipped);
//!
//!     let query = QueryService::new(coordinator.store().clone());
//!     let note = coordinator.root().join("index.typ");
//!     for link in query.backlinks(&note).await.unwrap_or_default() {
//!         println!("{:?} links here at line {}", link.source, link.position.line);
//!     }
//!     for diagnostic in query.all_diagnostics().await? {
//!         println!("{diagnostic}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Feeding live edits
//!
//! File-change events can come from anywhere: an editor's `didChange`, a watcher, a test.
//!
//! ```rust,no_run
//! # use typst_oxide::{config::IndexConfig, coordinator::Coordinator, event::FileEvent};
//! # use std::path::{Path, PathBuf};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let coordinator = Coordinator::open(Path::new("./notes"), IndexConfig::default(), Some(tx)).await?;
//! coordinator
//!     .handle_event(FileEvent::Modified(PathBuf::from("./notes/index.typ")))
//!     .await?;
//! while let Ok(event) = rx.try_recv() {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Reference syntax
//!
//! | form                     | meaning                                        |
//! |--------------------------|------------------------------------------------|
//! | `[[target]]`             | a note by title, stem, file name or path       |
//! | `[[target\|alias]]`      | same, displayed as `alias`                     |
//! | `[[target:label]]`       | a label within the note                        |
//! | `[[target:label\|alias]]`| both                                           |
//! | `[[image.png]]`          | a non-note file (never resolves to a label)    |
//!
//! Matching ignores case and Unicode normalization form. Aliases never affect resolution.
//!
//! ## Feature Flags
//!
//! - `service`: the `watch` module
//! - `bin`: the `typst-oxide` command line tool (implies `service`)

pub mod config;
pub mod coordinator;
pub mod diagnostic;
pub mod error;
pub mod event;
pub mod extract;
pub mod paths;
pub mod query;
pub mod resolver;
pub mod store;
#[cfg(test)]
mod tests;
#[cfg(feature = "service")]
pub mod watch;

pub use error::*;
