//! Read-only queries against the latest committed snapshot.
//!
//! Every query takes the store's read view once and answers entirely from it, so the answer
//! reflects one committed state. Queries never wait on pending parses: a note whose latest
//! content failed to parse is answered from its last good snapshot, and [QueryService::diagnostics]
//! says so.

use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
    Direction,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    diagnostic::{label_diagnostics, scan_issue_diagnostics, Diagnostic, DiagnosticKind},
    error::IndexError,
    extract::{LabelDecl, MetaValue, Position},
    paths::{match_key, normalize_file_path, reference_key, relative_path_string, stem_of},
    resolver::{LabelResolution, RefKey, Resolution, StoredReference},
    store::{FileRecord, IndexStore, StoreReader},
};

/// One reference together with its current outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub source: PathBuf,
    pub ordinal: u32,
    pub target: String,
    pub label: Option<String>,
    pub alias: Option<String>,
    pub position: Position,
    pub resolution: Resolution,
}

impl Link {
    fn new(source: &Path, reference: &StoredReference, resolution: Resolution) -> Self {
        Link {
            source: source.to_path_buf(),
            ordinal: reference.ordinal,
            target: reference.target.clone(),
            label: reference.label.clone(),
            alias: reference.alias.clone(),
            position: reference.position,
            resolution,
        }
    }

    /// The text shown for the reference: its alias when present.
    pub fn display_text(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub path: PathBuf,
    pub key: String,
    pub value: MetaValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefTarget {
    File(PathBuf),
    Label { file: PathBuf, name: String },
}

/// Where a reference leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Definition {
    /// The start of a note. Also returned when the referenced label is missing.
    File { path: PathBuf },
    Label {
        path: PathBuf,
        name: String,
        position: Position,
    },
    /// A non-note file; there is nothing inside it to point at
    External { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphScope {
    All,
    Files(Vec<PathBuf>),
    /// Notes within `depth` links of `center`, following links in either direction
    Neighborhood { center: PathBuf, depth: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub path: PathBuf,
    pub rel_path: String,
    pub title: String,
}

/// All resolved references from `source` to `target`, collapsed into one edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: PathBuf,
    pub target: PathBuf,
    pub references: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    /// Unresolved references owned by notes in scope; they have no edge
    pub unresolved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionContext {
    /// Inside `[[...` before any `:`
    Target,
    /// After `[[target:`. An empty target means the current note.
    Label { target: String },
    MetadataKey,
    MetadataValue { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CompletionKind {
    Note,
    Label,
    MetadataKey,
    MetadataValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub kind: CompletionKind,
    /// Workspace-relative path of the note the candidate belongs to
    pub detail: Option<String>,
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<IndexStore>,
}

impl QueryService {
    pub fn new(store: Arc<IndexStore>) -> Self {
        QueryService { store }
    }

    fn normalize(&self, path: &Path) -> PathBuf {
        normalize_file_path(self.store.root(), path)
    }

    /// References owned by `file`, in document order. `None` when the note is not indexed.
    pub async fn forward_links(&self, file: &Path) -> Option<Vec<Link>> {
        let file = self.normalize(file);
        let reader = self.store.read().await;
        let links = reader.forward_links(&file)?;
        Some(
            links
                .into_iter()
                .map(|(reference, outcome)| Link::new(&file, reference, outcome))
                .collect(),
        )
    }

    /// References pointing at `file`, ambiguous ones included. `None` when the note is not
    /// indexed.
    pub async fn backlinks(&self, file: &Path) -> Option<Vec<Link>> {
        let file = self.normalize(file);
        let reader = self.store.read().await;
        backlinks_of(&reader, &file)
    }

    pub async fn references_to(&self, target: &RefTarget) -> Result<Vec<Link>, IndexError> {
        let (file, label) = match target {
            RefTarget::File(file) => (self.normalize(file), None),
            RefTarget::Label { file, name } => (self.normalize(file), Some(name.as_str())),
        };
        let reader = self.store.read().await;
        let links = backlinks_of(&reader, &file)
            .ok_or_else(|| IndexError::NotFound(format!("{file:?} is not indexed")))?;
        let Some(name) = label else {
            return Ok(links);
        };
        let Some(decl) = reader.file(&file).and_then(|f| f.find_label(name)) else {
            return Ok(Vec::new());
        };
        Ok(links
            .into_iter()
            .filter(|link| {
                link.label.as_deref().is_some_and(|wanted| {
                    reader
                        .file(&file)
                        .and_then(|f| f.find_label(wanted))
                        .is_some_and(|found| found == decl)
                })
            })
            .collect())
    }

    /// Metadata of one note, or of every note when `file` is `None`, ordered by path then key.
    pub async fn metadata(&self, file: Option<&Path>) -> Result<Vec<MetadataEntry>, IndexError> {
        let reader = self.store.read().await;
        match file {
            Some(file) => {
                let file = self.normalize(file);
                let metadata = reader
                    .metadata_of(&file)
                    .await?
                    .ok_or_else(|| IndexError::NotFound(format!("{file:?} is not indexed")))?;
                Ok(metadata
                    .into_iter()
                    .map(|(key, value)| MetadataEntry {
                        path: file.clone(),
                        key,
                        value,
                    })
                    .collect())
            }
            None => Ok(reader
                .all_metadata()
                .await?
                .into_iter()
                .map(|(path, key, value)| MetadataEntry { path, key, value })
                .collect()),
        }
    }

    pub async fn metadata_by_key(&self, key: &str) -> Result<Vec<MetadataEntry>, IndexError> {
        let reader = self.store.read().await;
        Ok(reader
            .metadata_by_key(key)
            .await?
            .into_iter()
            .map(|(path, value)| MetadataEntry {
                path,
                key: key.to_string(),
                value,
            })
            .collect())
    }

    pub async fn labels(&self, file: &Path) -> Option<Vec<LabelDecl>> {
        let file = self.normalize(file);
        let reader = self.store.read().await;
        reader.file(&file).map(|f| f.labels.clone())
    }

    pub async fn file_info(&self, file: &Path) -> Result<Option<FileRecord>, IndexError> {
        let file = self.normalize(file);
        self.store.read().await.file_record(&file).await
    }

    /// Where `[[target:label]]`, written in `source`, leads. Ambiguous targets yield every
    /// candidate; unresolved ones yield nothing.
    pub async fn definition_of(
        &self,
        source: &Path,
        target: &str,
        label: Option<&str>,
    ) -> Result<Vec<Definition>, IndexError> {
        let source = self.normalize(source);
        let source_rel = relative_path_string(self.store.root(), &source)?;
        let key = reference_key(target, &source_rel);
        let reader = self.store.read().await;
        let resolution = reader.resolve(target, &key, label);
        Ok(definitions(&reader, &resolution, label))
    }

    /// Definitions of the reference under the cursor (1-based line and column). Empty when the
    /// cursor is not on a reference.
    pub async fn definition_at(
        &self,
        file: &Path,
        line: u32,
        column: u32,
    ) -> Result<Vec<Definition>, IndexError> {
        let file = self.normalize(file);
        let reader = self.store.read().await;
        let links = reader
            .forward_links(&file)
            .ok_or_else(|| IndexError::NotFound(format!("{file:?} is not indexed")))?;
        let under_cursor = links.into_iter().find(|(reference, _)| {
            let start = reference.position;
            start.line == line && start.column <= column && column < start.column + span(reference)
        });
        Ok(match under_cursor {
            Some((reference, outcome)) => {
                definitions(&reader, &outcome, reference.label.as_deref())
            }
            None => Vec::new(),
        })
    }

    /// Notes and resolved references within `scope`. Ambiguous and external references have no
    /// edge.
    pub async fn graph(&self, scope: &GraphScope) -> Result<LinkGraph, IndexError> {
        let reader = self.store.read().await;
        let mut graph: DiGraph<PathBuf, ()> = DiGraph::new();
        let mut nodes: BTreeMap<PathBuf, NodeIndex> = BTreeMap::new();
        for (path, _) in reader.files() {
            nodes.insert(path.clone(), graph.add_node(path.clone()));
        }
        for (source, _) in reader.files() {
            for (_, outcome) in reader.forward_links(source).unwrap_or_default() {
                if let Resolution::File { path, .. } = outcome {
                    if let (Some(&a), Some(&b)) = (nodes.get(source), nodes.get(&path)) {
                        graph.add_edge(a, b, ());
                    }
                }
            }
        }

        let in_scope: BTreeSet<NodeIndex> = match scope {
            GraphScope::All => graph.node_indices().collect(),
            GraphScope::Files(paths) => paths
                .iter()
                .filter_map(|p| nodes.get(&self.normalize(p)).copied())
                .collect(),
            GraphScope::Neighborhood { center, depth } => {
                let center = self.normalize(center);
                let start = nodes
                    .get(&center)
                    .copied()
                    .ok_or_else(|| IndexError::NotFound(format!("{center:?} is not indexed")))?;
                neighborhood(&graph, start, *depth)
            }
        };

        let mut output = LinkGraph::default();
        let mut edges: BTreeMap<(NodeIndex, NodeIndex), usize> = BTreeMap::new();
        for &index in &in_scope {
            let path = &graph[index];
            if let Some(file) = reader.file(path) {
                output.nodes.push(GraphNode {
                    path: path.clone(),
                    rel_path: file.rel_path.clone(),
                    title: file.display_name().to_string(),
                });
            }
            for edge in graph.edges_directed(index, Direction::Outgoing) {
                if in_scope.contains(&edge.target()) {
                    *edges.entry((index, edge.target())).or_default() += 1;
                }
            }
            output.unresolved += reader
                .forward_links(path)
                .unwrap_or_default()
                .iter()
                .filter(|(_, outcome)| *outcome == Resolution::Unresolved)
                .count();
        }
        output.nodes.sort_by(|a, b| a.path.cmp(&b.path));
        output.edges = edges
            .into_iter()
            .map(|((a, b), references)| GraphEdge {
                source: graph[a].clone(),
                target: graph[b].clone(),
                references,
            })
            .collect();
        output
            .edges
            .sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
        Ok(output)
    }

    /// Completion candidates for `partial` in `context`, ranked prefix matches first, then
    /// substring matches, each group alphabetical. Matching ignores case.
    pub async fn completion_candidates(
        &self,
        context: &CompletionContext,
        partial: &str,
        current_file: &Path,
    ) -> Result<Vec<Completion>, IndexError> {
        let reader = self.store.read().await;
        let mut candidates: Vec<Completion> = Vec::new();
        match context {
            CompletionContext::Target => {
                for (_, file) in reader.files() {
                    let stem = stem_of(&file.rel_path).to_string();
                    let mut names = vec![stem];
                    if let Some(title) = &file.title {
                        names.insert(0, title.clone());
                    }
                    names.dedup();
                    for name in names {
                        candidates.push(Completion {
                            text: name,
                            kind: CompletionKind::Note,
                            detail: Some(file.rel_path.clone()),
                        });
                    }
                }
            }
            CompletionContext::Label { target } => {
                let current = self.normalize(current_file);
                let owners: Vec<PathBuf> = if target.trim().is_empty() {
                    vec![current]
                } else {
                    let source_rel = relative_path_string(self.store.root(), &current)?;
                    let key = reference_key(target, &source_rel);
                    reader
                        .resolve(target, &key, None)
                        .targets()
                        .into_iter()
                        .cloned()
                        .collect()
                };
                for owner in owners {
                    let Some(file) = reader.file(&owner) else {
                        continue;
                    };
                    let mut seen = BTreeSet::new();
                    for label in &file.labels {
                        if seen.insert(label.name.clone()) {
                            candidates.push(Completion {
                                text: label.name.clone(),
                                kind: CompletionKind::Label,
                                detail: Some(file.rel_path.clone()),
                            });
                        }
                    }
                }
            }
            CompletionContext::MetadataKey => {
                for key in reader.metadata_keys().await? {
                    candidates.push(Completion {
                        text: key,
                        kind: CompletionKind::MetadataKey,
                        detail: None,
                    });
                }
            }
            CompletionContext::MetadataValue { key } => {
                for value in reader.metadata_values(key).await? {
                    candidates.push(Completion {
                        text: value,
                        kind: CompletionKind::MetadataValue,
                        detail: None,
                    });
                }
            }
        }
        Ok(rank_completions(candidates, partial))
    }

    /// Diagnostics of one note. Fails with `NotFound` when the note is not indexed.
    pub async fn diagnostics(&self, file: &Path) -> Result<Vec<Diagnostic>, IndexError> {
        let file = self.normalize(file);
        let reader = self.store.read().await;
        diagnostics_of(&reader, &file).await
    }

    /// Diagnostics of every indexed note, ordered by path.
    pub async fn all_diagnostics(&self) -> Result<Vec<Diagnostic>, IndexError> {
        let reader = self.store.read().await;
        let mut paths: Vec<PathBuf> = reader.files().map(|(p, _)| p.clone()).collect();
        paths.sort();
        let mut diagnostics = Vec::new();
        for path in paths {
            diagnostics.extend(diagnostics_of(&reader, &path).await?);
        }
        Ok(diagnostics)
    }
}

fn backlinks_of(reader: &StoreReader<'_>, file: &Path) -> Option<Vec<Link>> {
    let links = reader.backlinks(file)?;
    Some(
        links
            .into_iter()
            .map(|(RefKey { source, .. }, reference, outcome)| {
                Link::new(&source, reference, outcome.clone())
            })
            .collect(),
    )
}

fn definitions(
    reader: &StoreReader<'_>,
    resolution: &Resolution,
    label: Option<&str>,
) -> Vec<Definition> {
    match resolution {
        Resolution::File { path, .. } => {
            let decl = label.and_then(|name| reader.file(path).and_then(|f| f.find_label(name)));
            vec![match decl {
                Some(decl) => Definition::Label {
                    path: path.clone(),
                    name: decl.name.clone(),
                    position: decl.position,
                },
                None => Definition::File { path: path.clone() },
            }]
        }
        Resolution::Ambiguous { candidates } => candidates
            .iter()
            .map(|path| Definition::File { path: path.clone() })
            .collect(),
        Resolution::External { target } => vec![Definition::External {
            target: target.clone(),
        }],
        Resolution::Unresolved => Vec::new(),
    }
}

/// Width in characters of `[[target:label|alias]]` as written. Rows cached without a width fall
/// back to an estimate that assumes no padding.
fn span(reference: &StoredReference) -> u32 {
    if reference.width > 0 {
        return reference.width;
    }
    let mut width = reference.target.chars().count() + 4;
    if let Some(label) = &reference.label {
        width += label.chars().count() + 1;
    }
    if let Some(alias) = &reference.alias {
        width += alias.chars().count() + 1;
    }
    u32::try_from(width).unwrap_or(u32::MAX)
}

fn neighborhood(
    graph: &DiGraph<PathBuf, ()>,
    start: NodeIndex,
    depth: usize,
) -> BTreeSet<NodeIndex> {
    let mut seen = BTreeSet::from([start]);
    let mut queue = VecDeque::from([(start, 0)]);
    while let Some((node, distance)) = queue.pop_front() {
        if distance == depth {
            continue;
        }
        for next in graph.neighbors_undirected(node) {
            if seen.insert(next) {
                queue.push_back((next, distance + 1));
            }
        }
    }
    seen
}

fn rank_completions(candidates: Vec<Completion>, partial: &str) -> Vec<Completion> {
    let needle = match_key(partial);
    let mut ranked: Vec<(u8, String, Completion)> = Vec::new();
    let mut seen: HashMap<(CompletionKind, String), ()> = HashMap::new();
    for candidate in candidates {
        let key = match_key(&candidate.text);
        let rank = if key.starts_with(&needle) {
            0
        } else if key.contains(&needle) {
            1
        } else {
            continue;
        };
        let identity = (candidate.kind, format!("{}\0{:?}", candidate.text, candidate.detail));
        if seen.insert(identity, ()).is_some() {
            continue;
        }
        ranked.push((rank, key, candidate));
    }
    ranked.sort_by(|a, b| {
        (a.0, &a.1, &a.2.text, &a.2.detail).cmp(&(b.0, &b.1, &b.2.text, &b.2.detail))
    });
    ranked.into_iter().map(|(_, _, candidate)| candidate).collect()
}

async fn diagnostics_of(
    reader: &StoreReader<'_>,
    file: &Path,
) -> Result<Vec<Diagnostic>, IndexError> {
    let indexed = reader
        .file(file)
        .ok_or_else(|| IndexError::NotFound(format!("{file:?} is not indexed")))?;
    let mut diagnostics = Vec::new();
    for (reference, outcome) in reader.forward_links(file).unwrap_or_default() {
        let diagnostic = match &outcome {
            Resolution::Unresolved => Some((
                DiagnosticKind::BrokenReference,
                format!("no note named `{}`", reference.target),
            )),
            Resolution::File {
                path,
                label: Some(LabelResolution::Missing),
            } => Some((
                DiagnosticKind::MissingLabel,
                format!(
                    "`{}` has no label <{}>",
                    reader
                        .file(path)
                        .map(|f| f.rel_path.as_str())
                        .unwrap_or(reference.target.as_str()),
                    reference.label.as_deref().unwrap_or_default()
                ),
            )),
            Resolution::Ambiguous { candidates } => Some((
                DiagnosticKind::AmbiguousReference,
                format!(
                    "`{}` matches {} notes: {}",
                    reference.target,
                    candidates.len(),
                    candidates
                        .iter()
                        .map(|c| reader
                            .file(c)
                            .map(|f| f.rel_path.clone())
                            .unwrap_or_else(|| c.display().to_string()))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )),
            _ => None,
        };
        if let Some((kind, message)) = diagnostic {
            diagnostics.push(Diagnostic::new(
                kind,
                file.to_path_buf(),
                Some(reference.position),
                message,
            ));
        }
    }
    diagnostics.extend(label_diagnostics(file, &indexed.labels));
    if let Some(record) = reader.file_record(file).await? {
        diagnostics.extend(scan_issue_diagnostics(file, &record.scan_issues));
        if let Some(error) = record.parse_error {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::ParseFailure,
                file.to_path_buf(),
                None,
                format!("latest content failed to parse, showing the last indexed version: {error}"),
            ));
        }
    }
    diagnostics.sort_by_key(|d| (d.position.is_some(), d.position));
    Ok(diagnostics)
}
