//! Reference resolution over the set of indexed notes.
//!
//! [ResolutionIndex] is the derived, in-memory side of the index: which note answers to which
//! name, which labels each note owns, and the resolution outcome of every stored reference
//! together with the inverted (target → inbound references) index that backlinks are read from.
//!
//! The index only stores forward ownership (a note owns its labels and references). Backlinks
//! are a derived view that is updated incrementally: when a note is replaced or removed, the
//! references whose target key is one of that note's old or new names are re-resolved, and
//! nothing else is touched.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use crate::{
    extract::{LabelDecl, Position, RefOccurrence},
    paths::{extension_of, file_keys, match_key, reference_key},
};

/// A reference as stored for its source note: the occurrence plus its lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReference {
    /// Position among the source note's references, in document order
    pub ordinal: u32,
    pub target: String,
    pub target_key: String,
    pub label: Option<String>,
    pub alias: Option<String>,
    pub position: Position,
    /// Characters covered by the occurrence. Zero for rows cached before widths were recorded.
    pub width: u32,
}

impl StoredReference {
    pub fn from_occurrence(ordinal: u32, occurrence: &RefOccurrence, source_rel: &str) -> Self {
        StoredReference {
            ordinal,
            target: occurrence.target.clone(),
            target_key: reference_key(&occurrence.target, source_rel),
            label: occurrence.label.clone(),
            alias: occurrence.alias.clone(),
            position: occurrence.position,
            width: occurrence.width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelResolution {
    Found {
        position: Position,
        is_implicit: bool,
    },
    Missing,
}

/// Outcome of resolving one reference against the current set of notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Exactly one note matches. `label` is present when the reference names a label.
    File {
        path: PathBuf,
        label: Option<LabelResolution>,
    },
    /// A file of a non-managed type; valid but never resolves to a label
    External { target: String },
    /// Several notes answer to the target; all of them, sorted by path
    Ambiguous { candidates: Vec<PathBuf> },
    Unresolved,
}

impl Resolution {
    /// Notes this outcome points at. Ambiguous outcomes point at every candidate.
    pub fn targets(&self) -> Vec<&PathBuf> {
        match self {
            Resolution::File { path, .. } => vec![path],
            Resolution::Ambiguous { candidates } => candidates.iter().collect(),
            Resolution::External { .. } | Resolution::Unresolved => Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            Resolution::File { .. } | Resolution::External { .. }
        )
    }
}

/// Identity of one stored reference: its source note and ordinal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefKey {
    pub source: PathBuf,
    pub ordinal: u32,
}

/// The facts of one note the resolver needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    pub rel_path: String,
    pub title: Option<String>,
    pub keys: Vec<String>,
    pub labels: Vec<LabelDecl>,
    pub references: Vec<StoredReference>,
}

impl IndexedFile {
    pub fn new(
        rel_path: String,
        title: Option<String>,
        labels: Vec<LabelDecl>,
        mut references: Vec<StoredReference>,
    ) -> Self {
        references.sort_by_key(|r| r.ordinal);
        let keys = file_keys(&rel_path, title.as_deref());
        IndexedFile {
            rel_path,
            title,
            keys,
            labels,
            references,
        }
    }

    /// The name shown for this note: its title, or its file stem.
    pub fn display_name(&self) -> &str {
        self.title
            .as_deref()
            .unwrap_or_else(|| crate::paths::stem_of(&self.rel_path))
    }

    /// The reference at `ordinal`. Ordinals are normally the position in `references`; a
    /// binary search covers gaps.
    pub fn reference(&self, ordinal: u32) -> Option<&StoredReference> {
        match self.references.get(ordinal as usize) {
            Some(r) if r.ordinal == ordinal => Some(r),
            _ => self
                .references
                .binary_search_by_key(&ordinal, |r| r.ordinal)
                .ok()
                .map(|i| &self.references[i]),
        }
    }

    /// Exact name match first, then a case-insensitive one. The first declaration wins.
    pub fn find_label(&self, name: &str) -> Option<&LabelDecl> {
        let name = name.trim();
        self.labels.iter().find(|l| l.name == name).or_else(|| {
            let key = match_key(name);
            self.labels.iter().find(|l| match_key(&l.name) == key)
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolutionIndex {
    managed_extensions: Vec<String>,
    files: BTreeMap<PathBuf, IndexedFile>,
    by_key: HashMap<String, BTreeSet<PathBuf>>,
    refs_by_target_key: HashMap<String, BTreeSet<RefKey>>,
    outcomes: HashMap<RefKey, Resolution>,
    inbound: HashMap<PathBuf, BTreeSet<RefKey>>,
}

impl ResolutionIndex {
    pub fn new(managed_extensions: Vec<String>) -> Self {
        ResolutionIndex {
            managed_extensions,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn file(&self, path: &Path) -> Option<&IndexedFile> {
        self.files.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = (&PathBuf, &IndexedFile)> {
        self.files.iter()
    }

    /// Replace everything known about `path`. Returns the other notes whose outgoing
    /// resolution changed as a consequence.
    pub fn replace_file(&mut self, path: &Path, file: IndexedFile) -> BTreeSet<PathBuf> {
        let mut affected_keys: BTreeSet<String> = BTreeSet::new();
        if let Some(old) = self.detach(path) {
            affected_keys.extend(old.keys);
        }
        affected_keys.extend(file.keys.iter().cloned());

        for key in &file.keys {
            self.by_key
                .entry(key.clone())
                .or_default()
                .insert(path.to_path_buf());
        }
        let own_refs: Vec<RefKey> = file
            .references
            .iter()
            .map(|r| {
                let ref_key = RefKey {
                    source: path.to_path_buf(),
                    ordinal: r.ordinal,
                };
                self.refs_by_target_key
                    .entry(r.target_key.clone())
                    .or_default()
                    .insert(ref_key.clone());
                ref_key
            })
            .collect();
        self.files.insert(path.to_path_buf(), file);

        for ref_key in own_refs {
            self.refresh(&ref_key);
        }
        let mut invalidated = self.refresh_keys(&affected_keys);
        invalidated.remove(path);
        invalidated
    }

    /// Forget `path`. Returns `None` when the note was not indexed, otherwise the notes whose
    /// outgoing resolution changed.
    pub fn remove_file(&mut self, path: &Path) -> Option<BTreeSet<PathBuf>> {
        let old = self.detach(path)?;
        let affected_keys: BTreeSet<String> = old.keys.into_iter().collect();
        let mut invalidated = self.refresh_keys(&affected_keys);
        invalidated.remove(path);
        Some(invalidated)
    }

    /// Unlink a note and its references from every map. Outcomes of references pointing at it
    /// are left for the caller to refresh.
    fn detach(&mut self, path: &Path) -> Option<IndexedFile> {
        let old = self.files.remove(path)?;
        for key in &old.keys {
            if let Some(paths) = self.by_key.get_mut(key) {
                paths.remove(path);
                if paths.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        for r in &old.references {
            let ref_key = RefKey {
                source: path.to_path_buf(),
                ordinal: r.ordinal,
            };
            if let Some(refs) = self.refs_by_target_key.get_mut(&r.target_key) {
                refs.remove(&ref_key);
                if refs.is_empty() {
                    self.refs_by_target_key.remove(&r.target_key);
                }
            }
            if let Some(outcome) = self.outcomes.remove(&ref_key) {
                self.unlink_inbound(&ref_key, &outcome);
            }
        }
        Some(old)
    }

    fn refresh_keys(&mut self, keys: &BTreeSet<String>) -> BTreeSet<PathBuf> {
        let dependents: BTreeSet<RefKey> = keys
            .iter()
            .filter_map(|key| self.refs_by_target_key.get(key))
            .flatten()
            .cloned()
            .collect();
        dependents
            .into_iter()
            .filter(|ref_key| self.refresh(ref_key))
            .map(|ref_key| ref_key.source)
            .collect()
    }

    /// Recompute the outcome of one reference. Returns whether it changed.
    fn refresh(&mut self, ref_key: &RefKey) -> bool {
        let Some(reference) = self
            .files
            .get(&ref_key.source)
            .and_then(|f| f.reference(ref_key.ordinal))
        else {
            return false;
        };
        let outcome = self.resolve_reference(reference);
        if self.outcomes.get(ref_key) == Some(&outcome) {
            return false;
        }
        if let Some(previous) = self.outcomes.remove(ref_key) {
            self.unlink_inbound(ref_key, &previous);
        }
        for target in outcome.targets() {
            self.inbound
                .entry(target.clone())
                .or_default()
                .insert(ref_key.clone());
        }
        self.outcomes.insert(ref_key.clone(), outcome);
        true
    }

    fn unlink_inbound(&mut self, ref_key: &RefKey, outcome: &Resolution) {
        for target in outcome.targets() {
            if let Some(refs) = self.inbound.get_mut(target) {
                refs.remove(ref_key);
                if refs.is_empty() {
                    self.inbound.remove(target);
                }
            }
        }
    }

    /// Resolve a stored reference against the current notes.
    pub fn resolve_reference(&self, reference: &StoredReference) -> Resolution {
        self.resolve(
            &reference.target,
            &reference.target_key,
            reference.label.as_deref(),
        )
    }

    pub fn resolve(&self, target: &str, target_key: &str, label: Option<&str>) -> Resolution {
        let candidates: Vec<&PathBuf> = self
            .by_key
            .get(target_key)
            .map(|paths| paths.iter().collect())
            .unwrap_or_default();
        match candidates.as_slice() {
            [] => match extension_of(target.trim()) {
                Some(ext) if !self.is_managed_extension(ext) => Resolution::External {
                    target: target.trim().to_string(),
                },
                _ => Resolution::Unresolved,
            },
            [path] => {
                let label = label.map(|name| {
                    match self.files.get(*path).and_then(|f| f.find_label(name)) {
                        Some(decl) => LabelResolution::Found {
                            position: decl.position,
                            is_implicit: decl.is_implicit,
                        },
                        None => LabelResolution::Missing,
                    }
                });
                Resolution::File {
                    path: (*path).clone(),
                    label,
                }
            }
            _ => Resolution::Ambiguous {
                candidates: candidates.into_iter().cloned().collect(),
            },
        }
    }

    fn is_managed_extension(&self, ext: &str) -> bool {
        self.managed_extensions
            .iter()
            .any(|managed| managed.eq_ignore_ascii_case(ext))
    }

    pub fn outcome(&self, ref_key: &RefKey) -> Option<&Resolution> {
        self.outcomes.get(ref_key)
    }

    /// The references owned by `path` with their outcomes, in document order. `None` when the
    /// note is not indexed.
    pub fn forward_links(&self, path: &Path) -> Option<Vec<(&StoredReference, Resolution)>> {
        let file = self.files.get(path)?;
        Some(
            file.references
                .iter()
                .map(|r| {
                    let ref_key = RefKey {
                        source: path.to_path_buf(),
                        ordinal: r.ordinal,
                    };
                    let outcome = self
                        .outcomes
                        .get(&ref_key)
                        .cloned()
                        .unwrap_or_else(|| self.resolve_reference(r));
                    (r, outcome)
                })
                .collect(),
        )
    }

    /// References across the index whose outcome points at `path`, ordered by source path and
    /// ordinal. `None` when the note is not indexed.
    pub fn backlinks(&self, path: &Path) -> Option<Vec<(RefKey, &StoredReference, &Resolution)>> {
        if !self.files.contains_key(path) {
            return None;
        }
        let Some(refs) = self.inbound.get(path) else {
            return Some(Vec::new());
        };
        Some(
            refs.iter()
                .filter_map(|ref_key| {
                    let reference = self.files.get(&ref_key.source)?.reference(ref_key.ordinal)?;
                    let outcome = self.outcomes.get(ref_key)?;
                    Some((ref_key.clone(), reference, outcome))
                })
                .collect(),
        )
    }

    /// Notes answering to a name, as a user would type it.
    pub fn notes_named(&self, name: &str) -> Vec<&PathBuf> {
        self.by_key
            .get(&match_key(name))
            .map(|paths| paths.iter().collect())
            .unwrap_or_default()
    }
}
