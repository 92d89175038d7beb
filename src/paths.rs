//! Path and name normalization shared by the extractor, store, and resolver.
//!
//! Three kinds of strings are normalized here:
//!
//! - **Workspace paths**: files are identified by their absolute path on disk, and persisted as a
//!   workspace-relative string with `/` separators so the cache is portable across platforms.
//! - **Match keys**: the case-folded, Unicode-normalized form used to compare a reference target
//!   against the titles and file names of notes.
//! - **Label names**: the slug derived from a heading's text.

use std::{
    borrow::Cow,
    path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR},
};
use unicode_normalization::UnicodeNormalization;

use crate::error::IndexError;

/// Utility function to replace separators and convert to unicode (via to_string_lossy) on os path.
pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    os_path_ref
        .as_ref()
        .components()
        .map(|c| match c {
            Component::RootDir => Cow::from("".to_string()),
            _ => c.as_os_str().to_string_lossy(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn string_to_os_path(path_string: &str) -> PathBuf {
    PathBuf::from(path_string.replace('/', MAIN_SEPARATOR_STR))
}

/// Resolve `.` and `..` components of a `/`-separated path without touching the filesystem.
///
/// Leading `..` components that would escape the root are preserved.
pub fn normalize_lexical(path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if matches!(components.last(), Some(last) if *last != "..") {
                    components.pop();
                } else {
                    components.push("..");
                }
            }
            _ => components.push(part),
        }
    }
    components.join("/")
}

/// Turn a path reported by a watcher or the caller into the absolute form used as a file's
/// identity. Deleted files can no longer be canonicalized, so the parent directory is
/// canonicalized when it still exists and the path is normalized lexically otherwise.
pub fn normalize_file_path(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    if let Ok(canonical) = joined.canonicalize() {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (joined.parent(), joined.file_name()) {
        if let Ok(parent) = parent.canonicalize() {
            return parent.join(name);
        }
    }
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Whether any component of `path` below `root` starts with `.`. The root's own components are
/// not considered, so a workspace may itself live in a hidden directory. Paths outside `root`
/// are never hidden; they are rejected as outside the workspace instead.
pub fn is_hidden_path(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root).is_ok_and(|relative| {
        relative
            .components()
            .any(|c| matches!(c, Component::Normal(name) if name.to_string_lossy().starts_with('.')))
    })
}

/// Workspace-relative, `/`-separated form of an absolute file path.
pub fn relative_path_string(root: &Path, path: &Path) -> Result<String, IndexError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| IndexError::OutsideWorkspace(path.display().to_string()))?;
    Ok(os_path_to_string(relative))
}

/// The form used to compare reference targets with note names: NFC, trimmed, lowercase, `\`
/// treated as `/`.
pub fn match_key(name: &str) -> String {
    name.trim()
        .nfc()
        .collect::<String>()
        .to_lowercase()
        .replace('\\', "/")
}

/// File extension of a reference target or file name, if any. Dot files have no extension.
pub fn extension_of(name: &str) -> Option<&str> {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    match file_name.rfind('.') {
        Some(0) | None => None,
        Some(idx) if idx + 1 < file_name.len() => Some(&file_name[idx + 1..]),
        Some(_) => None,
    }
}

fn strip_extension(rel_path: &str) -> &str {
    match extension_of(rel_path) {
        Some(ext) => &rel_path[..rel_path.len() - ext.len() - 1],
        None => rel_path,
    }
}

/// File stem of a workspace-relative path.
pub fn stem_of(rel_path: &str) -> &str {
    let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    strip_extension(file_name)
}

/// All keys under which a note can be referenced: its derived title, stem, file name, relative
/// path, and relative path without extension. Deduplicated, in that order.
pub fn file_keys(rel_path: &str, title: Option<&str>) -> Vec<String> {
    let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let stem = stem_of(rel_path);
    let candidates = [
        title.unwrap_or(stem),
        stem,
        file_name,
        rel_path,
        strip_extension(rel_path),
    ];
    let mut keys: Vec<String> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let key = match_key(candidate);
        if !key.is_empty() && !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// The key a reference target is looked up under. Targets containing a `/` are treated as
/// paths relative to the referencing note (or to the workspace root when they start with `/`).
pub fn reference_key(target: &str, source_rel_path: &str) -> String {
    let target = target.trim();
    if !target.contains('/') && !target.contains('\\') {
        return match_key(target);
    }
    let target = target.replace('\\', "/");
    let joined = if let Some(rooted) = target.strip_prefix('/') {
        rooted.to_string()
    } else {
        match source_rel_path.rfind('/') {
            Some(idx) => format!("{}/{}", &source_rel_path[..idx], target),
            None => target,
        }
    };
    match_key(&normalize_lexical(&joined))
}

/// Derive the implicit label name of a heading: lowercase, runs of characters other than
/// alphanumerics, `-` and `_` collapse to one `-`, no leading or trailing `-`.
pub fn to_label_name(heading: &str) -> String {
    let lowered = heading.trim().nfc().collect::<String>().to_lowercase();
    let mut name = String::with_capacity(lowered.len());
    let mut pending_dash = false;
    for c in lowered.chars() {
        if c.is_alphanumeric() || c == '_' {
            if pending_dash && !name.is_empty() {
                name.push('-');
            }
            pending_dash = false;
            name.push(c);
        } else {
            pending_dash = true;
        }
    }
    name
}
