//! The extractor turns raw note content into the facts the index stores.
//!
//! Labels and references are found by [scan::scan]; metadata comes from a [MetadataSource].
//! Extraction never touches the store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::IndexError;

pub mod meta;
pub mod scan;

pub use meta::{
    title_of, ConfiguredMetadata, InlineMeta, MetaValue, MetadataMap, MetadataSource, TypstQuery,
};
pub use scan::{scan, ScanOutput};

/// 1-based line and character column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Position { line, column }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDecl {
    pub name: String,
    pub position: Position,
    /// Derived from a heading rather than written as `<name>`
    pub is_implicit: bool,
}

/// One `[[target:label|alias]]` occurrence, as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefOccurrence {
    pub target: String,
    pub label: Option<String>,
    pub alias: Option<String>,
    pub position: Position,
    /// Characters from the opening `[[` through the closing `]]`, padding included
    pub width: u32,
}

/// Malformed reference syntax found while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanIssue {
    pub message: String,
    pub position: Position,
}

/// Everything extracted from one version of a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub metadata: MetadataMap,
    pub labels: Vec<LabelDecl>,
    pub references: Vec<RefOccurrence>,
    pub issues: Vec<ScanIssue>,
    /// Hex SHA-256 of the content this was extracted from
    pub content_hash: String,
}

impl Extraction {
    pub fn title(&self) -> Option<&str> {
        title_of(&self.metadata)
    }
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct Extractor<M> {
    source: M,
}

impl<M: MetadataSource> Extractor<M> {
    pub fn new(source: M) -> Self {
        Extractor { source }
    }

    pub fn source(&self) -> &M {
        &self.source
    }

    /// Extract all facts from `content`. Fails only when the metadata collaborator rejects the
    /// content; malformed references are reported in [Extraction::issues] instead.
    #[tracing::instrument(skip(self, content))]
    pub async fn extract(&self, path: &Path, content: &str) -> Result<Extraction, IndexError> {
        let metadata = self.source.extract(path, content).await?;
        let ScanOutput {
            labels,
            references,
            issues,
        } = scan(content);
        tracing::debug!(
            "extracted {} metadata keys, {} labels, {} references ({} issues)",
            metadata.len(),
            labels.len(),
            references.len(),
            issues.len()
        );
        Ok(Extraction {
            metadata,
            labels,
            references,
            issues,
            content_hash: content_hash(content),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_extract_combines_metadata_and_scan() {
        let extractor = Extractor::new(InlineMeta);
        let content = "#meta(title: \"Alpha\")\n= Start <s>\nSee [[Beta]].\n";
        let extraction = extractor.extract(Path::new("/w/a.typ"), content).await.unwrap();
        assert_eq!(extraction.title(), Some("Alpha"));
        assert_eq!(extraction.labels.len(), 2);
        assert_eq!(extraction.references.len(), 1);
        assert_eq!(extraction.references[0].position, Position::new(3, 5));
        assert_eq!(extraction.content_hash, content_hash(content));
        assert_eq!(extraction.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_metadata_failure_fails_extraction() {
        let extractor = Extractor::new(InlineMeta);
        let result = extractor
            .extract(Path::new("/w/a.typ"), "#meta(title: \"broken\n[[Beta]]")
            .await;
        assert!(matches!(result, Err(IndexError::Extraction(_))));
    }
}
