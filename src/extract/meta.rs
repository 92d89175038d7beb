//! Metadata collaborators.
//!
//! Metadata is whatever a note declares through Typst `metadata` elements. Two sources produce
//! the same [MetadataMap]:
//!
//! - [InlineMeta] reads `#meta(key: value, ...)` and `#metadata((key: value, ...))` blocks
//!   directly out of the note text. It understands string literals, bare tokens, arrays and
//!   dictionaries, which covers the well-known `title`, `tags` and `alias` keys.
//! - [TypstQuery] hands the content to `typst query` and converts the JSON it prints. It sees
//!   everything the compiler sees, at the cost of a process per parse.
//!
//! Both fail with [IndexError::Extraction] on malformed content. Callers keep the previously
//! extracted metadata in that case.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    config::{ExtractorConfig, IndexConfig},
    error::IndexError,
};

/// A metadata value: a string, an ordered list of strings, or a nested mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Text(String),
    List(Vec<String>),
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetaValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The individual strings a completion or key lookup can match against. Maps are opaque.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            MetaValue::Text(text) => vec![text.as_str()],
            MetaValue::List(items) => items.iter().map(String::as_str).collect(),
            MetaValue::Map(_) => Vec::new(),
        }
    }

    /// Convert a JSON value as printed by `typst query`. `null` has no representation.
    pub fn from_json(value: &Value) -> Option<MetaValue> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(MetaValue::Text(s.clone())),
            Value::Bool(_) | Value::Number(_) => Some(MetaValue::Text(value.to_string())),
            Value::Array(items) => Some(MetaValue::List(
                items
                    .iter()
                    .filter(|item| !item.is_null())
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            Value::Object(entries) => Some(MetaValue::Map(
                entries
                    .iter()
                    .filter_map(|(k, v)| MetaValue::from_json(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        }
    }

    fn into_list_item(self) -> String {
        match self {
            MetaValue::Text(text) => text,
            other => serde_json::to_string(&other).unwrap_or_default(),
        }
    }
}

pub type MetadataMap = BTreeMap<String, MetaValue>;

/// The derived title declared by a note, if any.
pub fn title_of(metadata: &MetadataMap) -> Option<&str> {
    metadata
        .get("title")
        .and_then(MetaValue::as_text)
        .map(str::trim)
        .filter(|title| !title.is_empty())
}

/// External collaborator that turns note content into key/value metadata.
pub trait MetadataSource: Send + Sync {
    fn extract(
        &self,
        path: &Path,
        content: &str,
    ) -> impl Future<Output = Result<MetadataMap, IndexError>> + Send;
}

/// Shells out to `typst query`, feeding the note through stdin so the unsaved content is what
/// gets compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypstQuery {
    binary: String,
    root: PathBuf,
}

impl TypstQuery {
    pub fn new(binary: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        TypstQuery {
            binary: binary.into(),
            root: root.into(),
        }
    }
}

impl MetadataSource for TypstQuery {
    #[tracing::instrument(skip(self, content))]
    async fn extract(&self, path: &Path, content: &str) -> Result<MetadataMap, IndexError> {
        let mut child = Command::new(&self.binary)
            .arg("query")
            .arg("--root")
            .arg(&self.root)
            .arg("-")
            .arg("metadata")
            .args(["--field", "value", "--one"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => IndexError::Extraction("typst command not found".into()),
                _ => IndexError::Extraction(format!("failed to execute typst query: {e}")),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content.as_bytes())
                .await
                .map_err(|e| IndexError::Extraction(format!("failed to write to typst: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| IndexError::Extraction(format!("typst query failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // `--one` fails when the note declares no metadata at all
            if stderr.contains("found 0") {
                return Ok(MetadataMap::new());
            }
            return Err(IndexError::Extraction(stderr.trim().to_string()));
        }

        let value: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            IndexError::Extraction(format!("typst query printed invalid JSON: {e}"))
        })?;
        match MetaValue::from_json(&value) {
            Some(MetaValue::Map(map)) => Ok(map),
            _ => {
                tracing::debug!("metadata value of {path:?} is not a dictionary, ignoring");
                Ok(MetadataMap::new())
            }
        }
    }
}

/// Reads `#meta(...)` and `#metadata((...))` blocks without invoking the compiler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InlineMeta;

impl InlineMeta {
    /// Synchronous core of the inline extractor.
    pub fn parse(content: &str) -> Result<MetadataMap, IndexError> {
        let mut metadata = MetadataMap::new();
        let mut offset = 0;
        let mut line_no = 1;
        let mut in_fence = false;
        while offset < content.len() {
            let line_end = content[offset..]
                .find('\n')
                .map(|i| offset + i + 1)
                .unwrap_or(content.len());
            let line = &content[offset..line_end];
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") {
                in_fence = !in_fence;
            } else if !in_fence {
                let indent = line.len() - trimmed.len();
                let block = if trimmed.starts_with("#meta(") {
                    Some((BlockKind::Meta, "#meta".len()))
                } else if trimmed.starts_with("#metadata(") {
                    Some((BlockKind::Metadata, "#metadata".len()))
                } else {
                    None
                };
                if let Some((kind, name_len)) = block {
                    let start = offset + indent + name_len;
                    let mut parser = ArgParser::new(content, start, line_no);
                    let args = parser.parse_group()?;
                    kind.merge_into(args, line_no, &mut metadata)?;
                    line_no = parser.line;
                    // Resume at the line following the block
                    offset = content[parser.pos..]
                        .find('\n')
                        .map(|i| parser.pos + i + 1)
                        .unwrap_or(content.len());
                    line_no += 1;
                    continue;
                }
            }
            offset = line_end;
            line_no += 1;
        }
        Ok(metadata)
    }
}

impl MetadataSource for InlineMeta {
    async fn extract(&self, _path: &Path, content: &str) -> Result<MetadataMap, IndexError> {
        InlineMeta::parse(content)
    }
}

/// The collaborator selected by [IndexConfig::extractor].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfiguredMetadata {
    Inline(InlineMeta),
    Typst(TypstQuery),
}

impl ConfiguredMetadata {
    pub fn from_config(config: &IndexConfig, root: &Path) -> Self {
        match &config.extractor {
            ExtractorConfig::Inline => ConfiguredMetadata::Inline(InlineMeta),
            ExtractorConfig::Typst { binary } => {
                ConfiguredMetadata::Typst(TypstQuery::new(binary.clone(), root))
            }
        }
    }
}

impl MetadataSource for ConfiguredMetadata {
    async fn extract(&self, path: &Path, content: &str) -> Result<MetadataMap, IndexError> {
        match self {
            ConfiguredMetadata::Inline(inline) => inline.extract(path, content).await,
            ConfiguredMetadata::Typst(typst) => typst.extract(path, content).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BlockKind {
    Meta,
    Metadata,
}

impl BlockKind {
    fn merge_into(
        self,
        args: Group,
        line_no: usize,
        metadata: &mut MetadataMap,
    ) -> Result<(), IndexError> {
        match (self, args) {
            (BlockKind::Meta, Group::Named(entries)) => {
                metadata.extend(entries);
                Ok(())
            }
            (BlockKind::Meta, Group::Positional { items, .. }) if items.is_empty() => Ok(()),
            (BlockKind::Meta, Group::Positional { .. }) => Err(IndexError::Extraction(format!(
                "line {line_no}: #meta takes only named arguments"
            ))),
            (BlockKind::Metadata, Group::Positional { items, .. }) if items.len() == 1 => {
                match items.into_iter().next() {
                    Some(MetaValue::Map(entries)) => metadata.extend(entries),
                    _ => tracing::debug!("line {line_no}: #metadata value is not a dictionary"),
                }
                Ok(())
            }
            (BlockKind::Metadata, _) => Err(IndexError::Extraction(format!(
                "line {line_no}: #metadata takes exactly one positional argument"
            ))),
        }
    }
}

/// Contents of one parenthesized group.
#[derive(Debug)]
enum Group {
    Named(Vec<(String, MetaValue)>),
    Positional {
        items: Vec<MetaValue>,
        trailing_comma: bool,
    },
}

impl Group {
    fn into_value(self) -> MetaValue {
        match self {
            Group::Named(entries) => MetaValue::Map(entries.into_iter().collect()),
            // `("a")` is just the string, `("a",)` is an array
            Group::Positional {
                mut items,
                trailing_comma: false,
            } if items.len() == 1 => items.remove(0),
            Group::Positional { items, .. } => {
                MetaValue::List(items.into_iter().map(MetaValue::into_list_item).collect())
            }
        }
    }
}

struct ArgParser<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> ArgParser<'a> {
    fn new(src: &'a str, pos: usize, line: usize) -> Self {
        ArgParser { src, pos, line }
    }

    fn error(&self, message: &str) -> IndexError {
        IndexError::Extraction(format!("line {}: {message}", self.line))
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.src[self.pos..].starts_with("//") => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), IndexError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(&format!("expected `{expected}`, found `{c}`"))),
            None => Err(self.error(&format!("expected `{expected}`, found end of file"))),
        }
    }

    /// Parse `( ... )` starting at the opening parenthesis.
    fn parse_group(&mut self) -> Result<Group, IndexError> {
        self.expect('(')?;
        self.skip_trivia();
        if self.peek() == Some(':') {
            self.bump();
            self.skip_trivia();
            self.expect(')')?;
            return Ok(Group::Named(Vec::new()));
        }

        let mut named = Vec::new();
        let mut positional = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_trivia();
            match self.peek() {
                Some(')') => {
                    self.bump();
                    break;
                }
                None => return Err(self.error("unbalanced parentheses")),
                _ => {}
            }

            match self.try_parse_key()? {
                Some(key) => {
                    self.skip_trivia();
                    if let Some(value) = self.parse_value()? {
                        named.push((key, value));
                    }
                }
                None => {
                    if let Some(value) = self.parse_value()? {
                        positional.push(value);
                    }
                }
            }

            self.skip_trivia();
            match self.bump() {
                Some(',') => trailing_comma = true,
                Some(')') => {
                    trailing_comma = false;
                    break;
                }
                Some(c) => return Err(self.error(&format!("unexpected `{c}` in arguments"))),
                None => return Err(self.error("unbalanced parentheses")),
            }
        }

        match (named.is_empty(), positional.is_empty()) {
            (false, false) => Err(self.error("cannot mix named and positional arguments")),
            (false, true) => Ok(Group::Named(named)),
            _ => Ok(Group::Positional {
                items: positional,
                trailing_comma,
            }),
        }
    }

    /// Consume `key:` if present. Keys are identifiers or string literals.
    fn try_parse_key(&mut self) -> Result<Option<String>, IndexError> {
        let (start, line) = (self.pos, self.line);
        let key = match self.peek() {
            Some('"') => self.parse_string()?,
            Some(c) if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(c) = self.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' {
                        ident.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                ident
            }
            _ => return Ok(None),
        };
        self.skip_trivia();
        if self.peek() == Some(':') {
            self.bump();
            Ok(Some(key))
        } else {
            self.pos = start;
            self.line = line;
            Ok(None)
        }
    }

    /// Parse one value. `none` yields no value.
    fn parse_value(&mut self) -> Result<Option<MetaValue>, IndexError> {
        match self.peek() {
            Some('"') => Ok(Some(MetaValue::Text(self.parse_string()?))),
            Some('(') => Ok(Some(self.parse_group()?.into_value())),
            Some(_) => {
                // Bare expressions such as `2024`, `true` or `datetime(year: 2024)` are kept
                // verbatim
                let start = self.pos;
                let mut depth = 0usize;
                while let Some(c) = self.peek() {
                    match c {
                        '(' => depth += 1,
                        ')' if depth == 0 => break,
                        ')' => depth -= 1,
                        ',' | '\n' if depth == 0 => break,
                        '"' => {
                            self.parse_string()?;
                            continue;
                        }
                        _ => {}
                    }
                    self.bump();
                }
                let token = self.src[start..self.pos].trim();
                match token {
                    "" => Err(self.error("expected a value")),
                    "none" => Ok(None),
                    _ => Ok(Some(MetaValue::Text(token.to_string()))),
                }
            }
            None => Err(self.error("unbalanced parentheses")),
        }
    }

    fn parse_string(&mut self) -> Result<String, IndexError> {
        let start_line = self.line;
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('u') => out.push(self.parse_unicode_escape()?),
                    Some(c) => out.push(c),
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(IndexError::Extraction(format!(
            "line {start_line}: unterminated string"
        )))
    }

    /// `\u{hex}`, after the `u`.
    fn parse_unicode_escape(&mut self) -> Result<char, IndexError> {
        self.expect('{')?;
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
            self.bump();
        }
        let hex = &self.src[start..self.pos];
        self.expect('}')?;
        u32::from_str_radix(hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error(&format!("invalid unicode escape `{hex}`")))
    }
}
