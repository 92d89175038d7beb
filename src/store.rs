//! The persisted index: four SQLite tables owned by this module, plus the in-memory
//! [ResolutionIndex] derived from them.
//!
//! Every mutation goes through [IndexStore::replace_file], [IndexStore::record_parse_failure] or
//! [IndexStore::remove_file]. Each takes the snapshot lock for writing, runs one SQL transaction,
//! and applies the matching delta to the resolution index before releasing the lock. Readers go
//! through [IndexStore::read], which holds the lock for reading, so a reader never sees the
//! tables and the resolution index disagree, and never sees half of a write.

use futures_core::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    query_builder::Separated,
    sqlite::{
        Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    },
    ConnectOptions, Pool, QueryBuilder,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    ops::Deref,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::{
    config::IndexConfig,
    error::IndexError,
    extract::{Extraction, LabelDecl, MetaValue, MetadataMap, Position, ScanIssue},
    paths::{relative_path_string, string_to_os_path},
    resolver::{IndexedFile, ResolutionIndex, StoredReference},
};

/// <https://www.sqlite.org/limits.html#max_variable_number>
pub const SQLITE_LIMIT_VARIABLE_NUMBER: usize = 32766;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Filesystem timestamps of a note, in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTimes {
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
}

impl FileTimes {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        FileTimes {
            created_at: metadata.created().ok().and_then(system_time_millis),
            modified_at: metadata.modified().ok().and_then(system_time_millis),
        }
    }

    pub fn of(path: &Path) -> Self {
        fs::metadata(path)
            .map(|m| FileTimes::from_metadata(&m))
            .unwrap_or_default()
    }
}

pub fn system_time_millis(time: SystemTime) -> Option<i64> {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
}

fn now_millis() -> Option<i64> {
    system_time_millis(SystemTime::now())
}

/// The `files` row of a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub rel_path: String,
    pub created_at: Option<i64>,
    pub modified_at: Option<i64>,
    pub last_parsed: Option<i64>,
    pub content_hash: Option<String>,
    /// Set while the latest content fails to parse
    pub parse_error: Option<String>,
    pub scan_issues: Vec<ScanIssue>,
}

type FileRow = (
    String,
    Option<i64>,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<String>,
    String,
);

/// What the initial scan needs to decide whether a note changed since it was last indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedState {
    pub modified_at: Option<i64>,
    pub has_parse_error: bool,
}

pub struct IndexStore {
    pool: Pool<Sqlite>,
    root: PathBuf,
    db_path: PathBuf,
    snapshot: RwLock<ResolutionIndex>,
    rebuilt: bool,
}

impl IndexStore {
    /// Open (or create) the cache for the workspace at `root`, which must be canonical.
    ///
    /// A cache that fails its integrity check or its migrations is deleted and recreated empty;
    /// [IndexStore::rebuilt] then reports `true` so the caller can re-scan everything.
    #[tracing::instrument(skip(config))]
    pub async fn open(root: &Path, config: &IndexConfig) -> Result<IndexStore, IndexError> {
        let db_path = config.db_path(root);
        let (pool, rebuilt) = match db_init(&db_path).await {
            Ok(pool) => (pool, false),
            Err(e) => {
                tracing::warn!("Index cache at {db_path:?} is unusable ({e}), rebuilding it");
                remove_db_files(&db_path)?;
                (db_init(&db_path).await?, true)
            }
        };
        let store = IndexStore {
            pool,
            root: root.to_path_buf(),
            db_path,
            snapshot: RwLock::new(ResolutionIndex::new(config.managed_extensions.clone())),
            rebuilt,
        };
        store.load_snapshot().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Whether the cache had to be recreated from scratch when it was opened.
    pub fn rebuilt(&self) -> bool {
        self.rebuilt
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn abs_path(&self, rel_path: &str) -> PathBuf {
        self.root.join(string_to_os_path(rel_path))
    }

    /// Rebuild the resolution index from the tables.
    async fn load_snapshot(&self) -> Result<(), IndexError> {
        let mut snapshot = self.snapshot.write().await;
        let files: Vec<(i64, String)> = sqlx::query_as("SELECT id, path FROM files")
            .fetch_all(&self.pool)
            .await?;
        let titles: BTreeMap<i64, String> = sqlx::query_as::<_, (i64, String)>(
            "SELECT file_id, value FROM metadata \
             WHERE key = 'title' AND kind = 'text' AND value IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .filter(|(_, title)| !title.trim().is_empty())
        .map(|(id, title)| (id, title.trim().to_string()))
        .collect();

        let mut labels: BTreeMap<i64, Vec<LabelDecl>> = BTreeMap::new();
        let label_rows: Vec<(i64, String, i64, i64, bool)> = sqlx::query_as(
            "SELECT file_id, name, line, col, is_implicit FROM labels ORDER BY file_id, rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        for (file_id, name, line, col, is_implicit) in label_rows {
            labels.entry(file_id).or_default().push(LabelDecl {
                name,
                position: position(line, col),
                is_implicit,
            });
        }

        let mut references: BTreeMap<i64, Vec<StoredReference>> = BTreeMap::new();
        let ref_rows: Vec<ReferenceRow> = sqlx::query_as(
            "SELECT file_id, ordinal, target, target_key, label, alias, line, col, width \
             FROM cross_references ORDER BY file_id, ordinal",
        )
        .fetch_all(&self.pool)
        .await?;
        for (file_id, ordinal, target, target_key, label, alias, line, col, width) in ref_rows {
            references.entry(file_id).or_default().push(StoredReference {
                ordinal: u32::try_from(ordinal).unwrap_or_default(),
                target,
                target_key,
                label,
                alias,
                position: position(line, col),
                width: u32::try_from(width).unwrap_or_default(),
            });
        }

        for (id, rel_path) in files {
            let path = self.abs_path(&rel_path);
            let file = IndexedFile::new(
                rel_path,
                titles.get(&id).cloned(),
                labels.remove(&id).unwrap_or_default(),
                references.remove(&id).unwrap_or_default(),
            );
            snapshot.replace_file(&path, file);
        }
        tracing::info!(
            "Index cache initialized from {:?}: {} files",
            self.db_path,
            snapshot.len()
        );
        Ok(())
    }

    /// Hold the committed snapshot for reading.
    pub async fn read(&self) -> StoreReader<'_> {
        StoreReader {
            index: self.snapshot.read().await,
            pool: &self.pool,
            root: &self.root,
        }
    }

    /// Atomically replace every row owned by `path` with the facts in `extraction`. References
    /// from other notes into `path` are kept. Returns the other notes whose outgoing resolution
    /// changed.
    #[tracing::instrument(skip(self, extraction))]
    pub async fn replace_file(
        &self,
        path: &Path,
        times: FileTimes,
        extraction: &Extraction,
    ) -> Result<BTreeSet<PathBuf>, IndexError> {
        let rel_path = relative_path_string(&self.root, path)?;
        let references: Vec<StoredReference> = extraction
            .references
            .iter()
            .enumerate()
            .map(|(i, occurrence)| {
                StoredReference::from_occurrence(i as u32, occurrence, &rel_path)
            })
            .collect();
        let scan_issues = serde_json::to_string(&extraction.issues)?;

        let mut snapshot = self.snapshot.write().await;
        let mut tx = self.pool.begin().await?;
        let file_id: i64 = sqlx::query_scalar(
            "INSERT INTO files \
                (path, created_at, modified_at, last_parsed, content_hash, parse_error, scan_issues) \
             VALUES (?, ?, ?, ?, ?, NULL, ?) \
             ON CONFLICT(path) DO UPDATE SET \
                created_at = COALESCE(files.created_at, excluded.created_at), \
                modified_at = excluded.modified_at, \
                last_parsed = excluded.last_parsed, \
                content_hash = excluded.content_hash, \
                parse_error = NULL, \
                scan_issues = excluded.scan_issues \
             RETURNING id",
        )
        .bind(&rel_path)
        .bind(times.created_at.or_else(now_millis))
        .bind(times.modified_at)
        .bind(now_millis())
        .bind(&extraction.content_hash)
        .bind(&scan_issues)
        .fetch_one(&mut *tx)
        .await?;

        for table in ["metadata", "labels", "cross_references"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE file_id = ?"))
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
        }

        insert_chunked(
            &mut *tx,
            "INSERT INTO metadata (file_id, key, ordinal, kind, value) ",
            metadata_rows(&extraction.metadata)?,
            5,
            |b, (key, ordinal, kind, value)| {
                b.push_bind(file_id)
                    .push_bind(key)
                    .push_bind(ordinal)
                    .push_bind(kind)
                    .push_bind(value);
            },
        )
        .await?;
        insert_chunked(
            &mut *tx,
            "INSERT INTO labels (file_id, name, line, col, is_implicit) ",
            extraction.labels.clone(),
            5,
            |b, label| {
                b.push_bind(file_id)
                    .push_bind(label.name)
                    .push_bind(i64::from(label.position.line))
                    .push_bind(i64::from(label.position.column))
                    .push_bind(label.is_implicit);
            },
        )
        .await?;
        insert_chunked(
            &mut *tx,
            "INSERT INTO cross_references \
                (file_id, ordinal, target, target_key, label, alias, line, col, width) ",
            references.clone(),
            9,
            |b, r| {
                b.push_bind(file_id)
                    .push_bind(i64::from(r.ordinal))
                    .push_bind(r.target)
                    .push_bind(r.target_key)
                    .push_bind(r.label)
                    .push_bind(r.alias)
                    .push_bind(i64::from(r.position.line))
                    .push_bind(i64::from(r.position.column))
                    .push_bind(i64::from(r.width));
            },
        )
        .await?;
        tx.commit().await?;

        let file = IndexedFile::new(
            rel_path,
            extraction.title().map(str::to_string),
            extraction.labels.clone(),
            references,
        );
        let invalidated = snapshot.replace_file(path, file);
        tracing::debug!(
            "Committed {:?}: {} references, {} notes invalidated",
            path,
            extraction.references.len(),
            invalidated.len()
        );
        Ok(invalidated)
    }

    /// Record that the latest content of `path` failed to parse. Existing rows are kept. A note
    /// seen for the first time gets a bare `files` row so diagnostics can report it.
    #[tracing::instrument(skip(self, message))]
    pub async fn record_parse_failure(
        &self,
        path: &Path,
        times: FileTimes,
        message: &str,
    ) -> Result<BTreeSet<PathBuf>, IndexError> {
        let rel_path = relative_path_string(&self.root, path)?;
        let mut snapshot = self.snapshot.write().await;
        sqlx::query(
            "INSERT INTO files (path, created_at, modified_at, parse_error) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(path) DO UPDATE SET parse_error = excluded.parse_error",
        )
        .bind(&rel_path)
        .bind(times.created_at.or_else(now_millis))
        .bind(times.modified_at)
        .bind(message)
        .execute(&self.pool)
        .await?;

        if snapshot.contains(path) {
            return Ok(BTreeSet::new());
        }
        Ok(snapshot.replace_file(
            path,
            IndexedFile::new(rel_path, None, Vec::new(), Vec::new()),
        ))
    }

    /// Remove `path` and everything it owns. `None` when it was not indexed; otherwise the
    /// notes whose outgoing resolution changed.
    #[tracing::instrument(skip(self))]
    pub async fn remove_file(&self, path: &Path) -> Result<Option<BTreeSet<PathBuf>>, IndexError> {
        let rel_path = relative_path_string(&self.root, path)?;
        let mut snapshot = self.snapshot.write().await;
        let result = sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(&rel_path)
            .execute(&self.pool)
            .await?;
        let invalidated = snapshot.remove_file(path);
        if result.rows_affected() == 0 && invalidated.is_some() {
            tracing::warn!("{path:?} was indexed in memory but had no files row");
        }
        Ok(invalidated)
    }

    /// Cached modification state of every note, for the initial scan.
    pub async fn cached_states(&self) -> Result<BTreeMap<PathBuf, CachedState>, IndexError> {
        let rows: Vec<(String, Option<i64>, bool)> =
            sqlx::query_as("SELECT path, modified_at, parse_error IS NOT NULL FROM files")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(rel_path, modified_at, has_parse_error)| {
                (
                    self.abs_path(&rel_path),
                    CachedState {
                        modified_at,
                        has_parse_error,
                    },
                )
            })
            .collect())
    }
}

/// A consistent read view: the resolution index plus the tables it was derived from.
pub struct StoreReader<'a> {
    index: RwLockReadGuard<'a, ResolutionIndex>,
    pool: &'a Pool<Sqlite>,
    root: &'a Path,
}

impl Deref for StoreReader<'_> {
    type Target = ResolutionIndex;

    fn deref(&self) -> &Self::Target {
        &self.index
    }
}

impl StoreReader<'_> {
    pub fn root(&self) -> &Path {
        self.root
    }

    fn abs_path(&self, rel_path: &str) -> PathBuf {
        self.root.join(string_to_os_path(rel_path))
    }

    pub async fn file_record(&self, path: &Path) -> Result<Option<FileRecord>, IndexError> {
        let rel_path = relative_path_string(self.root, path)?;
        let row: Option<FileRow> = sqlx::query_as(
            "SELECT path, created_at, modified_at, last_parsed, content_hash, parse_error, \
             scan_issues FROM files WHERE path = ?",
        )
        .bind(&rel_path)
        .fetch_optional(self.pool)
        .await?;
        row.map(|row| self.file_record_from_row(row)).transpose()
    }

    pub async fn file_records(&self) -> Result<Vec<FileRecord>, IndexError> {
        let rows: Vec<FileRow> = sqlx::query_as(
            "SELECT path, created_at, modified_at, last_parsed, content_hash, parse_error, \
             scan_issues FROM files ORDER BY path",
        )
        .fetch_all(self.pool)
        .await?;
        rows.into_iter()
            .map(|row| self.file_record_from_row(row))
            .collect()
    }

    fn file_record_from_row(&self, row: FileRow) -> Result<FileRecord, IndexError> {
        let (rel_path, created_at, modified_at, last_parsed, content_hash, parse_error, issues) =
            row;
        Ok(FileRecord {
            path: self.abs_path(&rel_path),
            rel_path,
            created_at,
            modified_at,
            last_parsed,
            content_hash,
            parse_error,
            scan_issues: serde_json::from_str(&issues)?,
        })
    }

    /// Metadata of one note. `None` when the note is not indexed.
    pub async fn metadata_of(&self, path: &Path) -> Result<Option<MetadataMap>, IndexError> {
        if !self.index.contains(path) {
            return Ok(None);
        }
        let rel_path = relative_path_string(self.root, path)?;
        let rows: Vec<MetadataRow> = sqlx::query_as(
            "SELECT f.path, m.key, m.kind, m.value FROM metadata m \
             JOIN files f ON f.id = m.file_id WHERE f.path = ? \
             ORDER BY m.key, m.ordinal",
        )
        .bind(&rel_path)
        .fetch_all(self.pool)
        .await?;
        Ok(Some(
            assemble_metadata(rows)?
                .into_iter()
                .map(|(_, key, value)| (key, value))
                .collect(),
        ))
    }

    /// `(path, key, value)` for every note, ordered by path then key.
    pub async fn all_metadata(&self) -> Result<Vec<(PathBuf, String, MetaValue)>, IndexError> {
        let rows: Vec<MetadataRow> = sqlx::query_as(
            "SELECT f.path, m.key, m.kind, m.value FROM metadata m \
             JOIN files f ON f.id = m.file_id ORDER BY f.path, m.key, m.ordinal",
        )
        .fetch_all(self.pool)
        .await?;
        Ok(assemble_metadata(rows)?
            .into_iter()
            .map(|(rel_path, key, value)| (self.abs_path(&rel_path), key, value))
            .collect())
    }

    /// Every note declaring `key`, ordered by path.
    pub async fn metadata_by_key(
        &self,
        key: &str,
    ) -> Result<Vec<(PathBuf, MetaValue)>, IndexError> {
        let rows: Vec<MetadataRow> = sqlx::query_as(
            "SELECT f.path, m.key, m.kind, m.value FROM metadata m \
             JOIN files f ON f.id = m.file_id WHERE m.key = ? ORDER BY f.path, m.ordinal",
        )
        .bind(key)
        .fetch_all(self.pool)
        .await?;
        Ok(assemble_metadata(rows)?
            .into_iter()
            .map(|(rel_path, _, value)| (self.abs_path(&rel_path), value))
            .collect())
    }

    pub async fn metadata_keys(&self) -> Result<Vec<String>, IndexError> {
        Ok(
            sqlx::query_scalar("SELECT DISTINCT key FROM metadata ORDER BY key")
                .fetch_all(self.pool)
                .await?,
        )
    }

    /// Distinct text and list-item values declared under `key`.
    pub async fn metadata_values(&self, key: &str) -> Result<Vec<String>, IndexError> {
        Ok(sqlx::query_scalar(
            "SELECT DISTINCT value FROM metadata \
             WHERE key = ? AND kind != 'map' AND value IS NOT NULL ORDER BY value",
        )
        .bind(key)
        .fetch_all(self.pool)
        .await?)
    }
}

type ReferenceRow = (
    i64,
    i64,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    i64,
    i64,
);

/// `(relative path, key, kind, value)`
type MetadataRow = (String, String, String, Option<String>);

fn position(line: i64, col: i64) -> Position {
    Position::new(
        u32::try_from(line).unwrap_or_default(),
        u32::try_from(col).unwrap_or_default(),
    )
}

/// Flatten metadata into `(key, ordinal, kind, value)` rows. A list becomes one row per item
/// (an empty list one row with no value), a map one JSON row.
fn metadata_rows(
    metadata: &MetadataMap,
) -> Result<Vec<(String, i64, &'static str, Option<String>)>, IndexError> {
    let mut rows = Vec::new();
    for (key, value) in metadata {
        match value {
            MetaValue::Text(text) => rows.push((key.clone(), 0, "text", Some(text.clone()))),
            MetaValue::List(items) if items.is_empty() => {
                rows.push((key.clone(), 0, "list", None))
            }
            MetaValue::List(items) => {
                for (ordinal, item) in items.iter().enumerate() {
                    rows.push((key.clone(), ordinal as i64, "list", Some(item.clone())));
                }
            }
            MetaValue::Map(_) => {
                rows.push((key.clone(), 0, "map", Some(serde_json::to_string(value)?)))
            }
        }
    }
    Ok(rows)
}

/// Inverse of [metadata_rows]. Rows must be grouped by path and key, in ordinal order.
fn assemble_metadata(
    rows: Vec<MetadataRow>,
) -> Result<Vec<(String, String, MetaValue)>, IndexError> {
    let mut out: Vec<(String, String, MetaValue)> = Vec::new();
    for (path, key, kind, value) in rows {
        if let Some((last_path, last_key, MetaValue::List(items))) = out.last_mut() {
            if kind == "list" && *last_path == path && *last_key == key {
                items.extend(value);
                continue;
            }
        }
        let value = match kind.as_str() {
            "text" => MetaValue::Text(value.unwrap_or_default()),
            "list" => MetaValue::List(value.into_iter().collect()),
            "map" => serde_json::from_str(value.as_deref().unwrap_or("{}"))?,
            other => {
                return Err(IndexError::Store(format!(
                    "unknown metadata kind '{other}' for key '{key}'"
                )))
            }
        };
        out.push((path, key, value));
    }
    Ok(out)
}

/// Insert `rows` with as few statements as the bind limit allows.
async fn insert_chunked<R, F>(
    conn: &mut SqliteConnection,
    head: &'static str,
    rows: Vec<R>,
    binds_per_row: usize,
    mut bind: F,
) -> Result<(), IndexError>
where
    F: FnMut(&mut Separated<'_, 'static, Sqlite, &'static str>, R),
{
    let chunk_size = (SQLITE_LIMIT_VARIABLE_NUMBER / binds_per_row).max(1);
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let chunk: Vec<R> = rows.by_ref().take(chunk_size).collect();
        let mut qb = QueryBuilder::<Sqlite>::new(head);
        qb.push_values(chunk, |mut b, row| bind(&mut b, row));
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

fn remove_db_files(db_path: &Path) -> Result<(), IndexError> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        let file = PathBuf::from(name);
        match fs::remove_file(&file) {
            Ok(()) => tracing::debug!("Removed {file:?}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![
        Migration {
            version: 1,
            description: "create_index_tables",
            sql: "\
            CREATE TABLE files (\
                id INTEGER PRIMARY KEY, path TEXT NOT NULL UNIQUE, created_at INTEGER, \
                modified_at INTEGER, last_parsed INTEGER, content_hash TEXT, parse_error TEXT, \
                scan_issues TEXT NOT NULL DEFAULT '[]'); \
            CREATE TABLE metadata (\
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE, \
                key TEXT NOT NULL, ordinal INTEGER NOT NULL, kind TEXT NOT NULL, value TEXT); \
            CREATE TABLE cross_references (\
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE, \
                ordinal INTEGER NOT NULL, target TEXT NOT NULL, target_key TEXT NOT NULL, \
                label TEXT, alias TEXT, line INTEGER NOT NULL, col INTEGER NOT NULL); \
            CREATE TABLE labels (\
                file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE, \
                name TEXT NOT NULL, line INTEGER NOT NULL, col INTEGER NOT NULL, \
                is_implicit INTEGER NOT NULL);",
            kind: MigrationType::ReversibleUp,
        },
        Migration {
            version: 2,
            description: "create_lookup_indexes",
            sql: "\
            CREATE INDEX idx_metadata_file ON metadata(file_id); \
            CREATE INDEX idx_metadata_key ON metadata(key); \
            CREATE INDEX idx_references_file ON cross_references(file_id); \
            CREATE INDEX idx_references_target_key ON cross_references(target_key); \
            CREATE INDEX idx_labels_file ON labels(file_id); \
            CREATE INDEX idx_labels_name ON labels(name);",
            kind: MigrationType::ReversibleUp,
        },
        Migration {
            version: 3,
            description: "add_reference_width",
            sql: "ALTER TABLE cross_references ADD COLUMN width INTEGER NOT NULL DEFAULT 0;",
            kind: MigrationType::ReversibleUp,
        },
    ])
}

/// Connect, migrate and integrity-check the cache database.
pub async fn db_init(db_path: &Path) -> Result<Pool<Sqlite>, IndexError> {
    tracing::debug!("Initializing cache db from file: {:?}", db_path);
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
        .disable_statement_logging();

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    let checked: Result<(), IndexError> = async {
        let integrity: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&pool)
            .await?;
        if integrity != "ok" {
            return Err(IndexError::Store(format!(
                "integrity check failed: {integrity}"
            )));
        }
        let migrator = Migrator::new(migrations()).await?;
        migrator.run(&pool).await?;
        Ok(())
    }
    .await;
    if let Err(e) = checked {
        pool.close().await;
        return Err(e);
    }

    let file_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tCached file count:\t{file_count}"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{content_hash, scan};
    use test_log::test;

    fn extraction(content: &str, metadata: MetadataMap) -> Extraction {
        let out = scan(content);
        Extraction {
            metadata,
            labels: out.labels,
            references: out.references,
            issues: out.issues,
            content_hash: content_hash(content),
        }
    }

    async fn open_store(dir: &Path) -> IndexStore {
        IndexStore::open(dir, &IndexConfig::default()).await.unwrap()
    }

    #[test]
    fn test_metadata_rows_round_trip() {
        let mut metadata = MetadataMap::new();
        metadata.insert("title".into(), MetaValue::Text("T".into()));
        metadata.insert(
            "tags".into(),
            MetaValue::List(vec!["a".into(), "b".into()]),
        );
        metadata.insert("none".into(), MetaValue::List(vec![]));
        metadata.insert(
            "nested".into(),
            MetaValue::Map(BTreeMap::from([("k".into(), MetaValue::Text("v".into()))])),
        );
        let rows = metadata_rows(&metadata).unwrap();
        assert_eq!(rows.len(), 5);
        let rows: Vec<MetadataRow> = rows
            .into_iter()
            .map(|(key, _, kind, value)| ("a.typ".to_string(), key, kind.to_string(), value))
            .collect();
        let assembled: MetadataMap = assemble_metadata(rows)
            .unwrap()
            .into_iter()
            .map(|(_, k, v)| (k, v))
            .collect();
        assert_eq!(assembled, metadata);
    }

    #[tokio::test]
    async fn test_replace_is_full_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let store = open_store(&root).await;
        let a = root.join("a.typ");

        let mut metadata = MetadataMap::new();
        metadata.insert("title".into(), MetaValue::Text("Alpha".into()));
        metadata.insert("tags".into(), MetaValue::List(vec!["x".into(), "y".into()]));
        store
            .replace_file(&a, FileTimes::default(), &extraction("<one>\n[[b]] [[c]]", metadata))
            .await
            .unwrap();
        store
            .replace_file(&a, FileTimes::default(), &extraction("[[d]]", MetadataMap::new()))
            .await
            .unwrap();

        let reader = store.read().await;
        let links = reader.forward_links(&a).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].0.target, "d");
        assert!(reader.file(&a).unwrap().labels.is_empty());
        assert_eq!(reader.metadata_of(&a).await.unwrap(), Some(MetadataMap::new()));
        let record = reader.file_record(&a).await.unwrap().unwrap();
        assert_eq!(record.rel_path, "a.typ");
        assert_eq!(record.content_hash.as_deref(), Some(content_hash("[[d]]").as_str()));
        assert!(record.last_parsed.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let a = root.join("a.typ");
        let b = root.join("notes/b.typ");
        {
            let store = open_store(&root).await;
            let mut metadata = MetadataMap::new();
            metadata.insert("title".into(), MetaValue::Text("Beta".into()));
            store
                .replace_file(&b, FileTimes::default(), &extraction("= Math\n", metadata))
                .await
                .unwrap();
            store
                .replace_file(&a, FileTimes::default(), &extraction("[[Beta:math|B]]", MetadataMap::new()))
                .await
                .unwrap();
            store.close().await;
        }

        let store = open_store(&root).await;
        assert!(!store.rebuilt());
        let reader = store.read().await;
        assert_eq!(reader.len(), 2);
        let backlinks = reader.backlinks(&b).unwrap();
        assert_eq!(backlinks.len(), 1);
        assert_eq!(backlinks[0].0.source, a);
        assert_eq!(backlinks[0].1.alias.as_deref(), Some("B"));
        assert_eq!(reader.file(&b).unwrap().title.as_deref(), Some("Beta"));
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let config = IndexConfig::default();
        fs::write(config.db_path(&root), vec![b'x'; 4096]).unwrap();

        let store = IndexStore::open(&root, &config).await.unwrap();
        assert!(store.rebuilt());
        assert!(store.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_parse_failure_creates_bare_row_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let store = open_store(&root).await;
        let a = root.join("a.typ");

        store
            .record_parse_failure(&a, FileTimes::default(), "line 1: unterminated string")
            .await
            .unwrap();
        {
            let reader = store.read().await;
            assert!(reader.contains(&a));
            let record = reader.file_record(&a).await.unwrap().unwrap();
            assert_eq!(record.parse_error.as_deref(), Some("line 1: unterminated string"));
        }

        store
            .replace_file(&a, FileTimes::default(), &extraction("[[x]]", MetadataMap::new()))
            .await
            .unwrap();
        store
            .record_parse_failure(&a, FileTimes::default(), "again")
            .await
            .unwrap();
        let reader = store.read().await;
        // Previous good facts are retained alongside the error
        assert_eq!(reader.forward_links(&a).unwrap().len(), 1);
        let record = reader.file_record(&a).await.unwrap().unwrap();
        assert_eq!(record.parse_error.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_remove_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let store = open_store(&root).await;
        let a = root.join("a.typ");
        let mut metadata = MetadataMap::new();
        metadata.insert("tags".into(), MetaValue::List(vec!["x".into()]));
        store
            .replace_file(&a, FileTimes::default(), &extraction("<l>\n[[b]]", metadata))
            .await
            .unwrap();

        assert!(store.remove_file(&a).await.unwrap().is_some());
        assert!(store.remove_file(&a).await.unwrap().is_none());
        for table in ["metadata", "labels", "cross_references", "files"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&store.pool)
                .await
                .unwrap();
            assert_eq!(count, 0, "{table} still has rows");
        }
    }

    #[tokio::test]
    async fn test_paths_outside_root_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let store = open_store(&root).await;
        let err = store
            .replace_file(
                Path::new("/definitely/elsewhere.typ"),
                FileTimes::default(),
                &extraction("", MetadataMap::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::OutsideWorkspace(_)));
    }
}
