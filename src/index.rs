//! Message index: the nearest-neighbour lookup the retriever sits on.
//!
//! `VectorIndex` is the seam the core depends on. `SqliteMessageIndex` backs it
//! with an FTS5 table ranked by bm25; a filtered query that finds fewer than
//! `k` lexical hits is topped up with that member's most recent records so the
//! caller always sees `min(k, records)` documents, as a similarity index would.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{IndexError, dedup_keep_order, is_stopword, tokenize};

const INGEST_BATCH: usize = 100;

/// Exact-match restriction on the indexed `user_name` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFilter {
    pub user_name: String,
}

impl MetadataFilter {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            user_name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexHit {
    pub id: String,
    pub text: String,
    pub user_name: String,
    pub timestamp: String,
    /// Higher is closer. Top-up records carry 0.
    pub score: f64,
}

pub trait VectorIndex: Send + Sync {
    fn query(
        &self,
        text: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError>;

    fn count(&self) -> Result<usize, IndexError>;

    /// Distinct member names in first-ingested order.
    fn distinct_user_names(&self) -> Result<Vec<String>, IndexError>;
}

/// One exported chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub user_name: String,
    pub timestamp: String,
    #[serde(default)]
    pub message: String,
}

impl MessageRecord {
    pub fn document_text(&self) -> String {
        format!(
            "On {}, user {} sent a message: '{}'",
            self.timestamp, self.user_name, self.message
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExportFile {
    Wrapped { items: Vec<MessageRecord> },
    Bare(Vec<MessageRecord>),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    pub files: usize,
    pub seen: usize,
    pub indexed: usize,
    pub skipped_empty: usize,
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    user_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    message TEXT NOT NULL,
    document TEXT NOT NULL,
    ingested_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_name);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    document,
    content='messages', content_rowid='rowid',
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, document) VALUES (new.rowid, new.document);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, document)
    VALUES ('delete', old.rowid, old.document);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, document)
    VALUES ('delete', old.rowid, old.document);
    INSERT INTO messages_fts(rowid, document) VALUES (new.rowid, new.document);
END;
";

pub struct SqliteMessageIndex {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteMessageIndex {
    /// Opens an existing index. Errors if the file doesn't exist.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, IndexError> {
        if !path.exists() {
            return Err(IndexError::NotFound(path.display().to_string()));
        }
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        index.apply_pragmas(busy_timeout)?;
        index.with_conn(|conn| conn.execute_batch(SCHEMA_SQL))?;
        Ok(index)
    }

    /// Opens or creates an index file with the full schema.
    pub fn open_or_create(path: &Path, busy_timeout: Duration) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let index = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        index.apply_pragmas(busy_timeout)?;
        index.with_conn(|conn| conn.execute_batch(SCHEMA_SQL))?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn apply_pragmas(&self, busy_timeout: Duration) -> Result<(), IndexError> {
        self.with_conn(|conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA cache_size = -8000;",
            )
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, IndexError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(f(&mut conn)?)
    }

    /// Inserts or replaces records in one transaction. Records with a blank
    /// message are skipped; returns how many were written.
    pub fn upsert(&self, records: &[MessageRecord]) -> Result<usize, IndexError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (id, user_id, user_name, timestamp, message, document)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                        user_id = excluded.user_id,
                        user_name = excluded.user_name,
                        timestamp = excluded.timestamp,
                        message = excluded.message,
                        document = excluded.document",
                )?;
                for record in records {
                    if record.message.trim().is_empty() {
                        continue;
                    }
                    stmt.execute(params![
                        record.id,
                        record.user_id,
                        record.user_name,
                        record.timestamp,
                        record.message,
                        record.document_text(),
                    ])?;
                    written += 1;
                }
            }
            tx.commit()?;
            Ok(written)
        })
    }

    fn lexical(
        &self,
        fts_query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<IndexHit> {
            let score: f64 = row.get(4)?;
            Ok(IndexHit {
                id: row.get(0)?,
                text: row.get(1)?,
                user_name: row.get(2)?,
                timestamp: row.get(3)?,
                // bm25 is negative; closer matches are more negative.
                score: -score,
            })
        };
        self.with_conn(|conn| match filter {
            Some(filter) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT m.id, m.document, m.user_name, m.timestamp, bm25(messages_fts) AS rank_score
                     FROM messages_fts JOIN messages m ON m.rowid = messages_fts.rowid
                     WHERE messages_fts MATCH ?1 AND m.user_name = ?2
                     ORDER BY rank_score
                     LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![fts_query, filter.user_name, k as i64], map_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT m.id, m.document, m.user_name, m.timestamp, bm25(messages_fts) AS rank_score
                     FROM messages_fts JOIN messages m ON m.rowid = messages_fts.rowid
                     WHERE messages_fts MATCH ?1
                     ORDER BY rank_score
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![fts_query, k as i64], map_row)?;
                rows.collect()
            }
        })
    }

    fn most_recent(
        &self,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<IndexHit> {
            Ok(IndexHit {
                id: row.get(0)?,
                text: row.get(1)?,
                user_name: row.get(2)?,
                timestamp: row.get(3)?,
                score: 0.0,
            })
        };
        self.with_conn(|conn| match filter {
            Some(filter) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, document, user_name, timestamp FROM messages
                     WHERE user_name = ?1 ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![filter.user_name, k as i64], map_row)?;
                rows.collect()
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, document, user_name, timestamp FROM messages
                     ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![k as i64], map_row)?;
                rows.collect()
            }
        })
    }
}

impl VectorIndex for SqliteMessageIndex {
    fn query(
        &self,
        text: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let fts_query = fts_query(text);
        let mut hits = if fts_query.is_empty() {
            Vec::new()
        } else {
            self.lexical(&fts_query, k, filter)?
        };
        if hits.len() < k {
            let seen: HashSet<String> = hits.iter().map(|h| h.id.clone()).collect();
            let recent = self.most_recent(k, filter)?;
            hits.extend(recent.into_iter().filter(|h| !seen.contains(&h.id)));
            hits.truncate(k);
        }
        debug!(
            user = filter.map(|f| f.user_name.as_str()).unwrap_or("*"),
            k,
            hits = hits.len(),
            "index query"
        );
        Ok(hits)
    }

    fn count(&self) -> Result<usize, IndexError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get::<_, i64>(0))
        })
        .map(|n| n.max(0) as usize)
    }

    fn distinct_user_names(&self) -> Result<Vec<String>, IndexError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_name FROM messages GROUP BY user_name ORDER BY MIN(rowid)",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
    }
}

/// Builds an FTS5 MATCH expression: OR of the quoted, non-stopword query tokens.
pub(crate) fn fts_query(text: &str) -> String {
    let tokens: Vec<String> = tokenize(text)
        .into_iter()
        .map(|t| t.trim_end_matches("'s").to_string())
        .filter(|t| !t.is_empty() && !is_stopword(t))
        .filter(|t| t.chars().count() >= 2 || t.chars().all(|c| c.is_ascii_digit()))
        .collect();
    dedup_keep_order(tokens)
        .into_iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Reads one export file: `{"items": [...]}` or a bare array of records.
pub fn load_export(path: &Path) -> Result<Vec<MessageRecord>, IndexError> {
    let raw = fs::read_to_string(path)?;
    let parsed: ExportFile = serde_json::from_str(&raw)?;
    Ok(match parsed {
        ExportFile::Wrapped { items } => items,
        ExportFile::Bare(items) => items,
    })
}

fn export_files(path: &Path) -> Result<Vec<PathBuf>, IndexError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(IndexError::NotFound(path.display().to_string()));
    }
    let mut files: Vec<PathBuf> = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")))
        .collect();
    files.sort();
    Ok(files)
}

/// Ingests a file or every `*.json` under a directory, in batches.
pub fn ingest_path(index: &SqliteMessageIndex, path: &Path) -> Result<IngestReport, IndexError> {
    let mut report = IngestReport::default();
    for file in export_files(path)? {
        let records = match load_export(&file) {
            Ok(records) => records,
            Err(err) => {
                warn!(file = %file.display(), error = %err, "skipping unreadable export");
                continue;
            }
        };
        report.files += 1;
        report.seen += records.len();
        report.skipped_empty += records
            .iter()
            .filter(|r| r.message.trim().is_empty())
            .count();
        for batch in records.chunks(INGEST_BATCH) {
            report.indexed += index.upsert(batch)?;
        }
        info!(file = %file.display(), records = records.len(), "ingested export");
    }
    Ok(report)
}
