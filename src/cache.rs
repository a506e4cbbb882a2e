//! Rationale cache in SQLite.
//!
//! Entries are keyed by model, prompt template and the rendered prompt, so a
//! repeated draw with the same persona, concept, question and seed is served
//! without a provider call. All statements run on a blocking thread against
//! one shared connection.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS rationale_cache (
    key_hash      TEXT PRIMARY KEY,
    model         TEXT NOT NULL,
    template_slug TEXT NOT NULL,
    prompt_hash   TEXT NOT NULL,
    rationale     TEXT NOT NULL,
    input_tokens  INTEGER,
    output_tokens INTEGER,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    hit_count     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS rationale_cache_updated ON rationale_cache (updated_at);
"#;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache export: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cache worker: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RationaleCacheKey {
    pub model: String,
    pub template_slug: String,
    /// blake3 of the rendered prompt.
    pub prompt_hash: String,
    pub key_hash: String,
}

impl RationaleCacheKey {
    pub fn new(model: &str, template_slug: &str, prompt: &str) -> Self {
        let prompt_hash = blake3::hash(prompt.as_bytes()).to_hex().to_string();

        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        let mut hasher = blake3::Hasher::new();
        for part in [model, template_slug, prompt_hash.as_str()] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }

        Self {
            model: model.to_string(),
            template_slug: template_slug.to_string(),
            key_hash: hasher.finalize().to_hex().to_string(),
            prompt_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedRationale {
    pub rationale: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

impl CachedRationale {
    pub fn new(rationale: impl Into<String>) -> Self {
        Self {
            rationale: rationale.into(),
            input_tokens: None,
            output_tokens: None,
        }
    }
}

#[async_trait]
pub trait RationaleCache: Send + Sync {
    /// A hit bumps the entry's hit count and recency.
    async fn get(&self, key: &RationaleCacheKey) -> Result<Option<CachedRationale>, CacheError>;

    /// Inserts or replaces the rationale stored under `key`.
    async fn put(&self, key: &RationaleCacheKey, value: &CachedRationale) -> Result<(), CacheError>;
}

/// One exported row.
#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub model: String,
    pub template_slug: String,
    pub prompt_hash: String,
    pub rationale: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

#[derive(Clone)]
pub struct SqliteRationaleCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteRationaleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRationaleCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteRationaleCache {
    /// Opens (creating if needed) the database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "opened rationale cache");

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until this process holds the maintenance lock.
    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::acquire(&self.path)
    }

    async fn run<F, R>(&self, job: F) -> Result<R, CacheError>
    where
        F: FnOnce(&mut Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            job(&mut guard)
        })
        .await?
    }

    pub async fn count(&self) -> Result<usize, CacheError> {
        self.run(|conn| Ok(row_count(conn)?)).await
    }

    /// Writes every row as one JSON line, most recently used first, and
    /// returns how many were written.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.run(move |conn| {
            let mut out = BufWriter::new(File::create(&path)?);
            let mut stmt = conn.prepare(
                "SELECT key_hash, model, template_slug, prompt_hash, rationale,
                        input_tokens, output_tokens, created_at, updated_at, hit_count
                 FROM rationale_cache
                 ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CacheExportRow {
                    key_hash: row.get(0)?,
                    model: row.get(1)?,
                    template_slug: row.get(2)?,
                    prompt_hash: row.get(3)?,
                    rationale: row.get(4)?,
                    input_tokens: row.get(5)?,
                    output_tokens: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                    hit_count: row.get(9)?,
                })
            })?;

            let mut written = 0;
            for row in rows {
                serde_json::to_writer(&mut out, &row?)?;
                out.write_all(b"\n")?;
                written += 1;
            }
            out.flush()?;
            Ok(written)
        })
        .await
    }

    /// Drops entries unused for `max_age_days`, then trims to the `max_rows`
    /// most recently used. Both steps commit together.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;

            if let Some(days) = max_age_days {
                let age = i64::try_from(days).unwrap_or(i64::MAX).saturating_mul(SECONDS_PER_DAY);
                let cutoff = now().saturating_sub(age);
                deleted += tx.execute(
                    "DELETE FROM rationale_cache WHERE updated_at < ?1",
                    params![cutoff],
                )?;
            }
            if let Some(keep) = max_rows {
                deleted += tx.execute(
                    "DELETE FROM rationale_cache WHERE key_hash IN (
                         SELECT key_hash FROM rationale_cache
                         ORDER BY updated_at DESC
                         LIMIT -1 OFFSET ?1
                     )",
                    params![i64::try_from(keep).unwrap_or(i64::MAX)],
                )?;
            }

            let remaining = row_count(&tx)?;
            tx.commit()?;
            Ok(CachePruneStats { deleted, remaining })
        })
        .await
    }
}

#[async_trait]
impl RationaleCache for SqliteRationaleCache {
    async fn get(&self, key: &RationaleCacheKey) -> Result<Option<CachedRationale>, CacheError> {
        let key_hash = key.key_hash.clone();
        self.run(move |conn| {
            let hit = conn
                .query_row(
                    "SELECT rationale, input_tokens, output_tokens
                     FROM rationale_cache WHERE key_hash = ?1",
                    params![key_hash],
                    |row| {
                        Ok(CachedRationale {
                            rationale: row.get(0)?,
                            input_tokens: row.get(1)?,
                            output_tokens: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            if hit.is_some() {
                conn.execute(
                    "UPDATE rationale_cache
                     SET hit_count = hit_count + 1, updated_at = ?1
                     WHERE key_hash = ?2",
                    params![now(), key_hash],
                )?;
            }
            Ok(hit)
        })
        .await
    }

    async fn put(&self, key: &RationaleCacheKey, value: &CachedRationale) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        self.run(move |conn| {
            let ts = now();
            conn.execute(
                "INSERT INTO rationale_cache (
                     key_hash, model, template_slug, prompt_hash, rationale,
                     input_tokens, output_tokens, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(key_hash) DO UPDATE SET
                     rationale = excluded.rationale,
                     input_tokens = excluded.input_tokens,
                     output_tokens = excluded.output_tokens,
                     updated_at = excluded.updated_at",
                params![
                    key.key_hash,
                    key.model,
                    key.template_slug,
                    key.prompt_hash,
                    value.rationale,
                    value.input_tokens,
                    value.output_tokens,
                    ts,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

/// Advisory lock on `<db>.lock`; released on drop. The lock file's contents
/// are never touched.
#[derive(Debug)]
pub struct CacheLock {
    _file: File,
}

impl CacheLock {
    fn acquire(db_path: &Path) -> Result<Self, CacheError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(db_path.with_extension("lock"))?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

fn row_count(conn: &Connection) -> Result<usize, rusqlite::Error> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM rationale_cache", [], |row| row.get(0))?;
    Ok(usize::try_from(n).unwrap_or(0))
}

fn now() -> i64 {
    Utc::now().timestamp()
}
