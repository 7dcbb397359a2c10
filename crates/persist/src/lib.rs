//! Porch persistence: a SQLite revision table.
//! One database file holds the revisions of every repository, keyed by
//! `(namespace, repository, package, workspace)`.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use metrics::histogram;
use porch_core::{ObjectKey, PackageRevision, PackageRevisionKey, PorchError, PorchResult, Repository, ResourceMap};
use porch_repository::{PackageRepository, RepositoryOpener, RevisionTable, StoredRevision, TableRepository};
use rusqlite::OptionalExtension;
use tracing::info;

/// SQLite-backed table. Simple and synchronous; reconciles are not latency sensitive here.
pub struct SqliteTable {
    db: Mutex<rusqlite::Connection>,
}

fn backend(e: impl std::fmt::Display) -> PorchError {
    PorchError::backend(format!("sqlite: {e}"))
}

impl SqliteTable {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("PORCH_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS revisions (
                namespace  TEXT NOT NULL,
                repository TEXT NOT NULL,
                package    TEXT NOT NULL,
                workspace  TEXT NOT NULL,
                rv         INTEGER NOT NULL,
                meta       TEXT NOT NULL,
                resources  BLOB NOT NULL,
                PRIMARY KEY (namespace, repository, package, workspace)
            )",
            [],
        )
        .context("creating revisions table")?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %path, "revision table opened");
        Ok(me)
    }

    fn conn(&self) -> PorchResult<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| PorchError::backend("sqlite connection lock poisoned"))
    }
}

fn encode(rec: &StoredRevision) -> PorchResult<(String, Vec<u8>)> {
    let meta = serde_json::to_string(&rec.revision)?;
    let resources = serde_json::to_string(&rec.resources)?;
    Ok((meta, maybe_compress(&resources)))
}

impl RevisionTable for SqliteTable {
    fn insert(&self, rec: &StoredRevision) -> PorchResult<()> {
        let started = std::time::Instant::now();
        let key = rec.key();
        let (meta, blob) = encode(rec)?;
        let db = self.conn()?;
        let res = db.execute(
            "INSERT INTO revisions(namespace, repository, package, workspace, rv, meta, resources)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![key.namespace, key.repository, key.package, key.workspace, rec.resource_version() as i64, meta, blob],
        );
        match res {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                return Err(PorchError::AlreadyExists(format!("package revision {key}")));
            }
            Err(e) => return Err(backend(e)),
        }
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn replace(&self, rec: &StoredRevision, expected: u64) -> PorchResult<()> {
        let started = std::time::Instant::now();
        let key = rec.key();
        let (meta, blob) = encode(rec)?;
        let db = self.conn()?;
        let n = db
            .execute(
                "UPDATE revisions SET rv = ?5, meta = ?6, resources = ?7
                 WHERE namespace = ?1 AND repository = ?2 AND package = ?3 AND workspace = ?4 AND rv = ?8",
                rusqlite::params![key.namespace, key.repository, key.package, key.workspace, rec.resource_version() as i64, meta, blob, expected as i64],
            )
            .map_err(backend)?;
        if n == 0 {
            return Err(missing_or_conflict(&db, &key, expected)?);
        }
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn remove(&self, key: &PackageRevisionKey, expected: u64) -> PorchResult<()> {
        let db = self.conn()?;
        let n = db
            .execute(
                "DELETE FROM revisions WHERE namespace = ?1 AND repository = ?2 AND package = ?3 AND workspace = ?4 AND rv = ?5",
                rusqlite::params![key.namespace, key.repository, key.package, key.workspace, expected as i64],
            )
            .map_err(backend)?;
        if n == 0 {
            return Err(missing_or_conflict(&db, key, expected)?);
        }
        Ok(())
    }

    fn load(&self, key: &PackageRevisionKey) -> PorchResult<Option<StoredRevision>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let row: Option<(String, Vec<u8>)> = db
            .query_row(
                "SELECT meta, resources FROM revisions WHERE namespace = ?1 AND repository = ?2 AND package = ?3 AND workspace = ?4",
                rusqlite::params![key.namespace, key.repository, key.package, key.workspace],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(backend)?;
        let Some((meta, blob)) = row else { return Ok(None) };
        let revision: PackageRevision = serde_json::from_str(&meta)?;
        let resources: ResourceMap = serde_json::from_str(&maybe_decompress(&blob))?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Some(StoredRevision { revision, resources }))
    }

    fn list(&self, namespace: &str, repository: &str) -> PorchResult<Vec<PackageRevision>> {
        let db = self.conn()?;
        let mut stmt = db
            .prepare("SELECT meta FROM revisions WHERE namespace = ?1 AND repository = ?2 ORDER BY package, workspace")
            .map_err(backend)?;
        let mut rows = stmt.query([namespace, repository]).map_err(backend)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            let meta: String = row.get(0).map_err(backend)?;
            out.push(serde_json::from_str(&meta)?);
        }
        Ok(out)
    }
}

fn missing_or_conflict(db: &rusqlite::Connection, key: &PackageRevisionKey, expected: u64) -> PorchResult<PorchError> {
    let stored: Option<i64> = db
        .query_row(
            "SELECT rv FROM revisions WHERE namespace = ?1 AND repository = ?2 AND package = ?3 AND workspace = ?4",
            rusqlite::params![key.namespace, key.repository, key.package, key.workspace],
            |row| row.get(0),
        )
        .optional()
        .map_err(backend)?;
    Ok(match stored {
        None => PorchError::not_found(format!("package revision {key}")),
        Some(rv) => PorchError::conflict(format!("package revision {key}: stored version {rv} != {expected}")),
    })
}

/// Opens every repository over one shared SQLite table.
#[derive(Clone)]
pub struct SqliteOpener {
    table: Arc<SqliteTable>,
}

impl SqliteOpener {
    pub fn new(table: SqliteTable) -> Self { Self { table: Arc::new(table) } }
}

impl RepositoryOpener for SqliteOpener {
    fn open(&self, repo: &Repository) -> PorchResult<Arc<dyn PackageRepository>> {
        let key = ObjectKey::of(repo);
        Ok(Arc::new(TableRepository::new(key.namespace, key.name, Arc::clone(&self.table))))
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".porch");
        let _ = std::fs::create_dir_all(&p);
        p.push("porch.db");
        return p.to_string_lossy().to_string();
    }
    "porch.db".to_string()
}

pub fn maybe_compress(text: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("PORCH_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(text.as_bytes(), lvl).unwrap_or_else(|_| text.as_bytes().to_vec());
    }
    text.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
