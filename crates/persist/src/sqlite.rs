//! SQLite backend: one row per snapshot key, upserted in place.
//! Simple and synchronous; calls are moved off the runtime with `spawn_blocking`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use tracing::debug;

use crate::{PersistError, SnapshotBackend};

const SNAPSHOT_KEY: &str = "snapshot.json";

pub struct SqliteBackend {
    db: Arc<Mutex<rusqlite::Connection>>,
    path: String,
}

impl SqliteBackend {
    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS snapshots (
                key  TEXT PRIMARY KEY,
                ts   INTEGER NOT NULL,
                body BLOB NOT NULL
            )",
            [],
        )
        .context("creating snapshots table")?;
        Ok(Self { db: Arc::new(Mutex::new(db)), path: path.to_string() })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await
        .context("sqlite task panicked")?
    }
}

#[async_trait::async_trait]
impl SnapshotBackend for SqliteBackend {
    fn location(&self) -> String {
        format!("sqlite://{}#{}", self.path, SNAPSHOT_KEY)
    }

    async fn get(&self, max_bytes: usize) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let out = self
            .blocking(move |db| {
                let size: Option<i64> = db
                    .query_row("SELECT length(body) FROM snapshots WHERE key = ?1", [SNAPSHOT_KEY], |row| {
                        row.get(0)
                    })
                    .optional()?;
                let Some(size) = size else { return Ok(None) };
                if size as u64 > max_bytes as u64 {
                    return Err(PersistError::TooLarge { size: size as u64, max: max_bytes }.into());
                }
                let body: Vec<u8> =
                    db.query_row("SELECT body FROM snapshots WHERE key = ?1", [SNAPSHOT_KEY], |row| row.get(0))?;
                Ok(Some(body))
            })
            .await?;
        debug!(took_ms = %started.elapsed().as_millis(), found = out.is_some(), "sqlite snapshot read");
        Ok(out)
    }

    async fn put(&self, body: Vec<u8>) -> Result<()> {
        let started = Instant::now();
        let ts = chrono::Utc::now().timestamp();
        self.blocking(move |db| {
            db.execute(
                "INSERT INTO snapshots(key, ts, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET ts = excluded.ts, body = excluded.body",
                (SNAPSHOT_KEY, ts, &body),
            )?;
            Ok(())
        })
        .await?;
        debug!(took_ms = %started.elapsed().as_millis(), "sqlite snapshot written");
        Ok(())
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".xtrack");
        let _ = std::fs::create_dir_all(&p);
        p.push("snapshot.db");
        return p.to_string_lossy().to_string();
    }
    "xtrack-snapshot.db".to_string()
}
