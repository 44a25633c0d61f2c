//! Cache Store (C1) — durable, crash-safe storage of translations.
//!
//! Backed by an embedded `rusqlite` database in WAL mode. Writes are
//! serialized through a single connection guarded by a mutex (the
//! store is single-writer, multi-reader is not needed at this scale);
//! readers never wait on more than one in-flight write because every
//! write is a short single-statement transaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::domain::ContextFingerprint;

/// Current on-disk schema version. Versions listed in
/// `COMPATIBLE_VERSIONS` are kept as-is on open; anything else causes
/// the table to be truncated and re-initialized.
const CURRENT_VERSION: i32 = 1;
const COMPATIBLE_VERSIONS: &[i32] = &[1];

/// Default `last_used` cutoff for the lazy daily sweep, in days.
/// Matches the original implementation's `auto_cleanup_days` default.
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Aggregate statistics about the cache contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub record_count: u64,
    pub disk_bytes: u64,
    pub top_used: Vec<(String, u64)>,
    pub per_model: HashMap<String, u64>,
}

/// Versioned JSON snapshot format for `export`/`import`.
#[derive(Debug, Serialize, Deserialize)]
struct ExportEntry {
    source_text: String,
    context_fingerprint: String,
    model_id: String,
    target_text: String,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    usage_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportSnapshot {
    version: i32,
    entries: Vec<ExportEntry>,
}

pub struct CacheStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    last_sweep_day: Mutex<Option<chrono::NaiveDate>>,
    retention_days: u32,
}

impl CacheStore {
    /// Open (or create) the cache database at `db_path`. If the file
    /// exists but cannot be initialized, falls back to a sibling
    /// `.bak` file; if that also fails, re-creates an empty store.
    pub fn open(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match Self::open_and_init(&db_path) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Cache store failed to initialize ({e}), trying .bak");
                let bak_path = Self::bak_path(&db_path);
                if bak_path.exists() {
                    std::fs::copy(&bak_path, &db_path)?;
                    Self::open_and_init(&db_path).or_else(|_| {
                        std::fs::remove_file(&db_path).ok();
                        Self::open_and_init(&db_path)
                    })?
                } else {
                    std::fs::remove_file(&db_path).ok();
                    Self::open_and_init(&db_path)?
                }
            }
        };

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
            last_sweep_day: Mutex::new(None),
            retention_days: DEFAULT_RETENTION_DAYS,
        })
    }

    /// Overrides the `last_used` cutoff used by the lazy daily sweep.
    /// Defaults to [`DEFAULT_RETENTION_DAYS`].
    pub fn with_retention_days(mut self, retention_days: u32) -> Self {
        self.retention_days = retention_days;
        self
    }

    fn bak_path(db_path: &Path) -> PathBuf {
        let mut p = db_path.as_os_str().to_owned();
        p.push(".bak");
        PathBuf::from(p)
    }

    fn open_and_init(db_path: &Path) -> anyhow::Result<Connection> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            "#,
        )?;
        Self::init_schema(&conn)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT)",
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE((SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'), 0)",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version == 0 {
            Self::apply_schema_v1(conn)?;
        } else if !COMPATIBLE_VERSIONS.contains(&current_version) {
            tracing::warn!(
                "Cache schema version {} is incompatible with {}, truncating",
                current_version,
                CURRENT_VERSION
            );
            conn.execute_batch("DROP TABLE IF EXISTS translations;")?;
            Self::apply_schema_v1(conn)?;
        }

        Ok(())
    }

    fn apply_schema_v1(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS translations (
                source_text TEXT NOT NULL,
                context_fingerprint TEXT NOT NULL,
                model_id TEXT NOT NULL,
                target_text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_used TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (source_text, context_fingerprint, model_id)
            );
            CREATE INDEX IF NOT EXISTS idx_translations_model ON translations(model_id);
            CREATE INDEX IF NOT EXISTS idx_translations_last_used ON translations(last_used);

            INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', '1');
            "#,
        )?;
        Ok(())
    }

    /// Point lookup. On hit, atomically bumps `usage_count` and
    /// `last_used` and returns the target text.
    pub fn get(&self, source: &str, ctx_fp: ContextFingerprint, model: &str) -> Option<String> {
        self.maybe_run_daily_sweep();
        let conn = self.conn.lock().unwrap();
        let fp_hex = ctx_fp.to_hex();
        let now = Utc::now().to_rfc3339();

        let result: rusqlite::Result<String> = conn.query_row(
            "UPDATE translations
             SET usage_count = usage_count + 1, last_used = ?4
             WHERE source_text = ?1 AND context_fingerprint = ?2 AND model_id = ?3
             RETURNING target_text",
            params![source, fp_hex, model, now],
            |row| row.get(0),
        );

        match result {
            Ok(text) => Some(text),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                tracing::warn!("cache get failed, treating as miss: {e}");
                None
            }
        }
    }

    /// Upsert a translation. Rejected (returns `Ok(false)`) if either
    /// string is empty after trimming.
    pub fn put(
        &self,
        source: &str,
        target: &str,
        ctx_fp: ContextFingerprint,
        model: &str,
    ) -> anyhow::Result<bool> {
        if source.trim().is_empty() || target.trim().is_empty() {
            return Ok(false);
        }

        let conn = self.conn.lock().unwrap();
        let fp_hex = ctx_fp.to_hex();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO translations
                (source_text, context_fingerprint, model_id, target_text, created_at, last_used, usage_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)
             ON CONFLICT(source_text, context_fingerprint, model_id) DO UPDATE SET
                target_text = excluded.target_text,
                last_used = excluded.last_used,
                usage_count = translations.usage_count + 1",
            params![source, fp_hex, model, target, now],
        )?;
        Ok(true)
    }

    /// Delete entries whose `last_used` is older than `days` ago.
    /// Takes a `.bak` snapshot first since this is destructive.
    pub fn delete_older_than(&self, days: u32) -> anyhow::Result<u64> {
        self.backup()?;
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
        let affected = conn.execute("DELETE FROM translations WHERE last_used < ?1", params![cutoff])?;
        Ok(affected as u64)
    }

    pub fn delete_by_model(&self, model_id: &str) -> anyhow::Result<u64> {
        self.backup()?;
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM translations WHERE model_id = ?1", params![model_id])?;
        Ok(affected as u64)
    }

    pub fn clear_all(&self) -> anyhow::Result<()> {
        self.backup()?;
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM translations", [])?;
        Ok(())
    }

    /// `VACUUM` plus the lazy eviction sweep, exposed as the `cache
    /// --optimize` CLI verb.
    pub fn optimize(&self) -> anyhow::Result<()> {
        self.run_daily_sweep();
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    pub fn stats(&self) -> anyhow::Result<CacheStats> {
        let conn = self.conn.lock().unwrap();
        let record_count: u64 =
            conn.query_row("SELECT COUNT(*) FROM translations", [], |r| r.get(0))?;

        let disk_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);

        let top_used = Self::top_used_locked(&conn, 10)?;

        let mut per_model = HashMap::new();
        let mut stmt = conn.prepare("SELECT model_id, COUNT(*) FROM translations GROUP BY model_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?;
        for row in rows {
            let (model, count) = row?;
            per_model.insert(model, count);
        }

        Ok(CacheStats {
            record_count,
            disk_bytes,
            top_used,
            per_model,
        })
    }

    /// Top-N entries by `usage_count`, returned as `(source_text, count)`.
    pub fn top_used(&self, n: usize) -> anyhow::Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().unwrap();
        Self::top_used_locked(&conn, n)
    }

    fn top_used_locked(conn: &Connection, n: usize) -> anyhow::Result<Vec<(String, u64)>> {
        let mut stmt = conn.prepare(
            "SELECT source_text, usage_count FROM translations ORDER BY usage_count DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![n as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Write a versioned JSON snapshot of the entire cache.
    pub fn export(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_text, context_fingerprint, model_id, target_text, created_at, last_used, usage_count FROM translations",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ExportEntry {
                source_text: row.get(0)?,
                context_fingerprint: row.get(1)?,
                model_id: row.get(2)?,
                target_text: row.get(3)?,
                created_at: row.get(4)?,
                last_used: row.get(5)?,
                usage_count: row.get(6)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        let snapshot = ExportSnapshot {
            version: CURRENT_VERSION,
            entries,
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Import a snapshot of the current or immediately prior schema
    /// version. Entries from unrecognized (future) versions are
    /// ignored rather than erroring out. Takes a `.bak` first.
    pub fn import(&self, path: impl AsRef<Path>) -> anyhow::Result<u64> {
        self.backup()?;
        let json = std::fs::read_to_string(path)?;
        let snapshot: ExportSnapshot = serde_json::from_str(&json)?;

        if snapshot.version > CURRENT_VERSION {
            tracing::warn!(
                "Ignoring import snapshot from newer schema version {} (current {})",
                snapshot.version,
                CURRENT_VERSION
            );
            return Ok(0);
        }

        let conn = self.conn.lock().unwrap();
        let mut imported = 0u64;
        for entry in snapshot.entries {
            if entry.source_text.trim().is_empty() || entry.target_text.trim().is_empty() {
                continue;
            }
            conn.execute(
                "INSERT INTO translations
                    (source_text, context_fingerprint, model_id, target_text, created_at, last_used, usage_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(source_text, context_fingerprint, model_id) DO UPDATE SET
                    target_text = excluded.target_text,
                    last_used = excluded.last_used,
                    usage_count = excluded.usage_count",
                params![
                    entry.source_text,
                    entry.context_fingerprint,
                    entry.model_id,
                    entry.target_text,
                    entry.created_at.to_rfc3339(),
                    entry.last_used.to_rfc3339(),
                    entry.usage_count,
                ],
            )?;
            imported += 1;
        }
        Ok(imported)
    }

    fn backup(&self) -> anyhow::Result<()> {
        if self.db_path.exists() {
            std::fs::copy(&self.db_path, Self::bak_path(&self.db_path))?;
        }
        Ok(())
    }

    /// A background sweep runs at most once per calendar day,
    /// triggered lazily on first access of that day.
    fn maybe_run_daily_sweep(&self) {
        let today = Utc::now().date_naive();
        let mut last = self.last_sweep_day.lock().unwrap();
        if *last != Some(today) {
            *last = Some(today);
            drop(last);
            self.run_daily_sweep();
        }
    }

    fn run_daily_sweep(&self) {
        match self.delete_older_than(self.retention_days) {
            Ok(affected) => tracing::debug!(affected, retention_days = self.retention_days, "Ran lazy daily cache sweep"),
            Err(e) => tracing::warn!("Daily cache sweep failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> ContextFingerprint {
        ContextFingerprint::of(&["Hi.", "Hello.", "Bye."])
    }

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        assert!(store.put("Hello.", "你好。", fp(), "M").unwrap());
        assert_eq!(store.get("Hello.", fp(), "M"), Some("你好。".to_string()));
    }

    #[test]
    fn empty_strings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        assert!(!store.put("  ", "x", fp(), "M").unwrap());
        assert!(!store.put("x", "  ", fp(), "M").unwrap());
    }

    #[test]
    fn get_increments_usage_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        store.put("Hello.", "你好。", fp(), "M").unwrap();
        store.get("Hello.", fp(), "M");
        store.get("Hello.", fp(), "M");
        let stats = store.stats().unwrap();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.top_used[0].1, 3); // 1 from put + 2 gets
    }

    #[test]
    fn export_import_roundtrips_modulo_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        store.put("Hello.", "你好。", fp(), "M").unwrap();

        let export_path = dir.path().join("snap.json");
        store.export(&export_path).unwrap();

        let store2 = CacheStore::open(dir.path().join("cache2.db")).unwrap();
        let imported = store2.import(&export_path).unwrap();
        assert_eq!(imported, 1);
        assert_eq!(store2.get("Hello.", fp(), "M"), Some("你好。".to_string()));
    }

    #[test]
    fn delete_by_model_removes_only_that_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        store.put("a", "A", fp(), "M1").unwrap();
        store.put("b", "B", fp(), "M2").unwrap();
        let deleted = store.delete_by_model("M1").unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.get("a", fp(), "M1"), None);
        assert_eq!(store.get("b", fp(), "M2"), Some("B".to_string()));
    }

    #[test]
    fn bak_file_is_created_before_destructive_ops() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("cache.db");
        let store = CacheStore::open(&db_path).unwrap();
        store.put("a", "A", fp(), "M1").unwrap();
        store.clear_all().unwrap();
        assert!(CacheStore::bak_path(&db_path).exists());
    }

    #[test]
    fn daily_sweep_evicts_entries_past_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db"))
            .unwrap()
            .with_retention_days(30);
        store.put("a", "A", fp(), "M1").unwrap();
        {
            let conn = store.conn.lock().unwrap();
            let stale = (Utc::now() - chrono::Duration::days(31)).to_rfc3339();
            conn.execute("UPDATE translations SET last_used = ?1", params![stale]).unwrap();
        }
        store.run_daily_sweep();
        assert_eq!(store.get("a", fp(), "M1"), None);
    }

    #[test]
    fn optimize_runs_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db"))
            .unwrap()
            .with_retention_days(1);
        store.put("a", "A", fp(), "M1").unwrap();
        {
            let conn = store.conn.lock().unwrap();
            let stale = (Utc::now() - chrono::Duration::days(2)).to_rfc3339();
            conn.execute("UPDATE translations SET last_used = ?1", params![stale]).unwrap();
        }
        store.optimize().unwrap();
        assert_eq!(store.get("a", fp(), "M1"), None);
    }
}
