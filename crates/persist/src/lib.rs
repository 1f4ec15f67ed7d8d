//! vtx persistence: SQLite store for reconciled endpoint state.
//! One row per saved snapshot; the latest three per key are kept.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

const KEEP_PER_KEY: i64 = 3;

/// Local state saved for one managed endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Caller-chosen key (manifest `key`).
    pub key: String,
    /// Remote identity, `projects/{p}/locations/{r}/endpoints/{id}`.
    pub id: String,
    pub project: String,
    pub region: String,
    pub ts: i64,
    /// JSON-encoded endpoint state.
    pub state_json: String,
}

pub trait StateStore {
    fn put(&self, rec: StateRecord) -> Result<()>;
    /// Latest snapshot for `key`.
    fn get(&self, key: &str) -> Result<Option<StateRecord>>;
    /// Drop every snapshot for `key`. Returns whether anything was removed.
    fn remove(&self, key: &str) -> Result<bool>;
    /// Latest snapshot of every key, ordered by key.
    fn list(&self) -> Result<Vec<StateRecord>>;
    fn history(&self, key: &str, limit: Option<usize>) -> Result<Vec<StateRecord>>;
}

/// SQLite-backed store. Synchronous; the CLI is not latency sensitive here.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("VTX_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS endpoint_state (
                key     TEXT NOT NULL,
                id      TEXT NOT NULL,
                project TEXT NOT NULL,
                region  TEXT NOT NULL,
                ts      INTEGER NOT NULL,
                state   TEXT NOT NULL
            )",
            [],
        ).context("creating endpoint_state table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_endpoint_state_key_ts ON endpoint_state(key, ts DESC)",
            [],
        ).ok();
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("state db lock poisoned"))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateRecord> {
    Ok(StateRecord {
        key: row.get(0)?,
        id: row.get(1)?,
        project: row.get(2)?,
        region: row.get(3)?,
        ts: row.get(4)?,
        state_json: row.get(5)?,
    })
}

impl StateStore for SqliteStore {
    fn put(&self, rec: StateRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO endpoint_state(key, id, project, region, ts, state) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (&rec.key, &rec.id, &rec.project, &rec.region, rec.ts, &rec.state_json),
        ).with_context(|| format!("saving state for {}", rec.key))?;
        tx.execute(
            "DELETE FROM endpoint_state
             WHERE key = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM endpoint_state WHERE key = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&rec.key, KEEP_PER_KEY),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("state_put_total", 1u64);
        debug!(key = %rec.key, id = %rec.id, "persist: saved state");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        Ok(self.history(key, Some(1))?.into_iter().next())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let db = self.conn()?;
        let n = db
            .execute("DELETE FROM endpoint_state WHERE key = ?1", [key])
            .with_context(|| format!("removing state for {}", key))?;
        counter!("state_remove_total", 1u64);
        Ok(n > 0)
    }

    fn list(&self) -> Result<Vec<StateRecord>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT key, id, project, region, ts, state FROM endpoint_state s
             WHERE rowid = (
                 SELECT rowid FROM endpoint_state WHERE key = s.key ORDER BY ts DESC, rowid DESC LIMIT 1
             )
             ORDER BY key",
        )?;
        let out = stmt.query_map([], row_to_record)?.collect::<rusqlite::Result<Vec<_>>>()?;
        histogram!("persist_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn history(&self, key: &str, limit: Option<usize>) -> Result<Vec<StateRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(KEEP_PER_KEY as usize);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT key, id, project, region, ts, state FROM endpoint_state
             WHERE key = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let out = stmt.query_map((key, cap as i64), row_to_record)?.collect::<rusqlite::Result<Vec<_>>>()?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".vtx");
        let _ = std::fs::create_dir_all(&p);
        p.push("state.db");
        return p.to_string_lossy().to_string();
    }
    "vtx-state.db".to_string()
}

pub fn now_ts() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// RFC 3339 rendering of a saved-at timestamp, falling back to the raw seconds.
pub fn format_ts(ts: i64) -> String {
    time::OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("vtx-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn rec(key: &str, ts: i64) -> StateRecord {
        StateRecord {
            key: key.into(),
            id: format!("projects/p/locations/us-central1/endpoints/{}", ts),
            project: "p".into(),
            region: "us-central1".into(),
            ts,
            state_json: format!(r#"{{"display_name":"v{}"}}"#, ts),
        }
    }

    #[test]
    fn put_get_rotate() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        for i in 0..5 {
            s.put(rec("svc-a", i)).unwrap();
        }
        let rows = s.history("svc-a", None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].ts, 4);
        assert_eq!(rows[1].ts, 3);
        assert_eq!(rows[2].ts, 2);
        assert_eq!(s.get("svc-a").unwrap().unwrap(), rec("svc-a", 4));
    }

    #[test]
    fn list_returns_latest_per_key() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        s.put(rec("b", 1)).unwrap();
        s.put(rec("a", 1)).unwrap();
        s.put(rec("a", 2)).unwrap();
        let all = s.list().unwrap();
        let keys: Vec<(&str, i64)> = all.iter().map(|r| (r.key.as_str(), r.ts)).collect();
        assert_eq!(keys, vec![("a", 2), ("b", 1)]);
    }

    #[test]
    fn remove_drops_all_snapshots() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        s.put(rec("a", 1)).unwrap();
        s.put(rec("a", 2)).unwrap();
        assert!(s.remove("a").unwrap());
        assert!(s.get("a").unwrap().is_none());
        assert!(!s.remove("a").unwrap());
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        assert_eq!(format_ts(0), "1970-01-01T00:00:00Z");
        assert!(now_ts() > 1_600_000_000);
    }
}
