//! Persistence layer.
//!
//! One sqlite database owns every local table. Repositories are grouped per
//! entity in the submodules; they all go through the shared connection here.
//! Writes that span multiple rows run inside a single transaction with a
//! bounded retry on busy/locked.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

mod campaigns;
mod fields;
mod groups;
mod memberships;
mod subscribers;
mod sync_log;
mod transitions;

/// Budget for one transactional batch, including busy retries.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

const BUSY_RETRY_BASE_MS: u64 = 100;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &str) -> SyncResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SyncResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                product_id TEXT,
                artist TEXT,
                album TEXT,
                year INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS fields (
                id TEXT PRIMARY KEY,
                field_name TEXT NOT NULL,
                campaign_id TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                group_name TEXT NOT NULL UNIQUE,
                campaign_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_groups_campaign ON groups(campaign_id);
            CREATE TABLE IF NOT EXISTS subscribers (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                first_name TEXT,
                last_name TEXT,
                display_name TEXT,
                fields_json TEXT NOT NULL DEFAULT '{}',
                subscribed_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS campaign_group_subscribers (
                campaign_id TEXT NOT NULL,
                subscriber_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                subscriber_tier TEXT NOT NULL,
                purchase_id INTEGER,
                purchased INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (campaign_id, subscriber_id)
            );
            CREATE INDEX IF NOT EXISTS idx_cgs_group ON campaign_group_subscribers(group_id);
            CREATE TABLE IF NOT EXISTS transitions (
                id TEXT PRIMARY KEY,
                source_campaign_id TEXT NOT NULL,
                destination_campaign_id TEXT NOT NULL,
                status TEXT NOT NULL,
                count_transferred INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE TABLE IF NOT EXISTS transition_subscribers (
                transition_id TEXT NOT NULL,
                subscriber_id TEXT NOT NULL,
                PRIMARY KEY (transition_id, subscriber_id)
            );
            CREATE TABLE IF NOT EXISTS sync_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sync_date TEXT NOT NULL,
                status TEXT NOT NULL,
                synced_subscribers INTEGER NOT NULL DEFAULT 0,
                notes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sync_log_date ON sync_log(sync_date DESC);
            CREATE TABLE IF NOT EXISTS kv_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` inside a transaction. Busy/locked errors are retried with a
    /// linear delay until [`TRANSACTION_TIMEOUT`] is spent; anything else
    /// rolls back and surfaces immediately.
    pub async fn with_tx<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: Fn(&rusqlite::Transaction<'_>) -> SyncResult<T>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = {
                let mut conn = self.conn.lock().await;
                let tx = conn.transaction()?;
                match f(&tx) {
                    Ok(value) => {
                        tx.commit()?;
                        Ok(value)
                    }
                    Err(e) => {
                        // Drop of `tx` rolls back.
                        Err(e)
                    }
                }
            };
            match result {
                Ok(value) => return Ok(value),
                Err(SyncError::TransientDb(msg)) => {
                    if started.elapsed() >= TRANSACTION_TIMEOUT {
                        return Err(SyncError::TransientDb(format!(
                            "transaction budget exhausted after {attempt} attempts: {msg}"
                        )));
                    }
                    warn!("transient db error on attempt {attempt}: {msg}");
                    tokio::time::sleep(Duration::from_millis(
                        BUSY_RETRY_BASE_MS * u64::from(attempt),
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Shared read access for one-shot queries.
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    // kv_state backs the progress/error store.

    pub async fn kv_get(&self, key: &str) -> SyncResult<Option<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached("SELECT value FROM kv_state WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub async fn kv_set(&self, key: &str, value: &str) -> SyncResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![key, value, now_str()],
        )?;
        Ok(())
    }

    pub async fn kv_delete(&self, key: &str) -> SyncResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM kv_state WHERE key = ?1", [key])?;
        Ok(())
    }
}

pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_ts)
}
