//! sync_log repository: the durable audit of pipeline runs.

use super::{now_str, parse_ts, Database};
use crate::error::SyncResult;
use crate::models::{SyncRecord, SyncRunStatus};
use chrono::{Duration, Utc};
use rusqlite::params;

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRecord> {
    let date: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(SyncRecord {
        id: row.get(0)?,
        sync_date: parse_ts(&date),
        status: SyncRunStatus::parse(&status),
        synced_subscribers: row.get(3)?,
        notes: row.get(4)?,
    })
}

impl Database {
    /// Inserts a new run row and returns its id.
    pub async fn insert_sync_record(&self, status: SyncRunStatus) -> SyncResult<i64> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO sync_log (sync_date, status, synced_subscribers, notes)
             VALUES (?1, ?2, 0, NULL)",
            params![now_str(), status.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Updates the run row in place; the id comes from
    /// [`Database::insert_sync_record`].
    pub async fn upsert_sync_record(
        &self,
        id: i64,
        status: SyncRunStatus,
        synced_subscribers: i64,
        notes: Option<&str>,
    ) -> SyncResult<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE sync_log
             SET status = ?1, synced_subscribers = ?2, notes = ?3
             WHERE id = ?4",
            params![status.as_str(), synced_subscribers, notes, id],
        )?;
        Ok(())
    }

    pub async fn get_sync_record(&self, id: i64) -> SyncResult<Option<SyncRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, sync_date, status, synced_subscribers, notes FROM sync_log WHERE id = ?1",
        )?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_sync_records(&self, limit: usize) -> SyncResult<Vec<SyncRecord>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, sync_date, status, synced_subscribers, notes
             FROM sync_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], row_to_record)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Drops run rows older than the retention window.
    pub async fn prune_sync_log(&self, retention_days: i64) -> SyncResult<usize> {
        let cutoff = (Utc::now() - Duration::days(retention_days.max(1))).to_rfc3339();
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM sync_log WHERE sync_date < ?1", [cutoff])?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_sync_record(SyncRunStatus::Running).await.unwrap();
        db.upsert_sync_record(id, SyncRunStatus::Completed, 42, Some("ok"))
            .await
            .unwrap();

        let rec = db.get_sync_record(id).await.unwrap().unwrap();
        assert_eq!(rec.status, SyncRunStatus::Completed);
        assert_eq!(rec.synced_subscribers, 42);
        assert_eq!(rec.notes.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn newest_first_listing() {
        let db = Database::open_in_memory().unwrap();
        let first = db.insert_sync_record(SyncRunStatus::Running).await.unwrap();
        let second = db.insert_sync_record(SyncRunStatus::Running).await.unwrap();
        let all = db.list_sync_records(10).await.unwrap();
        assert_eq!(all[0].id, second);
        assert_eq!(all[1].id, first);
    }

    #[tokio::test]
    async fn prune_keeps_recent_rows() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_sync_record(SyncRunStatus::Completed).await.unwrap();
        {
            let conn = db.lock().await;
            conn.execute(
                "UPDATE sync_log SET sync_date = '2020-01-01T00:00:00+00:00' WHERE id = ?1",
                [id],
            )
            .unwrap();
        }
        db.insert_sync_record(SyncRunStatus::Completed).await.unwrap();

        let pruned = db.prune_sync_log(30).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(db.list_sync_records(10).await.unwrap().len(), 1);
    }
}
