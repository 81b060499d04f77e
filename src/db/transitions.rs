//! Transition audit repository.

use super::{now_str, parse_ts, parse_ts_opt, Database};
use crate::error::SyncResult;
use crate::models::{Transition, TransitionStatus};
use rusqlite::params;
use uuid::Uuid;

const SELECT_COLS: &str = "id, source_campaign_id, destination_campaign_id, status, \
                           count_transferred, started_at, finished_at";

fn row_to_transition(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transition> {
    let status: String = row.get(3)?;
    let started: String = row.get(5)?;
    let finished: Option<String> = row.get(6)?;
    Ok(Transition {
        id: row.get(0)?,
        source_campaign_id: row.get(1)?,
        destination_campaign_id: row.get(2)?,
        status: TransitionStatus::parse(&status),
        count_transferred: row.get(4)?,
        started_at: parse_ts(&started),
        finished_at: parse_ts_opt(finished),
    })
}

impl Database {
    /// Creates the audit row for a transition run and returns its id.
    pub async fn log_transition(
        &self,
        source_campaign_id: &str,
        destination_campaign_id: &str,
        status: TransitionStatus,
    ) -> SyncResult<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO transitions
             (id, source_campaign_id, destination_campaign_id, status, count_transferred, started_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                &id,
                source_campaign_id,
                destination_campaign_id,
                status.as_str(),
                now_str(),
            ],
        )?;
        Ok(id)
    }

    pub async fn update_transition(
        &self,
        id: &str,
        status: TransitionStatus,
        count_transferred: i64,
    ) -> SyncResult<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE transitions
             SET status = ?1, count_transferred = ?2, finished_at = ?3
             WHERE id = ?4",
            params![status.as_str(), count_transferred, now_str(), id],
        )?;
        Ok(())
    }

    pub async fn get_transition(&self, id: &str) -> SyncResult<Option<Transition>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM transitions WHERE id = ?1"
        ))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_transition(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_transitions(&self, limit: usize) -> SyncResult<Vec<Transition>> {
        let limit = limit.clamp(1, 1000) as i64;
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM transitions ORDER BY started_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map([limit], row_to_transition)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Audit rows; duplicates across matrix rows collapse on the primary key.
    pub async fn bulk_upsert_transition_subscribers(
        &self,
        transition_id: &str,
        subscriber_ids: &[String],
    ) -> SyncResult<usize> {
        let transition_id = transition_id.to_string();
        let subscriber_ids = subscriber_ids.to_vec();
        self.with_tx(move |tx| {
            let mut inserted = 0usize;
            for subscriber_id in &subscriber_ids {
                inserted += tx.execute(
                    "INSERT OR IGNORE INTO transition_subscribers (transition_id, subscriber_id)
                     VALUES (?1, ?2)",
                    params![&transition_id, subscriber_id],
                )?;
            }
            Ok(inserted)
        })
        .await
    }

    pub async fn count_transition_subscribers(&self, transition_id: &str) -> SyncResult<i64> {
        let conn = self.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM transition_subscribers WHERE transition_id = ?1",
            [transition_id],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transition_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .log_transition("c1", "c2", TransitionStatus::Running)
            .await
            .unwrap();

        let t = db.get_transition(&id).await.unwrap().unwrap();
        assert_eq!(t.status, TransitionStatus::Running);
        assert_eq!(t.count_transferred, 0);
        assert!(t.finished_at.is_none());

        db.update_transition(&id, TransitionStatus::Complete, 2)
            .await
            .unwrap();
        let t = db.get_transition(&id).await.unwrap().unwrap();
        assert_eq!(t.status, TransitionStatus::Complete);
        assert_eq!(t.count_transferred, 2);
        assert!(t.finished_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_audit_rows_collapse() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .log_transition("c1", "c2", TransitionStatus::Running)
            .await
            .unwrap();
        let inserted = db
            .bulk_upsert_transition_subscribers(
                &id,
                &["s1".to_string(), "s2".to_string(), "s1".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(db.count_transition_subscribers(&id).await.unwrap(), 2);
    }
}
