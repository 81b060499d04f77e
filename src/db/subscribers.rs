//! Subscriber repository. Custom fields live as a JSON map per row.

use super::{now_str, parse_ts, parse_ts_opt, Database};
use crate::error::SyncResult;
use crate::models::{Subscriber, SubscriberStatus};
use rusqlite::params;
use std::collections::HashMap;

const SELECT_COLS: &str =
    "id, email, status, first_name, last_name, display_name, fields_json, subscribed_at, updated_at";

fn row_to_subscriber(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscriber> {
    let status: String = row.get(2)?;
    let fields_json: String = row.get(6)?;
    let subscribed_at: Option<String> = row.get(7)?;
    let updated: String = row.get(8)?;
    Ok(Subscriber {
        id: row.get(0)?,
        email: row.get(1)?,
        status: SubscriberStatus::parse(&status),
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        display_name: row.get(5)?,
        fields: serde_json::from_str::<HashMap<String, String>>(&fields_json)
            .unwrap_or_default(),
        subscribed_at: parse_ts_opt(subscribed_at),
        updated_at: parse_ts(&updated),
    })
}

fn upsert_in_tx(tx: &rusqlite::Transaction<'_>, sub: &Subscriber) -> SyncResult<()> {
    let fields_json = serde_json::to_string(&sub.fields)
        .map_err(|e| crate::error::SyncError::Internal(format!("serialize fields: {e}")))?;
    tx.execute(
        "INSERT INTO subscribers
         (id, email, status, first_name, last_name, display_name, fields_json, subscribed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            email = excluded.email,
            status = excluded.status,
            first_name = excluded.first_name,
            last_name = excluded.last_name,
            display_name = excluded.display_name,
            fields_json = excluded.fields_json,
            subscribed_at = excluded.subscribed_at,
            updated_at = excluded.updated_at",
        params![
            &sub.id,
            sub.email.to_lowercase(),
            sub.status.as_str(),
            sub.first_name.as_deref(),
            sub.last_name.as_deref(),
            sub.display_name.as_deref(),
            fields_json,
            sub.subscribed_at.map(|t| t.to_rfc3339()),
            now_str(),
        ],
    )?;
    Ok(())
}

impl Database {
    pub async fn get_subscriber_by_id(&self, id: &str) -> SyncResult<Option<Subscriber>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM subscribers WHERE id = ?1"
        ))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_subscriber(row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_subscriber_by_email(&self, email: &str) -> SyncResult<Option<Subscriber>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM subscribers WHERE email = ?1"
        ))?;
        let mut rows = stmt.query([email.trim().to_lowercase()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_subscriber(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_subscribers(&self) -> SyncResult<Vec<Subscriber>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM subscribers ORDER BY email ASC"
        ))?;
        let rows = stmt.query_map([], row_to_subscriber)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn count_subscribers(&self) -> SyncResult<u64> {
        let conn = self.lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM subscribers", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub async fn upsert_subscriber(&self, sub: &Subscriber) -> SyncResult<()> {
        self.with_tx(|tx| upsert_in_tx(tx, sub)).await
    }

    pub async fn upsert_subscribers(&self, subs: &[Subscriber]) -> SyncResult<usize> {
        self.with_tx(|tx| {
            for sub in subs {
                upsert_in_tx(tx, sub)?;
            }
            Ok(subs.len())
        })
        .await
    }

    pub async fn delete_subscriber(&self, id: &str) -> SyncResult<bool> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM campaign_group_subscribers WHERE subscriber_id = ?1",
                [id],
            )?;
            let n = tx.execute("DELETE FROM subscribers WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
        .await
    }
}
