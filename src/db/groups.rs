//! Group repository. One row per `(campaign, tier)` audience upstream.

use super::Database;
use crate::error::SyncResult;
use crate::models::Group;
use rusqlite::params;

fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        group_name: row.get(1)?,
        campaign_id: row.get(2)?,
    })
}

fn upsert_in_tx(tx: &rusqlite::Transaction<'_>, group: &Group) -> SyncResult<()> {
    tx.execute(
        "INSERT INTO groups (id, group_name, campaign_id)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            group_name = excluded.group_name,
            campaign_id = excluded.campaign_id",
        params![&group.id, group.group_name.to_uppercase(), &group.campaign_id],
    )?;
    Ok(())
}

impl Database {
    pub async fn get_group_by_id(&self, id: &str) -> SyncResult<Option<Group>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id, group_name, campaign_id FROM groups WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_group(row)?)),
            None => Ok(None),
        }
    }

    /// Group names are matched case-insensitively; everything is stored
    /// uppercase.
    pub async fn get_group_by_name(&self, group_name: &str) -> SyncResult<Option<Group>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT id, group_name, campaign_id FROM groups WHERE group_name = ?1")?;
        let mut rows = stmt.query([group_name.to_uppercase()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_group(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_groups(&self) -> SyncResult<Vec<Group>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT id, group_name, campaign_id FROM groups ORDER BY group_name")?;
        let rows = stmt.query_map([], row_to_group)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn list_groups_for_campaign(&self, campaign_id: &str) -> SyncResult<Vec<Group>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, group_name, campaign_id FROM groups WHERE campaign_id = ?1 ORDER BY group_name",
        )?;
        let rows = stmt.query_map([campaign_id], row_to_group)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn upsert_group(&self, group: &Group) -> SyncResult<()> {
        self.with_tx(|tx| upsert_in_tx(tx, group)).await
    }

    pub async fn upsert_groups(&self, groups: &[Group]) -> SyncResult<usize> {
        self.with_tx(|tx| {
            for group in groups {
                upsert_in_tx(tx, group)?;
            }
            Ok(groups.len())
        })
        .await
    }

    /// Removes a group and its memberships; used by the validation sweep when
    /// the group vanished upstream.
    pub async fn delete_group(&self, id: &str) -> SyncResult<bool> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM campaign_group_subscribers WHERE group_id = ?1",
                [id],
            )?;
            let n = tx.execute("DELETE FROM groups WHERE id = ?1", [id])?;
            Ok(n > 0)
        })
        .await
    }
}
