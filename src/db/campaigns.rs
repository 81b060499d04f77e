//! Campaign repository.

use super::{now_str, parse_ts, Database};
use crate::error::SyncResult;
use crate::models::Campaign;
use rusqlite::params;

const SELECT_COLS: &str =
    "id, name, product_id, artist, album, year, created_at, updated_at";

fn row_to_campaign(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        product_id: row.get(2)?,
        artist: row.get(3)?,
        album: row.get(4)?,
        year: row.get(5)?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn upsert_in_tx(tx: &rusqlite::Transaction<'_>, campaign: &Campaign) -> SyncResult<()> {
    tx.execute(
        "INSERT INTO campaigns (id, name, product_id, artist, album, year, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            product_id = excluded.product_id,
            artist = excluded.artist,
            album = excluded.album,
            year = excluded.year,
            updated_at = excluded.updated_at",
        params![
            &campaign.id,
            campaign.name.to_uppercase(),
            campaign.product_id.as_deref(),
            campaign.artist.as_deref(),
            campaign.album.as_deref(),
            campaign.year,
            campaign.created_at.to_rfc3339(),
            now_str(),
        ],
    )?;
    Ok(())
}

impl Database {
    pub async fn get_campaign_by_id(&self, id: &str) -> SyncResult<Option<Campaign>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM campaigns WHERE id = ?1"
        ))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_campaign(row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_campaign_by_name(&self, name: &str) -> SyncResult<Option<Campaign>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM campaigns WHERE name = ?1"
        ))?;
        let mut rows = stmt.query([name.to_uppercase()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_campaign(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_campaigns(&self) -> SyncResult<Vec<Campaign>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM campaigns ORDER BY name ASC"
        ))?;
        let rows = stmt.query_map([], row_to_campaign)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn upsert_campaign(&self, campaign: &Campaign) -> SyncResult<()> {
        self.with_tx(|tx| upsert_in_tx(tx, campaign)).await
    }

    pub async fn upsert_campaigns(&self, campaigns: &[Campaign]) -> SyncResult<usize> {
        self.with_tx(|tx| {
            for campaign in campaigns {
                upsert_in_tx(tx, campaign)?;
            }
            Ok(campaigns.len())
        })
        .await
    }

    pub async fn delete_campaign(&self, id: &str) -> SyncResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM campaigns WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}
