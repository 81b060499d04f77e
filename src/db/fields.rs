//! Purchase-field repository. One row per campaign.

use super::Database;
use crate::error::SyncResult;
use crate::models::Field;
use rusqlite::params;

fn row_to_field(row: &rusqlite::Row<'_>) -> rusqlite::Result<Field> {
    Ok(Field {
        id: row.get(0)?,
        field_name: row.get(1)?,
        campaign_id: row.get(2)?,
    })
}

fn upsert_in_tx(tx: &rusqlite::Transaction<'_>, field: &Field) -> SyncResult<()> {
    tx.execute(
        "INSERT INTO fields (id, field_name, campaign_id)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(campaign_id) DO UPDATE SET
            id = excluded.id,
            field_name = excluded.field_name",
        params![
            &field.id,
            field.field_name.to_uppercase(),
            &field.campaign_id
        ],
    )?;
    Ok(())
}

impl Database {
    pub async fn get_field_by_id(&self, id: &str) -> SyncResult<Option<Field>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id, field_name, campaign_id FROM fields WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_field(row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_field_by_name(&self, field_name: &str) -> SyncResult<Option<Field>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT id, field_name, campaign_id FROM fields WHERE field_name = ?1")?;
        let mut rows = stmt.query([field_name.to_uppercase()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_field(row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_field_for_campaign(&self, campaign_id: &str) -> SyncResult<Option<Field>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, field_name, campaign_id FROM fields WHERE campaign_id = ?1",
        )?;
        let mut rows = stmt.query([campaign_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_field(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_fields(&self) -> SyncResult<Vec<Field>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT id, field_name, campaign_id FROM fields ORDER BY field_name")?;
        let rows = stmt.query_map([], row_to_field)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn upsert_field(&self, field: &Field) -> SyncResult<()> {
        self.with_tx(|tx| upsert_in_tx(tx, field)).await
    }

    pub async fn upsert_fields(&self, fields: &[Field]) -> SyncResult<usize> {
        self.with_tx(|tx| {
            for field in fields {
                upsert_in_tx(tx, field)?;
            }
            Ok(fields.len())
        })
        .await
    }

    pub async fn delete_field(&self, id: &str) -> SyncResult<bool> {
        let conn = self.lock().await;
        let n = conn.execute("DELETE FROM fields WHERE id = ?1", [id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_field_per_campaign() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_field(&Field {
            id: "f1".into(),
            field_name: "2025_A_B_PURCHASE".into(),
            campaign_id: "c1".into(),
        })
        .await
        .unwrap();
        // Re-syncing the same campaign with a new upstream field id replaces
        // the row instead of adding a second one.
        db.upsert_field(&Field {
            id: "f2".into(),
            field_name: "2025_A_B_PURCHASE".into(),
            campaign_id: "c1".into(),
        })
        .await
        .unwrap();

        let all = db.list_fields().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "f2");
        let by_campaign = db.get_field_for_campaign("c1").await.unwrap().unwrap();
        assert_eq!(by_campaign.field_name, "2025_A_B_PURCHASE");
    }

    #[tokio::test]
    async fn lookup_by_name_is_uppercased() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_field(&Field {
            id: "f1".into(),
            field_name: "2025_a_b_purchase".into(),
            campaign_id: "c1".into(),
        })
        .await
        .unwrap();
        assert!(db
            .get_field_by_name("2025_a_b_purchase")
            .await
            .unwrap()
            .is_some());
    }
}
