//! campaign_group_subscribers repository.
//!
//! One row per `(campaign, subscriber)`; re-synced wholesale every run. The
//! email-keyed update helpers resolve the subscriber id through the
//! subscribers table so callers can work with the address they got from the
//! provider.

use super::{now_str, parse_ts, Database};
use crate::error::{SyncError, SyncResult};
use crate::models::CampaignGroupSubscriber;
use rusqlite::params;

const SELECT_COLS: &str =
    "campaign_id, subscriber_id, group_id, subscriber_tier, purchase_id, updated_at";

fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<CampaignGroupSubscriber> {
    let updated: String = row.get(5)?;
    Ok(CampaignGroupSubscriber {
        campaign_id: row.get(0)?,
        subscriber_id: row.get(1)?,
        group_id: row.get(2)?,
        subscriber_tier: row.get(3)?,
        purchase_id: row.get(4)?,
        updated_at: parse_ts(&updated),
    })
}

fn upsert_in_tx(
    tx: &rusqlite::Transaction<'_>,
    m: &CampaignGroupSubscriber,
) -> SyncResult<()> {
    tx.execute(
        "INSERT INTO campaign_group_subscribers
         (campaign_id, subscriber_id, group_id, subscriber_tier, purchase_id, purchased, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(campaign_id, subscriber_id) DO UPDATE SET
            group_id = excluded.group_id,
            subscriber_tier = excluded.subscriber_tier,
            purchase_id = excluded.purchase_id,
            purchased = excluded.purchased,
            updated_at = excluded.updated_at",
        params![
            &m.campaign_id,
            &m.subscriber_id,
            &m.group_id,
            m.subscriber_tier.to_uppercase(),
            m.purchase_id,
            m.purchase_id.is_some() as i64,
            now_str(),
        ],
    )?;
    Ok(())
}

fn subscriber_id_by_email(
    tx: &rusqlite::Transaction<'_>,
    email: &str,
) -> SyncResult<String> {
    let mut stmt = tx.prepare_cached("SELECT id FROM subscribers WHERE email = ?1")?;
    let mut rows = stmt.query([email.trim().to_lowercase()])?;
    match rows.next()? {
        Some(row) => Ok(row.get(0)?),
        None => Err(SyncError::Validation(format!("unknown subscriber {email}"))),
    }
}

impl Database {
    pub async fn get_membership(
        &self,
        campaign_id: &str,
        subscriber_id: &str,
    ) -> SyncResult<Option<CampaignGroupSubscriber>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM campaign_group_subscribers
             WHERE campaign_id = ?1 AND subscriber_id = ?2"
        ))?;
        let mut rows = stmt.query([campaign_id, subscriber_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_membership(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_memberships_for_campaign(
        &self,
        campaign_id: &str,
    ) -> SyncResult<Vec<CampaignGroupSubscriber>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM campaign_group_subscribers
             WHERE campaign_id = ?1 ORDER BY subscriber_id"
        ))?;
        let rows = stmt.query_map([campaign_id], row_to_membership)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn list_memberships_for_group(
        &self,
        group_id: &str,
    ) -> SyncResult<Vec<CampaignGroupSubscriber>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {SELECT_COLS} FROM campaign_group_subscribers
             WHERE group_id = ?1 ORDER BY subscriber_id"
        ))?;
        let rows = stmt.query_map([group_id], row_to_membership)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn upsert_membership(&self, m: &CampaignGroupSubscriber) -> SyncResult<()> {
        self.with_tx(|tx| upsert_in_tx(tx, m)).await
    }

    pub async fn upsert_memberships(
        &self,
        memberships: &[CampaignGroupSubscriber],
    ) -> SyncResult<usize> {
        self.with_tx(|tx| {
            for m in memberships {
                upsert_in_tx(tx, m)?;
            }
            Ok(memberships.len())
        })
        .await
    }

    /// Drops memberships of a group that are no longer present upstream.
    /// `keep` holds the subscriber ids observed in the latest enumeration.
    pub async fn prune_memberships_for_group(
        &self,
        group_id: &str,
        keep: &[String],
    ) -> SyncResult<usize> {
        let group_id = group_id.to_string();
        let keep: std::collections::HashSet<String> = keep.iter().cloned().collect();
        self.with_tx(move |tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT subscriber_id FROM campaign_group_subscribers WHERE group_id = ?1",
            )?;
            let present: Vec<String> = stmt
                .query_map([&group_id], |row| row.get::<_, String>(0))?
                .collect::<Result<_, _>>()?;
            drop(stmt);

            let mut removed = 0usize;
            for subscriber_id in present {
                if !keep.contains(&subscriber_id) {
                    removed += tx.execute(
                        "DELETE FROM campaign_group_subscribers
                         WHERE group_id = ?1 AND subscriber_id = ?2",
                        params![&group_id, &subscriber_id],
                    )?;
                }
            }
            Ok(removed)
        })
        .await
    }

    pub async fn update_subscriber_tier(
        &self,
        email: &str,
        campaign_id: &str,
        tier: &str,
    ) -> SyncResult<()> {
        let email = email.to_string();
        let campaign_id = campaign_id.to_string();
        let tier = tier.to_uppercase();
        self.with_tx(move |tx| {
            let subscriber_id = subscriber_id_by_email(tx, &email)?;
            tx.execute(
                "UPDATE campaign_group_subscribers
                 SET subscriber_tier = ?1, updated_at = ?2
                 WHERE campaign_id = ?3 AND subscriber_id = ?4",
                params![&tier, now_str(), &campaign_id, &subscriber_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_subscriber_group(
        &self,
        email: &str,
        group_id: &str,
        campaign_id: &str,
    ) -> SyncResult<()> {
        let email = email.to_string();
        let group_id = group_id.to_string();
        let campaign_id = campaign_id.to_string();
        self.with_tx(move |tx| {
            let subscriber_id = subscriber_id_by_email(tx, &email)?;
            tx.execute(
                "UPDATE campaign_group_subscribers
                 SET group_id = ?1, updated_at = ?2
                 WHERE campaign_id = ?3 AND subscriber_id = ?4",
                params![&group_id, now_str(), &campaign_id, &subscriber_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn update_subscriber_purchase_status(
        &self,
        email: &str,
        campaign_id: &str,
        purchased: bool,
    ) -> SyncResult<()> {
        let email = email.to_string();
        let campaign_id = campaign_id.to_string();
        self.with_tx(move |tx| {
            let subscriber_id = subscriber_id_by_email(tx, &email)?;
            if purchased {
                tx.execute(
                    "UPDATE campaign_group_subscribers
                     SET purchased = 1, updated_at = ?1
                     WHERE campaign_id = ?2 AND subscriber_id = ?3",
                    params![now_str(), &campaign_id, &subscriber_id],
                )?;
            } else {
                tx.execute(
                    "UPDATE campaign_group_subscribers
                     SET purchased = 0, purchase_id = NULL, updated_at = ?1
                     WHERE campaign_id = ?2 AND subscriber_id = ?3",
                    params![now_str(), &campaign_id, &subscriber_id],
                )?;
            }
            Ok(())
        })
        .await
    }
}
