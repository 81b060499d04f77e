//! Campaign transition executor.
//!
//! An out-of-band operator command: move cohorts from a source campaign to a
//! successor campaign, one transition-matrix row at a time. Rows that demand
//! purchase evidence verify each stored order id against the store before the
//! subscriber is allowed through.

use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::models::{Campaign, ErrorQueueEntry, Subscriber, TransitionStatus};
use crate::providers::dds::DdsApi;
use crate::providers::mlp::MlpApi;
use crate::sync::progress::ProgressStore;
use crate::tiers::TierEngine;
use crate::validators::{self, DailyTransitionCap};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TransitionReport {
    pub transition_id: String,
    pub transferred: i64,
    /// Matrix rows skipped because a group was missing, with the reason.
    pub skipped_rows: Vec<String>,
}

pub struct TransitionExecutor {
    db: Database,
    mlp: Arc<dyn MlpApi>,
    dds: Option<Arc<dyn DdsApi>>,
    tiers: Arc<TierEngine>,
    progress: ProgressStore,
    per_page: u32,
    max_daily_transitions: u32,
}

impl TransitionExecutor {
    pub fn new(
        db: Database,
        mlp: Arc<dyn MlpApi>,
        dds: Option<Arc<dyn DdsApi>>,
        tiers: Arc<TierEngine>,
        progress: ProgressStore,
        per_page: u32,
        max_daily_transitions: u32,
    ) -> Self {
        Self {
            db,
            mlp,
            dds,
            tiers,
            progress,
            per_page: per_page.max(1),
            max_daily_transitions,
        }
    }

    /// Resolves both campaigns, records the transition and walks the matrix.
    /// The audit row ends `Complete` with the transferred count, or `Failed`
    /// on an unhandled error.
    pub async fn run(
        &self,
        source_name: &str,
        destination_name: &str,
    ) -> SyncResult<TransitionReport> {
        let source = self
            .db
            .get_campaign_by_name(source_name)
            .await?
            .ok_or_else(|| {
                SyncError::Validation(format!("unknown source campaign {source_name}"))
            })?;
        let destination = self
            .db
            .get_campaign_by_name(destination_name)
            .await?
            .ok_or_else(|| {
                SyncError::Validation(format!("unknown destination campaign {destination_name}"))
            })?;

        let transition_id = self
            .db
            .log_transition(&source.id, &destination.id, TransitionStatus::Running)
            .await?;
        info!(
            "transition {transition_id}: {} -> {}",
            source.name, destination.name
        );

        match self.execute(&transition_id, &source, &destination).await {
            Ok(report) => {
                self.db
                    .update_transition(&transition_id, TransitionStatus::Complete, report.transferred)
                    .await?;
                info!(
                    "transition {transition_id} complete, {} transferred",
                    report.transferred
                );
                Ok(report)
            }
            Err(e) => {
                self.db
                    .update_transition(&transition_id, TransitionStatus::Failed, 0)
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        transition_id: &str,
        source: &Campaign,
        destination: &Campaign,
    ) -> SyncResult<TransitionReport> {
        let mut cap = DailyTransitionCap::new(self.max_daily_transitions);
        let mut transferred: i64 = 0;
        let mut skipped_rows = Vec::new();

        for row in self.tiers.matrix().to_vec() {
            if !self.tiers.is_known(&row.current_tier) || !self.tiers.is_known(&row.next_tier) {
                warn!(
                    "matrix row {} -> {} references unknown tiers, skipping",
                    row.current_tier, row.next_tier
                );
                skipped_rows.push(format!("{} -> {}: unknown tier", row.current_tier, row.next_tier));
                continue;
            }

            let source_group_name = source.group_name_for_tier(&row.current_tier);
            let destination_group_name = destination.group_name_for_tier(&row.next_tier);

            let Some(source_group) = self.db.get_group_by_name(&source_group_name).await? else {
                warn!("source group {source_group_name} missing, skipping row");
                skipped_rows.push(format!("{source_group_name}: missing source group"));
                continue;
            };
            let Some(destination_group) =
                self.db.get_group_by_name(&destination_group_name).await?
            else {
                warn!("destination group {destination_group_name} missing, skipping row");
                skipped_rows.push(format!("{destination_group_name}: missing destination group"));
                continue;
            };

            let members = self.fetch_group_members(&source_group.id).await?;
            debug!(
                "row {} -> {}: {} members in {}",
                row.current_tier,
                row.next_tier,
                members.len(),
                source_group_name
            );

            let mut kept: Vec<Subscriber> = Vec::new();
            for sub in members {
                if row.requires_purchase {
                    match self.verify_purchase(source, &sub).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!("{} has no verifiable order, filtered", sub.email);
                            continue;
                        }
                        Err(e) => {
                            self.enqueue(&e, Some(sub.email.clone())).await;
                            continue;
                        }
                    }
                }
                if !cap.allow(&sub.email) {
                    self.enqueue(
                        &SyncError::Validation(format!(
                            "{} exceeded {} transitions today",
                            sub.email, self.max_daily_transitions
                        )),
                        Some(sub.email.clone()),
                    )
                    .await;
                    continue;
                }
                kept.push(sub);
            }

            if kept.is_empty() {
                continue;
            }

            // A failed import loses this row, not the whole transition.
            match self
                .mlp
                .bulk_import_to_group(&kept, &destination_group.id)
                .await
            {
                Ok(_) => {
                    let ids: Vec<String> = kept.iter().map(|s| s.id.clone()).collect();
                    let inserted = self
                        .db
                        .bulk_upsert_transition_subscribers(transition_id, &ids)
                        .await?;
                    transferred += inserted as i64;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        "bulk import into {destination_group_name} failed: {e}; continuing"
                    );
                    self.enqueue(&e, Some(destination_group_name.clone())).await;
                    skipped_rows.push(format!("{destination_group_name}: import failed"));
                }
            }
        }

        Ok(TransitionReport {
            transition_id: transition_id.to_string(),
            transferred,
            skipped_rows,
        })
    }

    async fn fetch_group_members(&self, group_id: &str) -> SyncResult<Vec<Subscriber>> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let batch = self
                .mlp
                .get_group_subscribers(group_id, page, self.per_page)
                .await?;
            if batch.is_empty() {
                break;
            }
            let last = batch.len() < self.per_page as usize;
            out.extend(batch);
            if last {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    /// A subscriber passes a purchase-gated row iff the source campaign's
    /// purchase field holds a positive integer order id and the store
    /// confirms the order belongs to their email.
    async fn verify_purchase(&self, source: &Campaign, sub: &Subscriber) -> SyncResult<bool> {
        let Some(raw) = sub.purchase_field(&source.name) else {
            return Ok(false);
        };
        let Some(order_id) = validators::parse_order_id(raw) else {
            return Err(SyncError::Validation(format!(
                "purchase field for {} is not an order id: {raw:?}",
                sub.email
            )));
        };
        let Some(dds_api) = &self.dds else {
            return Err(SyncError::Configuration(
                "purchase verification requires store credentials".into(),
            ));
        };
        dds_api.validate_order(order_id, &sub.email).await
    }

    async fn enqueue(&self, e: &SyncError, item: Option<String>) {
        self.progress
            .enqueue_error(ErrorQueueEntry {
                kind: e.kind().to_string(),
                message: e.to_string(),
                item,
                retry_count: 0,
                last_attempt: Utc::now(),
            })
            .await
            .ok();
    }
}
