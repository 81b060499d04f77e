//! Five-stage sync pipeline.
//!
//! Stage order is fixed because each stage depends on ids produced by the
//! previous one: campaigns → fields → groups → subscribers → memberships.
//! Every stage is resumable from the durable checkpoint, honours the stop
//! flag between paginated requests, and reports progress after each batch.

use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::models::{
    Campaign, CampaignGroupSubscriber, ErrorQueueEntry, Field, Group, ProgressCheckpoint,
    Subscriber, SyncRunStatus, SyncStatus,
};
use crate::providers::dds::{self, DdsApi};
use crate::providers::mlp::MlpApi;
use crate::sync::guard::{process_memory_bytes, ErrorSlot, ResourceGuard};
use crate::sync::progress::ProgressStore;
use crate::tiers::TierEngine;
use crate::validators;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const TOTAL_STAGES: u32 = 5;

/// In-flight page batches between the fetch task and the persistence loop.
const PAGE_CHANNEL_CAP: usize = 4;

/// Bound on the sales walk when recovering an order id for one subscriber.
const ORDER_SCAN_PAGE_CAP: u32 = 50;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub batch_size: usize,
    pub subscribers_per_page: u32,
    pub max_pages_per_run: u32,
    pub log_retention_days: i64,
    pub product_codes: HashMap<String, String>,
    pub max_processing: Duration,
    pub memory_limit_bytes: u64,
    pub memory_threshold_pct: f64,
}

impl PipelineOptions {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            batch_size: cfg.batch_size,
            subscribers_per_page: cfg.subscribers_per_page,
            max_pages_per_run: cfg.max_pages_per_run,
            log_retention_days: cfg.log_retention_days,
            product_codes: cfg.tiers.product_codes.clone(),
            max_processing: Duration::from_secs(cfg.max_processing_secs),
            memory_limit_bytes: cfg.memory_limit_bytes,
            memory_threshold_pct: cfg.memory_threshold_pct,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub record_id: i64,
    pub status: SyncRunStatus,
    pub subscribers_synced: u64,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct GroupSweepReport {
    pub checked: usize,
    pub deleted: Vec<String>,
}

enum StageOutcome {
    Done { processed: u64 },
    Halted { checkpoint: ProgressCheckpoint, processed: u64, reason: String },
}

/// How the stage-4 fetch task ended.
enum FetchEnd {
    Exhausted,
    Stopped { checkpoint: ProgressCheckpoint },
    PageBudget { checkpoint: ProgressCheckpoint },
    ConsumerGone,
}

pub struct SyncPipeline {
    db: Database,
    mlp: Arc<dyn MlpApi>,
    dds: Option<Arc<dyn DdsApi>>,
    tiers: Arc<TierEngine>,
    progress: ProgressStore,
    opts: PipelineOptions,
    cache_flushers: Vec<Arc<dyn Fn() + Send + Sync>>,
    last_error: ErrorSlot,
}

impl SyncPipeline {
    pub fn new(
        db: Database,
        mlp: Arc<dyn MlpApi>,
        dds: Option<Arc<dyn DdsApi>>,
        tiers: Arc<TierEngine>,
        progress: ProgressStore,
        opts: PipelineOptions,
    ) -> Self {
        Self {
            db,
            mlp,
            dds,
            tiers,
            progress,
            opts,
            cache_flushers: Vec::new(),
            last_error: ErrorSlot::default(),
        }
    }

    /// Registers a cache to shed when the memory threshold is crossed.
    pub fn with_cache_flusher(mut self, flusher: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.cache_flushers.push(flusher);
        self
    }

    /// The slot the run's guard records stage errors into. Hand this to
    /// [`crate::sync::guard::install_shutdown_hook`] so a crash mid-run
    /// still produces a failure record with the real cause.
    pub fn error_slot(&self) -> ErrorSlot {
        Arc::clone(&self.last_error)
    }

    /// Runs all five stages, resuming from a checkpoint when one is present.
    pub async fn run(&self) -> SyncResult<RunSummary> {
        let lock_ttl = self.opts.max_processing + Duration::from_secs(60);
        if !self.progress.acquire_run_lock(lock_ttl).await? {
            return Err(SyncError::Validation(
                "another sync run holds the lock".into(),
            ));
        }
        let result = self.run_locked().await;
        self.progress.release_run_lock().await.ok();
        result
    }

    async fn run_locked(&self) -> SyncResult<RunSummary> {
        self.progress.clear_stop_flag().await?;
        if self.opts.log_retention_days > 0 {
            match self.db.prune_sync_log(self.opts.log_retention_days).await {
                Ok(0) => {}
                Ok(n) => debug!("pruned {n} sync_log rows past retention"),
                Err(e) => warn!("sync_log prune failed: {e}"),
            }
        }

        let record_id = self.db.insert_sync_record(SyncRunStatus::Running).await?;
        let guard = ResourceGuard::new(
            self.opts.max_processing,
            self.opts.memory_limit_bytes,
            self.opts.memory_threshold_pct,
        )
        .with_error_slot(Arc::clone(&self.last_error));

        let mut resume = self.validated_checkpoint().await?;
        let start_stage = resume
            .as_ref()
            .map(|c| c.stage)
            .unwrap_or(1)
            .clamp(1, TOTAL_STAGES);
        if start_stage > 1 {
            info!("resuming sync from stage {start_stage}");
        }

        let mut subscribers_synced: u64 = 0;
        for stage in start_stage..=TOTAL_STAGES {
            let stage_resume = resume.take().filter(|c| c.stage == stage);
            self.publish_status(
                SyncRunStatus::Running,
                stage,
                stage_message(stage),
                0,
                Some(subscribers_synced),
                None,
            )
            .await?;
            info!("stage {stage}/{TOTAL_STAGES}: {}", stage_message(stage));

            let outcome = match stage {
                1 => self.stage_campaigns(&guard).await,
                2 => self.stage_fields(&guard).await,
                3 => self.stage_groups(&guard).await,
                4 => self.stage_subscribers(&guard, stage_resume).await,
                5 => self.stage_memberships(&guard, stage_resume).await,
                _ => Err(SyncError::Internal(format!("no such stage {stage}"))),
            };

            match outcome {
                Ok(StageOutcome::Done { processed }) => {
                    if stage == 4 {
                        subscribers_synced = processed;
                    }
                    if stage < TOTAL_STAGES {
                        self.progress
                            .save_checkpoint(&ProgressCheckpoint::at_stage(stage + 1))
                            .await?;
                    }
                    self.publish_status(
                        SyncRunStatus::Running,
                        stage,
                        &format!("{} done", stage_message(stage)),
                        processed,
                        Some(subscribers_synced),
                        None,
                    )
                    .await?;
                }
                Ok(StageOutcome::Halted {
                    checkpoint,
                    processed,
                    reason,
                }) => {
                    if stage == 4 {
                        subscribers_synced = processed;
                    }
                    self.progress.save_checkpoint(&checkpoint).await?;
                    self.db
                        .upsert_sync_record(
                            record_id,
                            SyncRunStatus::Stopped,
                            subscribers_synced as i64,
                            Some(&reason),
                        )
                        .await?;
                    self.publish_status(
                        SyncRunStatus::Stopped,
                        stage,
                        &reason,
                        processed,
                        Some(subscribers_synced),
                        None,
                    )
                    .await?;
                    info!("sync stopped at stage {stage}: {reason}");
                    return Ok(RunSummary {
                        record_id,
                        status: SyncRunStatus::Stopped,
                        subscribers_synced,
                        message: reason,
                    });
                }
                Err(e) => {
                    guard.record_error(e.to_string());
                    let message = format!("stage {stage} failed: {e}");
                    error!("{message}");
                    self.db
                        .upsert_sync_record(
                            record_id,
                            SyncRunStatus::Failed,
                            subscribers_synced as i64,
                            Some(&message),
                        )
                        .await
                        .ok();
                    self.publish_status(
                        SyncRunStatus::Failed,
                        stage,
                        &message,
                        0,
                        Some(subscribers_synced),
                        Some(e.to_string()),
                    )
                    .await
                    .ok();
                    return Err(e);
                }
            }
        }

        self.progress.clear_checkpoint().await?;
        self.db
            .upsert_sync_record(
                record_id,
                SyncRunStatus::Completed,
                subscribers_synced as i64,
                Some("sync completed"),
            )
            .await?;
        self.publish_status(
            SyncRunStatus::Completed,
            TOTAL_STAGES,
            "sync completed",
            subscribers_synced,
            Some(subscribers_synced),
            None,
        )
        .await?;
        info!("sync completed, {subscribers_synced} subscribers");
        Ok(RunSummary {
            record_id,
            status: SyncRunStatus::Completed,
            subscribers_synced,
            message: "sync completed".into(),
        })
    }

    // Stage 1: ensure every campaign exists upstream and locally.
    async fn stage_campaigns(&self, guard: &ResourceGuard) -> SyncResult<StageOutcome> {
        if let Some(reason) = self.halt_reason(guard).await? {
            return Ok(StageOutcome::Halted {
                checkpoint: ProgressCheckpoint::at_stage(1),
                processed: 0,
                reason,
            });
        }

        let upstream = self.mlp.list_campaigns_name_to_id().await?;
        let local = self.db.list_campaigns().await?;
        let mut by_name: HashMap<String, Campaign> = local
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();

        let mut batch: Vec<Campaign> = Vec::new();
        for (name, id) in &upstream {
            if !validators::passes(&validators::validate_campaign_name(name)) {
                debug!("ignoring upstream campaign with non-conforming name: {name}");
                continue;
            }
            let mut campaign = by_name
                .remove(&name.to_uppercase())
                .unwrap_or_else(|| Campaign::new(id.clone(), name.clone()));
            if campaign.id != *id {
                // The draft placeholder got a real upstream id.
                self.db.delete_campaign(&campaign.id).await?;
                campaign.id = id.clone();
            }
            fill_campaign_metadata(&mut campaign);
            batch.push(campaign);
        }

        // Local campaigns the provider has never seen: create drafts.
        for (name, mut campaign) in by_name {
            let issues = validators::validate_campaign_name(&name);
            if !validators::passes(&issues) {
                self.enqueue(&SyncError::Validation(issues[0].message.clone()), Some(name))
                    .await;
                continue;
            }
            let id = self
                .mlp
                .create_draft_campaign(&campaign.name, "regular", &campaign.name)
                .await?;
            if campaign.id != id {
                self.db.delete_campaign(&campaign.id).await?;
                campaign.id = id;
            }
            fill_campaign_metadata(&mut campaign);
            batch.push(campaign);
        }

        // Attach store products where the title resolves.
        if let Some(dds_api) = &self.dds {
            for campaign in batch.iter_mut().filter(|c| c.product_id.is_none()) {
                let parts: Vec<&str> = campaign.name.splitn(3, '_').collect();
                if parts.len() < 3 {
                    continue;
                }
                match dds::find_product_by_title_pattern(
                    dds_api.as_ref(),
                    &self.opts.product_codes,
                    parts[1],
                    parts[2],
                )
                .await
                {
                    Ok(Some(product_id)) => campaign.product_id = Some(product_id),
                    Ok(None) => debug!("no store product for campaign {}", campaign.name),
                    Err(e) if !e.is_fatal() => {
                        self.enqueue(&e, Some(campaign.name.clone())).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let n = self.db.upsert_campaigns(&batch).await?;
        Ok(StageOutcome::Done { processed: n as u64 })
    }

    // Stage 2: one numeric `<CAMPAIGN>_PURCHASE` field per campaign.
    async fn stage_fields(&self, guard: &ResourceGuard) -> SyncResult<StageOutcome> {
        if let Some(reason) = self.halt_reason(guard).await? {
            return Ok(StageOutcome::Halted {
                checkpoint: ProgressCheckpoint::at_stage(2),
                processed: 0,
                reason,
            });
        }

        let upstream: HashMap<String, crate::providers::mlp::MlpField> = self
            .mlp
            .list_fields()
            .await?
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();

        let mut batch = Vec::new();
        for campaign in self.db.list_campaigns().await? {
            let field_name = campaign.purchase_field_name();
            let upstream_field = match upstream.get(&field_name) {
                Some(f) => f.clone(),
                None => self.mlp.create_field(&field_name, "number").await?,
            };
            batch.push(Field {
                id: upstream_field.id,
                field_name,
                campaign_id: campaign.id.clone(),
            });
        }
        let n = self.db.upsert_fields(&batch).await?;
        Ok(StageOutcome::Done { processed: n as u64 })
    }

    // Stage 3: one group per campaign × tier.
    async fn stage_groups(&self, guard: &ResourceGuard) -> SyncResult<StageOutcome> {
        let upstream: HashMap<String, crate::providers::mlp::MlpGroup> = self
            .mlp
            .list_groups()
            .await?
            .into_iter()
            .map(|g| (g.name.clone(), g))
            .collect();

        let mut batch = Vec::new();
        for campaign in self.db.list_campaigns().await? {
            if let Some(reason) = self.halt_reason(guard).await? {
                return Ok(StageOutcome::Halted {
                    checkpoint: ProgressCheckpoint::at_stage(3),
                    processed: batch.len() as u64,
                    reason,
                });
            }
            for tier in self.tiers.order() {
                let group_name = campaign.group_name_for_tier(tier);
                let upstream_group = match upstream.get(&group_name) {
                    Some(g) => g.clone(),
                    None => self.mlp.create_group(&group_name).await?,
                };
                batch.push(Group {
                    id: upstream_group.id,
                    group_name,
                    campaign_id: campaign.id.clone(),
                });
            }
        }
        let n = self.db.upsert_groups(&batch).await?;
        Ok(StageOutcome::Done { processed: n as u64 })
    }

    // Stage 4: enumerate every subscriber upstream. Page fetches overlap
    // with persistence through a bounded channel.
    async fn stage_subscribers(
        &self,
        guard: &ResourceGuard,
        resume: Option<ProgressCheckpoint>,
    ) -> SyncResult<StageOutcome> {
        let start_cursor = resume.as_ref().and_then(|c| c.cursor.clone());
        let start_page = resume.as_ref().map(|c| c.next_page).unwrap_or(1).max(1);
        let per_page = self.opts.subscribers_per_page;
        let page_budget = self.opts.max_pages_per_run.max(1);

        type PageMsg = (u32, Vec<Subscriber>, Option<String>);
        let (tx, mut rx) = mpsc::channel::<PageMsg>(PAGE_CHANNEL_CAP);

        let mlp = Arc::clone(&self.mlp);
        let progress = self.progress.clone();
        let fetcher = tokio::spawn(async move {
            let mut cursor = start_cursor;
            let mut page = start_page;
            let mut fetched = 0u32;
            loop {
                let checkpoint = ProgressCheckpoint {
                    stage: 4,
                    campaign_id: None,
                    group_id: None,
                    next_page: page,
                    cursor: cursor.clone(),
                    retry_count: 0,
                };
                if progress.is_stopped().await.unwrap_or(false) {
                    return SyncResult::Ok(FetchEnd::Stopped { checkpoint });
                }
                if fetched >= page_budget {
                    return Ok(FetchEnd::PageBudget { checkpoint });
                }
                let batch = mlp.list_subscribers(cursor.as_deref(), per_page).await?;
                let next_cursor = batch.next_cursor.clone();
                let last = next_cursor.is_none() || batch.subscribers.is_empty();
                if tx
                    .send((page, batch.subscribers, next_cursor.clone()))
                    .await
                    .is_err()
                {
                    return Ok(FetchEnd::ConsumerGone);
                }
                if last {
                    return Ok(FetchEnd::Exhausted);
                }
                cursor = next_cursor;
                page += 1;
                fetched += 1;
            }
        });

        let mut processed: u64 = 0;
        let mut budget_halt: Option<String> = None;
        let mut fatal: Option<SyncError> = None;
        while let Some((page, subscribers, next_cursor)) = rx.recv().await {
            let mut valid = Vec::with_capacity(subscribers.len());
            for sub in subscribers {
                let issues = validators::validate_email(&sub.email);
                if validators::passes(&issues) {
                    valid.push(sub);
                } else {
                    self.enqueue(
                        &SyncError::Validation(issues[0].message.clone()),
                        Some(sub.email.clone()),
                    )
                    .await;
                }
            }

            for chunk in valid.chunks(self.opts.batch_size.max(1)) {
                match self.db.upsert_subscribers(chunk).await {
                    Ok(n) => processed += n as u64,
                    Err(e) if e.is_fatal() => {
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => {
                        // Batch rolled back; enqueue and continue with the
                        // next one.
                        self.enqueue(&e, Some(format!("subscriber page {page}"))).await;
                    }
                }
            }
            if fatal.is_some() {
                break;
            }

            self.progress
                .save_checkpoint(&ProgressCheckpoint {
                    stage: 4,
                    campaign_id: None,
                    group_id: None,
                    next_page: page + 1,
                    cursor: next_cursor,
                    retry_count: 0,
                })
                .await?;
            self.publish_status(
                SyncRunStatus::Running,
                4,
                &format!("synced subscriber page {page}"),
                processed,
                Some(processed),
                None,
            )
            .await?;

            if !guard.can_continue() {
                guard.manage_memory(
                    &self
                        .cache_flushers
                        .iter()
                        .map(|f| f.as_ref() as &(dyn Fn() + Send + Sync))
                        .collect::<Vec<_>>(),
                );
                if !guard.can_continue() {
                    budget_halt = Some("processing budget exceeded".to_string());
                    break;
                }
            }
        }
        drop(rx);
        if let Some(e) = fatal {
            fetcher.abort();
            return Err(e);
        }

        let end = fetcher
            .await
            .map_err(|e| SyncError::Internal(format!("fetch task panicked: {e}")))??;

        if let Some(reason) = budget_halt {
            let checkpoint = self
                .progress
                .load_checkpoint()
                .await?
                .unwrap_or_else(|| ProgressCheckpoint::at_stage(4));
            return Ok(StageOutcome::Halted {
                checkpoint,
                processed,
                reason,
            });
        }
        match end {
            FetchEnd::Exhausted | FetchEnd::ConsumerGone => {
                Ok(StageOutcome::Done { processed })
            }
            FetchEnd::Stopped { checkpoint } => Ok(StageOutcome::Halted {
                checkpoint,
                processed,
                reason: "stop requested".into(),
            }),
            FetchEnd::PageBudget { checkpoint } => Ok(StageOutcome::Halted {
                checkpoint,
                processed,
                reason: "page budget reached".into(),
            }),
        }
    }

    // Stage 5: per-group membership reconciliation with tier and purchase
    // resolution.
    async fn stage_memberships(
        &self,
        guard: &ResourceGuard,
        resume: Option<ProgressCheckpoint>,
    ) -> SyncResult<StageOutcome> {
        let campaigns: HashMap<String, Campaign> = self
            .db
            .list_campaigns()
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        let groups = self.db.list_groups().await?;

        let resume_group = resume.as_ref().and_then(|c| c.group_id.clone());
        let resume_page = resume.as_ref().map(|c| c.next_page).unwrap_or(1).max(1);
        let mut skipping = resume_group.is_some();
        let mut processed: u64 = 0;

        for group in &groups {
            if skipping {
                if Some(&group.id) != resume_group.as_ref() {
                    continue;
                }
                skipping = false;
            }
            let Some(campaign) = campaigns.get(&group.campaign_id) else {
                warn!("group {} has no local campaign, skipping", group.group_name);
                continue;
            };
            let Some(tier) = group.tier_suffix(&campaign.name) else {
                debug!(
                    "group {} does not extend campaign {}, skipping",
                    group.group_name, campaign.name
                );
                continue;
            };
            if !self.tiers.is_known(&tier) {
                warn!("group {} carries unknown tier {tier}", group.group_name);
                continue;
            }

            let resumed_mid_group = Some(&group.id) == resume_group.as_ref() && resume_page > 1;
            let mut page = if resumed_mid_group { resume_page } else { 1 };
            let mut seen: Vec<String> = Vec::new();

            loop {
                if let Some(reason) = self.halt_reason(guard).await? {
                    return Ok(StageOutcome::Halted {
                        checkpoint: ProgressCheckpoint {
                            stage: 5,
                            campaign_id: Some(campaign.id.clone()),
                            group_id: Some(group.id.clone()),
                            next_page: page,
                            cursor: None,
                            retry_count: 0,
                        },
                        processed,
                        reason,
                    });
                }

                let subscribers = self
                    .mlp
                    .get_group_subscribers(&group.id, page, self.opts.subscribers_per_page)
                    .await?;
                if subscribers.is_empty() {
                    break;
                }
                let page_len = subscribers.len();

                let mut rows = Vec::with_capacity(page_len);
                for sub in subscribers {
                    let issues = validators::validate_email(&sub.email);
                    if !validators::passes(&issues) {
                        self.enqueue(
                            &SyncError::Validation(issues[0].message.clone()),
                            Some(sub.email.clone()),
                        )
                        .await;
                        continue;
                    }
                    seen.push(sub.id.clone());
                    let row = self.build_membership(campaign, group, &tier, sub).await;
                    rows.push(row);
                }

                match self.db.upsert_memberships(&rows).await {
                    Ok(n) => processed += n as u64,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        self.enqueue(&e, Some(format!("{} page {page}", group.group_name)))
                            .await;
                    }
                }

                self.progress
                    .save_checkpoint(&ProgressCheckpoint {
                        stage: 5,
                        campaign_id: Some(campaign.id.clone()),
                        group_id: Some(group.id.clone()),
                        next_page: page + 1,
                        cursor: None,
                        retry_count: 0,
                    })
                    .await?;
                self.publish_status(
                    SyncRunStatus::Running,
                    5,
                    &format!("reconciled {} page {page}", group.group_name),
                    processed,
                    None,
                    None,
                )
                .await?;

                if page_len < self.opts.subscribers_per_page as usize {
                    break;
                }
                page += 1;
            }

            // A partial enumeration cannot say who left the group.
            if !resumed_mid_group {
                self.db
                    .prune_memberships_for_group(&group.id, &seen)
                    .await?;
            }
        }

        Ok(StageOutcome::Done { processed })
    }

    /// Builds one membership row: tier from the group name, order id from the
    /// purchase field, store reconciliation, and the progression move when
    /// purchase evidence appears. Per-item provider failures degrade to the
    /// best row we can build.
    async fn build_membership(
        &self,
        campaign: &Campaign,
        group: &Group,
        tier: &str,
        sub: Subscriber,
    ) -> CampaignGroupSubscriber {
        let mut purchase_id: Option<i64> = None;
        if let Some(raw) = sub.purchase_field(&campaign.name) {
            match validators::parse_order_id(raw) {
                Some(id) => purchase_id = Some(id),
                None => {
                    self.enqueue(
                        &SyncError::Validation(format!(
                            "purchase field for {} is not an order id: {raw:?}",
                            sub.email
                        )),
                        Some(sub.email.clone()),
                    )
                    .await;
                }
            }
        }

        // No recorded order: ask the store whether one exists and write it
        // back upstream when found.
        if purchase_id.is_none() {
            if let (Some(dds_api), Some(product_id)) = (&self.dds, &campaign.product_id) {
                match dds_api.has_user_purchased(&sub.email, product_id).await {
                    Ok(true) => match self.find_order_for_email(product_id, &sub.email).await {
                        Ok(Some(order_id)) => {
                            purchase_id = Some(order_id);
                            let mut fields = HashMap::new();
                            fields.insert(
                                campaign.purchase_field_name().to_lowercase(),
                                order_id.to_string(),
                            );
                            if let Err(e) =
                                self.mlp.update_subscriber_fields(&sub.id, &fields).await
                            {
                                self.enqueue(&e, Some(sub.email.clone())).await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => self.enqueue(&e, Some(sub.email.clone())).await,
                    },
                    Ok(false) => {}
                    Err(e) if !e.is_fatal() => self.enqueue(&e, Some(sub.email.clone())).await,
                    Err(e) => {
                        warn!("purchase lookup failed fatally for {}: {e}", sub.email);
                    }
                }
            }
        }

        // Progression only advances on purchase evidence; demotions are the
        // transition executor's business.
        let mut final_tier = tier.to_uppercase();
        let mut group_id = group.id.clone();
        if purchase_id.is_some() {
            let next = self.tiers.next_tier(tier, true);
            if next != final_tier {
                match self
                    .db
                    .get_group_by_name(&campaign.group_name_for_tier(&next))
                    .await
                {
                    Ok(Some(dest)) => {
                        let moved = self.mlp.add_to_group(&sub.id, &dest.id).await;
                        match moved {
                            Ok(()) => {
                                if let Err(e) =
                                    self.mlp.remove_from_group(&sub.id, &group.id).await
                                {
                                    self.enqueue(&e, Some(sub.email.clone())).await;
                                }
                                final_tier = next;
                                group_id = dest.id;
                            }
                            Err(e) => self.enqueue(&e, Some(sub.email.clone())).await,
                        }
                    }
                    Ok(None) => {
                        warn!(
                            "no group for tier {next} in campaign {}, leaving {} in place",
                            campaign.name, sub.email
                        );
                    }
                    Err(e) => self.enqueue(&e, Some(sub.email.clone())).await,
                }
            }
        }

        CampaignGroupSubscriber {
            campaign_id: campaign.id.clone(),
            subscriber_id: sub.id,
            group_id,
            subscriber_tier: final_tier,
            purchase_id,
            updated_at: Utc::now(),
        }
    }

    /// Walks the product's sales looking for the subscriber's order id. The
    /// producer fetches pages ahead into a bounded channel; dropping the
    /// receiver ends it early once the order is found.
    async fn find_order_for_email(
        &self,
        product_id: &str,
        email: &str,
    ) -> SyncResult<Option<i64>> {
        let Some(dds_api) = &self.dds else {
            return Ok(None);
        };
        let email = email.to_lowercase();
        let mut rx = dds::spawn_sales_producer(
            Arc::clone(dds_api),
            Some(product_id.to_string()),
            1,
            100,
            PAGE_CHANNEL_CAP,
        );
        let mut pages = 0u32;
        while let Some(batch) = rx.recv().await {
            let batch = batch?;
            if batch.sales.is_empty() {
                return Ok(None);
            }
            if let Some(sale) = batch.sales.iter().find(|s| s.email.to_lowercase() == email) {
                return Ok(Some(sale.order_id));
            }
            pages += 1;
            if pages >= ORDER_SCAN_PAGE_CAP {
                warn!("order scan for product {product_id} hit the page bound");
                break;
            }
        }
        Ok(None)
    }

    /// Validation sweep: drop local groups that vanished upstream.
    pub async fn validate_groups(&self) -> SyncResult<GroupSweepReport> {
        let upstream: std::collections::HashSet<String> = self
            .mlp
            .list_groups()
            .await?
            .into_iter()
            .map(|g| g.id)
            .collect();
        let local = self.db.list_groups().await?;
        let checked = local.len();
        let mut deleted = Vec::new();
        for group in local {
            if !upstream.contains(&group.id) {
                info!("group {} vanished upstream, deleting", group.group_name);
                self.db.delete_group(&group.id).await?;
                deleted.push(group.group_name);
            }
        }
        Ok(GroupSweepReport { checked, deleted })
    }

    /// Loads the checkpoint, discarding it when its campaign or group no
    /// longer exists; the run then restarts cleanly from stage 1.
    async fn validated_checkpoint(&self) -> SyncResult<Option<ProgressCheckpoint>> {
        let Some(cp) = self.progress.load_checkpoint().await? else {
            return Ok(None);
        };
        if cp.stage < 1 || cp.stage > TOTAL_STAGES {
            self.progress.clear_checkpoint().await?;
            return Ok(None);
        }
        if let Some(group_id) = &cp.group_id {
            let still_upstream = self
                .mlp
                .list_groups()
                .await?
                .iter()
                .any(|g| &g.id == group_id);
            if !still_upstream {
                info!("checkpoint group {group_id} vanished upstream, restarting from stage 1");
                self.progress.clear_checkpoint().await?;
                return Ok(None);
            }
        }
        if let Some(campaign_id) = &cp.campaign_id {
            if self.db.get_campaign_by_id(campaign_id).await?.is_none() {
                info!("checkpoint campaign {campaign_id} is gone, restarting from stage 1");
                self.progress.clear_checkpoint().await?;
                return Ok(None);
            }
        }
        Ok(Some(cp))
    }

    /// Stop flag first, then the time/memory budget (with one cache flush
    /// attempt before giving up on memory).
    async fn halt_reason(&self, guard: &ResourceGuard) -> SyncResult<Option<String>> {
        if self.progress.is_stopped().await? {
            return Ok(Some("stop requested".into()));
        }
        if !guard.can_continue() {
            if guard.over_memory_threshold() {
                guard.manage_memory(
                    &self
                        .cache_flushers
                        .iter()
                        .map(|f| f.as_ref() as &(dyn Fn() + Send + Sync))
                        .collect::<Vec<_>>(),
                );
                if guard.can_continue() {
                    return Ok(None);
                }
            }
            return Ok(Some("processing budget exceeded".into()));
        }
        Ok(None)
    }

    /// `subscribers_synced: None` keeps the previously published count, so
    /// stage 5 progress does not clobber the stage 4 total.
    async fn publish_status(
        &self,
        state: SyncRunStatus,
        stage: u32,
        message: &str,
        processed: u64,
        subscribers_synced: Option<u64>,
        last_error: Option<String>,
    ) -> SyncResult<()> {
        let previous = self.progress.get_status().await.unwrap_or_else(|_| SyncStatus::idle());
        let last_sync_time = if state == SyncRunStatus::Completed {
            Some(Utc::now())
        } else {
            previous.last_sync_time
        };
        self.progress
            .set_status(&SyncStatus {
                state,
                stage,
                total_stages: TOTAL_STAGES,
                message: message.to_string(),
                processed,
                total: None,
                subscribers_synced: subscribers_synced.unwrap_or(previous.subscribers_synced),
                last_error: last_error.or(previous.last_error),
                last_sync_time,
                memory_usage_bytes: process_memory_bytes(),
            })
            .await
    }

    async fn enqueue(&self, e: &SyncError, item: Option<String>) {
        debug!("enqueueing {}: {e}", e.kind());
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

fn stage_message(stage: u32) -> &'static str {
    match stage {
        1 => "syncing campaigns",
        2 => "syncing purchase fields",
        3 => "syncing tier groups",
        4 => "syncing subscribers",
        5 => "syncing group memberships",
        _ => "unknown stage",
    }
}

/// Derives artist/album/year columns from a `YYYY_ARTIST_PRODUCT` name when
/// they are not already set.
fn fill_campaign_metadata(campaign: &mut Campaign) {
    let parts: Vec<&str> = campaign.name.splitn(3, '_').collect();
    if parts.len() < 3 {
        return;
    }
    if campaign.year.is_none() {
        campaign.year = parts[0].parse::<i32>().ok();
    }
    if campaign.artist.is_none() {
        campaign.artist = Some(parts[1].to_string());
    }
    if campaign.album.is_none() {
        campaign.album = Some(parts[2].to_string());
    }
}
