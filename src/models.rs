use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A marketing wave (album release etc.) mirrored from MLP.
///
/// `name` is normalized uppercase in the form `YYYY_ARTIST_PRODUCT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub product_id: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.to_uppercase(),
            product_id: None,
            artist: None,
            album: None,
            year: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Name of the per-campaign purchase custom field upstream.
    pub fn purchase_field_name(&self) -> String {
        format!("{}_PURCHASE", self.name)
    }

    /// Upstream group name for one tier of this campaign.
    pub fn group_name_for_tier(&self, tier: &str) -> String {
        format!("{}_{}", self.name, tier.to_uppercase())
    }
}

/// An upstream custom subscriber attribute; exactly one per campaign,
/// named `<CAMPAIGN>_PURCHASE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub id: String,
    pub field_name: String,
    pub campaign_id: String,
}

/// An upstream audience representing one `(campaign, tier)` pair,
/// named `<CAMPAIGN>_<TIER>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub group_name: String,
    pub campaign_id: String,
}

impl Group {
    /// Tier suffix of the group name relative to its campaign name, e.g.
    /// `2025_A_B_GOLD` → `GOLD`. None when the name does not extend the
    /// campaign name.
    pub fn tier_suffix(&self, campaign_name: &str) -> Option<String> {
        let name = self.group_name.to_uppercase();
        let prefix = format!("{}_", campaign_name.to_uppercase());
        name.strip_prefix(&prefix).map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriberStatus {
    Active,
    Unsubscribed,
    Unconfirmed,
    Bounced,
    Junk,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriberStatus::Active => "active",
            SubscriberStatus::Unsubscribed => "unsubscribed",
            SubscriberStatus::Unconfirmed => "unconfirmed",
            SubscriberStatus::Bounced => "bounced",
            SubscriberStatus::Junk => "junk",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "unsubscribed" => SubscriberStatus::Unsubscribed,
            "unconfirmed" => SubscriberStatus::Unconfirmed,
            "bounced" => SubscriberStatus::Bounced,
            "junk" => SubscriberStatus::Junk,
            _ => SubscriberStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    /// Lower-cased; the canonical lookup key.
    pub email: String,
    pub status: SubscriberStatus,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    /// Custom field values keyed by lower-cased field name.
    pub fields: HashMap<String, String>,
    pub subscribed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    /// Value of the per-campaign purchase field, if present and non-empty.
    pub fn purchase_field(&self, campaign_name: &str) -> Option<&str> {
        let key = format!("{}_purchase", campaign_name.to_lowercase());
        self.fields.get(&key).map(|v| v.as_str()).filter(|v| !v.is_empty())
    }
}

/// Membership of one subscriber in one campaign, at one tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignGroupSubscriber {
    pub campaign_id: String,
    pub subscriber_id: String,
    pub group_id: String,
    pub subscriber_tier: String,
    /// DDS order id extracted from the per-campaign purchase field.
    pub purchase_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TransitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionStatus::Pending => "pending",
            TransitionStatus::Running => "running",
            TransitionStatus::Complete => "complete",
            TransitionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TransitionStatus::Running,
            "complete" => TransitionStatus::Complete,
            "failed" => TransitionStatus::Failed,
            _ => TransitionStatus::Pending,
        }
    }
}

/// One operator-commanded inter-campaign move.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub source_campaign_id: String,
    pub destination_campaign_id: String,
    pub status: TransitionStatus,
    pub count_transferred: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRunStatus {
    Running,
    Completed,
    Stopped,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Stopped => "stopped",
            SyncRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => SyncRunStatus::Completed,
            "stopped" => SyncRunStatus::Stopped,
            "failed" => SyncRunStatus::Failed,
            _ => SyncRunStatus::Running,
        }
    }
}

/// One row of sync_log: the durable audit of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: i64,
    pub sync_date: DateTime<Utc>,
    pub status: SyncRunStatus,
    pub synced_subscribers: i64,
    pub notes: Option<String>,
}

/// Live status published by the pipeline after every stage and page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncRunStatus,
    pub stage: u32,
    pub total_stages: u32,
    pub message: String,
    pub processed: u64,
    pub total: Option<u64>,
    pub subscribers_synced: u64,
    pub last_error: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub memory_usage_bytes: u64,
}

impl SyncStatus {
    pub fn idle() -> Self {
        Self {
            state: SyncRunStatus::Completed,
            stage: 0,
            total_stages: crate::sync::pipeline::TOTAL_STAGES,
            message: "idle".into(),
            processed: 0,
            total: None,
            subscribers_synced: 0,
            last_error: None,
            last_sync_time: None,
            memory_usage_bytes: 0,
        }
    }
}

/// Where a stopped or failed run resumes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    pub stage: u32,
    pub campaign_id: Option<String>,
    pub group_id: Option<String>,
    pub next_page: u32,
    /// Pagination cursor for cursor-driven enumerations (stage 4).
    pub cursor: Option<String>,
    pub retry_count: u32,
}

impl ProgressCheckpoint {
    pub fn at_stage(stage: u32) -> Self {
        Self {
            stage,
            campaign_id: None,
            group_id: None,
            next_page: 1,
            cursor: None,
            retry_count: 0,
        }
    }
}

/// One failed work item awaiting operator attention or retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorQueueEntry {
    pub kind: String,
    pub message: String,
    pub item: Option<String>,
    pub retry_count: u32,
    pub last_attempt: DateTime<Utc>,
}
