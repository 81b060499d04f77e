//! Durable progress and error store.
//!
//! All cross-cutting mutable state of a run lives here, persisted in the
//! kv_state table: live status, the stop flag, the resume checkpoint, the
//! bounded error queue and the run lock. Every mutation goes through this
//! interface so a crashed process leaves a resumable trail.

use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::models::{ErrorQueueEntry, ProgressCheckpoint, SyncStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const KEY_STATUS: &str = "sync_status";
const KEY_STOP_FLAG: &str = "sync_stop_flag";
const KEY_CHECKPOINT: &str = "sync_progress_checkpoint";
const KEY_ERROR_QUEUE: &str = "sync_error_queue";
const KEY_LOCK: &str = "sync_lock";

#[derive(Debug, Serialize, Deserialize)]
struct LockRow {
    token: String,
    expires_at: i64,
}

#[derive(Clone)]
pub struct ProgressStore {
    db: Database,
    max_errors: usize,
    own_lock_token: std::sync::Arc<Mutex<Option<String>>>,
}

impl ProgressStore {
    pub fn new(db: Database, max_errors: usize) -> Self {
        Self {
            db,
            max_errors: max_errors.max(1),
            own_lock_token: std::sync::Arc::new(Mutex::new(None)),
        }
    }

    pub async fn set_status(&self, status: &SyncStatus) -> SyncResult<()> {
        let raw = serde_json::to_string(status)
            .map_err(|e| SyncError::Internal(format!("serialize status: {e}")))?;
        self.db.kv_set(KEY_STATUS, &raw).await
    }

    pub async fn get_status(&self) -> SyncResult<SyncStatus> {
        match self.db.kv_get(KEY_STATUS).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| SyncError::Internal(format!("corrupt status row: {e}"))),
            None => Ok(SyncStatus::idle()),
        }
    }

    pub async fn set_stop_flag(&self) -> SyncResult<()> {
        self.db.kv_set(KEY_STOP_FLAG, "1").await
    }

    pub async fn clear_stop_flag(&self) -> SyncResult<()> {
        self.db.kv_delete(KEY_STOP_FLAG).await
    }

    pub async fn is_stopped(&self) -> SyncResult<bool> {
        Ok(self.db.kv_get(KEY_STOP_FLAG).await?.as_deref() == Some("1"))
    }

    pub async fn save_checkpoint(&self, checkpoint: &ProgressCheckpoint) -> SyncResult<()> {
        let raw = serde_json::to_string(checkpoint)
            .map_err(|e| SyncError::Internal(format!("serialize checkpoint: {e}")))?;
        debug!(
            "checkpoint: stage {} page {} campaign {:?}",
            checkpoint.stage, checkpoint.next_page, checkpoint.campaign_id
        );
        self.db.kv_set(KEY_CHECKPOINT, &raw).await
    }

    pub async fn load_checkpoint(&self) -> SyncResult<Option<ProgressCheckpoint>> {
        match self.db.kv_get(KEY_CHECKPOINT).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(cp) => Ok(Some(cp)),
                Err(e) => {
                    // A checkpoint we cannot read is a checkpoint we discard.
                    warn!("discarding unreadable checkpoint: {e}");
                    self.db.kv_delete(KEY_CHECKPOINT).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn clear_checkpoint(&self) -> SyncResult<()> {
        self.db.kv_delete(KEY_CHECKPOINT).await
    }

    /// Appends to the bounded FIFO; the oldest entries fall off the front.
    pub async fn enqueue_error(&self, entry: ErrorQueueEntry) -> SyncResult<()> {
        let mut queue = self.read_error_queue().await?;
        queue.push(entry);
        if queue.len() > self.max_errors {
            let excess = queue.len() - self.max_errors;
            queue.drain(..excess);
        }
        let raw = serde_json::to_string(&queue)
            .map_err(|e| SyncError::Internal(format!("serialize error queue: {e}")))?;
        self.db.kv_set(KEY_ERROR_QUEUE, &raw).await
    }

    pub async fn list_errors(&self, limit: usize) -> SyncResult<Vec<ErrorQueueEntry>> {
        let queue = self.read_error_queue().await?;
        let start = queue.len().saturating_sub(limit.max(1));
        Ok(queue[start..].to_vec())
    }

    pub async fn clear_errors(&self) -> SyncResult<()> {
        self.db.kv_delete(KEY_ERROR_QUEUE).await
    }

    async fn read_error_queue(&self) -> SyncResult<Vec<ErrorQueueEntry>> {
        match self.db.kv_get(KEY_ERROR_QUEUE).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    /// Takes the run lock unless a live one is held elsewhere. Expired locks
    /// from crashed runs are overwritten.
    pub async fn acquire_run_lock(&self, ttl: Duration) -> SyncResult<bool> {
        let now = Utc::now().timestamp();
        if let Some(raw) = self.db.kv_get(KEY_LOCK).await? {
            if let Ok(row) = serde_json::from_str::<LockRow>(&raw) {
                let ours = self.own_lock_token.lock().as_deref() == Some(row.token.as_str());
                if row.expires_at > now && !ours {
                    return Ok(false);
                }
                if row.expires_at <= now {
                    warn!("overriding expired run lock");
                }
            }
        }
        let token = Uuid::new_v4().to_string();
        let row = LockRow {
            token: token.clone(),
            expires_at: now + ttl.as_secs() as i64,
        };
        let raw = serde_json::to_string(&row)
            .map_err(|e| SyncError::Internal(format!("serialize lock: {e}")))?;
        self.db.kv_set(KEY_LOCK, &raw).await?;
        *self.own_lock_token.lock() = Some(token);
        Ok(true)
    }

    /// Releases only a lock this store acquired; someone else's live lock is
    /// left alone.
    pub async fn release_run_lock(&self) -> SyncResult<()> {
        let own = self.own_lock_token.lock().take();
        let Some(own) = own else {
            return Ok(());
        };
        if let Some(raw) = self.db.kv_get(KEY_LOCK).await? {
            if let Ok(row) = serde_json::from_str::<LockRow>(&raw) {
                if row.token == own {
                    self.db.kv_delete(KEY_LOCK).await?;
                }
            }
        }
        Ok(())
    }
}
