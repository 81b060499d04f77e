//! Error taxonomy for the sync engine.
//!
//! Every provider call, repository operation and pipeline stage returns
//! `Result<T, SyncError>`. The variant decides the recovery policy: retry,
//! skip-and-enqueue, or abort the stage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing credentials or invalid settings. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network failure, 5xx, or an unparseable response body. Retried with
    /// backoff up to the configured attempt budget.
    #[error("transport error: {0}")]
    Transport(String),

    /// 429 or exhausted rate budget. Absorbed by the HTTP layer, which sleeps
    /// until the reset timestamp; callers should never observe this.
    #[error("rate limited, reset in {reset_secs}s")]
    RateLimited { reset_secs: u64 },

    /// 4xx other than 429. Not retried.
    #[error("{method} {endpoint} returned {status}")]
    Client {
        endpoint: String,
        method: String,
        status: u16,
    },

    /// 401/403. Fatal for the current run.
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// Invalid email, unknown tier, malformed order id, illegal transition.
    /// Skipped per-item and enqueued.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Deadlock or lock timeout. Retried within the transaction budget.
    #[error("transient database error: {0}")]
    TransientDb(String),

    /// Schema or constraint violation. Batch rolled back and surfaced.
    #[error("database error: {0}")]
    PersistentDb(String),

    /// Cooperative stop. Expected; recorded as `Stopped`.
    #[error("cancelled")]
    Cancelled,

    /// Anything unexpected. Fatal for the stage.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the HTTP layer should retry the request that produced this.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::RateLimited { .. } | SyncError::TransientDb(_)
        )
    }

    /// Fatal errors terminate the whole run, not just the current item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Configuration(_) | SyncError::Authentication(_) | SyncError::Internal(_)
        )
    }

    /// Short classification tag used in sync_log notes and the error queue.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::Transport(_) => "transport",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Client { .. } => "client",
            SyncError::Authentication(_) => "authentication",
            SyncError::Validation(_) => "validation",
            SyncError::TransientDb(_) => "transient_db",
            SyncError::PersistentDb(_) => "persistent_db",
            SyncError::Cancelled => "cancelled",
            SyncError::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return SyncError::Transport(e.to_string());
        }
        if e.is_decode() {
            return SyncError::Transport(format!("response decode: {e}"));
        }
        SyncError::Transport(e.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    SyncError::TransientDb(e.to_string())
                }
                _ => SyncError::PersistentDb(e.to_string()),
            },
            _ => SyncError::PersistentDb(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Transport(format!("json parse: {e}"))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Transport("reset by peer".into()).is_retryable());
        assert!(SyncError::RateLimited { reset_secs: 5 }.is_retryable());
        assert!(SyncError::TransientDb("database is locked".into()).is_retryable());
        assert!(!SyncError::Validation("bad email".into()).is_retryable());
        assert!(!SyncError::Client {
            endpoint: "/groups".into(),
            method: "GET".into(),
            status: 404
        }
        .is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(SyncError::Authentication("401".into()).is_fatal());
        assert!(SyncError::Configuration("missing key".into()).is_fatal());
        assert!(!SyncError::Transport("timeout".into()).is_fatal());
        assert!(!SyncError::Cancelled.is_fatal());
    }

    #[test]
    fn sqlite_busy_maps_to_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(matches!(SyncError::from(busy), SyncError::TransientDb(_)));
    }
}
