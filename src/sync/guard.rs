//! Wall-clock and memory guard for long-running stages, plus the shutdown
//! hook for runs that die outside the normal error path.
//!
//! The pipeline asks `can_continue` between pages and batches; a breach is
//! handled like a cooperative stop (checkpoint and exit), never a kill. For
//! genuinely abnormal termination (panic, SIGTERM) the process installs
//! [`install_shutdown_hook`], which reads the last captured stage error and
//! writes a failed sync_log row before the process dies.

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::panic;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::warn;

/// Most recent stage error, shared between the per-run guard and the
/// process-level shutdown hook.
pub type ErrorSlot = Arc<Mutex<Option<String>>>;

pub struct ResourceGuard {
    started: Instant,
    max_processing: Duration,
    memory_limit_bytes: u64,
    memory_threshold_pct: f64,
    last_error: ErrorSlot,
}

impl ResourceGuard {
    pub fn new(max_processing: Duration, memory_limit_bytes: u64, memory_threshold_pct: f64) -> Self {
        Self {
            started: Instant::now(),
            max_processing,
            memory_limit_bytes,
            memory_threshold_pct: memory_threshold_pct.clamp(0.1, 1.0),
            last_error: ErrorSlot::default(),
        }
    }

    /// Shares an externally owned error slot, so the shutdown hook installed
    /// before the run sees errors this guard records during it.
    pub fn with_error_slot(mut self, slot: ErrorSlot) -> Self {
        self.last_error = slot;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// False once the wall-clock budget is spent or resident memory crossed
    /// the threshold.
    pub fn can_continue(&self) -> bool {
        if self.started.elapsed() >= self.max_processing {
            warn!(
                "processing budget of {}s spent",
                self.max_processing.as_secs()
            );
            return false;
        }
        !self.over_memory_threshold()
    }

    pub fn over_memory_threshold(&self) -> bool {
        let limit = (self.memory_limit_bytes as f64 * self.memory_threshold_pct) as u64;
        let usage = process_memory_bytes();
        if usage > limit {
            warn!("resident memory {usage}B over threshold {limit}B");
            true
        } else {
            false
        }
    }

    /// Sheds what weight we can: the provider caches. Called when the memory
    /// threshold is crossed.
    pub fn manage_memory(&self, cache_flushers: &[&(dyn Fn() + Send + Sync)]) {
        for flush in cache_flushers {
            flush();
        }
    }

    /// Remembers the most recent stage error so the shutdown hook can write
    /// a meaningful failure record.
    pub fn record_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

/// Writes a failed sync_log row for a run that died outside the normal error
/// path. Opens its own connection: the shared one may be held by the dying
/// thread.
pub fn record_abnormal_termination(db_path: &str, message: &str) {
    let Ok(conn) = Connection::open(db_path) else {
        return;
    };
    let _ = conn.execute(
        "INSERT INTO sync_log (sync_date, status, synced_subscribers, notes)
         VALUES (?1, 'failed', 0, ?2)",
        rusqlite::params![
            Utc::now().to_rfc3339(),
            format!("abnormal termination: {message}")
        ],
    );
}

/// Installs a process-wide panic hook that records the abnormal termination
/// before handing off to the previous hook. The failure note prefers the
/// last captured stage error over the raw panic payload.
pub fn install_shutdown_hook(db_path: &str, last_error: ErrorSlot) {
    let db_path = db_path.to_string();
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        // try_lock: the panicking thread may hold the slot.
        let captured = last_error.try_lock().and_then(|slot| (*slot).clone());
        let message = captured.unwrap_or_else(|| info.to_string());
        record_abnormal_termination(&db_path, &message);
        previous(info);
    }));
}

/// Resident memory of this process. The System instance is cached; creating
/// one is expensive.
pub fn process_memory_bytes() -> u64 {
    static CACHED_SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();
    let sys_mutex = CACHED_SYSTEM.get_or_init(|| Mutex::new(System::new()));
    let mut sys = sys_mutex.lock();

    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );
    sys.process(pid).map(|p| p.memory()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::SyncRunStatus;

    #[test]
    fn fresh_guard_can_continue() {
        let g = ResourceGuard::new(Duration::from_secs(300), u64::MAX, 0.8);
        assert!(g.can_continue());
    }

    #[test]
    fn zero_time_budget_stops_immediately() {
        let g = ResourceGuard::new(Duration::ZERO, u64::MAX, 0.8);
        assert!(!g.can_continue());
    }

    #[test]
    fn tiny_memory_limit_trips_threshold() {
        let g = ResourceGuard::new(Duration::from_secs(300), 1, 0.8);
        assert!(g.over_memory_threshold());
        assert!(!g.can_continue());
    }

    #[test]
    fn manage_memory_runs_every_flusher() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let g = ResourceGuard::new(Duration::from_secs(300), u64::MAX, 0.8);
        let count = AtomicU32::new(0);
        let bump = || {
            count.fetch_add(1, Ordering::SeqCst);
        };
        g.manage_memory(&[&bump, &bump]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn shared_slot_sees_recorded_errors() {
        let slot = ErrorSlot::default();
        let g = ResourceGuard::new(Duration::from_secs(300), u64::MAX, 0.8)
            .with_error_slot(Arc::clone(&slot));
        assert!(g.last_error().is_none());
        g.record_error("stage 4 exploded");
        assert_eq!(g.last_error().as_deref(), Some("stage 4 exploded"));
        assert_eq!(slot.lock().as_deref(), Some("stage 4 exploded"));
    }

    #[test]
    fn process_memory_is_nonzero() {
        assert!(process_memory_bytes() > 0);
    }

    #[tokio::test]
    async fn abnormal_termination_lands_in_sync_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.db");
        let path = path.to_str().unwrap();
        let db = Database::open(path).unwrap();

        record_abnormal_termination(path, "stage 4 exploded");

        let records = db.list_sync_records(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SyncRunStatus::Failed);
        let notes = records[0].notes.as_deref().unwrap();
        assert!(notes.contains("abnormal termination"));
        assert!(notes.contains("stage 4 exploded"));
    }

    #[tokio::test]
    async fn panic_hook_writes_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hook.db");
        let path = path.to_str().unwrap().to_string();
        let db = Database::open(&path).unwrap();

        let slot: ErrorSlot = Arc::new(Mutex::new(Some("stage 2 fell over".into())));
        install_shutdown_hook(&path, slot);
        let panicked = panic::catch_unwind(|| panic!("boom"));
        // restore the default hook so later panics print normally
        let _ = panic::take_hook();
        assert!(panicked.is_err());

        let records = db.list_sync_records(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SyncRunStatus::Failed);
        assert!(records[0]
            .notes
            .as_deref()
            .unwrap()
            .contains("stage 2 fell over"));
    }
}
