//! TierSync library.
//!
//! Reconciles a local subscriber/campaign database with a marketing-list
//! provider and a digital-downloads store, and moves cohorts between
//! campaigns on operator command.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod sync;
pub mod tiers;
pub mod transition;
pub mod validators;

pub use config::Config;
pub use db::Database;
pub use error::{SyncError, SyncResult};
pub use sync::{ProgressStore, SyncPipeline};
pub use tiers::TierEngine;
pub use transition::TransitionExecutor;
