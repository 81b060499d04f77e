//! TierSync operator CLI.
//!
//! One subcommand per operator action: run or stop a sync, inspect status,
//! validate provider connections, sweep groups against upstream, transition
//! campaigns and manage the error queue.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiersync::config::Config;
use tiersync::db::Database;
use tiersync::error::SyncError;
use tiersync::providers::http::RetryPolicy;
use tiersync::providers::{DdsApi, DdsClient, MlpApi, MlpClient};
use tiersync::sync::guard;
use tiersync::sync::{PipelineOptions, ProgressStore, SyncPipeline};
use tiersync::tiers::TierEngine;
use tiersync::transition::TransitionExecutor;

#[derive(Parser)]
#[command(name = "tiersync", about = "Campaign/subscriber reconciliation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the five-stage sync pipeline (resumes from a checkpoint if one
    /// exists).
    StartSync,
    /// Ask a running sync to stop at the next safe boundary.
    StopSync,
    /// Show the current sync status.
    Status,
    /// Check that both providers answer authenticated requests.
    ValidateConnections,
    /// Delete local groups that no longer exist upstream.
    ValidateGroups,
    /// Move eligible subscribers from one campaign to another per the
    /// transition matrix.
    Transition {
        source: String,
        destination: String,
    },
    /// Show the most recent entries of the error queue.
    Errors {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Clear the error queue.
    ClearErrors,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiersync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn retry_policy(cfg: &Config) -> RetryPolicy {
    RetryPolicy {
        max_retries: cfg.api_max_retries,
        ..RetryPolicy::default()
    }
}

fn build_mlp(cfg: &Config) -> Result<Arc<MlpClient>, SyncError> {
    let key = cfg.require_mlp_key()?;
    Ok(Arc::new(MlpClient::new(
        &cfg.mlp_base_url,
        key,
        retry_policy(cfg),
        Duration::from_millis(cfg.api_min_interval_ms),
        Duration::from_secs(cfg.api_timeout_secs),
    )?))
}

fn build_dds(cfg: &Config) -> Result<Option<Arc<DdsClient>>, SyncError> {
    match (&cfg.dds_api_key, &cfg.dds_token) {
        (Some(key), Some(token)) => Ok(Some(Arc::new(DdsClient::new(
            &cfg.dds_base_url,
            key,
            token,
            retry_policy(cfg),
            Duration::from_millis(cfg.api_min_interval_ms),
            Duration::from_secs(cfg.api_timeout_secs),
        )?))),
        _ => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cfg = Config::from_env().context("load configuration")?;
    let db = Database::open(&cfg.database_path)
        .map_err(|e| anyhow::anyhow!("open database {}: {e}", cfg.database_path))?;
    let progress = ProgressStore::new(db.clone(), cfg.error_queue_max);

    match cli.command {
        Command::StartSync => {
            // Ctrl-C degrades to a cooperative stop so the checkpoint lands.
            {
                let progress = progress.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received, stopping at the next safe boundary");
                        progress.set_stop_flag().await.ok();
                    }
                });
            }
            let mlp = build_mlp(&cfg)?;
            let dds = build_dds(&cfg)?;
            let tiers = Arc::new(TierEngine::from_config(&cfg.tiers));

            let mut pipeline = SyncPipeline::new(
                db,
                mlp.clone() as Arc<dyn MlpApi>,
                dds.clone().map(|d| d as Arc<dyn DdsApi>),
                tiers,
                progress,
                PipelineOptions::from_config(&cfg),
            );
            {
                let mlp = mlp.clone();
                pipeline = pipeline.with_cache_flusher(Arc::new(move || mlp.flush_cache()));
            }
            if let Some(dds) = dds {
                pipeline = pipeline.with_cache_flusher(Arc::new(move || dds.flush_cache()));
            }

            // Abnormal termination still leaves a failed run record: a panic
            // goes through the hook, SIGTERM through the signal task. Both
            // report the last stage error the run captured.
            let error_slot = pipeline.error_slot();
            guard::install_shutdown_hook(&cfg.database_path, Arc::clone(&error_slot));
            #[cfg(unix)]
            {
                let db_path = cfg.database_path.clone();
                let error_slot = Arc::clone(&error_slot);
                tokio::spawn(async move {
                    use tokio::signal::unix::{signal, SignalKind};
                    let Ok(mut term) = signal(SignalKind::terminate()) else {
                        return;
                    };
                    term.recv().await;
                    let message = error_slot
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "terminated by signal".to_string());
                    error!("SIGTERM received, recording failed run");
                    guard::record_abnormal_termination(&db_path, &message);
                    std::process::exit(1);
                });
            }

            match pipeline.run().await {
                Ok(summary) => {
                    println!(
                        "sync {}: {} subscribers ({})",
                        summary.status.as_str(),
                        summary.subscribers_synced,
                        summary.message
                    );
                }
                Err(e) => {
                    error!("sync failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::StopSync => {
            progress.set_stop_flag().await.context("set stop flag")?;
            println!("stop requested; the pipeline halts at the next safe boundary");
        }
        Command::Status => {
            let status = progress.get_status().await.context("read status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::ValidateConnections => {
            let mut healthy = true;
            match build_mlp(&cfg) {
                Ok(mlp) => match mlp.ping().await {
                    Ok(()) => println!("mlp: ok"),
                    Err(e) => {
                        healthy = false;
                        println!("mlp: {e}");
                    }
                },
                Err(e) => {
                    healthy = false;
                    println!("mlp: {e}");
                }
            }
            match build_dds(&cfg)? {
                Some(dds) => match dds.ping().await {
                    Ok(()) => println!("dds: ok"),
                    Err(e) => {
                        healthy = false;
                        println!("dds: {e}");
                    }
                },
                None => println!("dds: not configured"),
            }
            if !healthy {
                std::process::exit(1);
            }
        }
        Command::ValidateGroups => {
            let mlp = build_mlp(&cfg)?;
            let tiers = Arc::new(TierEngine::from_config(&cfg.tiers));
            let pipeline = SyncPipeline::new(
                db,
                mlp as Arc<dyn MlpApi>,
                None,
                tiers,
                progress,
                PipelineOptions::from_config(&cfg),
            );
            let report = pipeline.validate_groups().await?;
            println!(
                "checked {} groups, deleted {}",
                report.checked,
                report.deleted.len()
            );
            for name in report.deleted {
                println!("  deleted {name}");
            }
        }
        Command::Transition {
            source,
            destination,
        } => {
            let mlp = build_mlp(&cfg)?;
            let dds = build_dds(&cfg)?;
            let tiers = Arc::new(TierEngine::from_config(&cfg.tiers));
            let executor = TransitionExecutor::new(
                db,
                mlp as Arc<dyn MlpApi>,
                dds.map(|d| d as Arc<dyn DdsApi>),
                tiers,
                progress,
                cfg.subscribers_per_page,
                cfg.tiers.max_daily_transitions,
            );
            let report = executor.run(&source, &destination).await?;
            info!("transition {} finished", report.transition_id);
            println!(
                "transferred {} subscribers ({} rows skipped)",
                report.transferred,
                report.skipped_rows.len()
            );
            for skipped in report.skipped_rows {
                println!("  skipped {skipped}");
            }
        }
        Command::Errors { limit } => {
            let errors = progress.list_errors(limit).await?;
            if errors.is_empty() {
                println!("error queue is empty");
            }
            for entry in errors {
                println!(
                    "[{}] {} {}{}",
                    entry.last_attempt.to_rfc3339(),
                    entry.kind,
                    entry.message,
                    entry
                        .item
                        .map(|i| format!(" ({i})"))
                        .unwrap_or_default()
                );
            }
        }
        Command::ClearErrors => {
            progress.clear_errors().await?;
            println!("error queue cleared");
        }
    }

    Ok(())
}
