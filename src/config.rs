//! Runtime configuration.
//!
//! Everything is env-driven with sane defaults so the binary can start from a
//! bare `.env`. Tier ordering, the progression map, the transition matrix and
//! the product code table are operator data, not code; they load from an
//! optional JSON file next to the env config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub mlp_api_key: Option<String>,
    pub mlp_base_url: String,
    pub dds_api_key: Option<String>,
    pub dds_token: Option<String>,
    pub dds_base_url: String,
    pub api_timeout_secs: u64,
    pub api_max_retries: u32,
    pub api_min_interval_ms: u64,
    pub batch_size: usize,
    pub memory_limit_bytes: u64,
    pub memory_threshold_pct: f64,
    pub max_processing_secs: u64,
    pub max_pages_per_run: u32,
    pub subscribers_per_page: u32,
    pub error_queue_max: usize,
    pub log_retention_days: i64,
    pub tiers: TierConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./tiersync.db".to_string());

        let mlp_api_key = env::var("MLP_API_KEY").ok().filter(|k| !k.is_empty());
        let mlp_base_url = env::var("MLP_BASE_URL")
            .unwrap_or_else(|_| "https://connect.mailerlite.com/api".to_string());

        let dds_api_key = env::var("DDS_API_KEY").ok().filter(|k| !k.is_empty());
        let dds_token = env::var("DDS_TOKEN").ok().filter(|k| !k.is_empty());
        let dds_base_url =
            env::var("DDS_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1/edd-api".to_string());

        let api_timeout_secs = env_parse("API_TIMEOUT_SECONDS", 30u64);
        let api_max_retries = env_parse("API_MAX_RETRIES", 3u32);
        let api_min_interval_ms = env_parse("API_MIN_INTERVAL_MS", 1000u64);

        let batch_size = env_parse("SYNC_BATCH_SIZE", 1000usize).clamp(1, 10_000);
        let memory_limit_bytes = env_parse("SYNC_MEMORY_LIMIT_BYTES", 512 * 1024 * 1024u64);
        let memory_threshold_pct = env_parse("SYNC_MEMORY_THRESHOLD_PCT", 0.8f64).clamp(0.1, 1.0);
        let max_processing_secs = env_parse("SYNC_MAX_PROCESSING_SECONDS", 300u64);
        let max_pages_per_run = env_parse("SYNC_MAX_PAGES_PER_RUN", 10u32);
        let subscribers_per_page = env_parse("SYNC_SUBSCRIBERS_PER_PAGE", 100u32).clamp(1, 1000);

        let error_queue_max = env_parse("ERRORS_MAX_QUEUE", 100usize);
        let log_retention_days = env_parse("LOG_RETENTION_DAYS", 30i64);

        let tiers = match env::var("TIERS_CONFIG_PATH") {
            Ok(path) if !path.is_empty() => TierConfig::from_file(&path)
                .with_context(|| format!("load tier config from {path}"))?,
            _ => TierConfig::default(),
        };
        tiers.validate()?;

        Ok(Self {
            database_path,
            mlp_api_key,
            mlp_base_url,
            dds_api_key,
            dds_token,
            dds_base_url,
            api_timeout_secs,
            api_max_retries,
            api_min_interval_ms,
            batch_size,
            memory_limit_bytes,
            memory_threshold_pct,
            max_processing_secs,
            max_pages_per_run,
            subscribers_per_page,
            error_queue_max,
            log_retention_days,
            tiers,
        })
    }

    /// MLP credentials are required for every operation; fail early.
    pub fn require_mlp_key(&self) -> Result<&str, crate::error::SyncError> {
        self.mlp_api_key.as_deref().ok_or_else(|| {
            crate::error::SyncError::Configuration("MLP_API_KEY is not set".into())
        })
    }

    /// DDS credentials are only required for purchase-aware stages.
    pub fn require_dds_credentials(&self) -> Result<(&str, &str), crate::error::SyncError> {
        match (self.dds_api_key.as_deref(), self.dds_token.as_deref()) {
            (Some(key), Some(token)) => Ok((key, token)),
            _ => Err(crate::error::SyncError::Configuration(
                "DDS_API_KEY / DDS_TOKEN are not set".into(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// One row of the progression map: where a subscriber at `current` goes
/// depending on whether a verified purchase exists for the campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressionRule {
    pub current: String,
    pub purchased: String,
    pub not_purchased: String,
}

/// One operator-editable row of the inter-campaign transition matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixRow {
    pub current_tier: String,
    pub next_tier: String,
    pub requires_purchase: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub order: Vec<String>,
    pub progression: Vec<ProgressionRule>,
    pub matrix: Vec<MatrixRow>,
    #[serde(default)]
    pub product_codes: HashMap<String, String>,
    #[serde(default = "default_daily_cap")]
    pub max_daily_transitions: u32,
}

fn default_daily_cap() -> u32 {
    3
}

impl Default for TierConfig {
    fn default() -> Self {
        let rule = |current: &str, purchased: &str, not_purchased: &str| ProgressionRule {
            current: current.into(),
            purchased: purchased.into(),
            not_purchased: not_purchased.into(),
        };
        let row = |current: &str, next: &str, requires_purchase: bool| MatrixRow {
            current_tier: current.into(),
            next_tier: next.into(),
            requires_purchase,
        };

        Self {
            order: [
                "OPT_IN",
                "GOLD",
                "GOLD_PURCHASED",
                "SILVER",
                "SILVER_PURCHASED",
                "BRONZE",
                "BRONZE_PURCHASED",
                "WOOD",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            progression: vec![
                rule("OPT_IN", "GOLD_PURCHASED", "SILVER"),
                rule("GOLD", "GOLD_PURCHASED", "SILVER"),
                rule("SILVER", "SILVER_PURCHASED", "BRONZE"),
                rule("BRONZE", "BRONZE_PURCHASED", "WOOD"),
                // Purchased tiers are terminal: holding a verified purchase
                // never demotes.
                rule("GOLD_PURCHASED", "GOLD_PURCHASED", "GOLD_PURCHASED"),
                rule("SILVER_PURCHASED", "SILVER_PURCHASED", "SILVER_PURCHASED"),
                rule("BRONZE_PURCHASED", "BRONZE_PURCHASED", "BRONZE_PURCHASED"),
            ],
            matrix: vec![
                row("GOLD_PURCHASED", "GOLD", true),
                row("SILVER_PURCHASED", "SILVER", true),
                row("BRONZE_PURCHASED", "BRONZE", true),
                row("GOLD", "SILVER", false),
                row("SILVER", "BRONZE", false),
                row("BRONZE", "WOOD", false),
            ],
            product_codes: HashMap::new(),
            max_daily_transitions: default_daily_cap(),
        }
    }
}

impl TierConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: TierConfig = serde_json::from_str(&raw)?;
        Ok(cfg)
    }

    /// Every tier referenced by the progression map and the matrix must be a
    /// member of the configured order.
    pub fn validate(&self) -> Result<()> {
        if self.order.is_empty() {
            anyhow::bail!("tier order is empty");
        }
        for rule in &self.progression {
            for tier in [&rule.current, &rule.purchased, &rule.not_purchased] {
                if !self.order.iter().any(|t| t == tier) {
                    anyhow::bail!("progression references unknown tier {tier}");
                }
            }
        }
        for row in &self.matrix {
            for tier in [&row.current_tier, &row.next_tier] {
                if !self.order.iter().any(|t| t == tier) {
                    anyhow::bail!("transition matrix references unknown tier {tier}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tier_config_is_valid() {
        let cfg = TierConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.order.len(), 8);
        assert_eq!(cfg.max_daily_transitions, 3);
    }

    #[test]
    fn progression_covers_every_unpurchased_tier() {
        let cfg = TierConfig::default();
        for tier in ["OPT_IN", "GOLD", "SILVER", "BRONZE"] {
            assert!(
                cfg.progression.iter().any(|r| r.current == tier),
                "missing progression for {tier}"
            );
        }
    }

    #[test]
    fn invalid_progression_tier_rejected() {
        let mut cfg = TierConfig::default();
        cfg.progression.push(ProgressionRule {
            current: "PLATINUM".into(),
            purchased: "GOLD".into(),
            not_purchased: "WOOD".into(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tier_config_round_trips_through_json() {
        let cfg = TierConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TierConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.order, cfg.order);
        assert_eq!(back.matrix.len(), cfg.matrix.len());
    }
}
