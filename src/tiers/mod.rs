//! Tier engine.
//!
//! Pure decision logic: given a subscriber's current tier and whether a
//! verified purchase exists, where do they go next? No I/O; everything is
//! loaded from [`TierConfig`] at startup.

use crate::config::{MatrixRow, TierConfig};
use std::collections::HashMap;

pub struct TierEngine {
    order: Vec<String>,
    position: HashMap<String, usize>,
    /// current → (next when purchased, next when not)
    progression: HashMap<String, (String, String)>,
    matrix: Vec<MatrixRow>,
}

impl TierEngine {
    pub fn from_config(cfg: &TierConfig) -> Self {
        let order: Vec<String> = cfg.order.iter().map(|t| t.to_uppercase()).collect();
        let position = order
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        let progression = cfg
            .progression
            .iter()
            .map(|r| {
                (
                    r.current.to_uppercase(),
                    (r.purchased.to_uppercase(), r.not_purchased.to_uppercase()),
                )
            })
            .collect();
        let matrix = cfg
            .matrix
            .iter()
            .map(|r| MatrixRow {
                current_tier: r.current_tier.to_uppercase(),
                next_tier: r.next_tier.to_uppercase(),
                requires_purchase: r.requires_purchase,
            })
            .collect();
        Self {
            order,
            position,
            progression,
            matrix,
        }
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn is_known(&self, tier: &str) -> bool {
        self.position.contains_key(&tier.to_uppercase())
    }

    /// Index of the tier in the configured order; lower is higher standing.
    pub fn position(&self, tier: &str) -> Option<usize> {
        self.position.get(&tier.to_uppercase()).copied()
    }

    /// Next tier under the progression map. Identity when the current tier
    /// has no mapping.
    pub fn next_tier(&self, current: &str, purchased: bool) -> String {
        let current = current.to_uppercase();
        match self.progression.get(&current) {
            Some((with, without)) => {
                if purchased {
                    with.clone()
                } else {
                    without.clone()
                }
            }
            None => current,
        }
    }

    /// Whether `from → to` is a permitted edge. Staying put is always legal;
    /// otherwise the edge must appear in the transition matrix, and a row
    /// demanding purchase evidence only matches when evidence exists.
    pub fn is_legal(&self, from: &str, to: &str, purchased: bool) -> bool {
        let from = from.to_uppercase();
        let to = to.to_uppercase();
        if !self.is_known(&from) || !self.is_known(&to) {
            return false;
        }
        if from == to {
            return true;
        }
        self.matrix.iter().any(|row| {
            row.current_tier == from && row.next_tier == to && (purchased || !row.requires_purchase)
        })
    }

    /// Whether entering `tier` requires a verified purchase: either the tier
    /// is a `*_PURCHASED` cohort or every matrix edge into it demands
    /// evidence.
    pub fn requires_purchase(&self, tier: &str) -> bool {
        let tier = tier.to_uppercase();
        if tier.ends_with("_PURCHASED") {
            return true;
        }
        let entering: Vec<&MatrixRow> =
            self.matrix.iter().filter(|r| r.next_tier == tier).collect();
        !entering.is_empty() && entering.iter().all(|r| r.requires_purchase)
    }

    /// Matrix rows, for the transition executor.
    pub fn matrix(&self) -> &[MatrixRow] {
        &self.matrix
    }
}
