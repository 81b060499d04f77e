//! Input validators.
//!
//! Each validator is a small pure function returning the issues it found;
//! callers decide the pass/fail policy. An empty vec means the input is
//! acceptable.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// True when none of the issues is an error.
pub fn passes(issues: &[Issue]) -> bool {
    issues.iter().all(|i| i.severity != Severity::Error)
}

/// RFC-shape email check: one `@`, non-empty local part, domain with a dot
/// and no whitespace. The canonical key is the lower-cased address.
pub fn validate_email(email: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    let email = email.trim();
    if email.is_empty() {
        issues.push(Issue::error("email is empty"));
        return issues;
    }
    if email.chars().any(|c| c.is_whitespace()) {
        issues.push(Issue::error(format!("email contains whitespace: {email}")));
        return issues;
    }
    let mut parts = email.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let domain = parts.next().unwrap_or("");
    if local.is_empty() || domain.is_empty() {
        issues.push(Issue::error(format!("malformed email: {email}")));
        return issues;
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        issues.push(Issue::error(format!("invalid email domain: {domain}")));
    }
    if email.matches('@').count() != 1 {
        issues.push(Issue::error(format!("multiple @ in email: {email}")));
    }
    issues
}

/// Campaign names must match `^[0-9]{4}_[A-Z0-9]+_[A-Z0-9]+$` after
/// uppercasing.
pub fn validate_campaign_name(name: &str) -> Vec<Issue> {
    let name = name.trim().to_uppercase();
    let parts: Vec<&str> = name.split('_').collect();
    let ok = parts.len() >= 3
        && parts[0].len() == 4
        && parts[0].chars().all(|c| c.is_ascii_digit())
        && parts[1..]
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()));
    if ok {
        Vec::new()
    } else {
        vec![Issue::error(format!(
            "campaign name must be YYYY_ARTIST_PRODUCT, got {name}"
        ))]
    }
}

/// Tier must be a member of the configured order.
pub fn validate_tier(tier: &str, order: &[String]) -> Vec<Issue> {
    let tier = tier.trim().to_uppercase();
    if order.iter().any(|t| t.eq_ignore_ascii_case(&tier)) {
        Vec::new()
    } else {
        vec![Issue::error(format!("unknown tier {tier}"))]
    }
}

/// The stored purchase field must be a positive integer DDS order id.
/// Returns the parsed id when the shape is acceptable.
pub fn parse_order_id(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    value.parse::<i64>().ok().filter(|id| *id > 0)
}

pub fn validate_order_id(value: &str) -> Vec<Issue> {
    if parse_order_id(value).is_some() {
        Vec::new()
    } else {
        vec![Issue::error(format!(
            "purchase field is not a positive integer order id: {value:?}"
        ))]
    }
}

/// Caps tier transitions per subscriber per calendar day to dampen
/// oscillation between groups.
#[derive(Debug)]
pub struct DailyTransitionCap {
    max_per_day: u32,
    counts: HashMap<(String, NaiveDate), u32>,
}

impl DailyTransitionCap {
    pub fn new(max_per_day: u32) -> Self {
        Self {
            max_per_day: max_per_day.max(1),
            counts: HashMap::new(),
        }
    }

    /// Records one transition attempt for `email` today and reports whether
    /// it is still within the cap.
    pub fn allow(&mut self, email: &str) -> bool {
        let key = (email.to_lowercase(), Utc::now().date_naive());
        let count = self.counts.entry(key).or_insert(0);
        if *count >= self.max_per_day {
            return false;
        }
        *count += 1;
        true
    }

    pub fn check(&self, email: &str) -> Vec<Issue> {
        let key = (email.to_lowercase(), Utc::now().date_naive());
        match self.counts.get(&key) {
            Some(count) if *count >= self.max_per_day => vec![Issue::error(format!(
                "{email} exceeded {} transitions today",
                self.max_per_day
            ))],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_emails() {
        assert!(passes(&validate_email("a@x.io")));
        assert!(passes(&validate_email("first.last+tag@sub.example.com")));
    }

    #[test]
    fn rejects_malformed_emails() {
        assert!(!passes(&validate_email("")));
        assert!(!passes(&validate_email("no-at-sign")));
        assert!(!passes(&validate_email("two@@x.io")));
        assert!(!passes(&validate_email("a@nodot")));
        assert!(!passes(&validate_email("a b@x.io")));
        assert!(!passes(&validate_email("a@.leading.dot")));
    }

    #[test]
    fn campaign_name_format() {
        assert!(passes(&validate_campaign_name("2025_ARTIST_ALBUM")));
        assert!(passes(&validate_campaign_name("2025_artist_album")));
        assert!(passes(&validate_campaign_name("2026_A_B")));
        assert!(!passes(&validate_campaign_name("25_ARTIST_ALBUM")));
        assert!(!passes(&validate_campaign_name("2025_ARTIST")));
        assert!(!passes(&validate_campaign_name("2025__ALBUM")));
        assert!(!passes(&validate_campaign_name("YEAR_ARTIST_ALBUM")));
    }

    #[test]
    fn order_id_shapes() {
        assert_eq!(parse_order_id("4711"), Some(4711));
        assert_eq!(parse_order_id(" 42 "), Some(42));
        assert_eq!(parse_order_id("0"), None);
        assert_eq!(parse_order_id("-3"), None);
        assert_eq!(parse_order_id("order-17"), None);
        assert_eq!(parse_order_id(""), None);
        assert!(!passes(&validate_order_id("abc")));
    }

    #[test]
    fn tier_membership() {
        let order = vec!["GOLD".to_string(), "SILVER".to_string()];
        assert!(passes(&validate_tier("gold", &order)));
        assert!(!passes(&validate_tier("PLATINUM", &order)));
    }

    #[test]
    fn daily_cap_blocks_fourth_transition() {
        let mut cap = DailyTransitionCap::new(3);
        assert!(cap.allow("a@x.io"));
        assert!(cap.allow("a@x.io"));
        assert!(cap.allow("a@x.io"));
        assert!(!cap.allow("a@x.io"));
        assert!(!passes(&cap.check("A@X.IO")));
        // other subscribers are unaffected
        assert!(cap.allow("b@x.io"));
    }
}
