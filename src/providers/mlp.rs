//! Marketing-list provider (MLP) client.
//!
//! Bearer-auth JSON API. The audience model upstream: groups (one per
//! campaign × tier), custom fields (one `<CAMPAIGN>_PURCHASE` per campaign),
//! campaigns, and cursor-paginated subscribers. Everything rides on the
//! shared [`Http`] core for retry, pacing and caching.

use crate::error::{SyncError, SyncResult};
use crate::models::{Subscriber, SubscriberStatus};
use crate::providers::http::{Auth, Http, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const VERIFY_ATTEMPTS: u32 = 5;
const VERIFY_DELAY: Duration = Duration::from_secs(2);

/// An upstream group, before it is tied to a local campaign.
#[derive(Debug, Clone)]
pub struct MlpGroup {
    pub id: String,
    pub name: String,
}

/// An upstream custom field.
#[derive(Debug, Clone)]
pub struct MlpField {
    pub id: String,
    pub name: String,
    pub field_type: String,
}

/// One page of the subscriber enumeration.
#[derive(Debug, Clone)]
pub struct SubscriberPage {
    pub subscribers: Vec<Subscriber>,
    pub next_cursor: Option<String>,
}

/// The slice of the MLP API the engine needs. The pipeline and the
/// transition executor only see this trait; tests drive them with an
/// in-memory fake.
#[async_trait]
pub trait MlpApi: Send + Sync {
    async fn list_groups(&self) -> SyncResult<Vec<MlpGroup>>;
    async fn list_subscribers(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<SubscriberPage>;
    async fn get_subscriber(&self, id_or_email: &str) -> SyncResult<Subscriber>;
    async fn get_group_subscribers(
        &self,
        group_id: &str,
        page: u32,
        per_page: u32,
    ) -> SyncResult<Vec<Subscriber>>;
    async fn get_subscriber_groups(&self, subscriber_id: &str) -> SyncResult<Vec<MlpGroup>>;
    async fn create_group(&self, name: &str) -> SyncResult<MlpGroup>;
    async fn create_field(&self, name: &str, field_type: &str) -> SyncResult<MlpField>;
    async fn list_fields(&self) -> SyncResult<Vec<MlpField>>;
    async fn create_draft_campaign(
        &self,
        name: &str,
        campaign_type: &str,
        subject: &str,
    ) -> SyncResult<String>;
    async fn list_campaigns_name_to_id(&self) -> SyncResult<HashMap<String, String>>;
    async fn add_to_group(&self, subscriber_id: &str, group_id: &str) -> SyncResult<()>;
    async fn remove_from_group(&self, subscriber_id: &str, group_id: &str) -> SyncResult<()>;
    async fn update_subscriber_fields(
        &self,
        subscriber_id: &str,
        fields: &HashMap<String, String>,
    ) -> SyncResult<()>;
    async fn bulk_import_to_group(
        &self,
        subscribers: &[Subscriber],
        group_id: &str,
    ) -> SyncResult<usize>;
    async fn verify_tier(&self, subscriber_id: &str, expected_tier: &str) -> SyncResult<bool>;
    fn abort_pending(&self);
}

pub struct MlpClient {
    http: Http,
}

impl MlpClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        policy: RetryPolicy,
        min_interval: Duration,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let http = Http::new(
            base_url,
            Auth::Bearer(api_key.to_string()),
            policy,
            min_interval,
            timeout,
        )?;
        Ok(Self { http })
    }

    pub fn flush_cache(&self) {
        self.http.flush_cache();
    }

    /// Cheap authenticated call used by connection validation.
    pub async fn ping(&self) -> SyncResult<()> {
        self.http.get_json_uncached("/fields", &[]).await.map(|_| ())
    }
}

#[async_trait]
impl MlpApi for MlpClient {
    async fn list_groups(&self) -> SyncResult<Vec<MlpGroup>> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let body = self
                .http
                .get_json(
                    "/groups",
                    &[
                        ("limit".into(), "250".into()),
                        ("page".into(), page.to_string()),
                    ],
                )
                .await?;
            let batch = data_array(&body, "/groups")?;
            if batch.is_empty() {
                break;
            }
            for item in &batch {
                out.push(parse_group(item)?);
            }
            page += 1;
        }
        debug!("listed {} groups upstream", out.len());
        Ok(out)
    }

    async fn list_subscribers(
        &self,
        cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<SubscriberPage> {
        let mut query = vec![("limit".to_string(), limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor".to_string(), cursor.to_string()));
        }
        let body = self.http.get_json_uncached("/subscribers", &query).await?;
        let subscribers = data_array(&body, "/subscribers")?
            .into_iter()
            .map(parse_subscriber)
            .collect::<SyncResult<Vec<_>>>()?;
        let next_cursor = body
            .pointer("/meta/next_cursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(String::from);
        Ok(SubscriberPage {
            subscribers,
            next_cursor,
        })
    }

    async fn get_subscriber(&self, id_or_email: &str) -> SyncResult<Subscriber> {
        let body = self
            .http
            .get_json_uncached(&format!("/subscribers/{id_or_email}"), &[])
            .await?;
        parse_subscriber(data_object(&body, "/subscribers/{id}")?)
    }

    async fn get_group_subscribers(
        &self,
        group_id: &str,
        page: u32,
        per_page: u32,
    ) -> SyncResult<Vec<Subscriber>> {
        let body = self
            .http
            .get_json_uncached(
                &format!("/groups/{group_id}/subscribers"),
                &[
                    ("limit".into(), per_page.to_string()),
                    ("page".into(), page.to_string()),
                ],
            )
            .await?;
        data_array(&body, "/groups/{id}/subscribers")?
            .into_iter()
            .map(parse_subscriber)
            .collect()
    }

    async fn get_subscriber_groups(&self, subscriber_id: &str) -> SyncResult<Vec<MlpGroup>> {
        let body = self
            .http
            .get_json_uncached(&format!("/subscribers/{subscriber_id}/groups"), &[])
            .await?;
        data_array(&body, "/subscribers/{id}/groups")?
            .into_iter()
            .map(parse_group)
            .collect()
    }

    async fn create_group(&self, name: &str) -> SyncResult<MlpGroup> {
        let body = self
            .http
            .post_json("/groups", &json!({ "name": name.to_uppercase() }))
            .await?;
        let group = parse_group(data_object(&body, "/groups")?)?;
        info!("created upstream group {}", group.name);
        Ok(group)
    }

    async fn create_field(&self, name: &str, field_type: &str) -> SyncResult<MlpField> {
        let body = self
            .http
            .post_json(
                "/fields",
                &json!({ "name": name.to_uppercase(), "type": field_type }),
            )
            .await?;
        let field = parse_field(data_object(&body, "/fields")?)?;
        info!("created upstream field {}", field.name);
        Ok(field)
    }

    async fn list_fields(&self) -> SyncResult<Vec<MlpField>> {
        let body = self.http.get_json("/fields", &[]).await?;
        data_array(&body, "/fields")?
            .into_iter()
            .map(parse_field)
            .collect()
    }

    async fn create_draft_campaign(
        &self,
        name: &str,
        campaign_type: &str,
        subject: &str,
    ) -> SyncResult<String> {
        let body = self
            .http
            .post_json(
                "/campaigns",
                &json!({
                    "name": name.to_uppercase(),
                    "type": campaign_type,
                    "emails": [{ "subject": subject }],
                }),
            )
            .await?;
        let campaign = data_object(&body, "/campaigns")?;
        let id = string_at(campaign, "id")
            .ok_or_else(|| shape_error("/campaigns", "missing campaign id"))?;
        info!("created draft campaign {name} ({id})");
        Ok(id)
    }

    async fn list_campaigns_name_to_id(&self) -> SyncResult<HashMap<String, String>> {
        let mut out = HashMap::new();
        let mut page = 1u32;
        loop {
            let body = self
                .http
                .get_json(
                    "/campaigns",
                    &[
                        ("limit".into(), "100".into()),
                        ("page".into(), page.to_string()),
                    ],
                )
                .await?;
            let batch = data_array(&body, "/campaigns")?;
            if batch.is_empty() {
                break;
            }
            for item in &batch {
                let name = string_at(item, "name")
                    .ok_or_else(|| shape_error("/campaigns", "missing campaign name"))?;
                let id = string_at(item, "id")
                    .ok_or_else(|| shape_error("/campaigns", "missing campaign id"))?;
                out.insert(name.to_uppercase(), id);
            }
            page += 1;
        }
        Ok(out)
    }

    async fn add_to_group(&self, subscriber_id: &str, group_id: &str) -> SyncResult<()> {
        self.http
            .post_json(
                &format!("/subscribers/{subscriber_id}/groups/{group_id}"),
                &Value::Null,
            )
            .await?;
        Ok(())
    }

    async fn remove_from_group(&self, subscriber_id: &str, group_id: &str) -> SyncResult<()> {
        self.http
            .delete(&format!("/subscribers/{subscriber_id}/groups/{group_id}"))
            .await?;
        Ok(())
    }

    async fn update_subscriber_fields(
        &self,
        subscriber_id: &str,
        fields: &HashMap<String, String>,
    ) -> SyncResult<()> {
        self.http
            .put_json(
                &format!("/subscribers/{subscriber_id}"),
                &json!({ "fields": fields }),
            )
            .await?;
        Ok(())
    }

    async fn bulk_import_to_group(
        &self,
        subscribers: &[Subscriber],
        group_id: &str,
    ) -> SyncResult<usize> {
        if subscribers.is_empty() {
            return Ok(0);
        }
        let payload: Vec<Value> = subscribers
            .iter()
            .map(|s| json!({ "email": s.email, "fields": s.fields }))
            .collect();
        self.http
            .post_json(
                &format!("/groups/{group_id}/import-subscribers"),
                &json!({ "subscribers": payload }),
            )
            .await?;
        info!("imported {} subscribers into group {group_id}", subscribers.len());
        Ok(subscribers.len())
    }

    /// Polls the subscriber's groups until one carries the expected tier
    /// suffix, up to a fixed number of attempts. Group writes upstream are
    /// eventually consistent.
    async fn verify_tier(&self, subscriber_id: &str, expected_tier: &str) -> SyncResult<bool> {
        let suffix = format!("_{}", expected_tier.to_uppercase());
        for attempt in 1..=VERIFY_ATTEMPTS {
            let groups = self.get_subscriber_groups(subscriber_id).await?;
            if groups
                .iter()
                .any(|g| g.name.to_uppercase().ends_with(&suffix))
            {
                return Ok(true);
            }
            if attempt < VERIFY_ATTEMPTS {
                debug!(
                    "tier {expected_tier} not visible for {subscriber_id} \
                     (attempt {attempt}/{VERIFY_ATTEMPTS})"
                );
                sleep(VERIFY_DELAY).await;
            }
        }
        warn!("tier {expected_tier} never became visible for {subscriber_id}");
        Ok(false)
    }

    fn abort_pending(&self) {
        self.http.abort_pending();
    }
}

// Wire parsing. Responses are shape-validated here; anything malformed is a
// transport error so the caller's retry policy applies.

fn shape_error(endpoint: &str, detail: &str) -> SyncError {
    SyncError::Transport(format!("unexpected response shape from {endpoint}: {detail}"))
}

fn data_array<'a>(body: &'a Value, endpoint: &str) -> SyncResult<Vec<&'a Value>> {
    match body.get("data") {
        Some(Value::Array(items)) => Ok(items.iter().collect()),
        // Some list endpoints return a bare array.
        None => match body {
            Value::Array(items) => Ok(items.iter().collect()),
            Value::Null => Ok(Vec::new()),
            _ => Err(shape_error(endpoint, "expected data array")),
        },
        Some(_) => Err(shape_error(endpoint, "data is not an array")),
    }
}

fn data_object<'a>(body: &'a Value, endpoint: &str) -> SyncResult<&'a Value> {
    match body.get("data") {
        Some(obj @ Value::Object(_)) => Ok(obj),
        None if body.is_object() => Ok(body),
        _ => Err(shape_error(endpoint, "expected data object")),
    }
}

fn string_at(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_group(value: &Value) -> SyncResult<MlpGroup> {
    Ok(MlpGroup {
        id: string_at(value, "id").ok_or_else(|| shape_error("/groups", "group without id"))?,
        name: string_at(value, "name")
            .ok_or_else(|| shape_error("/groups", "group without name"))?
            .to_uppercase(),
    })
}

fn parse_field(value: &Value) -> SyncResult<MlpField> {
    Ok(MlpField {
        id: string_at(value, "id").ok_or_else(|| shape_error("/fields", "field without id"))?,
        name: string_at(value, "name")
            .ok_or_else(|| shape_error("/fields", "field without name"))?
            .to_uppercase(),
        field_type: string_at(value, "type").unwrap_or_else(|| "text".to_string()),
    })
}

fn parse_ts(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_subscriber(value: &Value) -> SyncResult<Subscriber> {
    let id =
        string_at(value, "id").ok_or_else(|| shape_error("/subscribers", "subscriber without id"))?;
    let email = string_at(value, "email")
        .ok_or_else(|| shape_error("/subscribers", "subscriber without email"))?
        .trim()
        .to_lowercase();
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .map(SubscriberStatus::parse)
        .unwrap_or(SubscriberStatus::Active);

    // Custom field values arrive as strings, numbers or null; normalize to
    // strings keyed lower-case.
    let mut fields = HashMap::new();
    if let Some(Value::Object(raw)) = value.get("fields") {
        for (k, v) in raw {
            let rendered = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => continue,
                other => other.to_string(),
            };
            fields.insert(k.to_lowercase(), rendered);
        }
    }

    Ok(Subscriber {
        id,
        email,
        status,
        first_name: string_at(value, "first_name")
            .or_else(|| fields.get("name").cloned()),
        last_name: string_at(value, "last_name")
            .or_else(|| fields.get("last_name").cloned()),
        display_name: string_at(value, "display_name"),
        fields,
        subscribed_at: parse_ts(value, "subscribed_at"),
        updated_at: parse_ts(value, "updated_at").unwrap_or_else(Utc::now),
    })
}
