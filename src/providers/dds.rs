//! Digital-downloads store (DDS) client.
//!
//! Key+token query auth over the same [`Http`] core. The store is the
//! authority on purchases: the engine asks it which orders exist, who bought
//! a product, and whether a stored order id really belongs to a subscriber.

use crate::error::{SyncError, SyncResult};
use crate::providers::http::{Auth, Http, RetryPolicy};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Fixed timeout for loopback calls into the embedding host.
pub const LOOPBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the sales pagination walk when answering a point query; a
/// missing purchase should not turn into an unbounded crawl.
const MAX_SALES_SCAN_PAGES: u32 = 50;

#[derive(Debug, Clone)]
pub struct DdsCustomer {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DdsProduct {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct DdsSale {
    pub order_id: i64,
    pub email: String,
    pub product_ids: Vec<String>,
}

/// One page of the sales enumeration, stream-friendly: the emails seen on
/// the page plus the full sale rows.
#[derive(Debug, Clone, Default)]
pub struct SalesPage {
    pub emails: Vec<String>,
    pub sales: Vec<DdsSale>,
}

#[async_trait]
pub trait DdsApi: Send + Sync {
    async fn list_customers(&self, page: u32, size: u32) -> SyncResult<Vec<DdsCustomer>>;
    async fn list_products(&self) -> SyncResult<Vec<DdsProduct>>;
    async fn list_sales(
        &self,
        product_id: Option<&str>,
        page: u32,
        size: u32,
    ) -> SyncResult<SalesPage>;
    async fn has_user_purchased(&self, email: &str, product_id: &str) -> SyncResult<bool>;
    /// True iff the order exists and its email matches case-insensitively.
    async fn validate_order(&self, order_id: i64, email: &str) -> SyncResult<bool>;
}

pub struct DdsClient {
    http: Http,
}

impl DdsClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        token: &str,
        policy: RetryPolicy,
        min_interval: Duration,
        timeout: Duration,
    ) -> SyncResult<Self> {
        // Loopback calls into the embedding host get the fixed 30 s budget
        // regardless of the configured API timeout.
        let loopback = base_url.contains("127.0.0.1") || base_url.contains("localhost");
        let timeout = if loopback { LOOPBACK_TIMEOUT } else { timeout };
        let http = Http::new(
            base_url,
            Auth::QueryKeyToken {
                key: api_key.to_string(),
                token: token.to_string(),
            },
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
        self.http
            .get_json_uncached("/products", &[("number".into(), "1".into())])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl DdsApi for DdsClient {
    async fn list_customers(&self, page: u32, size: u32) -> SyncResult<Vec<DdsCustomer>> {
        let body = self
            .http
            .get_json_uncached(
                "/customers",
                &[
                    ("page".into(), page.to_string()),
                    ("number".into(), size.to_string()),
                ],
            )
            .await?;
        let items = array_at(&body, "customers");
        items.iter().map(|c| parse_customer(c)).collect()
    }

    async fn list_products(&self) -> SyncResult<Vec<DdsProduct>> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            let body = self
                .http
                .get_json(
                    "/products",
                    &[
                        ("page".into(), page.to_string()),
                        ("number".into(), "100".into()),
                    ],
                )
                .await?;
            let items = array_at(&body, "products");
            if items.is_empty() {
                break;
            }
            for item in &items {
                out.push(parse_product(item)?);
            }
            page += 1;
        }
        Ok(out)
    }

    async fn list_sales(
        &self,
        product_id: Option<&str>,
        page: u32,
        size: u32,
    ) -> SyncResult<SalesPage> {
        let mut query = vec![
            ("page".to_string(), page.to_string()),
            ("number".to_string(), size.to_string()),
        ];
        if let Some(product_id) = product_id {
            query.push(("product".to_string(), product_id.to_string()));
        }
        let body = self.http.get_json_uncached("/sales", &query).await?;
        let mut out = SalesPage::default();
        for item in array_at(&body, "sales") {
            let sale = parse_sale(item)?;
            out.emails.push(sale.email.clone());
            out.sales.push(sale);
        }
        Ok(out)
    }

    async fn has_user_purchased(&self, email: &str, product_id: &str) -> SyncResult<bool> {
        let email = email.trim().to_lowercase();
        for page in 1..=MAX_SALES_SCAN_PAGES {
            let batch = self.list_sales(Some(product_id), page, 100).await?;
            if batch.sales.is_empty() {
                return Ok(false);
            }
            if batch.emails.iter().any(|e| e.to_lowercase() == email) {
                return Ok(true);
            }
        }
        warn!("sales scan for product {product_id} hit the page bound");
        Ok(false)
    }

    async fn validate_order(&self, order_id: i64, email: &str) -> SyncResult<bool> {
        let body = self
            .http
            .get_json_uncached("/sales", &[("id".into(), order_id.to_string())])
            .await?;
        let sales = array_at(&body, "sales");
        let Some(sale) = sales.first() else {
            debug!("order {order_id} not found");
            return Ok(false);
        };
        let sale = parse_sale(sale)?;
        Ok(sale.email.eq_ignore_ascii_case(email.trim()))
    }
}

/// Resolves `(artist, product_code)` to a DDS product id by matching product
/// titles. Short codes go through the operator's code table first, so a code
/// like `LP` can stand for its full catalogue wording.
pub async fn find_product_by_title_pattern(
    api: &dyn DdsApi,
    code_table: &HashMap<String, String>,
    artist: &str,
    product_code: &str,
) -> SyncResult<Option<String>> {
    let needle = code_table
        .get(&product_code.to_uppercase())
        .cloned()
        .unwrap_or_else(|| product_code.to_string())
        .to_lowercase();
    let artist = artist.replace('_', " ").to_lowercase();

    let products = api.list_products().await?;
    let hit = products.into_iter().find(|p| {
        let title = p.title.to_lowercase();
        title.contains(&artist) && title.contains(&needle)
    });
    Ok(hit.map(|p| p.id))
}

/// Restartable producer over the sales enumeration: pages are fetched ahead
/// and pushed into a bounded channel, so a consumer persisting batches never
/// holds more than `channel_cap` pages in memory. The task stops when the
/// store runs dry or the receiver goes away.
pub fn spawn_sales_producer(
    api: Arc<dyn DdsApi>,
    product_id: Option<String>,
    start_page: u32,
    page_size: u32,
    channel_cap: usize,
) -> mpsc::Receiver<SyncResult<SalesPage>> {
    let (tx, rx) = mpsc::channel(channel_cap.max(1));
    tokio::spawn(async move {
        let mut page = start_page.max(1);
        loop {
            let result = api.list_sales(product_id.as_deref(), page, page_size).await;
            let done = match &result {
                Ok(batch) => batch.sales.is_empty(),
                Err(_) => true,
            };
            if tx.send(result).await.is_err() {
                break;
            }
            if done {
                break;
            }
            page += 1;
        }
    });
    rx
}

fn shape_error(endpoint: &str, detail: &str) -> SyncError {
    SyncError::Transport(format!("unexpected response shape from {endpoint}: {detail}"))
}

/// The store wraps lists under a named key (`{"sales": [...]}`); some
/// deployments return the bare array.
fn array_at<'a>(body: &'a Value, key: &str) -> Vec<&'a Value> {
    match body.get(key) {
        Some(Value::Array(items)) => items.iter().collect(),
        _ => match body {
            Value::Array(items) => items.iter().collect(),
            _ => Vec::new(),
        },
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match value.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn parse_customer(value: &Value) -> SyncResult<DdsCustomer> {
    let info = value.get("info").unwrap_or(value);
    Ok(DdsCustomer {
        id: string_field(info, &["id", "customer_id", "user_id"])
            .ok_or_else(|| shape_error("/customers", "customer without id"))?,
        email: string_field(info, &["email"])
            .ok_or_else(|| shape_error("/customers", "customer without email"))?
            .to_lowercase(),
        display_name: string_field(info, &["display_name", "name"]),
    })
}

fn parse_product(value: &Value) -> SyncResult<DdsProduct> {
    let info = value.get("info").unwrap_or(value);
    Ok(DdsProduct {
        id: string_field(info, &["id", "product_id"])
            .ok_or_else(|| shape_error("/products", "product without id"))?,
        title: string_field(info, &["title", "name"])
            .ok_or_else(|| shape_error("/products", "product without title"))?,
    })
}

fn parse_sale(value: &Value) -> SyncResult<DdsSale> {
    let order_id = match value.get("ID").or_else(|| value.get("id")) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| shape_error("/sales", "sale without numeric id"))?;

    let email = string_field(value, &["email"])
        .ok_or_else(|| shape_error("/sales", "sale without email"))?
        .to_lowercase();

    let mut product_ids = Vec::new();
    if let Some(Value::Array(products)) = value.get("products") {
        for p in products {
            if let Some(id) = string_field(p, &["id", "product_id"]) {
                product_ids.push(id);
            }
        }
    }

    Ok(DdsSale {
        order_id,
        email,
        product_ids,
    })
}
