//! Shared HTTP core for both provider clients.
//!
//! Every provider method goes through [`Http`], which owns the retry loop,
//! rate-limit honouring, minimum inter-request spacing, the idempotent-GET
//! cache and the cooperative abort flag. Callers get back parsed
//! `serde_json::Value`s; shape validation happens in the typed clients.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, warn};

const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Guard against a provider that never stops answering 429.
const MAX_RATE_LIMIT_WAITS: u32 = 5;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub jitter: bool,
    pub honour_headers: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            jitter: true,
            honour_headers: true,
        }
    }
}

/// How requests authenticate.
#[derive(Debug, Clone)]
pub enum Auth {
    Bearer(String),
    /// Key + token as query parameters (the downloads store's scheme).
    QueryKeyToken { key: String, token: String },
    None,
}

struct CacheEntry {
    stored_at: Instant,
    body: Value,
}

struct RateState {
    last_request: Instant,
    /// When the provider told us the budget resets; requests wait past it.
    blocked_until: Option<Instant>,
}

pub struct Http {
    client: Client,
    base_url: String,
    auth: Auth,
    policy: RetryPolicy,
    min_interval: Duration,
    rate: Mutex<RateState>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    abort: AtomicBool,
}

impl Http {
    pub fn new(
        base_url: impl Into<String>,
        auth: Auth,
        policy: RetryPolicy,
        min_interval: Duration,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("TierSync/1.0 (campaign reconciliation)")
            .build()
            .map_err(|e| SyncError::Internal(format!("build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            policy,
            min_interval,
            rate: Mutex::new(RateState {
                last_request: Instant::now() - min_interval,
                blocked_until: None,
            }),
            cache: Mutex::new(HashMap::new()),
            abort: AtomicBool::new(false),
        })
    }

    /// Drains pending work: the flag is consulted before every attempt, so
    /// no further requests go out once it is set.
    pub fn abort_pending(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Drops every cached GET body; called by the memory guard.
    pub fn flush_cache(&self) {
        self.cache.lock().clear();
    }

    /// Cached GET. Entries live for an hour or until a mutation touches the
    /// same resource root.
    pub async fn get_json(&self, path: &str, query: &[(String, String)]) -> SyncResult<Value> {
        let key = cache_key(path, query);
        if let Some(body) = self.cache_lookup(&key) {
            debug!("cache hit for {path}");
            return Ok(body);
        }
        let body = self.request(Method::GET, path, query, None).await?;
        self.cache.lock().insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                body: body.clone(),
            },
        );
        Ok(body)
    }

    /// GET that bypasses the cache (pagination cursors churn too fast to be
    /// worth caching).
    pub async fn get_json_uncached(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> SyncResult<Value> {
        self.request(Method::GET, path, query, None).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> SyncResult<Value> {
        self.invalidate(path);
        self.request(Method::POST, path, &[], Some(body)).await
    }

    pub async fn put_json(&self, path: &str, body: &Value) -> SyncResult<Value> {
        self.invalidate(path);
        self.request(Method::PUT, path, &[], Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> SyncResult<Value> {
        self.invalidate(path);
        self.request(Method::DELETE, path, &[], None).await
    }

    fn cache_lookup(&self, key: &str) -> Option<Value> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.stored_at.elapsed() < CACHE_TTL => Some(entry.body.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    /// Drops cached entries under the mutated resource root, e.g. a POST to
    /// `/groups/7/subscribers` invalidates every cached `/groups` read.
    fn invalidate(&self, path: &str) {
        let root = path
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or("")
            .to_string();
        self.cache
            .lock()
            .retain(|key, _| !key.trim_start_matches('/').starts_with(&root));
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> SyncResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut rate_limit_waits: u32 = 0;
        let mut attempt: u32 = 0;

        loop {
            if self.abort.load(Ordering::SeqCst) {
                return Err(SyncError::Cancelled);
            }
            attempt += 1;
            self.pace().await;

            let mut req = self.client.request(method.clone(), &url);
            match &self.auth {
                Auth::Bearer(token) => {
                    req = req.bearer_auth(token);
                }
                Auth::QueryKeyToken { key, token } => {
                    req = req.query(&[("key", key.as_str()), ("token", token.as_str())]);
                }
                Auth::None => {}
            }
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            let outcome = match req.send().await {
                Ok(response) => self.classify(&method, path, response).await,
                Err(e) => Err(SyncError::from(e)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(SyncError::RateLimited { reset_secs }) => {
                    rate_limit_waits += 1;
                    if rate_limit_waits > MAX_RATE_LIMIT_WAITS {
                        return Err(SyncError::Transport(format!(
                            "still rate limited after {MAX_RATE_LIMIT_WAITS} waits: {url}"
                        )));
                    }
                    warn!("rate limited on {path}, sleeping {reset_secs}s");
                    sleep(Duration::from_secs(reset_secs.max(1))).await;
                    // Rate limiting does not consume a retry attempt.
                    attempt -= 1;
                }
                Err(e) if e.is_retryable() && attempt <= self.policy.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "attempt {attempt}/{} for {} {path} failed ({e}), retrying in {}ms",
                        self.policy.max_retries,
                        method,
                        delay.as_millis()
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Linear backoff: `base_delay × attempt`, with up to 20% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.policy.base_delay.as_millis() as u64 * u64::from(attempt);
        let jittered = if self.policy.jitter {
            let spread = (base / 5).max(1);
            base + rand::thread_rng().gen_range(0..spread)
        } else {
            base
        };
        Duration::from_millis(jittered)
    }

    /// Enforces minimum spacing and any rate-limit block before a request
    /// goes out.
    async fn pace(&self) {
        loop {
            let wait = {
                let mut rate = self.rate.lock();
                let now = Instant::now();
                let blocked = rate
                    .blocked_until
                    .filter(|until| *until > now)
                    .map(|until| until - now);
                let spacing = {
                    let since = now.duration_since(rate.last_request);
                    if since < self.min_interval {
                        Some(self.min_interval - since)
                    } else {
                        None
                    }
                };
                match blocked.into_iter().chain(spacing).max() {
                    Some(wait) => Some(wait),
                    None => {
                        rate.last_request = now;
                        rate.blocked_until = None;
                        None
                    }
                }
            };
            match wait {
                Some(wait) => {
                    debug!("pacing: waiting {}ms", wait.as_millis());
                    sleep(wait).await;
                }
                None => return,
            }
        }
    }

    /// Maps a response to the error taxonomy and records rate-limit headers.
    async fn classify(
        &self,
        method: &Method,
        path: &str,
        response: reqwest::Response,
    ) -> SyncResult<Value> {
        let status = response.status();
        if self.policy.honour_headers {
            self.record_rate_headers(&response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_secs = reset_seconds(&response).unwrap_or(5);
            return Err(SyncError::RateLimited { reset_secs });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Authentication(format!(
                "{method} {path} returned {status}"
            )));
        }
        if status.is_client_error() {
            return Err(SyncError::Client {
                endpoint: path.to_string(),
                method: method.to_string(),
                status: status.as_u16(),
            });
        }
        if status.is_server_error() {
            return Err(SyncError::Transport(format!(
                "{method} {path} returned {status}"
            )));
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        // A parse failure is a retryable transport error: the provider sent
        // a truncated or non-JSON body.
        serde_json::from_str(&text)
            .map_err(|e| SyncError::Transport(format!("{method} {path}: bad json body: {e}")))
    }

    fn record_rate_headers(&self, response: &reqwest::Response) {
        let remaining = header_u64(response, "x-ratelimit-remaining");
        if remaining != Some(0) {
            return;
        }
        if let Some(reset_secs) = reset_seconds(response) {
            let until = Instant::now() + Duration::from_secs(reset_secs);
            debug!("rate budget exhausted, blocking requests for {reset_secs}s");
            self.rate.lock().blocked_until = Some(until);
        }
    }
}

fn cache_key(path: &str, query: &[(String, String)]) -> String {
    let mut key = path.to_string();
    for (k, v) in query {
        key.push_str(&format!("&{k}={v}"));
    }
    key
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Reset headers arrive either as a delta in seconds or as a unix epoch.
fn reset_seconds(response: &reqwest::Response) -> Option<u64> {
    let raw = header_u64(response, "x-ratelimit-reset")
        .or_else(|| header_u64(response, "retry-after"))?;
    if raw > 1_000_000_000 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Some(raw.saturating_sub(now))
    } else {
        Some(raw)
    }
}
