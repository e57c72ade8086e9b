//! Freshness-bounded offer catalog + HTTP fetch utilities for ORP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use orp_core::Offer;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "orp-storage";

/// Truncated hex digest used for stable offer ids.
pub fn offer_digest(source: &str, name: &str, observed_date: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(name.to_lowercase().as_bytes());
    hasher.update(b":");
    hasher.update(observed_date.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Read-side filter for [`OfferStore::list`].
#[derive(Debug, Clone, Default)]
pub struct OfferFilter {
    pub store: Option<String>,
    pub category: Option<String>,
    pub min_discount: Option<u8>,
}

impl OfferFilter {
    fn matches(&self, offer: &Offer) -> bool {
        if let Some(store) = &self.store {
            if !offer.store.eq_ignore_ascii_case(store) {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if !offer.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        if let Some(min) = self.min_discount {
            if offer.discount_percentage < min {
                return false;
            }
        }
        true
    }
}

/// The one piece of long-lived shared mutable state: a copy-on-write
/// catalog of canonical offers keyed by id.
///
/// Writers build a new map and swap the `Arc`; readers clone the `Arc` and
/// work on an immutable snapshot, so a concurrent upsert can never expose a
/// half-written offer.
#[derive(Debug, Default)]
pub struct OfferStore {
    catalog: RwLock<Arc<HashMap<String, Offer>>>,
}

impl OfferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace offers by id, last write wins on content. Entries
    /// with other ids are untouched, which is what lets repeated daily
    /// scrapes converge instead of grow.
    pub async fn upsert(&self, offers: Vec<Offer>) -> usize {
        if offers.is_empty() {
            return 0;
        }
        let mut guard = self.catalog.write().await;
        let mut next: HashMap<String, Offer> = guard.as_ref().clone();
        let count = offers.len();
        for offer in offers {
            next.insert(offer.id.clone(), offer);
        }
        *guard = Arc::new(next);
        count
    }

    pub async fn get(&self, id: &str) -> Option<Offer> {
        self.catalog.read().await.get(id).cloned()
    }

    /// Live offers only, sorted by discount descending then name. Applies
    /// the lazy read-time liveness check so expired entries never surface
    /// even between sweeps.
    pub async fn list(&self, filter: Option<&OfferFilter>) -> Vec<Offer> {
        let snapshot = self.snapshot().await;
        let now = Utc::now();
        let mut offers: Vec<Offer> = snapshot
            .values()
            .filter(|o| o.is_live(now))
            .filter(|o| filter.map_or(true, |f| f.matches(o)))
            .cloned()
            .collect();
        offers.sort_by(|a, b| {
            b.discount_percentage
                .cmp(&a.discount_percentage)
                .then_with(|| a.name.cmp(&b.name))
        });
        offers
    }

    /// Remove offers whose validity window has passed. Returns the number
    /// removed. Invoked after every refresh cycle.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.catalog.write().await;
        let before = guard.len();
        if guard.values().all(|o| o.is_live(now)) {
            return 0;
        }
        let next: HashMap<String, Offer> = guard
            .as_ref()
            .iter()
            .filter(|(_, o)| o.is_live(now))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let removed = before - next.len();
        *guard = Arc::new(next);
        removed
    }

    /// Cheap immutable snapshot of the whole catalog. Includes expired
    /// entries; callers that care filter with [`Offer::is_live`].
    pub async fn snapshot(&self) -> Arc<HashMap<String, Offer>> {
        self.catalog.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.catalog.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.catalog.read().await.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Per-source, recoverable fetch failure. Exhausting retries for one source
/// never aborts the fetch of other sources.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET with a bounded timeout and a small retry budget. Transient
    /// failures (5xx, 429, connect/timeout) are retried with exponential
    /// backoff; everything else fails fast.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_bytes_limited(source_id, url).instrument(span).await
    }

    async fn fetch_bytes_limited(
        &self,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use orp_core::discount_percentage;

    fn mk_offer(id: &str, name: &str, old: f64, new: f64, valid_for_days: i64) -> Offer {
        let now = Utc::now();
        Offer {
            id: id.to_string(),
            name: name.to_string(),
            category: "Meat".to_string(),
            store: "northmart".to_string(),
            image_url: None,
            old_price: old,
            new_price: new,
            discount_percentage: discount_percentage(old, new),
            valid_until: now + ChronoDuration::days(valid_for_days),
            observed_at: now,
        }
    }

    #[test]
    fn offer_digest_is_stable_and_case_insensitive() {
        let a = offer_digest("northmart", "Chicken Breast", "2026-08-29");
        let b = offer_digest("northmart", "chicken breast", "2026-08-29");
        let c = offer_digest("northmart", "Chicken Breast", "2026-08-30");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[tokio::test]
    async fn upsert_by_id_replaces_instead_of_duplicating() {
        let store = OfferStore::new();
        store
            .upsert(vec![mk_offer("o1", "Milk 1L", 8.0, 5.0, 2)])
            .await;
        store
            .upsert(vec![mk_offer("o1", "Milk 1L", 8.0, 4.5, 2)])
            .await;

        assert_eq!(store.len().await, 1);
        let offer = store.get("o1").await.expect("offer present");
        assert_eq!(offer.new_price, 4.5);
    }

    #[tokio::test]
    async fn upsert_leaves_other_ids_untouched() {
        let store = OfferStore::new();
        store
            .upsert(vec![
                mk_offer("o1", "Milk 1L", 8.0, 5.0, 2),
                mk_offer("o2", "Butter 200g", 17.0, 12.0, 2),
            ])
            .await;
        store
            .upsert(vec![mk_offer("o1", "Milk 1L", 8.0, 4.0, 2)])
            .await;

        let o2 = store.get("o2").await.expect("o2 still present");
        assert_eq!(o2.new_price, 12.0);
    }

    #[tokio::test]
    async fn expired_offers_are_hidden_from_list_and_removed_by_sweep() {
        let store = OfferStore::new();
        store
            .upsert(vec![
                mk_offer("live", "Apples 1kg", 9.0, 5.0, 2),
                mk_offer("stale", "Old Bread", 8.0, 5.0, -1),
            ])
            .await;

        let listed = store.list(None).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "live");

        let removed = store.sweep_expired(Utc::now()).await;
        assert_eq!(removed, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("stale").await.is_none());
    }

    #[tokio::test]
    async fn list_sorts_by_discount_descending() {
        let store = OfferStore::new();
        store
            .upsert(vec![
                mk_offer("a", "Small cut", 10.0, 9.0, 2),
                mk_offer("b", "Deep cut", 10.0, 4.0, 2),
            ])
            .await;
        let listed = store.list(None).await;
        assert_eq!(listed[0].id, "b");
    }

    #[tokio::test]
    async fn list_filter_narrows_by_store_and_discount() {
        let store = OfferStore::new();
        let mut other = mk_offer("c", "Cheese", 20.0, 18.0, 2);
        other.store = "greenfield".to_string();
        store
            .upsert(vec![mk_offer("b", "Deep cut", 10.0, 4.0, 2), other])
            .await;

        let filter = OfferFilter {
            store: Some("northmart".to_string()),
            min_discount: Some(50),
            ..Default::default()
        };
        let listed = store.list(Some(&filter)).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "b");
    }

    #[tokio::test]
    async fn snapshot_is_isolated_from_later_writes() {
        let store = OfferStore::new();
        store
            .upsert(vec![mk_offer("o1", "Milk 1L", 8.0, 5.0, 2)])
            .await;
        let snapshot = store.snapshot().await;
        store
            .upsert(vec![mk_offer("o1", "Milk 1L", 8.0, 3.0, 2)])
            .await;

        assert_eq!(snapshot.get("o1").map(|o| o.new_price), Some(5.0));
        assert_eq!(store.get("o1").await.map(|o| o.new_price), Some(3.0));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses_are_server_errors_and_throttles() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
