//! Catalog refresh orchestration: normalization, the refresh cycle, and
//! the twice-daily scheduler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use orp_adapters::{adapter_for_source, AdapterContext, SourceAdapter};
use orp_core::{discount_percentage, Offer, RawOffer, CATEGORY_OTHER};
use orp_storage::{offer_digest, HttpClientConfig, HttpFetcher, OfferStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "orp-sync";

/// Sale-cycle default applied when a source does not publish an expiry.
const DEFAULT_VALIDITY_DAYS: i64 = 7;

/// Markup factor applied when a source publishes only the sale price.
const OLD_PRICE_MARKUP: f64 = 1.25;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub refresh_cron_1: String,
    pub refresh_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            scheduler_enabled: std::env::var("ORP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron_1: std::env::var("ORP_REFRESH_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            refresh_cron_2: std::env::var("ORP_REFRESH_CRON_2")
                .unwrap_or_else(|_| "0 0 12 * * *".to_string()),
            user_agent: std::env::var("ORP_USER_AGENT")
                .unwrap_or_else(|_| "orp-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("ORP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

pub fn load_source_registry(workspace_root: &PathBuf) -> Result<SourceRegistry> {
    let path = workspace_root.join("sources.yaml");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Keyword rules for category assignment, checked in order against the
/// lowercased product name. First hit wins.
const CATEGORY_RULES: &[(&str, &[&str])] = &[
    ("Meat", &[
        "chicken", "pork", "beef", "turkey", "sausage", "ham", "salami", "bacon",
        "mince", "ribs", "wings", "breast", "thigh", "cutlet",
    ]),
    ("Dairy", &[
        "milk", "yogurt", "yoghurt", "cream", "cheese", "butter", "curd",
    ]),
    ("Vegetables", &[
        "tomato", "potato", "onion", "carrot", "cabbage", "pepper", "cucumber",
        "lettuce", "spinach", "zucchini", "beans", "peas", "eggplant",
    ]),
    ("Fruit", &[
        "apple", "banana", "orange", "lemon", "grape", "melon", "strawberr",
        "pear", "plum", "cherr", "peach", "kiwi",
    ]),
    ("Bakery", &[
        "bread", "baguette", "bun", "roll", "croissant", "pretzel", "toast",
    ]),
    ("Fish", &[
        "fish", "salmon", "tuna", "sardine", "mackerel", "trout", "herring",
    ]),
    ("Pantry", &[
        "oil", "vinegar", "flour", "sugar", "salt", "rice", "pasta", "spaghetti",
        "canned", "tomato paste", "cornmeal", "macaroni",
    ]),
    ("Drinks", &[
        "beer", "wine", "juice", "water", "coffee", "tea", "cola", "lemonade",
    ]),
    ("Sweets", &[
        "chocolate", "biscuit", "cookie", "wafer", "ice cream", "dessert", "cake",
    ]),
];

fn canonical_category(hint: Option<&str>) -> Option<&'static str> {
    let hint = hint?.trim();
    CATEGORY_RULES
        .iter()
        .map(|(category, _)| *category)
        .find(|category| category.eq_ignore_ascii_case(hint))
}

/// Category from the source hint when it maps onto a known bucket,
/// otherwise a keyword scan of the product name, otherwise "Other".
pub fn assign_category(name: &str, hint: Option<&str>) -> String {
    if let Some(category) = canonical_category(hint) {
        return category.to_string();
    }
    let lower = name.to_lowercase();
    for (category, keywords) in CATEGORY_RULES {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return (*category).to_string();
        }
    }
    CATEGORY_OTHER.to_string()
}

/// Turn raw source records into canonical offers.
///
/// Records with an unusable price shape are dropped with a warning; the
/// discount is always recomputed and the id derived from
/// (source, name, observation date) so re-scrapes upsert.
pub fn normalize(raw_offers: Vec<RawOffer>, observed_at: DateTime<Utc>) -> Vec<Offer> {
    let observed_date = observed_at.format("%Y-%m-%d").to_string();
    let mut offers = Vec::with_capacity(raw_offers.len());

    for raw in raw_offers {
        if raw.new_price <= 0.0 {
            warn!(source = %raw.source, name = %raw.name, "dropping record with non-positive sale price");
            continue;
        }
        let old_price = match raw.old_price {
            Some(old) if old > 0.0 => old,
            Some(_) => {
                warn!(source = %raw.source, name = %raw.name, "dropping record with non-positive reference price");
                continue;
            }
            None => (raw.new_price * OLD_PRICE_MARKUP * 100.0).round() / 100.0,
        };
        if raw.new_price > old_price {
            warn!(
                source = %raw.source,
                name = %raw.name,
                old_price,
                new_price = raw.new_price,
                "dropping record priced above its reference"
            );
            continue;
        }

        let category = assign_category(&raw.name, raw.category_hint.as_deref());
        offers.push(Offer {
            id: offer_digest(&raw.source, &raw.name, &observed_date),
            name: raw.name,
            category,
            store: raw.source,
            image_url: raw.image_url,
            old_price,
            new_price: raw.new_price,
            discount_percentage: discount_percentage(old_price, raw.new_price),
            valid_until: raw
                .valid_until_hint
                .unwrap_or_else(|| observed_at + ChronoDuration::days(DEFAULT_VALIDITY_DAYS)),
            observed_at,
        });
    }

    offers
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("all {0} sources failed; store left unchanged")]
    AllSourcesFailed(usize),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub fetched: usize,
    pub normalized: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub upserted: usize,
    pub swept: usize,
}

/// What a refresh call amounted to: a full cycle, or a no-op because one
/// was already in flight.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Completed(RefreshSummary),
    Coalesced,
}

impl RefreshOutcome {
    pub fn triggered(&self) -> bool {
        matches!(self, RefreshOutcome::Completed(_))
    }
}

/// Owned refresh state: the single-flight flag plus the timestamps the
/// health endpoint reports. No ambient/global access.
#[derive(Debug, Default)]
pub struct RefreshContext {
    in_flight: AtomicBool,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

fn read_recovering<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_recovering<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RefreshContext {
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *read_recovering(&self.last_success)
    }

    pub fn last_error(&self) -> Option<String> {
        read_recovering(&self.last_error).clone()
    }

    fn record_success(&self, at: DateTime<Utc>) {
        *write_recovering(&self.last_success) = Some(at);
        *write_recovering(&self.last_error) = None;
    }

    fn record_failure(&self, message: String) {
        *write_recovering(&self.last_error) = Some(message);
    }
}

/// Clears the in-flight flag even on an early error return.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RefreshPipeline {
    http: Arc<HttpFetcher>,
    store: Arc<OfferStore>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    context: RefreshContext,
}

impl RefreshPipeline {
    /// Build the pipeline from config, wiring an adapter for every enabled
    /// source in the registry. Unknown source ids are skipped with a warning
    /// rather than failing startup.
    pub fn new(config: &SyncConfig, store: Arc<OfferStore>) -> Result<Self> {
        let registry = load_source_registry(&config.workspace_root)?;
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        for source in registry.sources.into_iter().filter(|s| s.enabled) {
            match adapter_for_source(&source.source_id) {
                Some(adapter) => adapters.push(Arc::from(adapter)),
                None => warn!(source_id = %source.source_id, "no adapter registered; skipping source"),
            }
        }

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        Ok(Self {
            http: Arc::new(http),
            store,
            adapters,
            context: RefreshContext::default(),
        })
    }

    /// Test/embedding constructor with an explicit adapter set.
    pub fn with_adapters(
        store: Arc<OfferStore>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
    ) -> Result<Self> {
        Ok(Self {
            http: Arc::new(HttpFetcher::new(HttpClientConfig::default())?),
            store,
            adapters,
            context: RefreshContext::default(),
        })
    }

    pub fn context(&self) -> &RefreshContext {
        &self.context
    }

    pub fn store(&self) -> &Arc<OfferStore> {
        &self.store
    }

    /// Run one refresh cycle, single-flight. A caller that loses the
    /// check-and-set races gets [`RefreshOutcome::Coalesced`] and no work
    /// is queued.
    pub async fn refresh_once(&self) -> Result<RefreshOutcome, SyncError> {
        if self
            .context
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("refresh already in progress; coalescing trigger");
            return Ok(RefreshOutcome::Coalesced);
        }
        let _guard = InFlightGuard(&self.context.in_flight);

        let started_at = Utc::now();
        let ctx = AdapterContext {
            run_id: Uuid::new_v4(),
            observed_at: started_at,
        };
        info!(run_id = %ctx.run_id, sources = self.adapters.len(), "starting refresh cycle");

        // Sources fetch concurrently and independently; the cycle merges
        // results only after every one has settled.
        let mut join_set = JoinSet::new();
        for adapter in &self.adapters {
            let adapter = Arc::clone(adapter);
            let http = Arc::clone(&self.http);
            join_set.spawn(async move {
                let result = adapter.fetch(&http, &ctx).await;
                (adapter.source_id().to_string(), result)
            });
        }

        let mut reports = Vec::with_capacity(self.adapters.len());
        let mut normalized_offers = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (source_id, result) = joined.map_err(|e| anyhow::anyhow!("fetch task panicked: {e}"))?;
            match result {
                Ok(raw) => {
                    let fetched = raw.len();
                    let offers = normalize(raw, ctx.observed_at);
                    info!(source_id = %source_id, fetched, normalized = offers.len(), "source fetched");
                    reports.push(SourceReport {
                        source_id,
                        fetched,
                        normalized: offers.len(),
                        error: None,
                    });
                    normalized_offers.extend(offers);
                }
                Err(err) => {
                    warn!(source_id = %source_id, error = %err, "source failed for this cycle");
                    reports.push(SourceReport {
                        source_id,
                        fetched: 0,
                        normalized: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        reports.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let total = reports.len();
        if total > 0 && reports.iter().all(|r| r.error.is_some()) {
            let message = format!("all {total} sources failed");
            self.context.record_failure(message);
            return Err(SyncError::AllSourcesFailed(total));
        }

        let upserted = self.store.upsert(normalized_offers).await;
        let swept = self.store.sweep_expired(Utc::now()).await;
        let finished_at = Utc::now();
        self.context.record_success(finished_at);
        info!(run_id = %ctx.run_id, upserted, swept, "refresh cycle complete");

        Ok(RefreshOutcome::Completed(RefreshSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at,
            sources: reports,
            upserted,
            swept,
        }))
    }
}

/// Wire the two fixed daily refresh jobs. Triggers landing while a cycle
/// is running coalesce through the pipeline's in-flight flag.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<RefreshPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.refresh_cron_1, &config.refresh_cron_2] {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.refresh_once().await {
                    Ok(RefreshOutcome::Completed(summary)) => {
                        info!(run_id = %summary.run_id, upserted = summary.upserted, "scheduled refresh complete");
                    }
                    Ok(RefreshOutcome::Coalesced) => {
                        info!("scheduled refresh coalesced into in-progress cycle");
                    }
                    Err(err) => {
                        warn!(error = %err, "scheduled refresh failed; keeping previous catalog");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orp_adapters::AdapterError;

    fn raw(source: &str, name: &str, old: Option<f64>, new: f64) -> RawOffer {
        RawOffer {
            source: source.to_string(),
            name: name.to_string(),
            old_price: old,
            new_price: new,
            category_hint: None,
            image_url: None,
            valid_until_hint: None,
        }
    }

    struct StaticAdapter {
        id: &'static str,
        offers: Vec<RawOffer>,
        delay: Duration,
    }

    #[async_trait]
    impl SourceAdapter for StaticAdapter {
        fn source_id(&self) -> &'static str {
            self.id
        }

        fn listing_url(&self) -> &'static str {
            "https://stub.example/listing"
        }

        fn parse_listing(
            &self,
            _body: &str,
            _ctx: &AdapterContext,
        ) -> Result<Vec<RawOffer>, AdapterError> {
            Ok(self.offers.clone())
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
        ) -> Result<Vec<RawOffer>, AdapterError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.offers.clone())
        }
    }

    struct FailingAdapter {
        id: &'static str,
    }

    #[async_trait]
    impl SourceAdapter for FailingAdapter {
        fn source_id(&self) -> &'static str {
            self.id
        }

        fn listing_url(&self) -> &'static str {
            "https://stub.example/listing"
        }

        fn parse_listing(
            &self,
            _body: &str,
            _ctx: &AdapterContext,
        ) -> Result<Vec<RawOffer>, AdapterError> {
            Err(AdapterError::Message("boom".to_string()))
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
        ) -> Result<Vec<RawOffer>, AdapterError> {
            Err(AdapterError::Message("connection refused".to_string()))
        }
    }

    struct TogglingAdapter {
        fail: AtomicBool,
        offers: Vec<RawOffer>,
    }

    #[async_trait]
    impl SourceAdapter for TogglingAdapter {
        fn source_id(&self) -> &'static str {
            "northmart"
        }

        fn listing_url(&self) -> &'static str {
            "https://stub.example/listing"
        }

        fn parse_listing(
            &self,
            _body: &str,
            _ctx: &AdapterContext,
        ) -> Result<Vec<RawOffer>, AdapterError> {
            Ok(self.offers.clone())
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
        ) -> Result<Vec<RawOffer>, AdapterError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AdapterError::Message("connection refused".to_string()));
            }
            Ok(self.offers.clone())
        }
    }

    fn static_adapter(id: &'static str, offers: Vec<RawOffer>) -> Arc<dyn SourceAdapter> {
        Arc::new(StaticAdapter {
            id,
            offers,
            delay: Duration::ZERO,
        })
    }

    #[test]
    fn normalize_recomputes_discount_and_derives_stable_ids() {
        let observed = Utc::now();
        let offers = normalize(
            vec![raw("northmart", "Chicken Breast 1kg", Some(32.99), 22.99)],
            observed,
        );
        assert_eq!(offers.len(), 1);
        let offer = &offers[0];
        assert_eq!(offer.discount_percentage, discount_percentage(32.99, 22.99));
        assert_eq!(offer.category, "Meat");
        assert_eq!(offer.valid_until, observed + ChronoDuration::days(7));

        // Same sale scraped again on the same day maps to the same id.
        let again = normalize(
            vec![raw("northmart", "chicken breast 1KG", Some(32.99), 21.00)],
            observed,
        );
        assert_eq!(offers[0].id, again[0].id);
    }

    #[test]
    fn normalize_drops_invalid_price_shapes() {
        let observed = Utc::now();
        let offers = normalize(
            vec![
                raw("northmart", "Negative sale", Some(10.0), -1.0),
                raw("northmart", "Priced above reference", Some(5.0), 9.0),
                raw("northmart", "Zero reference", Some(0.0), 3.0),
                raw("northmart", "Good Milk 1L", Some(8.0), 5.0),
            ],
            observed,
        );
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].name, "Good Milk 1L");
    }

    #[test]
    fn normalize_defaults_a_missing_reference_price() {
        let offers = normalize(vec![raw("pricewise", "Table Salt 1kg", None, 4.0)], Utc::now());
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].old_price, 5.0);
        assert!(offers[0].discount_percentage > 0);
    }

    #[test]
    fn category_assignment_prefers_hint_then_keywords_then_other() {
        assert_eq!(assign_category("Something odd", Some("Dairy")), "Dairy");
        assert_eq!(assign_category("Smoked salmon fillet", None), "Fish");
        assert_eq!(assign_category("Mystery item", Some("weird-hint")), "Other");
    }

    #[tokio::test]
    async fn refresh_is_idempotent_for_identical_source_data() {
        let store = Arc::new(OfferStore::new());
        let offers = vec![
            raw("northmart", "Milk 1L", Some(8.0), 5.0),
            raw("northmart", "Butter 200g", Some(17.0), 12.0),
        ];
        let pipeline = RefreshPipeline::with_adapters(
            Arc::clone(&store),
            vec![static_adapter("northmart", offers)],
        )
        .unwrap();

        pipeline.refresh_once().await.unwrap();
        let after_first = store.len().await;
        pipeline.refresh_once().await.unwrap();

        assert_eq!(store.len().await, after_first);
        assert_eq!(after_first, 2);
    }

    #[tokio::test]
    async fn concurrent_refreshes_coalesce_to_a_single_cycle() {
        let store = Arc::new(OfferStore::new());
        let slow = Arc::new(StaticAdapter {
            id: "northmart",
            offers: vec![raw("northmart", "Milk 1L", Some(8.0), 5.0)],
            delay: Duration::from_millis(200),
        });
        let pipeline =
            Arc::new(RefreshPipeline::with_adapters(store, vec![slow]).unwrap());

        let first = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.refresh_once().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = pipeline.refresh_once().await.unwrap();

        assert!(!second.triggered());
        assert!(first.await.unwrap().unwrap().triggered());
    }

    #[tokio::test]
    async fn one_failed_source_does_not_poison_the_cycle() {
        let store = Arc::new(OfferStore::new());
        let pipeline = RefreshPipeline::with_adapters(
            Arc::clone(&store),
            vec![
                Arc::new(FailingAdapter { id: "greenfield" }),
                static_adapter(
                    "northmart",
                    vec![raw("northmart", "Milk 1L", Some(8.0), 5.0)],
                ),
            ],
        )
        .unwrap();

        let outcome = pipeline.refresh_once().await.unwrap();
        let RefreshOutcome::Completed(summary) = outcome else {
            panic!("expected a completed cycle");
        };

        assert_eq!(store.len().await, 1);
        let failed = summary
            .sources
            .iter()
            .find(|r| r.source_id == "greenfield")
            .unwrap();
        assert!(failed.error.is_some());
        assert!(pipeline.context().last_success().is_some());
    }

    #[tokio::test]
    async fn all_sources_failing_leaves_the_store_untouched() {
        let store = Arc::new(OfferStore::new());
        let seed = normalize(
            vec![raw("northmart", "Previously Stored", Some(10.0), 6.0)],
            Utc::now(),
        );
        store.upsert(seed).await;

        let pipeline = RefreshPipeline::with_adapters(
            Arc::clone(&store),
            vec![
                Arc::new(FailingAdapter { id: "northmart" }),
                Arc::new(FailingAdapter { id: "greenfield" }),
            ],
        )
        .unwrap();

        let err = pipeline.refresh_once().await.unwrap_err();
        assert!(matches!(err, SyncError::AllSourcesFailed(2)));
        assert_eq!(store.len().await, 1);
        assert!(pipeline.context().last_error().is_some());
        // A second trigger is possible immediately: the flag was released.
        assert!(pipeline.refresh_once().await.is_err());
    }

    #[tokio::test]
    async fn failed_cycle_after_a_success_keeps_last_success_and_catalog() {
        let store = Arc::new(OfferStore::new());
        let adapter = Arc::new(TogglingAdapter {
            fail: AtomicBool::new(false),
            offers: vec![raw("northmart", "Milk 1L", Some(8.0), 5.0)],
        });
        let pipeline = RefreshPipeline::with_adapters(
            Arc::clone(&store),
            vec![Arc::clone(&adapter) as Arc<dyn SourceAdapter>],
        )
        .unwrap();

        pipeline.refresh_once().await.unwrap();
        let first_success = pipeline
            .context()
            .last_success()
            .expect("successful cycle records a timestamp");
        let listed_before = store.list(None).await;
        assert_eq!(listed_before.len(), 1);

        adapter.fail.store(true, Ordering::SeqCst);
        let err = pipeline.refresh_once().await.unwrap_err();
        assert!(matches!(err, SyncError::AllSourcesFailed(1)));

        // The failure is recorded, but the prior success and the catalog
        // it produced both survive.
        assert_eq!(pipeline.context().last_success(), Some(first_success));
        assert!(pipeline.context().last_error().is_some());
        assert_eq!(store.list(None).await, listed_before);
    }
}
