//! JSON API for the offer catalog and recipe synthesis.
//!
//! Five endpoints: list offers, a cached dashboard aggregate, recipe
//! generation, a manual refresh trigger, and health. All state hangs off
//! [`AppState`]; handlers stay thin and push the work into the owning crates.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use orp_core::{DashboardStats, Offer, Recipe};
use orp_recipes::{SynthesisError, Synthesizer};
use orp_storage::{OfferFilter, OfferStore};
use orp_sync::{RefreshOutcome, RefreshPipeline, RefreshSummary, SyncError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// How long a computed dashboard aggregate stays servable.
pub const DASHBOARD_CACHE_TTL: Duration = Duration::from_secs(180);

/// How many generated recipes the dashboard remembers.
pub const RECENT_RECIPES_CAP: usize = 24;

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Recent-recipe buffer and dashboard cache
// ---------------------------------------------------------------------------

/// Bounded newest-first buffer of recipes produced this process lifetime.
#[derive(Default)]
pub struct RecentRecipes {
    buffer: Mutex<VecDeque<Recipe>>,
}

impl RecentRecipes {
    pub fn record(&self, recipes: &[Recipe]) {
        let mut buffer = lock_recovering(&self.buffer);
        for recipe in recipes {
            buffer.push_front(recipe.clone());
        }
        buffer.truncate(RECENT_RECIPES_CAP);
    }

    pub fn snapshot(&self) -> Vec<Recipe> {
        lock_recovering(&self.buffer).iter().cloned().collect()
    }

    pub fn latest_generated_at(&self) -> Option<DateTime<Utc>> {
        lock_recovering(&self.buffer)
            .iter()
            .map(|r| r.generated_at)
            .max()
    }
}

#[derive(Default)]
struct DashboardCache {
    slot: Mutex<Option<(Instant, DashboardPayload)>>,
}

impl DashboardCache {
    fn get(&self, ttl: Duration) -> Option<DashboardPayload> {
        let slot = lock_recovering(&self.slot);
        let (computed_at, payload) = slot.as_ref()?;
        (computed_at.elapsed() <= ttl).then(|| payload.clone())
    }

    fn put(&self, payload: DashboardPayload) {
        *lock_recovering(&self.slot) = Some((Instant::now(), payload));
    }

    fn invalidate(&self) {
        *lock_recovering(&self.slot) = None;
    }
}

// ---------------------------------------------------------------------------
// State and wiring
// ---------------------------------------------------------------------------

pub struct AppState {
    pub store: Arc<OfferStore>,
    pub pipeline: Arc<RefreshPipeline>,
    pub synthesizer: Arc<Synthesizer>,
    pub recent_recipes: RecentRecipes,
    dashboard_cache: DashboardCache,
    dashboard_ttl: Duration,
}

impl AppState {
    pub fn new(
        store: Arc<OfferStore>,
        pipeline: Arc<RefreshPipeline>,
        synthesizer: Arc<Synthesizer>,
    ) -> Self {
        Self {
            store,
            pipeline,
            synthesizer,
            recent_recipes: RecentRecipes::default(),
            dashboard_cache: DashboardCache::default(),
            dashboard_ttl: DASHBOARD_CACHE_TTL,
        }
    }

    pub fn with_dashboard_ttl(mut self, ttl: Duration) -> Self {
        self.dashboard_ttl = ttl;
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/offers", get(offers_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/recipes/generate", post(generate_recipes_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("ORP_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct OffersQuery {
    store: Option<String>,
    category: Option<String>,
    min_discount: Option<u8>,
}

#[derive(Serialize)]
struct OffersResponse {
    total: usize,
    offers: Vec<Offer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardPayload {
    pub stats: DashboardStats,
    /// Live offers, best discount first.
    pub offers: Vec<Offer>,
    /// Recent recipes whose cost leans hardest on discounted offers.
    pub top_recipes: Vec<Recipe>,
    /// Recent recipes ordered by cost per serving.
    pub cheapest_recipes: Vec<Recipe>,
}

#[derive(Deserialize)]
struct GenerateRequest {
    #[serde(default)]
    offer_ids: Vec<String>,
}

#[derive(Serialize)]
struct GenerateResponse {
    recipes: Vec<Recipe>,
}

#[derive(Serialize)]
struct RefreshResponse {
    triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<RefreshSummary>,
}

#[derive(Serialize)]
struct HealthResponse {
    /// True once a refresh cycle has completed successfully.
    ok: bool,
    offers: usize,
    last_refresh: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_refresh_error: Option<String>,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn offers_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OffersQuery>,
) -> Json<OffersResponse> {
    let filter = OfferFilter {
        store: query.store,
        category: query.category,
        min_discount: query.min_discount,
    };
    let offers = state.store.list(Some(&filter)).await;
    Json(OffersResponse {
        total: offers.len(),
        offers,
    })
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Json<DashboardPayload> {
    if let Some(cached) = state.dashboard_cache.get(state.dashboard_ttl) {
        return Json(cached);
    }
    let payload = compute_dashboard(&state).await;
    state.dashboard_cache.put(payload.clone());
    Json(payload)
}

async fn generate_recipes_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerateRequest>,
) -> Response {
    match state.synthesizer.synthesize(&request.offer_ids).await {
        Ok(recipes) => {
            state.recent_recipes.record(&recipes);
            state.dashboard_cache.invalidate();
            Json(GenerateResponse { recipes }).into_response()
        }
        Err(err) => {
            let status = match &err {
                SynthesisError::EmptySelection => StatusCode::UNPROCESSABLE_ENTITY,
                SynthesisError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                SynthesisError::NoValidRecipes => StatusCode::BAD_GATEWAY,
            };
            warn!(error = %err, "recipe generation failed");
            error_response(status, err.to_string())
        }
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.refresh_once().await {
        Ok(RefreshOutcome::Completed(summary)) => {
            state.dashboard_cache.invalidate();
            Json(RefreshResponse {
                triggered: true,
                summary: Some(summary),
            })
            .into_response()
        }
        Ok(RefreshOutcome::Coalesced) => Json(RefreshResponse {
            triggered: false,
            summary: None,
        })
        .into_response(),
        Err(err @ SyncError::AllSourcesFailed(_)) => {
            error_response(StatusCode::BAD_GATEWAY, err.to_string())
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let context = state.pipeline.context();
    let last_refresh = context.last_success();
    Json(HealthResponse {
        ok: last_refresh.is_some(),
        offers: state.store.len().await,
        last_refresh,
        last_refresh_error: context.last_error(),
    })
}

// ---------------------------------------------------------------------------
// Dashboard aggregation
// ---------------------------------------------------------------------------

async fn compute_dashboard(state: &AppState) -> DashboardPayload {
    let offers = state.store.list(None).await;

    let mut categories = BTreeMap::new();
    let mut stores = BTreeSet::new();
    let mut total_potential_savings = 0.0;
    for offer in &offers {
        *categories.entry(offer.category.clone()).or_insert(0usize) += 1;
        stores.insert(offer.store.clone());
        total_potential_savings += offer.savings();
    }

    let recent = state.recent_recipes.snapshot();
    DashboardPayload {
        stats: DashboardStats {
            total_offers: offers.len(),
            total_potential_savings: (total_potential_savings * 100.0).round() / 100.0,
            categories,
            stores: stores.into_iter().collect(),
            recipes_updated: state.recent_recipes.latest_generated_at(),
        },
        offers,
        top_recipes: rank_top(&recent),
        cheapest_recipes: rank_cheapest(&recent),
    }
}

fn cmp_f64(a: f64, b: f64) -> std::cmp::Ordering {
    a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
}

/// Highest offer-sourced cost fraction first; ties go to the lower cost per
/// serving.
fn rank_top(recipes: &[Recipe]) -> Vec<Recipe> {
    let mut ranked = recipes.to_vec();
    ranked.sort_by(|a, b| {
        cmp_f64(b.offer_cost_fraction(), a.offer_cost_fraction())
            .then_with(|| cmp_f64(a.cost_per_serving, b.cost_per_serving))
    });
    ranked
}

/// Lowest cost per serving first; ties go to the recipe using more offers.
fn rank_cheapest(recipes: &[Recipe]) -> Vec<Recipe> {
    let mut ranked = recipes.to_vec();
    ranked.sort_by(|a, b| {
        cmp_f64(a.cost_per_serving, b.cost_per_serving)
            .then_with(|| b.offer_ingredient_count().cmp(&a.offer_ingredient_count()))
    });
    ranked
}
