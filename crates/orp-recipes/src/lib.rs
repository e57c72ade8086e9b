//! Recipe synthesis against the live offer catalog.
//!
//! A [`Synthesizer`] takes a selection of offer ids, asks a chat-completions
//! model for recipe suggestions built around those offers, then re-prices every
//! ingredient from the catalog so the cost figures reflect what the store
//! actually knows rather than whatever the model hallucinated. Identical
//! selections within a short window are deduplicated through a
//! fingerprint-keyed cache so concurrent dashboard users do not fan out into
//! parallel model calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use orp_core::{Ingredient, Nutrition, Offer, Recipe};
use orp_storage::OfferStore;

/// How long a cached synthesis result stays servable for the same selection.
pub const SYNTHESIS_CACHE_TTL: Duration = Duration::from_secs(120);

/// Price assumed for an ingredient no fallback-table entry covers.
pub const DEFAULT_FALLBACK_PRICE: f64 = 3.50;

/// Similarity floor for fuzzy ingredient-to-offer matching.
pub const MATCH_THRESHOLD: f64 = 0.82;

const SYSTEM_PROMPT: &str = "You are a professional chef who plans affordable home cooking \
around current supermarket discounts. You respond with JSON only, never prose.";

/// Pantry-staple price estimates used when an ingredient matches no live
/// offer. Keyed on a lowercase substring of the ingredient name; first hit
/// wins, so more specific entries come earlier.
const FALLBACK_PRICES: &[(&str, f64)] = &[
    ("olive oil", 6.00),
    ("sour cream", 4.50),
    ("cream", 4.00),
    ("butter", 5.00),
    ("cheese", 6.50),
    ("egg", 7.00),
    ("milk", 5.50),
    ("chicken", 9.00),
    ("beef", 12.00),
    ("pork", 9.00),
    ("fish", 10.00),
    ("rice", 4.00),
    ("pasta", 3.50),
    ("flour", 3.00),
    ("sugar", 2.50),
    ("onion", 2.00),
    ("garlic", 2.00),
    ("potato", 3.00),
    ("tomato", 3.50),
    ("oil", 4.00),
    ("salt", 1.00),
    ("pepper", 1.50),
    ("spice", 2.00),
    ("herb", 2.00),
];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model credential missing; set ORP_MODEL_API_KEY")]
    MissingCredential,
    #[error("model transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model returned HTTP {status}")]
    Api { status: u16 },
    #[error("model returned an empty completion")]
    EmptyResponse,
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    /// None of the requested offer ids resolved to a live catalog entry.
    #[error("selection resolved to no live offers")]
    EmptySelection,
    /// The model backend could not be reached or rejected the request.
    #[error("recipe model unavailable: {0}")]
    ModelUnavailable(#[source] ModelError),
    /// The model answered, but nothing in the reply survived validation.
    #[error("model reply contained no usable recipes")]
    NoValidRecipes,
}

// ---------------------------------------------------------------------------
// Model backend
// ---------------------------------------------------------------------------

/// Seam between the synthesizer and whatever produces completions. Production
/// uses [`ChatCompletionsBackend`]; tests plug in canned replies.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl ModelConfig {
    pub fn from_env() -> Self {
        let timeout_secs = std::env::var("ORP_MODEL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        Self {
            base_url: std::env::var("ORP_MODEL_BASE_URL")
                .unwrap_or_else(|_| "https://api.groq.com/openai/v1".to_string()),
            api_key: std::env::var("ORP_MODEL_API_KEY").ok(),
            model: std::env::var("ORP_MODEL_NAME")
                .unwrap_or_else(|_| "llama-3.3-70b-versatile".to_string()),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct ChatCompletionsBackend {
    client: reqwest::Client,
    config: ModelConfig,
}

impl ChatCompletionsBackend {
    pub fn new(config: ModelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ModelBackend for ChatCompletionsBackend {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ModelError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or(ModelError::MissingCredential)?;
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: prompt },
            ],
            temperature: 0.7,
            max_tokens: 3500,
        };
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ModelError::Api { status: status.as_u16() });
        }
        let payload: Value = response.json().await?;
        let content = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)?;
        Ok(content)
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Renders the user prompt for a selection of offers. The schema block is the
/// contract the parser below enforces; keep the two in sync.
pub fn build_prompt(offers: &[Offer]) -> String {
    let mut lines = String::from(
        "Create 3 dinner recipes that make the most of these discounted groceries.\n\nCurrent offers:\n",
    );
    for offer in offers {
        lines.push_str(&format!(
            "- {} ({}): {:.2} kr, was {:.2} kr ({}% off), category {}\n",
            offer.name,
            offer.store,
            offer.new_price,
            offer.old_price,
            offer.discount_percentage,
            offer.category,
        ));
    }
    lines.push_str(
        "\nRules:\n\
         - Build each recipe around the offers above; pantry staples are allowed as extras.\n\
         - For every ingredient set \"from_offer\" to true only when it comes from the list.\n\
         - Respond with ONLY a JSON object, no markdown fences, matching exactly:\n\
         {\"recipes\": [{\"name\": str, \"description\": str, \
         \"ingredients\": [{\"name\": str, \"quantity\": str, \"price\": number, \"from_offer\": bool}], \
         \"instructions\": [str], \"prep_time\": str, \"cook_time\": str, \"servings\": int, \
         \"estimated_cost\": number, \"cost_per_serving\": number, \"difficulty\": str, \
         \"nutrition\": {\"calories\": number, \"protein\": number, \"carbs\": number, \"fat\": number}, \
         \"tags\": [str], \"tips\": str}]}\n",
    );
    lines
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Cuts the JSON object out of a model reply that may be wrapped in markdown
/// fences or surrounded by prose. Returns `None` when no braces are found.
pub fn extract_json_payload(reply: &str) -> Option<&str> {
    let mut text = reply.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        text = stripped;
    } else if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
    }
    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped;
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

fn coerce_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// Numbers come back as JSON numbers on good days and as strings like
/// `"450 kcal"` on bad ones. Anything unparseable collapses to 0.
fn coerce_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => {
            let digits: String = s
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            digits.parse().unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

fn coerce_string_vec(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(coerce_str).collect())
        .unwrap_or_default()
}

fn parse_ingredient(value: &Value) -> Option<Ingredient> {
    let name = coerce_str(value.get("name")?)?;
    Some(Ingredient {
        name,
        quantity: value.get("quantity").and_then(coerce_str).unwrap_or_default(),
        price: value.get("price").map(coerce_f64).unwrap_or(0.0),
        from_offer: value.get("from_offer").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Turns one model-reply recipe object into a [`Recipe`], or drops it when a
/// required field (name, ingredients, instructions) is missing or empty.
fn parse_recipe(value: &Value) -> Option<Recipe> {
    let name = coerce_str(value.get("name")?)?;
    let ingredients: Vec<Ingredient> = value
        .get("ingredients")?
        .as_array()?
        .iter()
        .filter_map(parse_ingredient)
        .collect();
    if ingredients.is_empty() {
        return None;
    }
    let instructions = coerce_string_vec(value.get("instructions"));
    if instructions.is_empty() {
        return None;
    }
    let nutrition = value
        .get("nutrition")
        .map(|n| Nutrition {
            calories: n.get("calories").map(coerce_f64).unwrap_or(0.0),
            protein: n.get("protein").map(coerce_f64).unwrap_or(0.0),
            carbs: n.get("carbs").map(coerce_f64).unwrap_or(0.0),
            fat: n.get("fat").map(coerce_f64).unwrap_or(0.0),
            fiber: n.get("fiber").map(coerce_f64),
        })
        .unwrap_or_default();
    let servings = value
        .get("servings")
        .map(coerce_f64)
        .map(|s| s as u32)
        .unwrap_or(4)
        .max(1);
    Some(Recipe {
        id: Uuid::new_v4(),
        name,
        description: value.get("description").and_then(coerce_str).unwrap_or_default(),
        prep_time: value.get("prep_time").and_then(coerce_str).unwrap_or_default(),
        cook_time: value.get("cook_time").and_then(coerce_str),
        servings,
        difficulty: value.get("difficulty").and_then(coerce_str),
        ingredients,
        instructions,
        nutrition,
        estimated_cost: value.get("estimated_cost").map(coerce_f64).unwrap_or(0.0),
        cost_per_serving: value.get("cost_per_serving").map(coerce_f64).unwrap_or(0.0),
        tags: coerce_string_vec(value.get("tags")),
        tips: value.get("tips").and_then(coerce_str),
        generated_at: Utc::now(),
    })
}

/// Parses a full model reply. Recipes that fail validation are dropped
/// individually; an unreadable envelope yields an empty vec.
pub fn parse_recipes(reply: &str) -> Vec<Recipe> {
    let Some(payload) = extract_json_payload(reply) else {
        warn!("model reply contained no JSON object");
        return Vec::new();
    };
    let parsed: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "model reply was not valid JSON");
            return Vec::new();
        }
    };
    let items = match parsed.get("recipes").and_then(Value::as_array) {
        Some(items) => items.clone(),
        // Tolerate a bare top-level array as well.
        None => parsed.as_array().cloned().unwrap_or_default(),
    };
    let total = items.len();
    let recipes: Vec<Recipe> = items.iter().filter_map(parse_recipe).collect();
    if recipes.len() < total {
        warn!(
            dropped = total - recipes.len(),
            kept = recipes.len(),
            "dropped malformed recipes from model reply"
        );
    }
    recipes
}

// ---------------------------------------------------------------------------
// Cost matching
// ---------------------------------------------------------------------------

fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Finds the live offer that best matches an ingredient name. Token
/// containment wins outright; otherwise the highest Jaro-Winkler score at or
/// above [`MATCH_THRESHOLD`] is taken.
pub fn match_offer<'a>(ingredient: &str, offers: &'a [Offer]) -> Option<&'a Offer> {
    let needle = normalize_name(ingredient);
    if needle.is_empty() {
        return None;
    }
    let mut best: Option<(&Offer, f64)> = None;
    for offer in offers {
        let candidate = normalize_name(&offer.name);
        if candidate.is_empty() {
            continue;
        }
        if candidate.contains(&needle) || needle.contains(&candidate) {
            return Some(offer);
        }
        let score = strsim::jaro_winkler(&needle, &candidate);
        if score >= MATCH_THRESHOLD && best.map_or(true, |(_, s)| score > s) {
            best = Some((offer, score));
        }
    }
    best.map(|(offer, _)| offer)
}

/// Fallback estimate for an ingredient no offer covers.
pub fn fallback_price(ingredient: &str) -> f64 {
    let lowered = ingredient.to_lowercase();
    FALLBACK_PRICES
        .iter()
        .find(|(key, _)| lowered.contains(key))
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_FALLBACK_PRICE)
}

/// Re-prices every ingredient from the catalog, then recomputes the recipe's
/// cost totals so they are internally consistent regardless of what the model
/// claimed. Quantity scaling is deliberately not attempted; the offer's unit
/// price is used as-is.
pub fn price_recipe(mut recipe: Recipe, offers: &[Offer]) -> Recipe {
    for ingredient in &mut recipe.ingredients {
        match match_offer(&ingredient.name, offers) {
            Some(offer) => {
                ingredient.price = offer.new_price;
                ingredient.from_offer = true;
            }
            None => {
                ingredient.price = fallback_price(&ingredient.name);
                ingredient.from_offer = false;
                debug!(ingredient = %ingredient.name, price = ingredient.price, "no offer match; using fallback price");
            }
        }
    }
    recipe.estimated_cost = recipe.ingredients.iter().map(|i| i.price).sum();
    recipe.cost_per_serving = recipe.estimated_cost / f64::from(recipe.servings.max(1));
    recipe
}

// ---------------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------------

/// Order-insensitive fingerprint of an offer selection.
pub fn selection_fingerprint(offer_ids: &[String]) -> String {
    let mut ids: Vec<&str> = offer_ids.iter().map(String::as_str).collect();
    ids.sort_unstable();
    ids.dedup();
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(b":");
    }
    hex::encode(&hasher.finalize()[..16])
}

#[derive(Default)]
struct FingerprintSlot {
    gate: Arc<tokio::sync::Mutex<()>>,
    cached: Option<(Instant, Vec<Recipe>)>,
}

pub struct Synthesizer {
    store: Arc<OfferStore>,
    backend: Arc<dyn ModelBackend>,
    cache: Mutex<HashMap<String, FingerprintSlot>>,
    cache_ttl: Duration,
}

impl Synthesizer {
    pub fn new(store: Arc<OfferStore>, backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            store,
            backend,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: SYNTHESIS_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn slot_gate(&self, fingerprint: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut cache = self.lock_cache();
        cache.entry(fingerprint.to_string()).or_default().gate.clone()
    }

    fn cached_result(&self, fingerprint: &str) -> Option<Vec<Recipe>> {
        let cache = self.lock_cache();
        let slot = cache.get(fingerprint)?;
        let (stored_at, recipes) = slot.cached.as_ref()?;
        if stored_at.elapsed() <= self.cache_ttl {
            Some(recipes.clone())
        } else {
            None
        }
    }

    fn store_result(&self, fingerprint: &str, recipes: &[Recipe]) {
        let mut cache = self.lock_cache();
        let ttl = self.cache_ttl;
        for slot in cache.values_mut() {
            if slot.cached.as_ref().is_some_and(|(at, _)| at.elapsed() > ttl) {
                slot.cached = None;
            }
        }
        // A slot whose gate is held by an in-flight call must survive the
        // prune; dropping it would let a racing caller mint a second gate
        // for the same fingerprint.
        cache.retain(|_, slot| slot.cached.is_some() || Arc::strong_count(&slot.gate) > 1);
        cache
            .entry(fingerprint.to_string())
            .or_default()
            .cached = Some((Instant::now(), recipes.to_vec()));
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, FingerprintSlot>> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Synthesizes recipes for a selection of offer ids. Identical selections
    /// inside the cache TTL share a single model call; callers that race on
    /// the same fingerprint queue on its gate and then read the cached result.
    pub async fn synthesize(&self, offer_ids: &[String]) -> Result<Vec<Recipe>, SynthesisError> {
        let now = Utc::now();
        let snapshot = self.store.snapshot().await;
        let mut selected: Vec<Offer> = Vec::new();
        let mut seen: Vec<&str> = Vec::new();
        for id in offer_ids {
            if seen.contains(&id.as_str()) {
                continue;
            }
            seen.push(id);
            if let Some(offer) = snapshot.get(id).filter(|o| o.is_live(now)) {
                selected.push(offer.clone());
            }
        }
        if selected.is_empty() {
            return Err(SynthesisError::EmptySelection);
        }

        let selected_ids: Vec<String> = selected.iter().map(|o| o.id.clone()).collect();
        let fingerprint = selection_fingerprint(&selected_ids);
        let gate = self.slot_gate(&fingerprint);
        let _held = gate.lock().await;

        if let Some(cached) = self.cached_result(&fingerprint) {
            debug!(%fingerprint, "serving cached synthesis result");
            return Ok(cached);
        }

        let prompt = build_prompt(&selected);
        info!(
            %fingerprint,
            offers = selected.len(),
            "requesting recipe synthesis from model"
        );
        let reply = self
            .backend
            .complete(SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|err| {
                warn!(error = %err, "model call failed");
                SynthesisError::ModelUnavailable(err)
            })?;

        let parsed = parse_recipes(&reply);
        if parsed.is_empty() {
            return Err(SynthesisError::NoValidRecipes);
        }

        // Live offers beyond the user's selection are fair game for matching;
        // the model was only shown the selection, but pricing should use
        // everything the catalog knows.
        let all_live: Vec<Offer> = snapshot
            .values()
            .filter(|o| o.is_live(now))
            .cloned()
            .collect();
        let priced: Vec<Recipe> = parsed
            .into_iter()
            .map(|r| price_recipe(r, &all_live))
            .collect();

        self.store_result(&fingerprint, &priced);
        info!(%fingerprint, recipes = priced.len(), "synthesis complete");
        Ok(priced)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
