//! Source adapter contracts + one adapter per vendor feed.
//!
//! Each adapter encapsulates a single vendor's listing shape and translates
//! it into the common [`RawOffer`] record. New vendors slot in behind
//! [`SourceAdapter`] without touching the normalizer, store, or scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orp_core::RawOffer;
use orp_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "orp-adapters";

/// Shared per-cycle context handed to every adapter.
#[derive(Debug, Clone, Copy)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub observed_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            observed_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One adapter per source. `fetch` is the only I/O; `parse_listing` is pure
/// so feed-shape regressions are testable without a network.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn listing_url(&self) -> &'static str;

    fn parse_listing(
        &self,
        body: &str,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawOffer>, AdapterError>;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawOffer>, AdapterError> {
        let response = http
            .fetch_bytes(ctx.run_id, self.source_id(), self.listing_url())
            .await?;
        self.parse_listing(&response.text(), ctx)
    }
}

/// Strip currency symbols and thousands noise, accept comma decimals.
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',' || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = cleaned.replace(',', ".");
    // "1.299.99" style thousands separators: keep only the last dot.
    let value = match normalized.rfind('.') {
        Some(idx) if normalized.matches('.').count() > 1 => {
            let (head, tail) = normalized.split_at(idx);
            format!("{}{}", head.replace('.', ""), tail)
        }
        _ => normalized,
    };
    value.parse::<f64>().ok().filter(|v| *v > 0.0)
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_image_url(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr("src").or_else(|| n.value().attr("data-src")))
        .and_then(|s| text_or_none(s.to_string()))
        .filter(|url| url.starts_with("http"))
}

/// Grid-of-product-boxes HTML listing (the "weekly offers" page shape).
#[derive(Debug, Clone, Copy)]
struct NorthmartAdapter;

#[async_trait]
impl SourceAdapter for NorthmartAdapter {
    fn source_id(&self) -> &'static str {
        "northmart"
    }

    fn listing_url(&self) -> &'static str {
        "https://www.northmart.example/weekly-offers"
    }

    fn parse_listing(
        &self,
        body: &str,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawOffer>, AdapterError> {
        let document = Html::parse_document(body);
        let product = selector(".product-grid-box, [data-grid-box]")?;
        let title = selector(".product-grid-box__title, h3")?;
        let price = selector(".pricebox__price, .price")?;
        let old_price = selector(".pricebox__price--old, s, del")?;
        let category = selector(".product-grid-box__category")?;
        let image = selector("img")?;

        let mut offers = Vec::new();
        for node in document.select(&product) {
            let Some(name) = first_text(node, &title).filter(|n| n.len() >= 3) else {
                continue;
            };
            let Some(new_price) = first_text(node, &price).as_deref().and_then(parse_price)
            else {
                continue;
            };
            offers.push(RawOffer {
                source: self.source_id().to_string(),
                name,
                old_price: first_text(node, &old_price).as_deref().and_then(parse_price),
                new_price,
                category_hint: first_text(node, &category),
                image_url: first_image_url(node, &image),
                valid_until_hint: None,
            });
        }
        Ok(offers)
    }
}

/// Offer-tile HTML listing, with the price split into tag elements.
#[derive(Debug, Clone, Copy)]
struct GreenfieldAdapter;

#[async_trait]
impl SourceAdapter for GreenfieldAdapter {
    fn source_id(&self) -> &'static str {
        "greenfield"
    }

    fn listing_url(&self) -> &'static str {
        "https://www.greenfield.example/offers/current"
    }

    fn parse_listing(
        &self,
        body: &str,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawOffer>, AdapterError> {
        let document = Html::parse_document(body);
        let tile = selector(".offer-tile, [data-offer-tile]")?;
        let title = selector(".offer-tile__title, .offer-tile__subtitle, h3")?;
        let price = selector(".price-tag__price")?;
        let old_price = selector(".price-tag__old-price")?;
        let category = selector(".offer-tile__category")?;
        let image = selector("img")?;

        let mut offers = Vec::new();
        for node in document.select(&tile) {
            let Some(name) = first_text(node, &title).filter(|n| n.len() >= 3) else {
                continue;
            };
            let Some(new_price) = first_text(node, &price).as_deref().and_then(parse_price)
            else {
                continue;
            };
            offers.push(RawOffer {
                source: self.source_id().to_string(),
                name,
                old_price: first_text(node, &old_price).as_deref().and_then(parse_price),
                new_price,
                category_hint: first_text(node, &category),
                image_url: first_image_url(node, &image),
                valid_until_hint: None,
            });
        }
        Ok(offers)
    }
}

/// JSON promotions feed: `{"offers": [{name, price, was_price, ...}]}`.
#[derive(Debug, Clone, Copy)]
struct PricewiseAdapter;

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    // The feed has been seen emitting prices as both numbers and strings.
    cur.as_f64()
        .or_else(|| cur.as_str().and_then(parse_price))
}

#[async_trait]
impl SourceAdapter for PricewiseAdapter {
    fn source_id(&self) -> &'static str {
        "pricewise"
    }

    fn listing_url(&self) -> &'static str {
        "https://api.pricewise.example/v1/promotions"
    }

    fn parse_listing(
        &self,
        body: &str,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawOffer>, AdapterError> {
        let value: JsonValue = serde_json::from_str(body)
            .map_err(|e| AdapterError::Message(format!("invalid promotions feed: {e}")))?;
        let Some(entries) = value.get("offers").and_then(|v| v.as_array()) else {
            return Err(AdapterError::Message(
                "promotions feed missing `offers` array".to_string(),
            ));
        };

        let mut offers = Vec::new();
        for entry in entries {
            let Some(name) = json_str(entry, &["name"])
                .map(str::trim)
                .filter(|n| n.len() >= 3)
            else {
                continue;
            };
            let Some(new_price) = json_f64(entry, &["price"]).filter(|p| *p > 0.0) else {
                continue;
            };
            let valid_until_hint = json_str(entry, &["valid_until"])
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            offers.push(RawOffer {
                source: self.source_id().to_string(),
                name: name.to_string(),
                old_price: json_f64(entry, &["was_price"]),
                new_price,
                category_hint: json_str(entry, &["category"]).map(ToString::to_string),
                image_url: json_str(entry, &["image"]).map(ToString::to_string),
                valid_until_hint,
            });
        }
        Ok(offers)
    }
}

pub fn northmart_adapter() -> impl SourceAdapter {
    NorthmartAdapter
}

pub fn greenfield_adapter() -> impl SourceAdapter {
    GreenfieldAdapter
}

pub fn pricewise_adapter() -> impl SourceAdapter {
    PricewiseAdapter
}

pub fn adapter_for_source(source_id: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        "northmart" => Some(Box::new(NorthmartAdapter)),
        "greenfield" => Some(Box::new(GreenfieldAdapter)),
        "pricewise" => Some(Box::new(PricewiseAdapter)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NORTHMART_LISTING: &str = r#"
    <html><body>
      <div class="product-grid-box">
        <h3 class="product-grid-box__title">Chicken Breast 1kg</h3>
        <span class="pricebox__price">22,99 lei</span>
        <s class="pricebox__price--old">32,99 lei</s>
        <span class="product-grid-box__category">Meat</span>
        <img src="https://cdn.northmart.example/chicken.jpg" />
      </div>
      <div class="product-grid-box">
        <h3 class="product-grid-box__title">Whole Milk 1L</h3>
        <span class="pricebox__price">6.49</span>
      </div>
      <div class="product-grid-box">
        <h3 class="product-grid-box__title">No price here</h3>
      </div>
    </body></html>
    "#;

    const GREENFIELD_LISTING: &str = r#"
    <html><body>
      <div class="offer-tile">
        <h3 class="offer-tile__title">Golden Apples 1kg</h3>
        <span class="price-tag__price">4.99</span>
        <span class="price-tag__old-price">8.99</span>
        <span class="offer-tile__category">Fruit</span>
        <img data-src="https://cdn.greenfield.example/apples.jpg" />
      </div>
      <div class="offer-tile">
        <h3 class="offer-tile__title">ab</h3>
        <span class="price-tag__price">1.00</span>
      </div>
    </body></html>
    "#;

    const PRICEWISE_FEED: &str = r#"{
      "offers": [
        {
          "name": "Sunflower Oil 1L",
          "price": 8.99,
          "was_price": "13,99",
          "category": "Pantry",
          "image": "https://cdn.pricewise.example/oil.jpg",
          "valid_until": "2099-01-01T00:00:00Z"
        },
        {"name": "Missing price"},
        {"name": "Free sample", "price": 0}
      ]
    }"#;

    #[test]
    fn price_parsing_handles_currency_and_comma_decimals() {
        assert_eq!(parse_price("22,99 lei"), Some(22.99));
        assert_eq!(parse_price("$4.50"), Some(4.5));
        assert_eq!(parse_price("1.299,00"), Some(1299.0));
        assert_eq!(parse_price("free"), None);
        assert_eq!(parse_price("0"), None);
    }

    #[test]
    fn northmart_listing_parses_grid_boxes() {
        let ctx = AdapterContext::new();
        let offers = northmart_adapter()
            .parse_listing(NORTHMART_LISTING, &ctx)
            .unwrap();

        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].name, "Chicken Breast 1kg");
        assert_eq!(offers[0].new_price, 22.99);
        assert_eq!(offers[0].old_price, Some(32.99));
        assert_eq!(offers[0].category_hint.as_deref(), Some("Meat"));
        assert_eq!(
            offers[0].image_url.as_deref(),
            Some("https://cdn.northmart.example/chicken.jpg")
        );
        // Second box has no old price; the normalizer fills the default.
        assert_eq!(offers[1].old_price, None);
    }

    #[test]
    fn greenfield_listing_parses_tiles_and_skips_short_names() {
        let ctx = AdapterContext::new();
        let offers = greenfield_adapter()
            .parse_listing(GREENFIELD_LISTING, &ctx)
            .unwrap();

        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].name, "Golden Apples 1kg");
        assert_eq!(offers[0].old_price, Some(8.99));
        assert_eq!(
            offers[0].image_url.as_deref(),
            Some("https://cdn.greenfield.example/apples.jpg")
        );
    }

    #[test]
    fn pricewise_feed_parses_entries_and_drops_unpriced_rows() {
        let ctx = AdapterContext::new();
        let offers = pricewise_adapter()
            .parse_listing(PRICEWISE_FEED, &ctx)
            .unwrap();

        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].name, "Sunflower Oil 1L");
        assert_eq!(offers[0].old_price, Some(13.99));
        assert!(offers[0].valid_until_hint.is_some());
    }

    #[test]
    fn pricewise_rejects_a_non_json_body() {
        let ctx = AdapterContext::new();
        let err = pricewise_adapter()
            .parse_listing("<html>not json</html>", &ctx)
            .unwrap_err();
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[test]
    fn registry_resolves_known_sources_only() {
        assert!(adapter_for_source("northmart").is_some());
        assert!(adapter_for_source("greenfield").is_some());
        assert!(adapter_for_source("pricewise").is_some());
        assert!(adapter_for_source("unknown-mart").is_none());
    }
}
