//! Core domain model for ORP: offers, recipes, and dashboard stats.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "orp-core";

/// Category bucket assigned to offers that match no keyword rule.
pub const CATEGORY_OTHER: &str = "Other";

/// Raw per-source record, the common shape every source adapter emits.
///
/// Prices are already numeric here; adapters own the text-to-number step
/// because only they know the feed's formatting quirks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOffer {
    pub source: String,
    pub name: String,
    /// Reference price before the discount. Sources that only publish the
    /// sale price leave this empty; the normalizer fills in a default.
    pub old_price: Option<f64>,
    pub new_price: f64,
    pub category_hint: Option<String>,
    pub image_url: Option<String>,
    pub valid_until_hint: Option<DateTime<Utc>>,
}

/// Canonical, deduplicated discounted-product record with a bounded
/// validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Stable digest over (source, lowercase name, observation date), so a
    /// re-scrape of the same live sale upserts instead of duplicating.
    pub id: String,
    pub name: String,
    pub category: String,
    pub store: String,
    pub image_url: Option<String>,
    pub old_price: f64,
    pub new_price: f64,
    /// Always recomputed from the two prices, never taken from a feed.
    pub discount_percentage: u8,
    pub valid_until: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

impl Offer {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.valid_until > now
    }

    pub fn savings(&self) -> f64 {
        (self.old_price - self.new_price).max(0.0)
    }
}

/// `round((old - new) / old * 100)` with the degenerate cases pinned to 0.
pub fn discount_percentage(old_price: f64, new_price: f64) -> u8 {
    if old_price <= 0.0 || new_price > old_price {
        return 0;
    }
    (((old_price - new_price) / old_price) * 100.0).round() as u8
}

/// One line of a recipe's shopping list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    /// Free-form magnitude plus unit, e.g. "500g" or "2 tbsp".
    pub quantity: String,
    /// Resolved cost contribution; 0.0 when nothing could be resolved.
    pub price: f64,
    /// True iff the price came from a live offer rather than an estimate.
    pub from_offer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Nutrition {
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fat: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fiber: Option<f64>,
}

/// A synthesized, priced meal suggestion. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub prep_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cook_time: Option<String>,
    pub servings: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    pub ingredients: Vec<Ingredient>,
    /// Ordered execution steps.
    pub instructions: Vec<String>,
    pub nutrition: Nutrition,
    /// Sum of ingredient prices.
    pub estimated_cost: f64,
    /// `estimated_cost / max(servings, 1)`.
    pub cost_per_serving: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tips: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl Recipe {
    /// Fraction of the recipe's cost covered by offer-sourced ingredients.
    /// Used by the dashboard ranking; 0.0 for a zero-cost recipe.
    pub fn offer_cost_fraction(&self) -> f64 {
        if self.estimated_cost <= f64::EPSILON {
            return 0.0;
        }
        let from_offers: f64 = self
            .ingredients
            .iter()
            .filter(|i| i.from_offer)
            .map(|i| i.price)
            .sum();
        from_offers / self.estimated_cost
    }

    pub fn offer_ingredient_count(&self) -> usize {
        self.ingredients.iter().filter(|i| i.from_offer).count()
    }
}

/// Derived summary statistics; recomputed from the store, never accumulated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_offers: usize,
    pub total_potential_savings: f64,
    pub categories: BTreeMap<String, usize>,
    pub stores: Vec<String>,
    pub recipes_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_rounds_to_nearest_percent() {
        assert_eq!(discount_percentage(8.0, 5.0), 38);
        assert_eq!(discount_percentage(10.0, 7.5), 25);
        assert_eq!(discount_percentage(3.0, 2.0), 33);
    }

    #[test]
    fn discount_degenerate_inputs_are_zero() {
        assert_eq!(discount_percentage(0.0, 5.0), 0);
        assert_eq!(discount_percentage(-1.0, 5.0), 0);
        assert_eq!(discount_percentage(4.0, 5.0), 0);
    }

    #[test]
    fn offer_cost_fraction_ignores_estimated_ingredients() {
        let recipe = Recipe {
            id: Uuid::new_v4(),
            name: "Test".into(),
            description: String::new(),
            prep_time: "10 min".into(),
            cook_time: None,
            servings: 4,
            difficulty: None,
            ingredients: vec![
                Ingredient {
                    name: "Chicken".into(),
                    quantity: "500g".into(),
                    price: 6.0,
                    from_offer: true,
                },
                Ingredient {
                    name: "Oil".into(),
                    quantity: "2 tbsp".into(),
                    price: 2.0,
                    from_offer: false,
                },
            ],
            instructions: vec!["Cook".into()],
            nutrition: Nutrition::default(),
            estimated_cost: 8.0,
            cost_per_serving: 2.0,
            tags: vec![],
            tips: None,
            generated_at: Utc::now(),
        };
        assert!((recipe.offer_cost_fraction() - 0.75).abs() < 1e-9);
        assert_eq!(recipe.offer_ingredient_count(), 1);
    }
}
