//! The conditional metered-pricing engine and its data model.
//!
//! A [`PriceCard`] is the resolved, date-scoped rule set for one
//! (provider, model, endpoint) triple. The [`engine`] selects exactly one
//! [`PriceRule`] per usage meter and produces a nanos-exact [`Bill`].

pub mod catalog;
pub mod conditions;
pub mod engine;

pub use catalog::{Catalog, CatalogRow};
pub use conditions::{Condition, ConditionOp, matches_conditions};
pub use engine::compute_bill;

use crate::money::{Nanos, format_nanos_exact};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Meter names the gateway's provider adapters are known to emit. Usage keys
/// outside this set still bill when a card carries a rule for them.
pub const KNOWN_METERS: &[&str] = &[
    "input_text_tokens",
    "input_image_tokens",
    "input_audio_tokens",
    "input_video_tokens",
    "output_text_tokens",
    "output_image_tokens",
    "output_audio_tokens",
    "output_video_tokens",
    "output_image",
    "output_video_seconds",
    "cached_write_text_tokens",
    "cached_write_image_tokens",
    "cached_write_audio_tokens",
    "cached_write_video_tokens",
    "cached_read_text_tokens",
    "cached_read_image_tokens",
    "cached_read_video_tokens",
    "cached_read_audio_tokens",
    "embedding_tokens",
    "requests",
];

/// How repeated units of a meter are priced. Carried through from the
/// catalog; the engine currently bills every unit at the selected rule's
/// price (`flat` semantics) regardless of mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieringMode {
    Flat,
    Cliff,
    Marginal,
}

/// One billing rule for one meter, immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRule {
    pub id: String,
    pub pricing_plan: String,
    pub meter: String,
    pub unit: String,
    /// Quantity covered by one billable unit; always >= 1.
    pub unit_size: u32,
    /// Decimal string, arbitrary precision preserved until nanos conversion.
    pub price_per_unit: String,
    pub currency: String,
    pub tiering_mode: Option<TieringMode>,
    #[serde(rename = "match", default)]
    pub conditions: Vec<Condition>,
    /// Higher wins.
    pub priority: i64,
}

/// The resolved, date-scoped rule set for one (provider, model, endpoint)
/// triple. Recomputed fresh per lookup, never cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceCard {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    /// Minimum `effective_from` across constituent rows.
    pub effective_from: DateTime<Utc>,
    /// Tightest known expiry among rows, or `None` if no row expires.
    pub effective_to: Option<DateTime<Utc>>,
    pub currency: String,
    /// Maximum `updated_at` across rows.
    pub version: DateTime<Utc>,
    pub rules: Vec<PriceRule>,
}

/// One request's usage: quantities per meter plus the context object used
/// only for condition evaluation (never billed directly).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSample {
    /// Meter name → non-negative quantity, in deterministic iteration order.
    pub meters: BTreeMap<String, f64>,
    /// Arbitrary nested context for condition evaluation.
    pub context: Value,
}

impl UsageSample {
    /// Splits a raw usage payload into numeric meters and condition context.
    ///
    /// A key is a meter when it is a finite number and is either a known
    /// meter name or named by one of the card's rules. Everything else lands
    /// in the context; a nested `context` object is lifted to the top level.
    pub fn split(raw: &Value, card: &PriceCard) -> Self {
        let mut meters = BTreeMap::new();
        let mut context = Map::new();

        let Some(obj) = raw.as_object() else {
            return Self {
                meters,
                context: Value::Object(context),
            };
        };

        let is_meter = |key: &str| KNOWN_METERS.contains(&key) || card.rules.iter().any(|rule| rule.meter == key);

        for (key, value) in obj {
            match value.as_f64() {
                Some(quantity) if quantity.is_finite() && is_meter(key) => {
                    meters.insert(key.clone(), quantity);
                }
                _ => {
                    context.insert(key.clone(), value.clone());
                }
            }
        }

        // Lift a nested `context` object up to the top level.
        if let Some(Value::Object(nested)) = context.remove("context") {
            for (key, value) in nested {
                if !meters.contains_key(&key) {
                    context.insert(key, value);
                }
            }
        }

        Self {
            meters,
            context: Value::Object(context),
        }
    }

    /// A sample with meters only and an empty context.
    pub fn from_meters(meters: BTreeMap<String, f64>) -> Self {
        Self {
            meters,
            context: Value::Object(Map::new()),
        }
    }
}

/// One priced meter inside a [`Bill`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakdownLine {
    pub meter: String,
    pub quantity: f64,
    pub unit_size: u32,
    pub billable_units: u64,
    pub price_per_unit: String,
    pub line_nanos: Nanos,
    /// `line_nanos` formatted at 9dp, exact.
    pub line_cost: String,
    pub rule_id: String,
}

/// The itemized outcome of pricing one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bill {
    pub total_nanos: Nanos,
    /// `total_nanos` formatted at 9dp, exact.
    pub total_usd_str: String,
    pub currency: String,
    pub finish_reason: Option<String>,
    pub lines: Vec<BreakdownLine>,
}

impl Bill {
    /// A zero-line, zero-total bill. "No billable rule" is a valid, auditable
    /// outcome, not a failure.
    pub fn empty(currency: &str) -> Self {
        Self {
            total_nanos: 0,
            total_usd_str: format_nanos_exact(0, 9),
            currency: currency.to_string(),
            finish_reason: None,
            lines: Vec::new(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_nanos == 0
    }
}
