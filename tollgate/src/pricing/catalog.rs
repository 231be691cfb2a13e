//! Price catalog: raw rule rows and per-lookup card derivation.
//!
//! The catalog is an immutable in-memory snapshot of rule rows keyed by
//! `model_key = "<provider>:<model>:<endpoint>"`. [`Catalog::load_card`]
//! derives a fresh [`PriceCard`] for the rows active at a given instant;
//! cards are never cached or mutated in place.
//!
//! Plan filtering deliberately does not happen here: a card may carry rules
//! for several `pricing_plan` values at once, and the engine picks the plan.

use crate::errors::{Error, Result};
use crate::pricing::conditions::Condition;
use crate::pricing::{PriceCard, PriceRule, TieringMode};
use crate::types::ModelKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

fn default_plan() -> String {
    "standard".to_string()
}

fn default_unit() -> String {
    "unit".to_string()
}

fn default_unit_size() -> u32 {
    1
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_priority() -> i64 {
    100
}

/// Accepts a price as either a JSON string or number, preserving the exact
/// textual form for later nanos conversion.
fn deserialize_price<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => "0".to_string(),
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    })
}

/// One catalog row, as produced by the pricing importer.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogRow {
    pub id: String,
    pub model_key: String,
    #[serde(default = "default_plan")]
    pub pricing_plan: String,
    pub meter: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_unit_size")]
    pub unit_size: u32,
    #[serde(default, deserialize_with = "deserialize_price")]
    pub price_per_unit: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub tiering_mode: Option<TieringMode>,
    #[serde(rename = "match", default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    pub effective_from: DateTime<Utc>,
    #[serde(default)]
    pub effective_to: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogRow {
    fn to_rule(&self) -> PriceRule {
        PriceRule {
            id: self.id.clone(),
            pricing_plan: self.pricing_plan.clone(),
            meter: self.meter.clone(),
            unit: self.unit.clone(),
            unit_size: self.unit_size.max(1),
            price_per_unit: self.price_per_unit.clone(),
            currency: self.currency.clone(),
            tiering_mode: self.tiering_mode,
            conditions: self.conditions.clone(),
            priority: self.priority,
        }
    }

    /// A row is active when its validity window contains `now`.
    fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_from <= now && self.effective_to.is_none_or(|until| until > now)
    }
}

/// Immutable snapshot of catalog rows.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    rows: Vec<CatalogRow>,
}

impl Catalog {
    pub fn from_rows(rows: Vec<CatalogRow>) -> Self {
        Self { rows }
    }

    /// Parses a JSON array of catalog rows.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let rows: Vec<CatalogRow> = serde_json::from_str(raw)?;
        Ok(Self::from_rows(rows))
    }

    /// Loads catalog rows from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| Error::CatalogIo {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_json_str(&raw)?;
        debug!(path = %path.display(), rows = catalog.rows.len(), "loaded price catalog");
        Ok(catalog)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct (provider, model, endpoint) triples, sorted for deterministic
    /// enumeration by the simulator.
    pub fn combos(&self) -> Vec<ModelKey> {
        let mut keys: Vec<ModelKey> = self.rows.iter().map(|row| ModelKey::parse(&row.model_key)).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Derives the price card for one model key at `now`.
    ///
    /// Selects every row for the key whose validity window contains `now`,
    /// ordered by priority descending then `effective_from` descending.
    /// Returns `None` when no row is active. Card invariants:
    /// `effective_from` is the minimum across rows, `effective_to` the
    /// tightest non-null expiry (or `None`), `version` the maximum
    /// `updated_at`.
    pub fn load_card(&self, provider: &str, model: &str, endpoint: &str, now: DateTime<Utc>) -> Option<PriceCard> {
        let key = format!("{provider}:{model}:{endpoint}");
        let mut active: Vec<&CatalogRow> = self
            .rows
            .iter()
            .filter(|row| row.model_key == key && row.is_active_at(now))
            .collect();
        if active.is_empty() {
            return None;
        }

        active.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.effective_from.cmp(&a.effective_from))
        });

        let effective_from = active.iter().map(|row| row.effective_from).min()?;
        let effective_to = active.iter().filter_map(|row| row.effective_to).min();
        let version = active.iter().map(|row| row.updated_at).max()?;
        let currency = active.first().map(|row| row.currency.clone()).unwrap_or_else(default_currency);

        Some(PriceCard {
            provider: provider.to_string(),
            model: model.to_string(),
            endpoint: endpoint.to_string(),
            effective_from,
            effective_to,
            currency,
            version,
            rules: active.iter().map(|row| row.to_rule()).collect(),
        })
    }
}
