//! Independent cost estimation for differential testing.
//!
//! Re-derives the expected bill from the raw rules without calling the
//! engine, so a defect in either side shows up as a diff. Shares only the
//! condition matcher and the nanos conversions with the production path.

use crate::money::{Nanos, format_nanos_exact, parse_decimal_to_nanos};
use crate::pricing::conditions::matches_conditions;
use crate::pricing::{PriceCard, PriceRule};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EstimationLine {
    pub meter: String,
    pub quantity: f64,
    pub unit_size: u32,
    pub billable_units: u64,
    pub price_per_unit: String,
    pub line_nanos: Nanos,
    pub line_cost: String,
    pub rule_id: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Estimation {
    pub total_nanos: Nanos,
    pub total_usd_str: String,
    pub lines: Vec<EstimationLine>,
}

/// Estimates the bill for a synthesized scenario.
///
/// Selection implements the published pricing contract and nothing more:
/// plan-filtered rules ordered priority descending, first condition-matching
/// rule per meter, highest-priority fallback when nothing matches, ceiling
/// unit math in nanos. Equal-priority ties deliberately resolve in plain card
/// order, with none of the engine's specificity ranking, so a ranking
/// regression on either side shows up as a diff.
pub fn estimate_cost(usage: &BTreeMap<String, f64>, context: &Value, card: &PriceCard, plan: &str) -> Estimation {
    let mut rules: Vec<&PriceRule> = card.rules.iter().filter(|rule| rule.pricing_plan == plan).collect();
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut subject = Map::new();
    if let Some(obj) = context.as_object() {
        subject.extend(obj.clone());
    }
    for (meter, quantity) in usage {
        if let Some(number) = serde_json::Number::from_f64(*quantity) {
            subject.insert(meter.clone(), Value::Number(number));
        }
    }
    let subject = Value::Object(subject);

    let mut lines = Vec::new();
    let mut total_nanos: Nanos = 0;

    for (meter, &quantity) in usage {
        if quantity <= 0.0 {
            continue;
        }
        let meter_rules: Vec<&&PriceRule> = rules.iter().filter(|rule| &rule.meter == meter).collect();
        let Some(selected) = meter_rules
            .iter()
            .find(|rule| matches_conditions(&rule.conditions, &subject))
            .or_else(|| meter_rules.first())
        else {
            continue;
        };

        let unit_size = selected.unit_size.max(1);
        let billable_units = (quantity / unit_size as f64).ceil().max(0.0) as u64;
        let price_nanos = parse_decimal_to_nanos(&selected.price_per_unit);
        let line_nanos = (billable_units as i64).saturating_mul(price_nanos);
        total_nanos += line_nanos;

        lines.push(EstimationLine {
            meter: meter.clone(),
            quantity,
            unit_size,
            billable_units,
            price_per_unit: selected.price_per_unit.clone(),
            line_nanos,
            line_cost: format_nanos_exact(line_nanos, 9),
            rule_id: selected.id.clone(),
        });
    }

    Estimation {
        total_nanos,
        total_usd_str: format_nanos_exact(total_nanos, 9),
        lines,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::conditions::{Condition, ConditionOp};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn rule(id: &str, meter: &str, unit_size: u32, price: &str, priority: i64, conditions: Vec<Condition>) -> PriceRule {
        PriceRule {
            id: id.into(),
            pricing_plan: "standard".into(),
            meter: meter.into(),
            unit: "token".into(),
            unit_size,
            price_per_unit: price.into(),
            currency: "USD".into(),
            tiering_mode: None,
            conditions,
            priority,
        }
    }

    fn card(rules: Vec<PriceRule>) -> PriceCard {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        PriceCard {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            endpoint: "chat.completions".into(),
            effective_from: ts,
            effective_to: None,
            currency: "USD".into(),
            version: ts,
            rules,
        }
    }

    #[test]
    fn estimates_with_ceiling_unit_math() {
        let card = card(vec![rule("r1", "output_text_tokens", 1000, "0.002", 100, vec![])]);
        let usage = BTreeMap::from([("output_text_tokens".to_string(), 2500.0)]);
        let estimation = estimate_cost(&usage, &json!({}), &card, "standard");
        assert_eq!(estimation.lines[0].billable_units, 3);
        assert_eq!(estimation.total_nanos, 6_000_000);
        assert_eq!(estimation.total_usd_str, "0.006000000");
    }

    #[test]
    fn condition_matching_rule_beats_priority_fallback() {
        let cached = rule(
            "cached",
            "input_text_tokens",
            1,
            "0.0001",
            200,
            vec![Condition::new("cache_hit", ConditionOp::Eq, json!(true))],
        );
        let base = rule("base", "input_text_tokens", 1, "0.001", 100, vec![]);
        let card = card(vec![cached, base]);
        let usage = BTreeMap::from([("input_text_tokens".to_string(), 10.0)]);

        let hit = estimate_cost(&usage, &json!({"cache_hit": true}), &card, "standard");
        assert_eq!(hit.lines[0].rule_id, "cached");

        let miss = estimate_cost(&usage, &json!({"cache_hit": false}), &card, "standard");
        assert_eq!(miss.lines[0].rule_id, "base");
    }

    #[test]
    fn unmatched_conditions_fall_back_to_highest_priority() {
        let only = rule(
            "only",
            "requests",
            1,
            "0.5",
            100,
            vec![Condition::new("tier", ConditionOp::Eq, json!("enterprise"))],
        );
        let card = card(vec![only]);
        let usage = BTreeMap::from([("requests".to_string(), 2.0)]);
        let estimation = estimate_cost(&usage, &json!({}), &card, "standard");
        assert_eq!(estimation.lines[0].rule_id, "only");
        assert_eq!(estimation.total_nanos, 1_000_000_000);
    }

    #[test]
    fn meters_without_rules_contribute_nothing() {
        let card = card(vec![rule("r", "requests", 1, "0.01", 100, vec![])]);
        let usage = BTreeMap::from([("embedding_tokens".to_string(), 500.0), ("requests".to_string(), 1.0)]);
        let estimation = estimate_cost(&usage, &json!({}), &card, "standard");
        assert_eq!(estimation.lines.len(), 1);
        assert_eq!(estimation.lines[0].meter, "requests");
    }
}
