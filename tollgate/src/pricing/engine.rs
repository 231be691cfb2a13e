//! Rule selection and bill computation.
//!
//! For each meter in the usage sample the engine picks exactly one rule from
//! the card (plan-filtered), prices the quantity with ceiling unit math, and
//! sums the lines into a nanos-exact [`Bill`]. Pricing never fails: a missing
//! card, an unknown plan, or a meter without rules degrades to fewer lines,
//! not an error.

use crate::money::{format_nanos_exact, parse_decimal_to_nanos};
use crate::pricing::conditions::evaluate_conditions;
use crate::pricing::{Bill, BreakdownLine, PriceCard, PriceRule, UsageSample};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::debug;

/// Builds the object conditions are evaluated against: the request context
/// with every usage meter exposed under its own name.
fn match_context(usage: &UsageSample, context: &Value) -> Value {
    let mut merged = Map::new();
    if let Some(obj) = context.as_object() {
        merged.extend(obj.clone());
    }
    if let Some(obj) = usage.context.as_object() {
        merged.extend(obj.clone());
    }
    for (meter, quantity) in &usage.meters {
        if let Some(number) = serde_json::Number::from_f64(*quantity) {
            merged.insert(meter.clone(), Value::Number(number));
        }
    }
    Value::Object(merged)
}

struct ScoredRule<'a> {
    rule: &'a PriceRule,
    index: usize,
    satisfied: bool,
    matched_conditions: usize,
    total_conditions: usize,
    fully_satisfied_groups: usize,
    partially_satisfied_groups: usize,
}

/// Ranks candidates: priority first, then condition specificity. Equal
/// priorities are broken by how much of the context each rule's conditions
/// account for, with card order as the final tie-break.
fn rank_scores(a: &ScoredRule, b: &ScoredRule) -> Ordering {
    b.rule
        .priority
        .cmp(&a.rule.priority)
        .then_with(|| b.fully_satisfied_groups.cmp(&a.fully_satisfied_groups))
        .then_with(|| b.matched_conditions.cmp(&a.matched_conditions))
        .then_with(|| b.total_conditions.cmp(&a.total_conditions))
        .then_with(|| a.partially_satisfied_groups.cmp(&b.partially_satisfied_groups))
        .then_with(|| a.index.cmp(&b.index))
}

/// Selects the billing rule for one meter.
///
/// Candidates are ranked by [`rank_scores`] and the first whose conditions
/// are satisfied wins; when none match, the top-ranked candidate is still
/// selected so the meter is billed with the best-guess default instead of
/// silently dropped.
fn select_rule<'a>(candidates: &[&'a PriceRule], ctx: &Value) -> Option<&'a PriceRule> {
    let mut scored: Vec<ScoredRule<'a>> = candidates
        .iter()
        .enumerate()
        .map(|(index, rule)| {
            let summary = evaluate_conditions(&rule.conditions, ctx);
            ScoredRule {
                rule,
                index,
                satisfied: summary.satisfied(),
                matched_conditions: summary.matched_conditions,
                total_conditions: summary.total_conditions,
                fully_satisfied_groups: summary.fully_satisfied_groups(),
                partially_satisfied_groups: summary.partially_satisfied_groups(),
            }
        })
        .collect();
    scored.sort_by(rank_scores);
    scored
        .iter()
        .find(|score| score.satisfied)
        .or_else(|| scored.first())
        .map(|score| score.rule)
}

/// Prices a quantity with the selected rule: partial units always round up.
fn price_with_rule(quantity: f64, rule: &PriceRule) -> BreakdownLine {
    let unit_size = rule.unit_size.max(1);
    let billable_units = (quantity / unit_size as f64).ceil().max(0.0) as u64;
    let unit_price_nanos = parse_decimal_to_nanos(&rule.price_per_unit);
    let line_nanos = (billable_units as i64).saturating_mul(unit_price_nanos);

    BreakdownLine {
        meter: rule.meter.clone(),
        quantity,
        unit_size,
        billable_units,
        price_per_unit: rule.price_per_unit.clone(),
        line_nanos,
        line_cost: format_nanos_exact(line_nanos, 9),
        rule_id: rule.id.clone(),
    }
}

/// Computes the itemized bill for one request.
///
/// Meters with zero or negative quantity are skipped, not zero-billed. A
/// missing card or a plan with no applicable rules yields an empty bill.
pub fn compute_bill(card: Option<&PriceCard>, usage: &UsageSample, context: &Value, plan: &str) -> Bill {
    let Some(card) = card else {
        return Bill::empty("USD");
    };

    let plan_rules: Vec<&PriceRule> = card.rules.iter().filter(|rule| rule.pricing_plan == plan).collect();
    if plan_rules.is_empty() {
        debug!(provider = %card.provider, model = %card.model, endpoint = %card.endpoint, plan, "no rules for pricing plan");
        return Bill::empty(&card.currency);
    }

    let ctx = match_context(usage, context);
    let mut lines = Vec::new();

    for (meter, &quantity) in &usage.meters {
        if quantity <= 0.0 {
            continue;
        }

        // Card order feeds the ranking's final tie-break.
        let candidates: Vec<&PriceRule> = plan_rules.iter().filter(|rule| &rule.meter == meter).copied().collect();
        let Some(rule) = select_rule(&candidates, &ctx) else {
            debug!(meter, quantity, plan, "no rule candidates for meter");
            continue;
        };

        let line = price_with_rule(quantity, rule);
        debug!(
            meter,
            quantity,
            rule_id = %rule.id,
            billable_units = line.billable_units,
            line_nanos = line.line_nanos,
            "priced meter"
        );
        lines.push(line);
    }

    let total_nanos = lines.iter().map(|line| line.line_nanos).sum();
    Bill {
        total_nanos,
        total_usd_str: format_nanos_exact(total_nanos, 9),
        currency: card.currency.clone(),
        finish_reason: None,
        lines,
    }
}
