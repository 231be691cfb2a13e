//! Usage and context synthesis.
//!
//! Given the rules for one plan, the generator draws a quantity per meter and
//! builds a request context that exercises the conditions of the rule it
//! expects to win, so the differential run covers the conditional branches of
//! the catalog instead of only the defaults.

use crate::pricing::conditions::{Condition, ConditionOp, coerce_number, normalize_condition_value};
use crate::pricing::PriceRule;
use crate::sim::rng::Lcg32;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Sets `path` (dot-separated) inside a JSON object, creating intermediate
/// objects as needed. Non-object intermediates are replaced.
pub fn set_nested_value(target: &mut Map<String, Value>, path: &str, value: Value) {
    if path.is_empty() {
        return;
    }
    let mut parts = path.split('.').peekable();
    let mut current = target;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.insert(part.to_string(), value);
            return;
        }
        let slot = current.entry(part.to_string()).or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().unwrap_or_else(|| unreachable!("slot was just made an object"));
    }
}

/// Removes `path` from a JSON object; missing intermediates are a no-op.
pub fn unset_nested_value(target: &mut Map<String, Value>, path: &str) {
    if path.is_empty() {
        return;
    }
    let mut parts = path.split('.').peekable();
    let mut current = target;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            current.remove(part);
            return;
        }
        match current.get_mut(part).and_then(Value::as_object_mut) {
            Some(next) => current = next,
            None => return,
        }
    }
}

/// Mutates the shared context so `condition` is satisfied: set the literal
/// for `eq`/`in` (picking one member of a set), a flag for `exists`, removal
/// for `not_exists`, and a value just past the threshold for inequalities.
pub fn apply_condition_to_context(target: &mut Map<String, Value>, condition: &Condition, rng: &mut Lcg32) {
    if condition.path.is_empty() {
        return;
    }
    let normalized = normalize_condition_value(&condition.value);

    match condition.op {
        ConditionOp::NotExists => unset_nested_value(target, &condition.path),
        ConditionOp::Exists => set_nested_value(target, &condition.path, Value::Bool(true)),
        ConditionOp::In => {
            if let Value::Array(options) = &normalized
                && !options.is_empty()
            {
                let index = rng.int_in(0, options.len() as i64 - 1) as usize;
                set_nested_value(target, &condition.path, options[index].clone());
            }
        }
        ConditionOp::Eq => match &normalized {
            Value::Null => {}
            Value::Array(options) if !options.is_empty() => {
                let index = rng.int_in(0, options.len() as i64 - 1) as usize;
                set_nested_value(target, &condition.path, options[index].clone());
            }
            other => set_nested_value(target, &condition.path, other.clone()),
        },
        ConditionOp::Lt | ConditionOp::Lte | ConditionOp::Gt | ConditionOp::Gte => {
            let Some(numeric) = coerce_number(&normalized) else {
                return;
            };
            let adjusted = match condition.op {
                ConditionOp::Lt => numeric - 1.0,
                ConditionOp::Gt => numeric + 1.0,
                _ => numeric,
            };
            if let Some(number) = serde_json::Number::from_f64(adjusted) {
                set_nested_value(target, &condition.path, Value::Number(number));
            }
        }
        _ => {
            if !normalized.is_null() {
                set_nested_value(target, &condition.path, normalized);
            }
        }
    }
}

/// Draws a quantity satisfying the meter-scoped conditions.
///
/// Prefers the discrete set from `eq`/`in` conditions; otherwise narrows
/// `[min, max]` with the inequality conditions and draws uniformly. An empty
/// narrowed range falls back to the base minimum.
pub fn pick_quantity_for_meter(conditions: &[&Condition], min: i64, max: i64, rng: &mut Lcg32) -> i64 {
    let base_min = min.max(1);
    let base_max = max.max(base_min);

    if let Some(cond) = conditions.iter().find(|c| c.op == ConditionOp::Eq && !c.value.is_null())
        && let Some(numeric) = coerce_number(&cond.value)
    {
        return (numeric as i64).max(1);
    }

    if let Some(cond) = conditions.iter().find(|c| c.op == ConditionOp::In && !c.value.is_null()) {
        let normalized = normalize_condition_value(&cond.value);
        if let Value::Array(options) = normalized {
            let numeric: Vec<i64> = options.iter().filter_map(coerce_number).map(|n| n as i64).collect();
            if !numeric.is_empty() {
                let index = rng.int_in(0, numeric.len() as i64 - 1) as usize;
                return numeric[index].max(1);
            }
        }
    }

    let mut lo = base_min;
    let mut hi = base_max;
    for cond in conditions {
        let Some(numeric) = coerce_number(&cond.value) else {
            continue;
        };
        let threshold = numeric as i64;
        match cond.op {
            ConditionOp::Gt => lo = lo.max(threshold + 1),
            ConditionOp::Gte => lo = lo.max(threshold),
            ConditionOp::Lt => hi = hi.min(threshold - 1),
            ConditionOp::Lte => hi = hi.min(threshold),
            _ => {}
        }
    }

    if lo > hi {
        return base_min;
    }
    rng.int_in(lo, hi).max(1)
}

/// Does one meter-scoped condition accept this quantity? Presence operators
/// do not constrain the quantity.
fn condition_accepts_quantity(cond: &Condition, qty: i64) -> bool {
    let numeric = coerce_number(&cond.value);
    match cond.op {
        ConditionOp::Eq => numeric == Some(qty as f64),
        ConditionOp::Ne => numeric != Some(qty as f64),
        ConditionOp::Lt => numeric.is_some_and(|v| (qty as f64) < v),
        ConditionOp::Lte => numeric.is_some_and(|v| (qty as f64) <= v),
        ConditionOp::Gt => numeric.is_some_and(|v| (qty as f64) > v),
        ConditionOp::Gte => numeric.is_some_and(|v| (qty as f64) >= v),
        ConditionOp::In => {
            let normalized = normalize_condition_value(&cond.value);
            match normalized {
                Value::Array(options) => options.iter().filter_map(coerce_number).any(|v| v == qty as f64),
                _ => false,
            }
        }
        _ => true,
    }
}

/// Rules whose conditions on this meter's own path accept the drawn
/// quantity. Rules that do not constrain the meter always pass.
fn filter_rules_by_quantity<'a>(qty: i64, meter: &str, variants: &[&'a PriceRule]) -> Vec<&'a PriceRule> {
    variants
        .iter()
        .filter(|rule| {
            let meter_conds: Vec<&Condition> = rule.conditions.iter().filter(|c| c.path == meter).collect();
            meter_conds.is_empty() || meter_conds.iter().all(|c| condition_accepts_quantity(c, qty))
        })
        .copied()
        .collect()
}

/// One synthesized request: usage quantities plus the condition context.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub usage: BTreeMap<String, f64>,
    pub context: Value,
}

/// Synthesizes usage and context from one plan's rules.
///
/// Per meter: draw a quantity from the meter-scoped conditions, keep the
/// rules compatible with that quantity, pick one (uniformly among compatible,
/// else among all), and apply its non-meter conditions onto the shared
/// context. A card with no meters at all falls back to a `requests` draw.
pub fn generate_scenario(rules: &[&PriceRule], min: i64, max: i64, rng: &mut Lcg32) -> Scenario {
    let mut usage: BTreeMap<String, f64> = BTreeMap::new();
    let mut context = Map::new();

    let mut by_meter: BTreeMap<&str, Vec<&PriceRule>> = BTreeMap::new();
    for rule in rules {
        by_meter.entry(rule.meter.as_str()).or_default().push(rule);
    }

    for (meter, variants) in &by_meter {
        let meter_conditions: Vec<&Condition> = variants
            .iter()
            .flat_map(|rule| rule.conditions.iter())
            .filter(|cond| cond.path == *meter)
            .collect();
        let qty = pick_quantity_for_meter(&meter_conditions, min, max, rng);
        usage.insert((*meter).to_string(), qty as f64);

        let compatible = filter_rules_by_quantity(qty, meter, variants);
        let pool: &[&PriceRule] = if compatible.is_empty() { variants } else { &compatible };
        let picked = pool[rng.int_in(0, pool.len() as i64 - 1) as usize];

        for cond in &picked.conditions {
            if cond.path == *meter {
                continue;
            }
            apply_condition_to_context(&mut context, cond, rng);
        }
    }

    if usage.is_empty() {
        let lo = min.max(1);
        usage.insert("requests".to_string(), rng.int_in(lo, max.max(lo + 1)) as f64);
    }

    Scenario {
        usage,
        context: Value::Object(context),
    }
}
