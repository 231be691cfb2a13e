//! The condition predicate language used by price rules.
//!
//! A [`Condition`] tests one dot-delimited key path of a JSON context object
//! against a typed operator. Conditions inside a rule's `match` list AND
//! together by default; explicit `or_group` numbers form OR alternatives (see
//! [`matches_conditions`] for the exact combination algorithm).
//!
//! Malformed conditions never abort a pricing computation: a value that fails
//! numeric coercion or an invalid regex simply evaluates to "does not match".

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operator applied to the value found at a condition's key path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Exists,
    NotExists,
    StartsWith,
    Regex,
}

/// One predicate over a context object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot-delimited key path into the context (e.g. `"request.tier"`).
    pub path: String,
    pub op: ConditionOp,
    /// Comparison operand; unused for `exists`/`not_exists`.
    #[serde(default)]
    pub value: Value,
    /// Conditions sharing a group number form an OR alternative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or_group: Option<i64>,
    /// Ordering hint carried through from the catalog; not evaluated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub and_index: Option<i64>,
}

impl Condition {
    pub fn new(path: impl Into<String>, op: ConditionOp, value: Value) -> Self {
        Self {
            path: path.into(),
            op,
            value,
            or_group: None,
            and_index: None,
        }
    }
}

/// Resolves a dot-delimited path against a JSON value.
///
/// Missing intermediate keys (or traversal through a non-object) resolve to
/// `None` rather than an error.
pub fn resolve_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = ctx;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Normalizes a condition operand before comparison.
///
/// Array-literal strings such as `"[a, b]"` parse into a JSON array of their
/// trimmed elements; other strings are trimmed. Arrays and non-strings pass
/// through unchanged.
pub fn normalize_condition_value(value: &Value) -> Value {
    match value {
        Value::String(s) => match parse_array_literal(s) {
            Some(items) => Value::Array(items.into_iter().map(Value::String).collect()),
            None => Value::String(s.trim().to_string()),
        },
        other => other.clone(),
    }
}

/// Parses `"[a, b, c]"` into its elements, stripping quotes and brackets.
pub fn parse_array_literal(value: &str) -> Option<Vec<String>> {
    let trimmed = value.trim();
    if !trimmed.starts_with('[') || !trimmed.ends_with(']') {
        return None;
    }
    let inner = trimmed[1..trimmed.len() - 1].trim();
    if inner.is_empty() {
        return Some(Vec::new());
    }
    Some(
        inner
            .split(',')
            .map(|part| part.trim().trim_matches(|c| c == '\'' || c == '"' || c == '[' || c == ']').to_string())
            .filter(|part| !part.is_empty())
            .collect(),
    )
}

/// Numeric coercion used by the inequality operators. Numbers pass through,
/// numeric strings parse; anything else fails (and the condition fails
/// closed).
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Value equality with numeric awareness: `1` equals `1.0`, strings compare
/// after trimming.
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_plain_number(left), as_plain_number(right)) {
        return a == b;
    }
    match (left, right) {
        (Value::String(a), Value::String(b)) => a.trim() == b.trim(),
        (a, b) => a == b,
    }
}

fn as_plain_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn set_contains(set: &[Value], candidate: Option<&Value>) -> bool {
    let Some(candidate) = candidate else { return false };
    set.iter().any(|member| values_equal(member, candidate))
}

/// Evaluates a single condition against a context object.
pub fn eval_condition(cond: &Condition, ctx: &Value) -> bool {
    let found = resolve_path(ctx, &cond.path);
    match cond.op {
        ConditionOp::Exists => found.is_some(),
        ConditionOp::NotExists => found.is_none(),
        ConditionOp::Eq => match normalize_condition_value(&cond.value) {
            Value::Array(set) => set_contains(&set, found),
            normalized => found.is_some_and(|val| values_equal(val, &normalized)),
        },
        ConditionOp::Ne => match normalize_condition_value(&cond.value) {
            Value::Array(set) => !set_contains(&set, found),
            normalized => !found.is_some_and(|val| values_equal(val, &normalized)),
        },
        ConditionOp::Lt | ConditionOp::Lte | ConditionOp::Gt | ConditionOp::Gte => {
            let (Some(lhs), Some(rhs)) = (found.and_then(coerce_number), coerce_number(&cond.value)) else {
                // Non-numeric operand: fail closed.
                return false;
            };
            match cond.op {
                ConditionOp::Lt => lhs < rhs,
                ConditionOp::Lte => lhs <= rhs,
                ConditionOp::Gt => lhs > rhs,
                ConditionOp::Gte => lhs >= rhs,
                _ => unreachable!(),
            }
        }
        ConditionOp::In => match normalize_condition_value(&cond.value) {
            Value::Array(set) => set_contains(&set, found),
            _ => false,
        },
        ConditionOp::NotIn => match normalize_condition_value(&cond.value) {
            Value::Array(set) => !set_contains(&set, found),
            _ => false,
        },
        ConditionOp::StartsWith => match (found, &cond.value) {
            (Some(Value::String(val)), Value::String(prefix)) => val.starts_with(prefix.as_str()),
            _ => false,
        },
        ConditionOp::Regex => {
            let Some(Value::String(val)) = found else { return false };
            let pattern = match &cond.value {
                Value::String(p) => p.clone(),
                other => other.to_string(),
            };
            match Regex::new(&pattern) {
                Ok(re) => re.is_match(val),
                // A bad pattern is a bad rule, not a pricing failure.
                Err(_) => false,
            }
        }
    }
}

/// Per-condition evaluation outcome, annotated with its effective OR group.
#[derive(Debug, Clone)]
pub struct ConditionEvaluation {
    pub matches: bool,
    pub group: i64,
    pub explicit_group: bool,
}

/// Matched/total counts for one OR group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub group: i64,
    pub total: usize,
    pub matched: usize,
}

/// Full evaluation of a rule's condition list.
#[derive(Debug, Clone, Default)]
pub struct EvaluationSummary {
    pub total_conditions: usize,
    pub matched_conditions: usize,
    pub has_explicit_groups: bool,
    pub evaluations: Vec<ConditionEvaluation>,
    pub group_summaries: Vec<GroupSummary>,
}

impl EvaluationSummary {
    /// Whether the condition list as a whole matched: an empty list always
    /// matches, a plain list is an AND, explicit groups are an OR of ANDs.
    pub fn satisfied(&self) -> bool {
        if self.total_conditions == 0 {
            return true;
        }
        if !self.has_explicit_groups {
            return self.matched_conditions == self.total_conditions;
        }
        self.group_summaries.iter().any(|group| group.matched == group.total)
    }

    /// Groups with every member satisfied.
    pub fn fully_satisfied_groups(&self) -> usize {
        self.group_summaries.iter().filter(|g| g.total > 0 && g.matched == g.total).count()
    }

    /// Groups with some, but not all, members satisfied.
    pub fn partially_satisfied_groups(&self) -> usize {
        self.group_summaries.iter().filter(|g| g.matched > 0 && g.matched < g.total).count()
    }
}

/// Evaluates every condition and aggregates matched/total counts per group.
///
/// When any condition carries an explicit `or_group`, every ungrouped
/// condition joins group 1; without explicit groups each condition stands in
/// its own implicit group.
pub fn evaluate_conditions(conditions: &[Condition], ctx: &Value) -> EvaluationSummary {
    if conditions.is_empty() {
        return EvaluationSummary::default();
    }

    let has_explicit_groups = conditions.iter().any(|c| c.or_group.is_some());
    let mut summary = EvaluationSummary {
        total_conditions: conditions.len(),
        has_explicit_groups,
        ..Default::default()
    };

    for (index, condition) in conditions.iter().enumerate() {
        let matches = eval_condition(condition, ctx);
        if matches {
            summary.matched_conditions += 1;
        }

        let explicit_group = condition.or_group.is_some();
        let group = if has_explicit_groups {
            condition.or_group.unwrap_or(1)
        } else {
            index as i64 + 1
        };

        match summary.group_summaries.iter_mut().find(|g| g.group == group) {
            Some(stats) => {
                stats.total += 1;
                if matches {
                    stats.matched += 1;
                }
            }
            None => summary.group_summaries.push(GroupSummary {
                group,
                total: 1,
                matched: usize::from(matches),
            }),
        }

        summary.evaluations.push(ConditionEvaluation {
            matches,
            group,
            explicit_group,
        });
    }

    summary
}

/// Decides whether a rule's condition list matches a context.
///
/// An empty list always matches. Without explicit `or_group`s the list is a
/// plain AND. With explicit groups the list is an OR of ANDs: the rule
/// matches if any group has all of its members satisfied (ungrouped
/// conditions participate as group 1).
pub fn matches_conditions(conditions: &[Condition], ctx: &Value) -> bool {
    evaluate_conditions(conditions, ctx).satisfied()
}
