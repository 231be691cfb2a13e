//! Differential pricing simulator.
//!
//! Enumerates the catalog's (provider, model, endpoint) combos, synthesizes
//! usage and context per plan, prices every run through the engine, and
//! re-derives the expected cost with the independent [`estimator`]. Any run
//! whose totals disagree beyond [`DIFF_TOLERANCE`] (or that bills zero for
//! generated usage) is flagged; the harness exits non-zero when any run is
//! flagged.

pub mod estimator;
pub mod report;
pub mod rng;
pub mod scenario;

use crate::errors::{Error, Result};
use crate::pricing::{Bill, Catalog, PriceRule, compute_bill};
use crate::types::ModelKey;
use chrono::{DateTime, Utc};
use estimator::Estimation;
use rng::Lcg32;
use scenario::generate_scenario;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// USD difference below which engine and estimator are considered to agree.
pub const DIFF_TOLERANCE: f64 = 1e-6;

/// Simulator knobs, filled from the CLI.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Restrict to these providers (empty = all).
    pub providers: Vec<String>,
    /// Restrict to these model ids (empty = all).
    pub models: Vec<String>,
    /// Restrict to one endpoint.
    pub endpoint: Option<String>,
    /// Max combos to simulate; `None` simulates every combo.
    pub limit: Option<usize>,
    /// Runs per combo × plan.
    pub runs: usize,
    /// Pricing plan, or "all" for every plan on the card.
    pub plan: String,
    /// Quantity draw range, inclusive.
    pub min: i64,
    pub max: i64,
    pub seed: u64,
    /// Shuffle combos before applying the limit.
    pub randomize: bool,
    pub verbose: bool,
    /// Dump full estimation-vs-engine JSON for every run, not just flagged.
    pub debug: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            models: Vec::new(),
            endpoint: None,
            limit: Some(5),
            runs: 1,
            plan: "all".to_string(),
            min: 10,
            max: 5000,
            seed: 1,
            randomize: false,
            verbose: false,
            debug: false,
        }
    }
}

/// One simulated request with both sides of the differential.
#[derive(Debug, Clone)]
pub struct SimulationRun {
    pub key: ModelKey,
    pub plan: String,
    pub usage: BTreeMap<String, f64>,
    pub context: Value,
    pub bill: Bill,
    pub estimation: Estimation,
    pub diff_nanos: i64,
    pub diff_usd: f64,
    pub flagged: bool,
}

fn combo_selected(key: &ModelKey, options: &SimOptions) -> bool {
    (options.providers.is_empty() || options.providers.iter().any(|p| p == &key.provider))
        && (options.models.is_empty() || options.models.iter().any(|m| m == &key.model))
        && options.endpoint.as_ref().is_none_or(|e| e == &key.endpoint)
}

/// Runs the differential simulation over the catalog at `now`.
///
/// Returns runs sorted by (provider, model, endpoint, plan). Errors only when
/// the filters match no combo at all, or no card could be derived for any
/// selected combo.
pub fn simulate(catalog: &Catalog, now: DateTime<Utc>, options: &SimOptions) -> Result<Vec<SimulationRun>> {
    let mut combos: Vec<ModelKey> = catalog.combos().into_iter().filter(|key| combo_selected(key, options)).collect();
    if combos.is_empty() {
        return Err(Error::NoCombos);
    }

    let mut rng = Lcg32::new(options.seed);
    if options.randomize {
        rng.shuffle(&mut combos);
    }
    if let Some(limit) = options.limit {
        combos.truncate(limit);
    }

    let mut runs = Vec::new();

    for key in &combos {
        let Some(card) = catalog.load_card(&key.provider, &key.model, &key.endpoint, now) else {
            debug!(key = %key, "no active price card, skipping combo");
            continue;
        };

        let plans: Vec<String> = if options.plan == "all" {
            card.rules
                .iter()
                .map(|rule| rule.pricing_plan.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else if card.rules.iter().any(|rule| rule.pricing_plan == options.plan) {
            vec![options.plan.clone()]
        } else {
            Vec::new()
        };

        for plan in &plans {
            let plan_rules: Vec<&PriceRule> = card.rules.iter().filter(|rule| &rule.pricing_plan == plan).collect();
            if plan_rules.is_empty() {
                continue;
            }

            for _ in 0..options.runs {
                let scenario = generate_scenario(&plan_rules, options.min, options.max, &mut rng);
                let usage_sample = crate::pricing::UsageSample {
                    meters: scenario.usage.clone(),
                    context: scenario.context.clone(),
                };

                let bill = compute_bill(Some(&card), &usage_sample, &scenario.context, plan);
                let estimation = estimator::estimate_cost(&scenario.usage, &scenario.context, &card, plan);

                let diff_nanos = bill.total_nanos - estimation.total_nanos;
                let diff_usd = diff_nanos as f64 / 1_000_000_000.0;
                let flagged =
                    diff_usd.abs() > DIFF_TOLERANCE || (bill.total_nanos == 0 && !scenario.usage.is_empty());

                let run = SimulationRun {
                    key: key.clone(),
                    plan: plan.clone(),
                    usage: scenario.usage,
                    context: scenario.context,
                    bill,
                    estimation,
                    diff_nanos,
                    diff_usd,
                    flagged,
                };
                if options.debug || run.flagged {
                    report::debug_dump(&run, &card);
                }
                runs.push(run);
            }
        }
    }

    if runs.is_empty() {
        return Err(Error::NoRuns);
    }

    runs.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.plan.cmp(&b.plan)));
    Ok(runs)
}

/// Per combo × plan rollup.
#[derive(Debug, Clone)]
pub struct ComboAggregate {
    pub key: ModelKey,
    pub plan: String,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub zero_bill_runs: usize,
    pub mismatch_runs: usize,
    pub tokens_tested: f64,
}

/// Per model rollup across providers and endpoints.
#[derive(Debug, Clone)]
pub struct ModelAggregate {
    pub model: String,
    pub providers: BTreeSet<String>,
    pub combos: BTreeSet<String>,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub zero_bill_runs: usize,
    pub mismatch_runs: usize,
    pub tokens_tested: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub combos: Vec<ComboAggregate>,
    pub models: Vec<ModelAggregate>,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub zero_bill_runs: usize,
    pub mismatch_runs: usize,
    pub flagged_runs: usize,
    pub tokens_tested: f64,
}

/// Token volume exercised by one run, for the coverage columns.
fn tokens_in_run(run: &SimulationRun) -> f64 {
    run.usage
        .iter()
        .filter(|(meter, _)| meter.contains("token"))
        .map(|(_, qty)| qty)
        .sum()
}

/// Aggregates runs per combo × plan and per model. A run is successful when
/// it billed a non-zero amount and matched the estimate exactly in nanos.
pub fn aggregate(runs: &[SimulationRun]) -> Summary {
    let mut combos: BTreeMap<(ModelKey, String), ComboAggregate> = BTreeMap::new();
    let mut models: BTreeMap<String, ModelAggregate> = BTreeMap::new();
    let mut summary = Summary::default();

    for run in runs {
        let tokens = tokens_in_run(run);
        let billed_non_zero = run.bill.total_nanos > 0;
        let matches_estimate = run.diff_nanos == 0;
        let success = billed_non_zero && matches_estimate;

        let combo = combos
            .entry((run.key.clone(), run.plan.clone()))
            .or_insert_with(|| ComboAggregate {
                key: run.key.clone(),
                plan: run.plan.clone(),
                total_runs: 0,
                successful_runs: 0,
                zero_bill_runs: 0,
                mismatch_runs: 0,
                tokens_tested: 0.0,
            });
        let model = models.entry(run.key.model.clone()).or_insert_with(|| ModelAggregate {
            model: run.key.model.clone(),
            providers: BTreeSet::new(),
            combos: BTreeSet::new(),
            total_runs: 0,
            successful_runs: 0,
            zero_bill_runs: 0,
            mismatch_runs: 0,
            tokens_tested: 0.0,
        });
        model.providers.insert(run.key.provider.clone());
        model.combos.insert(format!("{}/{}", run.key, run.plan));

        combo.total_runs += 1;
        combo.tokens_tested += tokens;
        model.total_runs += 1;
        model.tokens_tested += tokens;
        summary.total_runs += 1;
        summary.tokens_tested += tokens;

        if success {
            combo.successful_runs += 1;
            model.successful_runs += 1;
            summary.successful_runs += 1;
        }
        if !billed_non_zero {
            combo.zero_bill_runs += 1;
            model.zero_bill_runs += 1;
            summary.zero_bill_runs += 1;
        }
        if !matches_estimate {
            combo.mismatch_runs += 1;
            model.mismatch_runs += 1;
            summary.mismatch_runs += 1;
        }
        if run.flagged {
            summary.flagged_runs += 1;
        }
    }

    summary.combos = combos.into_values().collect();
    summary.models = models.into_values().collect();
    summary
}
