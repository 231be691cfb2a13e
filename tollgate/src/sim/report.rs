//! Plain-text rendering for the simulator CLI.

use crate::pricing::PriceCard;
use crate::sim::{DIFF_TOLERANCE, SimulationRun, Summary};
use serde_json::json;

pub fn format_percent(part: usize, whole: usize) -> String {
    if whole == 0 {
        return "0.0000%".to_string();
    }
    format!("{:.4}%", part as f64 / whole as f64 * 100.0)
}

pub fn usage_snapshot(usage: &std::collections::BTreeMap<String, f64>) -> String {
    if usage.is_empty() {
        return "--".to_string();
    }
    usage
        .iter()
        .map(|(meter, qty)| format!("{meter}: {qty}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn format_billed(total_usd_str: &str, flagged: bool) -> String {
    if flagged {
        format!("{total_usd_str} (!!)")
    } else {
        total_usd_str.to_string()
    }
}

pub fn format_diff(diff_usd: f64) -> String {
    if diff_usd.abs() <= DIFF_TOLERANCE {
        return "0.000000000".to_string();
    }
    let sign = if diff_usd >= 0.0 { "+" } else { "-" };
    format!("{sign}{:.9} (!!)", diff_usd.abs())
}

fn render_rows(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return "  (no data)".to_string();
    }
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }
    let mut out = String::new();
    let render_line = |cells: &[String], widths: &[usize]| {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
    };
    let header_cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    out.push_str(&render_line(&header_cells, &widths));
    out.push('\n');
    out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 2 * (widths.len() - 1)));
    for row in rows {
        out.push('\n');
        out.push_str(&render_line(row, &widths));
    }
    out
}

/// One row per run: both totals, the diff, and the usage that produced them.
pub fn render_summary(runs: &[SimulationRun]) -> String {
    let rows: Vec<Vec<String>> = runs
        .iter()
        .map(|run| {
            vec![
                run.key.provider.clone(),
                run.key.model.clone(),
                run.key.endpoint.clone(),
                run.plan.clone(),
                run.estimation.total_usd_str.clone(),
                format_billed(&run.bill.total_usd_str, run.flagged),
                format_diff(run.diff_usd),
                usage_snapshot(&run.usage),
            ]
        })
        .collect();
    render_rows(
        &["Provider", "Model", "Endpoint", "Plan", "Est. USD", "Billed USD", "Diff USD", "Usage"],
        &rows,
    )
}

/// Per-line breakdown of one run, for `--verbose`.
pub fn render_breakdown(run: &SimulationRun) -> String {
    if run.bill.lines.is_empty() {
        return "No pricing lines generated.".to_string();
    }
    let rows: Vec<Vec<String>> = run
        .bill
        .lines
        .iter()
        .map(|line| {
            vec![
                line.meter.clone(),
                format!("{}", line.quantity),
                line.billable_units.to_string(),
                line.price_per_unit.clone(),
                line.line_cost.clone(),
            ]
        })
        .collect();
    render_rows(&["Meter", "Qty", "Billable Units", "Unit Price", "Line Cost"], &rows)
}

/// Model coverage rollup.
pub fn render_model_summary(summary: &Summary) -> String {
    let rows: Vec<Vec<String>> = summary
        .models
        .iter()
        .map(|model| {
            vec![
                model.model.clone(),
                model.providers.iter().cloned().collect::<Vec<_>>().join(", "),
                model.combos.len().to_string(),
                model.total_runs.to_string(),
                format_percent(model.successful_runs, model.total_runs),
                model.zero_bill_runs.to_string(),
                model.mismatch_runs.to_string(),
                format!("{}", model.tokens_tested),
            ]
        })
        .collect();
    render_rows(
        &["Model", "Providers", "Combos", "Runs", "Success %", "Zero-Bill", "Mismatch", "Tokens Tested"],
        &rows,
    )
}

/// Combos that failed the success criteria, worst success rate first.
pub fn render_combo_issues(summary: &Summary) -> String {
    let mut failing: Vec<_> = summary
        .combos
        .iter()
        .filter(|combo| combo.successful_runs != combo.total_runs)
        .collect();
    failing.sort_by(|a, b| {
        let a_rate = a.successful_runs as f64 / a.total_runs.max(1) as f64;
        let b_rate = b.successful_runs as f64 / b.total_runs.max(1) as f64;
        a_rate.partial_cmp(&b_rate).unwrap_or(std::cmp::Ordering::Equal).then(b.total_runs.cmp(&a.total_runs))
    });
    let rows: Vec<Vec<String>> = failing
        .iter()
        .map(|combo| {
            vec![
                combo.key.provider.clone(),
                combo.key.model.clone(),
                combo.key.endpoint.clone(),
                combo.plan.clone(),
                combo.total_runs.to_string(),
                format_percent(combo.successful_runs, combo.total_runs),
                combo.zero_bill_runs.to_string(),
                combo.mismatch_runs.to_string(),
            ]
        })
        .collect();
    render_rows(
        &["Provider", "Model", "Endpoint", "Plan", "Runs", "Success %", "Zero-Bill", "Mismatch"],
        &rows,
    )
}

/// Dumps the full estimation-vs-engine picture for one run as JSON, so a
/// flagged diff can be diagnosed without rerunning.
pub fn debug_dump(run: &SimulationRun, card: &PriceCard) {
    let candidate_rules: Vec<_> = card
        .rules
        .iter()
        .filter(|rule| rule.pricing_plan == run.plan)
        .map(|rule| {
            json!({
                "id": rule.id,
                "meter": rule.meter,
                "price_per_unit": rule.price_per_unit,
                "unit_size": rule.unit_size,
                "priority": rule.priority,
                "match": rule.conditions,
            })
        })
        .collect();

    let dump = json!({
        "tag": "pricing-debug-run",
        "combo": run.key.to_string(),
        "plan": run.plan,
        "usage": run.usage,
        "context": run.context,
        "estimation": run.estimation,
        "engine": {
            "total_nanos": run.bill.total_nanos,
            "total_usd_str": run.bill.total_usd_str,
            "lines": run.bill.lines,
        },
        "diff_usd": run.diff_usd,
        "diff_nanos": run.diff_nanos,
        "candidate_rules": candidate_rules,
    });
    match serde_json::to_string_pretty(&dump) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => eprintln!("failed to render debug dump: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::Bill;
    use crate::sim::estimator::Estimation;
    use crate::types::ModelKey;
    use std::collections::BTreeMap;

    fn run(flagged: bool, diff_usd: f64) -> SimulationRun {
        SimulationRun {
            key: ModelKey::new("openai", "gpt-4o", "chat.completions"),
            plan: "standard".into(),
            usage: BTreeMap::from([("input_text_tokens".to_string(), 1200.0)]),
            context: serde_json::json!({}),
            bill: Bill::empty("USD"),
            estimation: Estimation {
                total_nanos: 0,
                total_usd_str: "0.000000000".into(),
                lines: Vec::new(),
            },
            diff_nanos: (diff_usd * 1e9) as i64,
            diff_usd,
            flagged,
        }
    }

    #[test]
    fn diff_formatting_marks_flagged_values() {
        assert_eq!(format_diff(0.0), "0.000000000");
        assert_eq!(format_diff(5e-10), "0.000000000");
        assert_eq!(format_diff(0.004), "+0.004000000 (!!)");
        assert_eq!(format_diff(-0.004), "-0.004000000 (!!)");
    }

    #[test]
    fn billed_formatting_appends_a_flag_marker() {
        assert_eq!(format_billed("0.006000000", false), "0.006000000");
        assert_eq!(format_billed("0.006000000", true), "0.006000000 (!!)");
    }

    #[test]
    fn percent_handles_zero_denominator() {
        assert_eq!(format_percent(0, 0), "0.0000%");
        assert_eq!(format_percent(1, 4), "25.0000%");
    }

    #[test]
    fn summary_table_includes_every_run() {
        let rendered = render_summary(&[run(false, 0.0), run(true, 0.01)]);
        assert!(rendered.contains("gpt-4o"));
        assert!(rendered.contains("(!!)"));
        assert!(rendered.contains("input_text_tokens: 1200"));
    }

    #[test]
    fn empty_breakdown_has_a_placeholder() {
        assert_eq!(render_breakdown(&run(false, 0.0)), "No pricing lines generated.");
    }
}
