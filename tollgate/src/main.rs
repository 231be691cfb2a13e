//! Differential pricing simulator CLI.
//!
//! Enumerates provider/model/endpoint combinations from the price catalog,
//! generates random-but-reproducible usage for each, prices it through the
//! billing engine, and cross-checks the result against an independent
//! estimator. Exits 0 when every run agrees, 1 when any run is flagged.

use clap::Parser;
use tollgate::config::{Args, Config};
use tollgate::pricing::Catalog;
use tollgate::sim::{self, SimOptions};
use tollgate::telemetry::init_telemetry;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tollgate-sim", version, about = "Differential pricing simulator", long_about = None)]
struct Cli {
    #[command(flatten)]
    base: Args,

    /// Restrict to specific provider(s), comma-separated
    #[arg(short = 'p', long, value_delimiter = ',')]
    provider: Vec<String>,

    /// Restrict to specific model id(s), comma-separated
    #[arg(short = 'm', long, value_delimiter = ',')]
    model: Vec<String>,

    /// Restrict to a specific endpoint
    #[arg(short = 'e', long)]
    endpoint: Option<String>,

    /// Limit number of model/provider combos
    #[arg(short = 'l', long)]
    limit: Option<usize>,

    /// Random usage runs per combo
    #[arg(short = 'r', long)]
    runs: Option<usize>,

    /// Pricing plan to simulate ("all" for every plan)
    #[arg(long)]
    plan: Option<String>,

    /// Minimum random meter quantity
    #[arg(long)]
    min: Option<i64>,

    /// Maximum random meter quantity
    #[arg(long)]
    max: Option<i64>,

    /// Seed for deterministic randomness (defaults to the current time)
    #[arg(long)]
    seed: Option<u64>,

    /// Shuffle combos before sampling
    #[arg(long)]
    random: bool,

    /// Print the line breakdown per run
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Simulate every available combo (ignores --limit)
    #[arg(long)]
    all: bool,

    /// Dump full estimation-vs-engine JSON for every run
    #[arg(long)]
    debug: bool,

    /// Path to the price catalog, overriding the configured one
    #[arg(long)]
    catalog: Option<String>,
}

fn options_from(cli: &Cli, config: &Config) -> SimOptions {
    SimOptions {
        providers: cli.provider.clone(),
        models: cli.model.clone(),
        endpoint: cli.endpoint.clone(),
        limit: if cli.all {
            None
        } else {
            Some(cli.limit.unwrap_or(config.simulator.limit))
        },
        runs: cli.runs.unwrap_or(config.simulator.runs).max(1),
        plan: cli.plan.clone().unwrap_or_else(|| config.simulator.plan.clone()),
        min: cli.min.unwrap_or(config.simulator.min).max(0),
        max: cli.max.unwrap_or(config.simulator.max),
        seed: cli
            .seed
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as u64),
        randomize: cli.random,
        verbose: cli.verbose,
        debug: cli.debug,
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.base)?;

    if cli.base.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    init_telemetry()?;

    let catalog_path = cli.catalog.as_ref().unwrap_or(&config.catalog);
    let catalog = Catalog::load(catalog_path)?;
    let options = options_from(&cli, &config);

    info!(
        catalog = %catalog_path,
        seed = options.seed,
        runs = options.runs,
        plan = %options.plan,
        "starting pricing simulation"
    );

    let runs = sim::simulate(&catalog, chrono::Utc::now(), &options)?;

    println!("{}", sim::report::render_summary(&runs));

    if options.verbose {
        for run in &runs {
            println!("\n{} [{}]", run.key, run.plan);
            println!("{}", sim::report::render_breakdown(run));
        }
    }

    let summary = sim::aggregate(&runs);
    println!(
        "\nCompleted {} run(s) across {} combo(s): {} successful, {} zero-bill, {} mismatched.",
        summary.total_runs,
        summary.combos.len(),
        summary.successful_runs,
        summary.zero_bill_runs,
        summary.mismatch_runs
    );
    println!("\nModel coverage:\n{}", sim::report::render_model_summary(&summary));

    if summary.flagged_runs > 0 {
        println!(
            "\nCombos with issues:\n{}",
            sim::report::render_combo_issues(&summary)
        );
        println!("\n{} flagged run(s) detected.", summary.flagged_runs);
        std::process::exit(1);
    }

    println!("\nAll runs billed a non-zero amount and matched the estimator exactly.");
    Ok(())
}
