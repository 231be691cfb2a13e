//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` and can be set via the
//! `-f` flag or `TOLLGATE_CONFIG`. Variables prefixed with `TOLLGATE_`
//! override YAML values; nested fields use double underscores, e.g.
//! `TOLLGATE_SIMULATOR__RUNS=500` sets `simulator.runs`.
//!
//! There is no ambient global: the loaded [`Config`] is passed by reference
//! to whatever needs it.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug, Default)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TOLLGATE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without running.
    #[arg(long)]
    pub validate: bool,
}

/// Root configuration, loaded from YAML and environment variables. All fields
/// have defaults, so a missing config file is not an error.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the price catalog (JSON array of rule rows).
    pub catalog: String,
    /// Simulator defaults; CLI flags override these per invocation.
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatorConfig {
    /// Runs per provider/model/endpoint/plan combination.
    pub runs: usize,
    /// Max combinations to simulate.
    pub limit: usize,
    /// Pricing plan, or "all".
    pub plan: String,
    /// Random meter quantity range, inclusive.
    pub min: i64,
    pub max: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: "catalog.json".to_string(),
            simulator: SimulatorConfig::default(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            runs: 1,
            limit: 5,
            plan: "all".to_string(),
            min: 10,
            max: 5000,
        }
    }
}

impl Config {
    /// Loads configuration: defaults, then the YAML file, then `TOLLGATE_`
    /// environment overrides.
    pub fn load(args: &Args) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("TOLLGATE_").split("__"))
            .extract()?;
        Ok(config)
    }
}
