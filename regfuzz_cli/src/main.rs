use regfuzz_core::config::HarnessConfig;
use regfuzz_core::driver::RandomDriver;
use regfuzz_core::engine::QueryEngine;
use regfuzz_core::error::HarnessError;
use regfuzz_core::harness::Harness;
use regfuzz_core::target::PatternQueryEngine;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_QUERY: &str = "SELECT 'the quick brown fox jumps over the lazy dog' ~ $1";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Query to fuzz. Must take exactly one text parameter.
    #[clap(short, long)]
    query: Option<String>,
    #[clap(short, long, default_value_t = 100_000)]
    runs: u64,
    #[clap(long)]
    seed: Option<u64>,
    /// Lowers the default log filter to debug; `RUST_LOG` still wins.
    #[clap(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<HarnessConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("loading configuration from {config_path:?}");
            HarnessConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("regfuzz.toml");
            if default_config_path.exists() {
                info!("no config file specified, loading default {default_config_path:?}");
                HarnessConfig::load_from_file(&default_config_path)
            } else {
                info!("no config file specified and no regfuzz.toml found, using built-in defaults");
                Ok(HarnessConfig::default())
            }
        }
    }
}

/// Resource-limit failures end the process on the spot; everything else is
/// returned to `main` with context.
fn abort_if_fatal<T>(result: Result<T, HarnessError>) -> Result<T, HarnessError> {
    if let Err(e) = &result {
        if e.is_fatal() {
            error!("{e}");
            std::process::abort();
        }
    }
    result
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config_file)?;
    if let Some(seed) = cli.seed {
        config.driver.seed = seed;
    }
    let query = cli.query.unwrap_or_else(|| DEFAULT_QUERY.to_string());

    let mut engine = PatternQueryEngine::default();
    let mut driver = RandomDriver::new(config.driver.seed);
    let mut harness = Harness::new(config);

    abort_if_fatal(harness.setup_environment(&mut engine, driver.log().clone()))
        .context("failed to set up the fuzzing environment")?;

    let exit_code = abort_if_fatal(harness.run(&mut engine, &mut driver, cli.runs, &query))
        .with_context(|| format!("failed to fuzz {query:?}"))?;

    for finding in driver.log().findings() {
        warn!(
            "finding {} for input {:?} (md5 {})",
            finding.name,
            String::from_utf8_lossy(&finding.input),
            finding.input_hash
        );
    }
    if let Some(pattern) = engine.pattern_arena() {
        info!(
            "pattern arena holds {} bytes",
            pattern.totals().used()
        );
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
