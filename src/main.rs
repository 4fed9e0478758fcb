//! CLI Entry Point for bsp_i2c
//!
//! Provides command-line interface for:
//! - Running validation scenarios against the kernel (or a simulated board)
//! - Listing the available scenarios
//! - Checking a configuration file without touching hardware
//!
//! # Usage
//!
//! Run every scenario:
//! ```bash
//! bsp_i2c run --config /etc/bsp_i2c.toml
//! ```
//!
//! Run one scenario against the simulated board, JSON report on stdout:
//! ```bash
//! bsp_i2c run --config board.toml --scenario simultaneous-transactions --simulate --json
//! ```

use anyhow::{bail, Context, Result};
use bsp_i2c::config::BspConfig;
use bsp_i2c::hardware::mock::FakeBoard;
use bsp_i2c::procedures::{BspTestSuite, Platform, Scenario};
use bsp_i2c::tracing_init::{self, OutputFormat, TracingConfig};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "bsp_i2c")]
#[command(about = "FPGA BSP I2C topology provisioning and transaction validation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run validation scenarios
    Run {
        /// Board configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Scenario to run (repeatable; default: all, in order)
        #[arg(long = "scenario", value_enum)]
        scenarios: Vec<Scenario>,

        /// Print the report as JSON on stdout
        #[arg(long)]
        json: bool,

        /// Run against a simulated board seeded from the topology's golden values
        #[arg(long)]
        simulate: bool,

        /// Log span open/close events (scenario and adapter timings)
        #[arg(long)]
        trace_spans: bool,
    },

    /// List available scenarios
    ListScenarios,

    /// Load and validate a configuration file
    CheckConfig {
        /// Board configuration (TOML)
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            scenarios,
            json,
            simulate,
            trace_spans,
        } => run(&config, scenarios, json, simulate, trace_spans).await,
        Commands::ListScenarios => {
            for scenario in Scenario::ALL {
                println!("{:<34} {}", scenario.name(), scenario.description());
            }
            Ok(())
        }
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> Result<BspConfig> {
    if !path.is_file() {
        bail!("Configuration file {} not found", path.display());
    }
    let config = BspConfig::load_from(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

async fn run(
    path: &Path,
    scenarios: Vec<Scenario>,
    json: bool,
    simulate: bool,
    trace_spans: bool,
) -> Result<()> {
    let config = load_config(path)?;

    let format = if json {
        OutputFormat::Json
    } else {
        OutputFormat::Compact
    };
    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(format)
        .with_span_events(trace_spans)
        .with_ansi(std::io::stderr().is_terminal());
    tracing_init::init(tracing_config).map_err(anyhow::Error::msg)?;

    let suite = if simulate {
        info!("Running against simulated board");
        let board = Arc::new(FakeBoard::from_topology(&config.topology));
        BspTestSuite::new(
            Arc::new(config.topology.clone()),
            Platform::from_fake(board),
            config.concurrency.clone(),
        )
    } else {
        BspTestSuite::from_config(&config)
    };

    let scenarios = if scenarios.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        scenarios
    };
    let report = suite.run_many(&scenarios).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
    }

    if !report.all_passed() {
        bail!("{} scenario(s) failed", report.failed_count());
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let topology = &config.topology;
    println!(
        "{}: {} FPGA(s), {} adapter(s), {} device(s)",
        path.display(),
        topology.fpgas.len(),
        topology.adapter_count(),
        topology
            .fpgas
            .iter()
            .flat_map(|f| &f.i2c_adapters)
            .map(|a| a.i2c_devices.len())
            .sum::<usize>()
    );
    Ok(())
}
