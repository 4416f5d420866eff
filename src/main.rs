//! CLI Entry Point for crate-readout
//!
//! Provides command-line interface for:
//! - Checking a crate configuration (build every crate and print its layout)
//! - Simulating the trigger cycle against simulated modules
//!
//! Only the simulated module types from [`crate_readout::mock`] are
//! registered, so configurations for real hardware fail the check with an
//! unknown module type.
//!
//! # Usage
//!
//! ```bash
//! crate-readout check crate.toml
//! crate-readout check crate.toml --json
//! crate-readout simulate crate.toml --triggers 1000
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use crate_readout::config::{CrateSettings, ReadoutConfig};
use crate_readout::counter::AUTO_PREFIX;
use crate_readout::event_buffer::EventBuffer;
use crate_readout::logging::{self, OutputFormat, TracingConfig};
use crate_readout::mock::{self, MockModule, MockScaler};
use crate_readout::module::DriverRegistry;
use crate_readout::readout_crate::{CrateState, ReadoutCrate};
use crate_readout::registry::CrateRegistry;

#[derive(Parser)]
#[command(name = "crate-readout")]
#[command(about = "DAQ crate readout orchestrator", long_about = None)]
struct Cli {
    /// Override the log level of the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every crate of a config file and print the layout
    Check {
        /// Path to the crate config file
        config: PathBuf,

        /// Print the layout as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the trigger cycle against simulated modules
    Simulate {
        /// Path to the crate config file
        config: PathBuf,

        /// Number of triggers per crate
        #[arg(long, default_value = "100")]
        triggers: u32,

        /// Event buffer size in bytes
        #[arg(long, default_value = "65536")]
        buffer_bytes: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match &cli.command {
        Commands::Check { config, .. } | Commands::Simulate { config, .. } => config.clone(),
    };
    let config = ReadoutConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    let format = match cli.log_format {
        LogFormat::Pretty => OutputFormat::Pretty,
        LogFormat::Compact => OutputFormat::Compact,
        LogFormat::Json => OutputFormat::Json,
    };
    logging::init(TracingConfig::from_level_str(level).map_err(anyhow::Error::msg)?.with_format(format))
        .map_err(anyhow::Error::msg)?;

    let mut drivers = DriverRegistry::new();
    mock::register(&mut drivers);

    match cli.command {
        Commands::Check { json, .. } => check(&config, &drivers, json),
        Commands::Simulate {
            triggers,
            buffer_bytes,
            ..
        } => simulate(&config, &drivers, triggers, buffer_bytes),
    }
}

fn build_all(config: &ReadoutConfig, drivers: &DriverRegistry) -> Result<Vec<ReadoutCrate>> {
    config
        .crates
        .iter()
        .map(|settings: &CrateSettings| {
            ReadoutCrate::create(settings, drivers).with_context(|| format!("building crate {}", settings.name))
        })
        .collect()
}

fn check(config: &ReadoutConfig, drivers: &DriverRegistry, json: bool) -> Result<()> {
    let crates = build_all(config, drivers)?;
    let mut registry = CrateRegistry::new();
    for crate_ in &crates {
        registry.add(crate_);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&registry.describe())?);
        return Ok(());
    }

    for (description, crate_) in registry.describe().iter().zip(&crates) {
        println!("Crate \"{}\" ({})", description.name, description.state);
        for tag in crate_.tag_names() {
            if let Some(tag) = crate_.get_tag_by_name(Some(&tag)) {
                println!("  tag {:<16} modules={}", tag.name, tag.module_num);
            }
        }
        for module in &description.modules {
            if module.barrier {
                println!("  [{:>3}] --- barrier ---", module.index);
            } else {
                println!(
                    "  [{:>3}] {:<12} id={:<4} event_max={}",
                    module.index, module.kind, module.id, module.event_max
                );
            }
        }
    }
    Ok(())
}

/// Advance every simulated module, scaler and auto counter by one trigger.
fn trigger(crate_: &ReadoutCrate, counters: &[String]) {
    for index in 0..crate_.module_list_len() {
        crate_.with_module(index, |core, module| {
            if let Some(mock) = MockModule::downcast(module) {
                if core.event_max > 0 {
                    mock.hardware().lock().trigger(1);
                }
            } else if let Some(scaler) = MockScaler::downcast(module) {
                let value = scaler.value();
                let mut value = value.lock();
                *value = value.wrapping_add(1);
            }
        });
    }
    for name in counters.iter().filter(|name| name.starts_with(AUTO_PREFIX)) {
        crate_.counter_increase(name, 1);
    }
}

fn simulate(config: &ReadoutConfig, drivers: &DriverRegistry, triggers: u32, buffer_bytes: usize) -> Result<()> {
    let mut crates = build_all(config, drivers)?;
    let mut buf = vec![0u8; buffer_bytes];

    for crate_ in &mut crates {
        crate_.init()?;
        let counters = crate_.counter_names();
        let mut bytes = 0usize;
        let mut failures = 0u32;

        for _ in 0..triggers {
            trigger(crate_, &counters);
            let mut result = crate_.readout_dt()?;
            let mut eb = EventBuffer::new(&mut buf);
            if crate_.state() == CrateState::Ready {
                result |= crate_.readout(&mut eb);
            }
            bytes += eb.offset();
            if !result.is_ok() {
                failures += 1;
                warn!(crate_name = crate_.name(), ?result, "Trigger failed");
            }
            crate_.finalize()?;
        }

        let info = crate_.info();
        info!(
            crate_name = crate_.name(),
            triggers,
            bytes,
            failures,
            acvt_ns = info.acvt_ns,
            shadow_max_bytes = info.shadow_max_bytes,
            "Simulation done"
        );
        println!(
            "{}: {} triggers, {} bytes, {} failures",
            crate_.name(),
            triggers,
            bytes,
            failures
        );
        crate_.deinit();
    }
    Ok(())
}
