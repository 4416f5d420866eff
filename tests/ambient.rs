//! Configuration loading and logging setup.

use std::time::Duration;

use crate_readout::config::{ReadoutConfig, TransportKind};
use crate_readout::logging::{self, OutputFormat, TracingConfig};
use crate_readout::mock;
use crate_readout::module::DriverRegistry;
use crate_readout::ReadoutCrate;
use serial_test::serial;

const FILE: &str = r#"
log_level = "warn"

[[crate]]
name = "Main"
acvt = true
reinit_sleep = "250ms"
timing.acvt_step_ns = 50

[[crate.module]]
kind = "mock"
acvt = true
event_max = 2

[[crate]]
name = "Seq"
transport = "sequencer"
"#;

#[test]
#[serial]
fn test_load_file_and_build() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crate.toml");
    std::fs::write(&path, FILE).unwrap();

    let config = ReadoutConfig::load_from(&path).unwrap();
    assert_eq!(config.log_level, "warn");
    assert_eq!(config.crates.len(), 2);
    let main = &config.crates[0];
    assert_eq!(main.reinit_sleep, Duration::from_millis(250));
    assert_eq!(main.timing.acvt_step_ns, 50);
    assert_eq!(config.crates[1].transport, TransportKind::Sequencer);

    let mut drivers = DriverRegistry::new();
    mock::register(&mut drivers);
    let crate_ = ReadoutCrate::create(main, &drivers).unwrap();
    assert!(crate_.acvt_has());
    assert_eq!(crate_.acvt_ns(), 0);
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crate.toml");
    std::fs::write(&path, FILE).unwrap();

    std::env::set_var("CRATE_READOUT_LOG_LEVEL", "debug");
    let config = ReadoutConfig::load_from(&path);
    std::env::remove_var("CRATE_READOUT_LOG_LEVEL");

    assert_eq!(config.unwrap().log_level, "debug");
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ReadoutConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.log_level, "info");
    assert!(config.crates.is_empty());
}

#[test]
#[serial]
fn test_logging_init_is_idempotent() {
    let config = TracingConfig::from_level_str("debug")
        .unwrap()
        .with_format(OutputFormat::Compact)
        .with_ansi(false);
    assert!(logging::init(config.clone()).is_ok());
    assert!(logging::init(config.with_format(OutputFormat::Json)).is_ok());
    tracing::info!("logging initialized twice");
}
