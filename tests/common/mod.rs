//! Shared helpers for the integration tests.

#![allow(dead_code)]

use crate_readout::config::CrateSettings;
use crate_readout::mock::{self, MockHandle, MockModule, MockScaler};
use crate_readout::module::DriverRegistry;
use crate_readout::{CrateResult, ReadoutCrate};

/// Driver registry with the simulated modules.
pub fn drivers() -> DriverRegistry {
    let mut drivers = DriverRegistry::new();
    mock::register(&mut drivers);
    drivers
}

/// Build a crate from one crate table.
pub fn try_build(toml: &str) -> CrateResult<ReadoutCrate> {
    let settings = CrateSettings::from_toml_str(toml)?;
    ReadoutCrate::create(&settings, &drivers())
}

/// Build a crate that is expected to be valid.
pub fn build(toml: &str) -> ReadoutCrate {
    try_build(toml).unwrap()
}

/// Scripted state of the mock at list index `index`.
pub fn hardware(crate_: &ReadoutCrate, index: usize) -> MockHandle {
    crate_
        .with_module(index, |_, m| MockModule::downcast(m).map(|m| m.hardware()))
        .flatten()
        .unwrap()
}

/// Fire `n` triggers: every data-producing mock queues `n` events, scalers
/// advance and the default tag's counters follow.
pub fn trigger(crate_: &ReadoutCrate, n: u32) {
    for index in 0..crate_.module_list_len() {
        crate_.with_module(index, |core, m| {
            if core.event_max == 0 && MockModule::downcast(&mut *m).is_some() {
                return;
            }
            if let Some(m) = MockModule::downcast(m) {
                m.hardware().lock().trigger(n);
            } else if let Some(s) = MockScaler::downcast(m) {
                let value = s.value();
                let mut value = value.lock();
                *value = value.wrapping_add(n);
            }
        });
    }
    crate_.tag_counter_increase(None, n);
}

/// Native-endian words of an event buffer.
pub fn words(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
