//! Crate registry as used by control paths.

mod common;

use common::{build, hardware, trigger};
use crate_readout::event_buffer::EventBuffer;
use crate_readout::mock::MockModule;
use crate_readout::registry::CrateRegistry;
use crate_readout::CrateState;

#[test]
fn test_describe_multiple_crates() {
    let mut a = build("name = \"Main\"\n[[module]]\nkind = \"mock\"\nevent_max = 4\n[[module]]\nkind = \"barrier\"\n");
    let b = build("name = \"Aux\"\n[[module]]\nkind = \"mock_scaler\"\n");
    a.init().unwrap();

    let mut registry = CrateRegistry::new();
    registry.add(&a);
    registry.add(&b);

    let described = registry.describe();
    assert_eq!(described.len(), 2);
    assert_eq!(described[0].state, CrateState::Prepared);
    assert_eq!(described[0].modules[0].event_max, 4);
    assert!(described[0].modules[1].barrier);
    assert_eq!(described[1].state, CrateState::Reinit);
    assert_eq!(described[1].modules[0].kind, "mock_scaler");

    let json = serde_json::to_value(&described).unwrap();
    assert_eq!(json[0]["name"], "Main");
    assert_eq!(json[0]["state"], "PREPARED");
    assert_eq!(json[1]["modules"][0]["event_max"], 0);
}

#[test]
fn test_state_visible_through_handle() {
    let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
    let mut registry = CrateRegistry::new();
    let index = registry.add(&crate_);
    assert_eq!(registry.get(index).unwrap().state(), CrateState::Reinit);

    crate_.init().unwrap();
    trigger(&crate_, 1);
    crate_.readout_dt().unwrap();
    assert_eq!(registry.find("Crate").unwrap().state(), CrateState::Ready);
}

#[test]
fn test_config_write_through_registry() {
    let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
    crate_.init().unwrap();
    let mut registry = CrateRegistry::new();
    registry.add(&crate_);

    let snippet: toml::Table = "event_max = 3".parse().unwrap();
    assert!(registry.config_write(0, 0, &snippet));
    assert!(!registry.config_write(0, 1, &snippet));

    trigger(&crate_, 1);
    assert!(crate_.readout_dt().unwrap().is_ok());
    let mut buf = [0u8; 64];
    let mut eb = EventBuffer::new(&mut buf);
    assert!(crate_.readout(&mut eb).is_ok());
    crate_.finalize().unwrap();

    assert_eq!(registry.describe()[0].modules[0].event_max, 3);
    assert_eq!(hardware(&crate_, 0).lock().fast_inits, 2);
}

#[test]
fn test_module_access_runs_closure() {
    let crate_ = build("[[module]]\nkind = \"mock\"\n[[module]]\nkind = \"mock\"\n");
    let mut registry = CrateRegistry::new();
    registry.add(&crate_);

    let ids: Vec<u32> = (0..2)
        .filter_map(|j| registry.module_access(0, j, |core, _| core.id))
        .collect();
    assert_eq!(ids, vec![0, 1]);

    registry.module_access(0, 1, |_, m| {
        MockModule::downcast(m).unwrap().hardware().lock().trigger(2);
    });
    assert_eq!(hardware(&crate_, 1).lock().pending.len(), 2);
    assert!(registry.module_access(1, 0, |_, _| ()).is_none());
}
