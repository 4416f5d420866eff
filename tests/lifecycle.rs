//! Init, finalize and reconfiguration across trigger cycles.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::{build, hardware, trigger};
use crate_readout::event_buffer::EventBuffer;
use crate_readout::{CrateError, CrateState, ReadoutCrate, ReadoutFail};

fn cycle(crate_: &mut ReadoutCrate, n: u32) -> ReadoutFail {
    trigger(crate_, n);
    let mut result = crate_.readout_dt().unwrap();
    let mut buf = vec![0u8; 1024];
    let mut eb = EventBuffer::new(&mut buf);
    if crate_.state() == CrateState::Ready {
        result |= crate_.readout(&mut eb);
    }
    crate_.finalize().unwrap();
    result
}

#[test]
fn test_config_write_applies_at_finalize() {
    let mut crate_ = build("[[module]]\nkind = \"mock\"\n[[module]]\nkind = \"mock\"\n");
    crate_.init().unwrap();
    let hw = hardware(&crate_, 0);
    assert_eq!(hw.lock().fast_inits, 1);

    let snippet: toml::Table = "event_max = 2".parse().unwrap();
    assert!(crate_.config_write(0, &snippet));
    assert!(crate_.config_write(0, &snippet));
    assert_eq!(crate_.handle().pending_reconfig(), vec![0]);

    assert!(cycle(&mut crate_, 1).is_ok());
    assert!(crate_.handle().pending_reconfig().is_empty());
    {
        let hw = hw.lock();
        assert_eq!(hw.fast_inits, 2);
        assert_eq!(hw.post_inits, 2);
        assert_eq!(hw.joint_inits, 2);
    }
    assert_eq!(hardware(&crate_, 1).lock().fast_inits, 1);
    assert_eq!(crate_.modules()[0].event_max, 2);

    // Reading continues with the new offset latched.
    assert!(cycle(&mut crate_, 2).is_ok());
    assert_eq!(crate_.state(), CrateState::Ready);
}

#[test]
fn test_config_write_rejects_barrier() {
    let crate_ = build("[[module]]\nkind = \"barrier\"\n[[module]]\nkind = \"mock\"\n");
    let snippet: toml::Table = "event_max = 2".parse().unwrap();
    assert!(!crate_.config_write(0, &snippet));
    assert!(!crate_.config_write(5, &snippet));
    assert!(crate_.config_write(1, &snippet));
}

#[test]
fn test_finalize_recovers_after_failure() {
    let mut crate_ = build(
        "reinit_sleep = \"1ms\"\ntiming.mismatch_timeout = \"5ms\"\n[[module]]\nkind = \"mock\"\n",
    );
    crate_.init().unwrap();
    crate_.tag_counter_increase(None, 1);
    assert!(!crate_.readout_dt().unwrap().is_ok());
    assert_eq!(crate_.state(), CrateState::Reinit);

    crate_.finalize().unwrap();
    assert_eq!(crate_.state(), CrateState::Prepared);
    assert_eq!(hardware(&crate_, 0).lock().slow_inits, 2);
    assert!(cycle(&mut crate_, 1).is_ok());
}

#[test]
fn test_init_retry_after_partial_round() {
    // The first module passes fast-init before the second one fails, so its
    // id is already registered when the round is abandoned.
    let mut crate_ = build(
        "reinit_sleep = \"1ms\"\n[[module]]\nkind = \"mock\"\n[[module]]\nkind = \"mock\"\nfail_init = 1\n",
    );
    crate_.init().unwrap();
    assert_eq!(crate_.state(), CrateState::Prepared);
    assert_eq!(hardware(&crate_, 0).lock().fast_inits, 2);
    assert_eq!(hardware(&crate_, 1).lock().fast_inits, 2);
    assert_eq!(hardware(&crate_, 1).lock().slow_inits, 2);
    assert!(cycle(&mut crate_, 1).is_ok());
}

#[test]
fn test_reconfig_runs_post_init_after_failed_fast_init() {
    let mut crate_ = build("reinit_sleep = \"1ms\"\n[[module]]\nkind = \"mock\"\n");
    crate_.init().unwrap();
    let hw = hardware(&crate_, 0);

    let snippet: toml::Table = "event_max = 2".parse().unwrap();
    assert!(crate_.config_write(0, &snippet));
    hw.lock().fail_init = 1;
    assert!(cycle(&mut crate_, 1).is_ok());
    {
        let hw = hw.lock();
        assert_eq!(hw.fast_inits, 2);
        assert_eq!(hw.post_inits, 2);
    }
    assert_eq!(crate_.state(), CrateState::Reinit);

    // The next trigger re-initializes instead of reading.
    assert!(cycle(&mut crate_, 1).is_ok());
    assert_eq!(crate_.state(), CrateState::Prepared);
    assert_eq!(hw.lock().slow_inits, 2);
    assert!(cycle(&mut crate_, 1).is_ok());
    assert_eq!(crate_.state(), CrateState::Ready);
}

#[test]
fn test_released_deadtime_forces_second_recovery() {
    let mut crate_ = build(
        "reinit_sleep = \"1ms\"\ndeadtime_release = true\n[[module]]\nkind = \"mock\"\nearly_dt = true\n",
    );
    let released = Arc::new(AtomicU32::new(0));
    let r = released.clone();
    crate_.set_deadtime_release(Box::new(move || {
        r.fetch_add(1, Ordering::SeqCst);
    }));
    crate_.init().unwrap();

    trigger(&crate_, 1);
    hardware(&crate_, 0).lock().corrupt_next = true;
    assert!(crate_.readout_dt().unwrap().is_ok());
    let mut buf = [0u8; 64];
    let mut eb = EventBuffer::new(&mut buf);
    assert_eq!(crate_.readout(&mut eb), ReadoutFail::DATA_CORRUPT);
    assert_eq!(released.load(Ordering::SeqCst), 1);

    // Triggers may have slipped in, so the crate stays in REINIT.
    crate_.finalize().unwrap();
    assert_eq!(crate_.state(), CrateState::Reinit);

    // The next deadtime phase re-initializes and skips the trigger.
    assert!(crate_.readout_dt().unwrap().is_ok());
    assert_eq!(crate_.state(), CrateState::Prepared);
}

#[test]
fn test_scaler_bound_tag() {
    let mut crate_ = build(
        "[[module]]\nkind = \"mock_scaler\"\nname = \"trig\"\n\
         [[module]]\nkind = \"tags\"\nnames = [\"Triggered\"]\nscaler = \"trig\"\n\
         [[module]]\nkind = \"mock\"\n",
    );
    assert_eq!(crate_.get_tag_by_name(Some("Triggered")).unwrap().module_num, 1);
    crate_.init().unwrap();

    assert!(cycle(&mut crate_, 3).is_ok());
    assert_eq!(crate_.counter_get("trig").unwrap().value, 3);
    assert!(crate_.counter_names().contains(&"trig".to_string()));
}

#[test]
fn test_shared_device_lifecycle() {
    let mut crate_ = build(
        "[[module]]\nkind = \"shared_device\"\ntype = \"mock_device\"\n\
         [[module]]\nkind = \"mock\"\nshared_device = true\n",
    );
    crate_.init().unwrap();
    assert!(crate_.get_tag_by_name(None).unwrap().needs_shared_device);
    assert!(crate_.tag_counter_increase(None, 0));
    crate_.deinit();
    assert_eq!(crate_.state(), CrateState::Reinit);
}

#[test]
fn test_init_retry_with_shared_device() {
    let mut crate_ = build(
        "reinit_sleep = \"1ms\"\n\
         [[module]]\nkind = \"shared_device\"\ntype = \"mock_device\"\nfail = false\n\
         [[module]]\nkind = \"mock\"\nfail_init = 1\n",
    );
    crate_.init().unwrap();
    assert_eq!(hardware(&crate_, 0).lock().fast_inits, 2);
}

#[test]
fn test_unknown_module_type() {
    let err = common::try_build("[[module]]\nkind = \"caen_v775\"\n").unwrap_err();
    assert!(matches!(err, CrateError::UnknownModuleType(kind) if kind == "caen_v775"));
}

#[test]
fn test_memtest_and_free_running() {
    let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
    crate_.memtest(4);
    assert_eq!(hardware(&crate_, 0).lock().memtests, 1);

    crate_.set_free_running(true);
    assert!(crate_.free_running());
    crate_.init().unwrap();
    // Counters are not checked, the module is read regardless.
    crate_.tag_counter_increase(None, 3);
    assert!(crate_.readout_dt().unwrap().is_ok());
    assert_eq!(crate_.state(), CrateState::Ready);
}
