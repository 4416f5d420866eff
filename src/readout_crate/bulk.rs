//! The bulk phase: move every module's data into the event buffer.

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{error, trace};

use super::{CrateInner, CrateState, ModuleCell, ModuleSlot, ReadoutCrate, Shared};
use crate::error::ReadoutFail;
use crate::event_buffer::{hex_dump, EventBuffer};
use crate::module::BARRIER_WORD;

/// Bytes of offending data included in error dumps.
const DUMP_LIMIT: usize = 256;

impl ReadoutCrate {
    /// Read every module into `eb`, releasing deadtime at the point found by
    /// the deadtime phase. Does nothing unless the crate is READY.
    ///
    /// Any failure sends the crate to REINIT. On success with deadtime still
    /// held, every module must report empty afterwards.
    pub fn readout(&mut self, eb: &mut EventBuffer<'_>) -> ReadoutFail {
        let inner = Arc::clone(&self.inner);
        let mut result = ReadoutFail::empty();
        let mut guard = Some(inner.shared.lock());
        if guard.as_ref().map(|shared| shared.state) != Some(CrateState::Ready) {
            return result;
        }
        let shadow_active = inner.do_shadow();
        let start = eb.offset();

        for (index, cell) in inner.modules.iter().enumerate() {
            if index == self.dt_release.release_at {
                self.dt_release.release();
            }
            if cell.is_barrier {
                if let Err(e) = eb.push_u32(BARRIER_WORD) {
                    error!(crate_name = inner.name(), module = index, "No room for barrier word");
                    result |= ReadoutFail::from(e);
                }
                continue;
            }
            if cell.slot.lock().core.event_max == 0 {
                continue;
            }
            if shadow_active && cell.supports_shadow {
                guard = None;
                result |= merge_shadow(&inner, cell, eb);
            } else {
                let shared = guard.get_or_insert_with(|| inner.shared.lock());
                result |= self.read_module(&inner, cell, shared, eb);
            }
        }
        if self.dt_release.release_at >= inner.modules.len() {
            self.dt_release.release();
        }

        let shared = guard.get_or_insert_with(|| inner.shared.lock());
        if result.is_ok() {
            if !self.free_running && self.dt_release.is_on() {
                result |= inner.check_empty(shared);
            }
        } else {
            shared.state = CrateState::Reinit;
            error!(crate_name = inner.name(), ?result, "Readout failed");
        }
        trace!(
            crate_name = inner.name(),
            bytes = eb.offset() - start,
            ?result,
            "readout done"
        );
        result
    }

    /// Read one module directly, under the crate mutex.
    fn read_module(
        &mut self,
        inner: &CrateInner,
        cell: &ModuleCell,
        shared: &mut MutexGuard<'_, Shared>,
        eb: &mut EventBuffer<'_>,
    ) -> ReadoutFail {
        let mut slot = cell.slot.lock();
        let ModuleSlot { core, driver, .. } = &mut *slot;
        let crate_counter = shared.counters[core.crate_counter].cur;
        trace!(
            module_id = core.id,
            kind = %cell.kind,
            prev = core.crate_counter_prev,
            cur = crate_counter.value,
            "read_module"
        );
        if !self.free_running
            && self.transport.can_skip()
            && crate_counter.diff_raw(core.crate_counter_prev) == 0
        {
            return ReadoutFail::empty();
        }

        let mark = eb.offset();
        let mut result = self.transport.readout(driver.as_mut(), core, eb);
        let data = eb.written_since(mark);
        if !result.is_ok() {
            error!(
                crate_name = inner.name(),
                module_id = core.id,
                kind = %cell.kind,
                ?result,
                "Readout error, dumping data:\n{}",
                hex_dump(data, DUMP_LIMIT)
            );
        } else {
            result = driver.parse_data(core, data, false);
            if !result.is_ok() {
                error!(
                    crate_name = inner.name(),
                    module_id = core.id,
                    kind = %cell.kind,
                    ?result,
                    "Parse error, dumping data:\n{}",
                    hex_dump(data, DUMP_LIMIT)
                );
            }
        }
        core.result |= result;
        if !result.is_ok() {
            shared.state = CrateState::Reinit;
        }
        core.crate_counter_prev = crate_counter.value;
        result
    }
}

/// Copy a module's published shadow region into `eb` and check it.
fn merge_shadow(inner: &CrateInner, cell: &ModuleCell, eb: &mut EventBuffer<'_>) -> ReadoutFail {
    let mark = eb.offset();
    {
        let pair = cell.shadow.lock();
        let published = pair.published();
        if let Err(e) = eb.write(published) {
            error!(
                crate_name = inner.name(),
                kind = %cell.kind,
                requested = e.requested,
                remaining = e.remaining,
                "Too much shadow data for the event buffer"
            );
            return ReadoutFail::from(e);
        }
    }
    let bytes = eb.offset() - mark;
    let data = eb.written_since(mark);

    let mut slot = cell.slot.lock();
    let ModuleSlot { core, driver, .. } = &mut *slot;
    let result = driver.parse_data(core, data, false);
    if !result.is_ok() {
        error!(
            crate_name = inner.name(),
            module_id = core.id,
            kind = %cell.kind,
            ?result,
            "Shadow parse error, dumping data:\n{}",
            hex_dump(data, DUMP_LIMIT)
        );
    }
    drop(slot);

    let mut shared = inner.shared.lock();
    shared.shadow_max_bytes = shared.shadow_max_bytes.max(bytes);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrateSettings;
    use crate::mock::{self, MockModule};
    use crate::module::DriverRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn build(toml: &str) -> ReadoutCrate {
        let mut drivers = DriverRegistry::new();
        mock::register(&mut drivers);
        let settings = CrateSettings::from_toml_str(toml).unwrap();
        ReadoutCrate::create(&settings, &drivers).unwrap()
    }

    fn trigger(crate_: &ReadoutCrate, n: u32) {
        for index in 0..crate_.module_list_len() {
            crate_.with_module(index, |_, m| {
                if let Some(m) = MockModule::downcast(m) {
                    m.hardware().lock().trigger(n);
                }
            });
        }
        crate_.tag_counter_increase(None, n);
    }

    fn words(data: &[u8]) -> Vec<u32> {
        data.chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_readout_requires_ready() {
        let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
        let mut buf = [0u8; 64];
        let mut eb = EventBuffer::new(&mut buf);
        assert!(crate_.readout(&mut eb).is_ok());
        assert_eq!(eb.offset(), 0);
    }

    #[test]
    fn test_readout_with_barrier() {
        let mut crate_ = build(
            "[[module]]\nkind = \"mock\"\n[[module]]\nkind = \"barrier\"\n[[module]]\nkind = \"mock\"\n",
        );
        crate_.init().unwrap();
        trigger(&crate_, 1);
        assert!(crate_.readout_dt().unwrap().is_ok());

        let mut buf = [0u8; 64];
        let mut eb = EventBuffer::new(&mut buf);
        assert!(crate_.readout(&mut eb).is_ok());
        let words = words(eb.filled());
        assert_eq!(words.len(), 3);
        assert_eq!(words[1], BARRIER_WORD);
        assert_eq!(words[0] >> 24, 0);
        assert_eq!(words[2] >> 24, 1);
        assert_eq!(crate_.state(), CrateState::Ready);
    }

    #[test]
    fn test_unchanged_counter_skips_module() {
        let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
        crate_.init().unwrap();
        assert!(crate_.readout_dt().unwrap().is_ok());
        let mut buf = [0u8; 16];
        let mut eb = EventBuffer::new(&mut buf);
        assert!(crate_.readout(&mut eb).is_ok());
        assert_eq!(eb.offset(), 0);
    }

    #[test]
    fn test_parse_error_sends_to_reinit() {
        let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
        crate_.init().unwrap();
        trigger(&crate_, 1);
        crate_.with_module(0, |_, m| {
            if let Some(m) = MockModule::downcast(m) {
                m.hardware().lock().corrupt_next = true;
            }
        });
        assert!(crate_.readout_dt().unwrap().is_ok());
        let mut buf = [0u8; 16];
        let mut eb = EventBuffer::new(&mut buf);
        assert_eq!(crate_.readout(&mut eb), ReadoutFail::DATA_CORRUPT);
        assert_eq!(crate_.state(), CrateState::Reinit);
    }

    #[test]
    fn test_leftover_data_fails_check_empty() {
        let mut crate_ = build("[[module]]\nkind = \"mock\"\n");
        crate_.init().unwrap();
        trigger(&crate_, 1);
        assert!(crate_.readout_dt().unwrap().is_ok());
        crate_.with_module(0, |_, m| {
            if let Some(m) = MockModule::downcast(m) {
                m.hardware().lock().leftover = true;
            }
        });
        let mut buf = [0u8; 16];
        let mut eb = EventBuffer::new(&mut buf);
        assert_eq!(crate_.readout(&mut eb), ReadoutFail::DATA_TOO_MUCH);
        assert_eq!(crate_.state(), CrateState::Reinit);
    }

    #[test]
    fn test_early_release_point() {
        let mut crate_ = build(
            "deadtime_release = true\n[[module]]\nkind = \"mock\"\n[[module]]\nkind = \"mock\"\nearly_dt = true\n",
        );
        let released = Arc::new(AtomicU32::new(0));
        let r = released.clone();
        crate_.set_deadtime_release(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        crate_.init().unwrap();
        trigger(&crate_, 1);
        assert!(crate_.readout_dt().unwrap().is_ok());
        assert_eq!(crate_.dt_release.release_at, 1);

        let mut buf = [0u8; 64];
        let mut eb = EventBuffer::new(&mut buf);
        assert!(crate_.readout(&mut eb).is_ok());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!crate_.dt_is_on());
    }

    #[test]
    fn test_inhibit_keeps_deadtime() {
        let mut crate_ = build("deadtime_release = true\n[[module]]\nkind = \"mock\"\nearly_dt = true\n");
        let released = Arc::new(AtomicU32::new(0));
        let r = released.clone();
        crate_.set_deadtime_release(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        crate_.init().unwrap();
        trigger(&crate_, 1);
        assert!(crate_.readout_dt().unwrap().is_ok());
        crate_.inhibit_once();

        let mut buf = [0u8; 64];
        let mut eb = EventBuffer::new(&mut buf);
        assert!(crate_.readout(&mut eb).is_ok());
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert!(crate_.dt_is_on());
    }
}
