//! The deadtime-critical phase.
//!
//! With deadtime held, every data-producing module is polled until its
//! event counter (and, in shadow mode, its shadow data counter) has caught up
//! with the crate counter it is bound to. The wait is bounded by one deadline
//! per phase.

use std::sync::Arc;
use std::thread;

use parking_lot::MutexGuard;
use tracing::{error, info, trace, warn};

use super::{CrateInner, CrateState, ModuleCell, ModuleSlot, ReadoutCrate, Shared};
use crate::error::{CrateResult, ReadoutFail};
use crate::logging::SuppressGuard;
use crate::module::ModuleFlags;
use crate::spin::SpinDeadline;

/// Outcome of one poll of one module.
enum Poll {
    Ready,
    Failed,
    Pending,
}

impl CrateInner {
    /// Pull the latest scaler values into their crate counters.
    fn refresh_counters(&self, shared: &mut Shared) -> ReadoutFail {
        let mut result = ReadoutFail::empty();
        for counter in &mut shared.counters {
            let Some(scaler) = counter.scaler else {
                continue;
            };
            match self.read_scaler(scaler) {
                Ok(value) => counter.cur.value = value,
                Err(fail) => {
                    warn!(crate_name = self.name(), counter = %counter.name, ?fail, "Scaler read failed");
                    result |= fail;
                }
            }
            trace!(
                counter = %counter.name,
                prev = counter.prev.value,
                cur = counter.cur.value,
                diff = counter.diff(),
                "Counter"
            );
        }
        result
    }
}

impl ReadoutCrate {
    /// Validate that every module saw the triggers the crate counted.
    ///
    /// In REINIT the crate is re-initialized instead and stays PREPARED, so
    /// the caller must not read this trigger. Otherwise the crate ends in
    /// READY on success and REINIT on any failure, which is also returned.
    pub fn readout_dt(&mut self) -> CrateResult<ReadoutFail> {
        let inner = Arc::clone(&self.inner);
        trace!(crate_name = inner.name(), "readout_dt");

        if self.state() == CrateState::Reinit {
            warn!(crate_name = inner.name(), "Crate needs re-init");
            self.deinit();
            thread::sleep(inner.settings.reinit_sleep);
            self.init()?;
            self.sync.clear();
            return Ok(ReadoutFail::empty());
        }

        let mut shared = inner.shared.lock();
        let mut result = inner.refresh_counters(&mut shared);

        let shadow_active = inner.do_shadow();
        let deadline = SpinDeadline::after(inner.settings.timing.mismatch_timeout);
        let mut release_at = 0;
        let mut waited = false;

        for (index, cell) in inner.modules.iter().enumerate() {
            {
                let slot = cell.slot.lock();
                if slot.core.skip_dt || slot.core.event_max == 0 {
                    continue;
                }
            }
            let (ok, fail) = self.poll_module(&inner, cell, &mut shared, &deadline, shadow_active, &mut waited);
            result |= fail;
            if ok && !cell.flags.contains(ModuleFlags::EARLY_DT) {
                release_at = index + 1;
            }
            if shadow_active && cell.supports_shadow {
                cell.shadow.lock().swap();
            }
        }

        if self.dt_release.enabled() && release_at != self.dt_release.release_at {
            info!(
                crate_name = inner.name(),
                release_at,
                modules = inner.modules.len(),
                "Deadtime release point moved"
            );
        }
        self.dt_release.release_at = release_at;

        if self.acvt.is_attached() {
            if waited {
                self.acvt.grow();
            }
            if let Some(ns) = self.acvt.adjust() {
                shared.acvt_ns = ns;
                if let Some(module) = self.acvt.module() {
                    inner.modules[module].slot.lock().driver.set_acvt(ns);
                }
            }
        }

        if !shared.reconfig.is_empty() {
            self.dt_release.inhibit_once();
        }

        if result.is_ok() {
            shared.state = CrateState::Ready;
        } else {
            shared.state = CrateState::Reinit;
            error!(crate_name = inner.name(), ?result, "readout_dt failed");
        }
        drop(shared);
        self.sync.clear();
        Ok(result)
    }

    /// Poll one module until it is ready, fails or the deadline passes.
    ///
    /// Returns whether the module is ready and the failures it reported.
    fn poll_module(
        &mut self,
        inner: &CrateInner,
        cell: &ModuleCell,
        shared: &mut MutexGuard<'_, Shared>,
        deadline: &SpinDeadline,
        shadow_active: bool,
        waited: &mut bool,
    ) -> (bool, ReadoutFail) {
        let mut suppress = SuppressGuard::new("readout_dt");
        loop {
            let poll = {
                let mut slot = cell.slot.lock();
                let ModuleSlot { core, driver, .. } = &mut *slot;
                let fail = self.transport.readout_dt(driver.as_mut(), core);
                core.result |= fail;
                if !fail.is_ok() {
                    error!(
                        crate_name = inner.name(),
                        module_id = core.id,
                        kind = %cell.kind,
                        ?fail,
                        "readout_dt failed"
                    );
                    Poll::Failed
                } else if self.free_running {
                    Poll::Ready
                } else {
                    let crate_counter = shared.counters[core.crate_counter].cur;
                    let lag = core.lag(crate_counter);
                    let shadow_lag = if shadow_active && cell.supports_shadow {
                        core.shadow_lag(crate_counter)
                    } else {
                        0
                    };
                    if lag == 0 && shadow_lag == 0 {
                        Poll::Ready
                    } else {
                        *waited = true;
                        if deadline.expired() || !self.transport.can_repoll() {
                            core.result |= ReadoutFail::EVENT_COUNTER_MISMATCH;
                            error!(
                                crate_name = inner.name(),
                                module_id = core.id,
                                kind = %cell.kind,
                                crate_counter = format_args!("0x{:08x}", crate_counter.value),
                                crate_bits = crate_counter.mask.count_ones(),
                                this_minus_crate = format_args!("0x{:08x}", core.this_minus_crate),
                                module_counter = format_args!("0x{:08x}", core.event_counter.value),
                                module_bits = core.event_counter.mask.count_ones(),
                                lag,
                                shadow_counter = format_args!("0x{:08x}", core.shadow_data_counter),
                                shadow_lag,
                                waited = ?deadline.elapsed(),
                                "Event counter mismatch"
                            );
                            Poll::Failed
                        } else {
                            Poll::Pending
                        }
                    }
                }
            };
            match poll {
                Poll::Ready => {
                    let slot = cell.slot.lock();
                    return (true, slot.core.result);
                }
                Poll::Failed => {
                    let slot = cell.slot.lock();
                    return (false, slot.core.result);
                }
                Poll::Pending => {
                    MutexGuard::unlocked(shared, || deadline.relax());
                    suppress.engage();
                }
            }
        }
    }
}
