//! The module contract.
//!
//! A module is one hardware data source in the crate: an ADC, a TDC, a
//! scaler, a trigger logic unit. Vendor drivers implement [`Module`]; the crate
//! owns every module exclusively and calls into it from the init pipeline, the
//! deadtime-critical phase, the bulk phase and, for shadow-capable modules,
//! the background drainer.
//!
//! # Architecture
//!
//! The crate keeps a [`ModuleCore`] next to every driver. The core holds what
//! the orchestration needs to know about a module regardless of type: its id,
//! its masked event counter, how many events it may buffer, and the offset
//! between its counter and the crate counter it is bound to. Drivers update
//! the public fields (mostly `event_counter`), the crate owns the rest.
//!
//! Optional capabilities have no-op default implementations. A driver only
//! overrides what its hardware supports.
//!
//! Drivers are constructed by factories registered in a [`DriverRegistry`].

pub mod barrier;
pub mod id_registry;
pub mod registry;
pub mod signature;

use std::any::Any;

use bitflags::bitflags;

use crate::config::ConfigBlock;
use crate::counter::Counter;
use crate::error::{CrateError, ReadoutFail};
use crate::event_buffer::EventBuffer;

pub use barrier::{Barrier, BARRIER_WORD};
pub use id_registry::IdRegistry;
pub use registry::{
    BuildContext, DriverRegistry, JointInit, JointMember, ModuleFactory, SharedDevice,
    SharedDeviceFactory,
};
pub use signature::{signatures_overlap, ModuleSignature};

bitflags! {
    /// Static module properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModuleFlags: u32 {
        /// The module latches its data on the trigger, so deadtime may be
        /// released before it is read out.
        const EARLY_DT = 1 << 0;
    }
}

/// Per-module bookkeeping shared between the crate and the driver.
#[derive(Debug, Clone)]
pub struct ModuleCore {
    /// Module id, unique within the crate.
    pub id: u32,
    /// Type tag the module was created from.
    pub kind: String,
    /// Hardware event counter, updated by the driver.
    pub event_counter: Counter,
    /// Events the module can buffer, 0 if it produces no event data.
    pub event_max: u32,
    /// Exclude from the deadtime-critical counter check.
    pub skip_dt: bool,
    /// Event counter value covered by data in the shadow buffer, updated by
    /// the driver in `readout_shadow`.
    pub shadow_data_counter: u32,
    pub(crate) crate_counter: usize,
    pub(crate) crate_counter_prev: u32,
    pub(crate) this_minus_crate: u32,
    pub(crate) result: ReadoutFail,
}

impl ModuleCore {
    /// Fresh core with a full-width counter.
    pub fn new(id: u32, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            event_counter: Counter::new(),
            event_max: 0,
            skip_dt: false,
            shadow_data_counter: 0,
            crate_counter: 0,
            crate_counter_prev: 0,
            this_minus_crate: 0,
            result: ReadoutFail::empty(),
        }
    }

    /// Offset between the module counter and its crate counter.
    pub fn this_minus_crate(&self) -> u32 {
        self.this_minus_crate
    }

    /// Failures accumulated since the last init.
    pub fn result(&self) -> ReadoutFail {
        self.result
    }

    /// Remember the current offset to `crate_counter`.
    pub(crate) fn latch(&mut self, crate_counter: Counter) {
        self.this_minus_crate = self.event_counter.value.wrapping_sub(crate_counter.value);
        self.shadow_data_counter = self.event_counter.value;
    }

    /// Events the module still lags behind the crate.
    pub(crate) fn lag(&self, crate_counter: Counter) -> u32 {
        Counter::diff(crate_counter, self.event_counter, self.this_minus_crate)
    }

    /// Events the shadow buffer still lags behind the crate.
    pub(crate) fn shadow_lag(&self, crate_counter: Counter) -> u32 {
        let shadow = Counter {
            value: self.shadow_data_counter,
            mask: self.event_counter.mask,
        };
        Counter::diff(crate_counter, shadow, self.this_minus_crate)
    }
}

/// Context handed to the init hooks.
pub struct InitContext<'a> {
    /// The module's core.
    pub core: &'a mut ModuleCore,
    /// The module's config items.
    pub config: &'a ConfigBlock,
    init_id: &'a mut u32,
    fatal: Option<CrateError>,
    free_running: bool,
    shadow_active: bool,
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(
        core: &'a mut ModuleCore,
        config: &'a ConfigBlock,
        init_id: &'a mut u32,
        free_running: bool,
        shadow_active: bool,
    ) -> Self {
        Self {
            core,
            config,
            init_id,
            fatal: None,
            free_running,
            shadow_active,
        }
    }

    /// True if the crate runs without a trigger.
    pub fn free_running(&self) -> bool {
        self.free_running
    }

    /// True if the crate drains shadow-capable modules in the background.
    pub fn shadow_active(&self) -> bool {
        self.shadow_active
    }

    /// Replace the id this module is registered under for the current init
    /// round, typically with an address reported by the hardware.
    ///
    /// `from` must be the id currently being initialized.
    pub fn remap_id(&mut self, from: u32, to: u32) -> Result<(), CrateError> {
        if from != *self.init_id {
            let current = *self.init_id;
            self.fatal = Some(CrateError::RemapMismatch { from, current });
            return Err(CrateError::RemapMismatch { from, current });
        }
        *self.init_id = to;
        Ok(())
    }

    pub(crate) fn take_fatal(&mut self) -> Option<CrateError> {
        self.fatal.take()
    }
}

/// A hardware module driver.
pub trait Module: Send {
    /// Static properties.
    fn flags(&self) -> ModuleFlags {
        ModuleFlags::empty()
    }

    /// Bit patterns that identify this module's data words.
    fn signature(&self) -> &[ModuleSignature] {
        &[]
    }

    /// Long-lived setup, e.g. mapping and resetting the hardware.
    fn init_slow(&mut self, ctx: &mut InitContext<'_>) -> anyhow::Result<()>;

    /// Settings that may change online, rerun on reconfiguration.
    fn init_fast(&mut self, ctx: &mut InitContext<'_>) -> anyhow::Result<()>;

    /// Runs after all modules are fast-initialized and the settle time passed.
    fn post_init(&mut self, _ctx: &mut InitContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Update `core.event_counter` from the hardware. Deadtime is held.
    fn readout_dt(&mut self, core: &mut ModuleCore) -> ReadoutFail;

    /// Move event data into `eb`.
    fn readout(&mut self, core: &mut ModuleCore, eb: &mut EventBuffer<'_>) -> ReadoutFail;

    /// True if the module can be drained by the background shadow task.
    fn supports_shadow(&self) -> bool {
        false
    }

    /// Drain whatever the module has into `eb`, outside the trigger path.
    ///
    /// Must update `core.shadow_data_counter` to the event count covered.
    fn readout_shadow(&mut self, _core: &mut ModuleCore, _eb: &mut EventBuffer<'_>) -> ReadoutFail {
        ReadoutFail::empty()
    }

    /// Validate event data produced by this module.
    fn parse_data(&mut self, core: &ModuleCore, data: &[u8], do_pedestals: bool) -> ReadoutFail;

    /// Report leftover data after a readout.
    fn check_empty(&mut self, _core: &ModuleCore) -> ReadoutFail {
        ReadoutFail::empty()
    }

    /// Undo the init hooks. Must tolerate being called when not initialized.
    fn deinit(&mut self, _core: &mut ModuleCore) {}

    /// Exercise on-board memory.
    fn memtest(&mut self, _core: &ModuleCore, _chunks: u32) {}

    /// Apply a new adaptive conversion timing, in ns.
    fn set_acvt(&mut self, _ns: u32) {}

    /// Read scaler `channel` declared through [`BuildContext::add_scaler`].
    fn read_scaler(&mut self, _core: &ModuleCore, _channel: usize) -> Result<u32, ReadoutFail> {
        Err(ReadoutFail::GENERAL)
    }

    /// Told the final event_max of the tag requested through
    /// [`BuildContext::request_event_limit`].
    fn set_event_limit(&mut self, _event_max: u32) {}

    /// Words this module contributes to a sequencer program.
    fn sequencer_program(&self, _core: &ModuleCore, _deadtime: bool) -> Vec<u32> {
        Vec::new()
    }

    /// Consume this module's deadtime segment of a sequencer stream, returning
    /// the words used.
    fn sequencer_readout_dt(&mut self, _core: &mut ModuleCore, _words: &[u32]) -> Result<usize, ReadoutFail> {
        Err(ReadoutFail::ERROR_DRIVER)
    }

    /// Consume this module's data segment of a sequencer stream into `eb`,
    /// returning the words used.
    fn sequencer_readout(
        &mut self,
        _core: &mut ModuleCore,
        _eb: &mut EventBuffer<'_>,
        _words: &[u32],
    ) -> Result<usize, ReadoutFail> {
        Err(ReadoutFail::ERROR_DRIVER)
    }

    /// Downcast support for typed access through the registry.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
