//! The crate: an ordered set of modules read out together.
//!
//! A [`ReadoutCrate`] is driven from a single trigger thread through three
//! calls per trigger:
//!
//! ```text
//!   trigger ──► readout_dt ──► readout ──► finalize ──► next trigger
//!               (deadtime      (bulk,      (latch counters,
//!                held, poll    release     reconfigure or
//!                counters)     deadtime)   recover)
//! ```
//!
//! # States
//!
//! ```text
//!            init ok                readout_dt ok
//!   REINIT ──────────► PREPARED ────────────────► READY
//!     ▲                    │                        │
//!     └────────────────────┴────── any failure ◄────┘
//! ```
//!
//! A failure anywhere sends the crate to REINIT; the next `readout_dt` or
//! `finalize` tears everything down, sleeps and initializes again. Fatal
//! misconfiguration surfaces as [`CrateError`] instead and is never retried.
//!
//! # Locking
//!
//! Mutable crate state lives behind one mutex (the crate mutex). Each module
//! sits in its own slot mutex and each shadow-capable module has a buffer
//! mutex. Locks are always taken in the order crate, slot, buffer. The
//! shadow drainer holds the crate mutex for a whole sweep; the trigger thread
//! holds it for the deadtime phase except while yielding between polls.
//!
//! # Example
//! ```no_run
//! use crate_readout::config::CrateSettings;
//! use crate_readout::event_buffer::EventBuffer;
//! use crate_readout::mock;
//! use crate_readout::module::DriverRegistry;
//! use crate_readout::readout_crate::ReadoutCrate;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut drivers = DriverRegistry::new();
//! mock::register(&mut drivers);
//! let settings = CrateSettings::from_toml_str("name = \"Main\"\n[[module]]\nkind = \"mock\"\n")?;
//! let mut crate_ = ReadoutCrate::create(&settings, &drivers)?;
//! crate_.init()?;
//!
//! let mut buf = vec![0u8; 4096];
//! crate_.tag_counter_increase(None, 1);
//! let result = crate_.readout_dt()?;
//! let mut eb = EventBuffer::new(&mut buf);
//! let result = result | crate_.readout(&mut eb);
//! crate_.finalize()?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

mod builder;
mod bulk;
mod deadtime;
mod lifecycle;
mod shadow_sweep;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::acvt::AcvtLoop;
use crate::config::{ConfigBlock, CrateSettings};
use crate::counter::{Counter, CrateCounter};
use crate::dt_release::{DeadtimeRelease, ReleaseFn};
use crate::error::{CrateError, CrateResult};
use crate::module::{IdRegistry, JointInit, Module, ModuleCore, ModuleFlags, SharedDevice};
use crate::shadow::{ShadowPair, ShadowTask};
use crate::tag::{Scaler, Tag};
use crate::transport::{marker, SequencerPhase, SequencerStep, Transport, DATA_MARKER, DT_MARKER};

/// Most values one trigger may push with [`ReadoutCrate::sync_push`].
pub const SYNC_MAX: usize = 10;

/// Crate lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CrateState {
    /// Needs (re)initialization before any readout.
    Reinit,
    /// Initialized, counters not yet validated.
    Prepared,
    /// Counters validated, the bulk phase may run.
    Ready,
}

impl fmt::Display for CrateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrateState::Reinit => "REINIT",
            CrateState::Prepared => "PREPARED",
            CrateState::Ready => "READY",
        };
        f.write_str(s)
    }
}

/// Callback run after a successful init or before a deinit.
pub type CrateCallback = Box<dyn FnMut(&str) + Send>;

/// Snapshot of crate-wide settings and readings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrateInfo {
    /// Configured per-tag event_max override, 0 if none.
    pub event_max_override: u32,
    /// Early deadtime release configured.
    pub deadtime_release: bool,
    /// Current adaptive timing in ns.
    pub acvt_ns: u32,
    /// Shadow arena size.
    pub shadow_bytes: usize,
    /// Largest shadow region merged into an event so far.
    pub shadow_max_bytes: usize,
}

/// Short description of one module, as printed by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    /// List index.
    pub index: usize,
    /// Module id.
    pub id: u32,
    /// Module type.
    pub kind: String,
    /// Event capacity.
    pub event_max: u32,
    /// True for barriers.
    pub barrier: bool,
}

// =============================================================================
// Internal layout
// =============================================================================

pub(crate) struct ModuleSlot {
    pub(crate) core: ModuleCore,
    pub(crate) driver: Box<dyn Module>,
    pub(crate) config: ConfigBlock,
}

/// A module and its shadow buffers. The list of cells never changes after
/// the crate is built.
pub(crate) struct ModuleCell {
    pub(crate) slot: Mutex<ModuleSlot>,
    pub(crate) shadow: Mutex<ShadowPair>,
    pub(crate) kind: String,
    pub(crate) is_barrier: bool,
    pub(crate) supports_shadow: bool,
    pub(crate) flags: ModuleFlags,
}

/// Everything guarded by the crate mutex.
pub(crate) struct Shared {
    pub(crate) state: CrateState,
    pub(crate) counters: Vec<CrateCounter>,
    pub(crate) tags: Vec<Tag>,
    pub(crate) shared_device: Option<Box<dyn SharedDevice>>,
    pub(crate) shared_device_config: ConfigBlock,
    pub(crate) ids: IdRegistry,
    pub(crate) reconfig: Vec<usize>,
    pub(crate) shadow_rebuild: bool,
    pub(crate) shadow_readable: usize,
    pub(crate) shadow_max_bytes: usize,
    pub(crate) acvt_ns: u32,
}

pub(crate) struct CrateInner {
    pub(crate) settings: CrateSettings,
    pub(crate) modules: Vec<ModuleCell>,
    pub(crate) scalers: Vec<Scaler>,
    pub(crate) joint: Vec<(String, JointInit)>,
    /// Module index and tag index of the event-limit delegation.
    pub(crate) event_limit: Option<(usize, usize)>,
    pub(crate) module_num: usize,
    pub(crate) shared: Mutex<Shared>,
}

impl CrateInner {
    pub(crate) fn name(&self) -> &str {
        &self.settings.name
    }

    pub(crate) fn do_shadow(&self) -> bool {
        self.settings.shadow_bytes > 0
    }
}

// =============================================================================
// ReadoutCrate
// =============================================================================

/// One crate of modules, owned by its trigger thread.
pub struct ReadoutCrate {
    inner: Arc<CrateInner>,
    dt_release: DeadtimeRelease,
    acvt: AcvtLoop,
    transport: Transport,
    free_running: bool,
    sync: Vec<i32>,
    shadow_task: Option<ShadowTask>,
    on_init: Option<CrateCallback>,
    on_deinit: Option<CrateCallback>,
}

impl ReadoutCrate {
    /// Crate name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CrateState {
        self.inner.shared.lock().state
    }

    /// Settings the crate was built from.
    pub fn settings(&self) -> &CrateSettings {
        &self.inner.settings
    }

    /// Number of modules, barriers excluded.
    pub fn module_count(&self) -> usize {
        self.inner.module_num
    }

    /// Number of list entries, barriers included.
    pub fn module_list_len(&self) -> usize {
        self.inner.modules.len()
    }

    /// Type of the module at list index `index`.
    pub fn module_kind(&self, index: usize) -> Option<&str> {
        self.inner.modules.get(index).map(|cell| cell.kind.as_str())
    }

    /// List index of the `nth` module of type `kind`.
    pub fn module_find(&self, kind: &str, nth: usize) -> Option<usize> {
        self.inner
            .modules
            .iter()
            .enumerate()
            .filter(|(_, cell)| !cell.is_barrier && cell.kind == kind)
            .nth(nth)
            .map(|(index, _)| index)
    }

    /// Run `f` with exclusive access to the module at `index`.
    pub fn with_module<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut ModuleCore, &mut dyn Module) -> R,
    ) -> Option<R> {
        self.handle().module_access(index, f)
    }

    /// Summaries of all list entries.
    pub fn modules(&self) -> Vec<ModuleSummary> {
        self.handle().modules()
    }

    /// True if shadow readout is configured.
    pub fn do_shadow(&self) -> bool {
        self.inner.do_shadow()
    }

    /// True if a module takes the adaptive timing.
    pub fn acvt_has(&self) -> bool {
        self.acvt.is_attached()
    }

    /// Current adaptive timing in ns.
    pub fn acvt_ns(&self) -> u32 {
        self.acvt.ns()
    }

    /// Snapshot of crate-wide settings and readings.
    pub fn info(&self) -> CrateInfo {
        self.handle().info()
    }

    /// Shared handle for the registry.
    pub fn handle(&self) -> CrateHandle {
        CrateHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    // -------------------------------------------------------------------------
    // Tags and counters
    // -------------------------------------------------------------------------

    /// Copy of tag `name`, or of the default tag for `None`.
    pub fn get_tag_by_name(&self, name: Option<&str>) -> Option<Tag> {
        let shared = self.inner.shared.lock();
        match name {
            None => shared.tags.first().cloned(),
            Some(name) => shared.tags.iter().find(|tag| tag.name == name).cloned(),
        }
    }

    /// Names of all tags, default first.
    pub fn tag_names(&self) -> Vec<String> {
        let shared = self.inner.shared.lock();
        shared.tags.iter().map(|tag| tag.name.clone()).collect()
    }

    /// Advance every counter of tag `name` (default tag for `None`) by `inc`.
    ///
    /// Returns false if the tag does not exist.
    pub fn tag_counter_increase(&self, name: Option<&str>, inc: u32) -> bool {
        let mut guard = self.inner.shared.lock();
        let shared = &mut *guard;
        let tag = match name {
            None => shared.tags.first(),
            Some(name) => shared.tags.iter().find(|tag| tag.name == name),
        };
        let Some(tag) = tag else {
            return false;
        };
        if inc != 0 && tag.needs_shared_device {
            if let Some(device) = shared.shared_device.as_mut() {
                device.readout_prepare();
            }
        }
        for &index in &tag.counters {
            let counter = &mut shared.counters[index];
            counter.cur.value = counter.cur.value.wrapping_add(inc);
        }
        true
    }

    /// Masked `cur - prev` of counter `name`.
    pub fn counter_get_diff(&self, name: &str) -> Option<u32> {
        let shared = self.inner.shared.lock();
        shared
            .counters
            .iter()
            .find(|counter| counter.name == name)
            .map(CrateCounter::diff)
    }

    /// Names of all crate counters.
    pub fn counter_names(&self) -> Vec<String> {
        let shared = self.inner.shared.lock();
        shared.counters.iter().map(|counter| counter.name.clone()).collect()
    }

    /// Advance the single counter `name` by `inc`. Returns false if unknown.
    pub fn counter_increase(&self, name: &str, inc: u32) -> bool {
        let mut shared = self.inner.shared.lock();
        match shared.counters.iter_mut().find(|counter| counter.name == name) {
            Some(counter) => {
                counter.cur.value = counter.cur.value.wrapping_add(inc);
                true
            }
            None => false,
        }
    }

    /// Current value of counter `name`.
    pub fn counter_get(&self, name: &str) -> Option<Counter> {
        let shared = self.inner.shared.lock();
        shared
            .counters
            .iter()
            .find(|counter| counter.name == name)
            .map(|counter| counter.cur)
    }

    // -------------------------------------------------------------------------
    // Sync values
    // -------------------------------------------------------------------------

    /// Remember a value for the current trigger.
    pub fn sync_push(&mut self, value: i32) -> CrateResult<()> {
        if self.sync.len() >= SYNC_MAX {
            return Err(CrateError::SyncOverflow(self.sync.len() + 1));
        }
        self.sync.push(value);
        Ok(())
    }

    /// Value `i` pushed during the current trigger.
    pub fn sync_get(&self, i: usize) -> Option<i32> {
        self.sync.get(i).copied()
    }

    // -------------------------------------------------------------------------
    // Deadtime, free running, callbacks
    // -------------------------------------------------------------------------

    /// Bind the callback that hands deadtime back to the DAQ backend.
    pub fn set_deadtime_release(&mut self, func: ReleaseFn) {
        self.dt_release.bind(func);
    }

    /// True while deadtime is held.
    pub fn dt_is_on(&self) -> bool {
        self.dt_release.is_on()
    }

    /// Keep deadtime held through the next release point.
    pub fn inhibit_once(&mut self) {
        self.dt_release.inhibit_once();
    }

    /// True if counter checks are skipped.
    pub fn free_running(&self) -> bool {
        self.free_running
    }

    /// Switch free running on or off.
    pub fn set_free_running(&mut self, on: bool) {
        if self.free_running != on {
            info!(crate_name = self.name(), free_running = on, "Free running changed");
        }
        self.free_running = on;
    }

    /// Run `callback` after every successful init.
    pub fn set_init_callback(&mut self, callback: CrateCallback) {
        self.on_init = Some(callback);
    }

    /// Run `callback` before every deinit.
    pub fn set_deinit_callback(&mut self, callback: CrateCallback) {
        self.on_deinit = Some(callback);
    }

    // -------------------------------------------------------------------------
    // Misc
    // -------------------------------------------------------------------------

    /// Exercise the memory of every module supporting it.
    pub fn memtest(&self, chunks: u32) {
        let _shared = self.inner.shared.lock();
        for cell in &self.inner.modules {
            let mut slot = cell.slot.lock();
            let ModuleSlot { core, driver, .. } = &mut *slot;
            debug!(module_id = core.id, kind = %cell.kind, chunks, "memtest");
            driver.memtest(core, chunks);
        }
    }

    /// Merge `snippet` into the config of module `index` and queue it for
    /// reconfiguration at the next finalize.
    pub fn config_write(&self, index: usize, snippet: &toml::Table) -> bool {
        self.handle().config_write(index, snippet)
    }

    /// Sequencer program for one phase: each visited module's words followed
    /// by the marker the controller must emit.
    pub fn sequencer_program(&self, phase: SequencerPhase) -> Vec<SequencerStep> {
        let mut steps = Vec::new();
        for (index, cell) in self.inner.modules.iter().enumerate() {
            let slot = cell.slot.lock();
            let core = &slot.core;
            let (visit, base) = match phase {
                SequencerPhase::Deadtime => (core.event_max != 0 && !core.skip_dt, DT_MARKER),
                SequencerPhase::Data => (!cell.is_barrier && core.event_max != 0, DATA_MARKER),
            };
            if !visit {
                continue;
            }
            let deadtime = phase == SequencerPhase::Deadtime;
            steps.push(SequencerStep {
                module: index,
                words: slot.driver.sequencer_program(core, deadtime),
                marker: marker(base, core.id),
            });
        }
        steps
    }

    /// Hand the crate the sequencer words fetched for `phase`.
    pub fn stage_sequencer(&mut self, phase: SequencerPhase, words: &[u32]) {
        self.transport.stage(phase, words);
    }

    /// Sequencer words of `phase` consumed since staging.
    pub fn sequencer_consumed(&self, phase: SequencerPhase) -> usize {
        self.transport.consumed(phase)
    }
}

impl fmt::Debug for ReadoutCrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadoutCrate")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("modules", &self.inner.module_num)
            .field("transport", &self.transport.kind())
            .field("dt_release", &self.dt_release)
            .finish()
    }
}

impl Drop for ReadoutCrate {
    fn drop(&mut self) {
        self.deinit();
    }
}

// =============================================================================
// CrateHandle
// =============================================================================

/// Shared view of a crate for control paths outside the trigger thread.
#[derive(Clone)]
pub struct CrateHandle {
    inner: Arc<CrateInner>,
}

impl CrateHandle {
    /// Crate name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CrateState {
        self.inner.shared.lock().state
    }

    /// Number of list entries, barriers included.
    pub fn module_list_len(&self) -> usize {
        self.inner.modules.len()
    }

    /// Snapshot of crate-wide settings and readings.
    pub fn info(&self) -> CrateInfo {
        let shared = self.inner.shared.lock();
        CrateInfo {
            event_max_override: self.inner.settings.event_max_override,
            deadtime_release: self.inner.settings.deadtime_release,
            acvt_ns: shared.acvt_ns,
            shadow_bytes: self.inner.settings.shadow_bytes,
            shadow_max_bytes: shared.shadow_max_bytes,
        }
    }

    /// Summaries of all list entries.
    pub fn modules(&self) -> Vec<ModuleSummary> {
        self.inner
            .modules
            .iter()
            .enumerate()
            .map(|(index, cell)| {
                let slot = cell.slot.lock();
                ModuleSummary {
                    index,
                    id: slot.core.id,
                    kind: cell.kind.clone(),
                    event_max: slot.core.event_max,
                    barrier: cell.is_barrier,
                }
            })
            .collect()
    }

    /// Run `f` with the module at `index` under the crate mutex.
    pub fn module_access<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut ModuleCore, &mut dyn Module) -> R,
    ) -> Option<R> {
        let cell = self.inner.modules.get(index)?;
        let _shared = self.inner.shared.lock();
        let mut slot = cell.slot.lock();
        let ModuleSlot { core, driver, .. } = &mut *slot;
        Some(f(core, driver.as_mut()))
    }

    /// Merge `snippet` into the config of module `index` and queue it for
    /// reconfiguration. Returns false for an unknown index or a barrier.
    pub fn config_write(&self, index: usize, snippet: &toml::Table) -> bool {
        let Some(cell) = self.inner.modules.get(index) else {
            return false;
        };
        if cell.is_barrier {
            return false;
        }
        let mut shared = self.inner.shared.lock();
        cell.slot.lock().config.merge(snippet);
        if !shared.reconfig.contains(&index) {
            shared.reconfig.push(index);
        }
        debug!(
            crate_name = self.name(),
            module = index,
            keys = ?snippet.keys().collect::<Vec<_>>(),
            "Module config written, reconfiguration queued"
        );
        true
    }

    /// Modules queued for reconfiguration.
    pub fn pending_reconfig(&self) -> Vec<usize> {
        self.inner.shared.lock().reconfig.clone()
    }
}

impl fmt::Debug for CrateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrateHandle").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use crate::module::DriverRegistry;

    fn build(toml: &str) -> ReadoutCrate {
        let mut drivers = DriverRegistry::new();
        mock::register(&mut drivers);
        let settings = CrateSettings::from_toml_str(toml).unwrap();
        ReadoutCrate::create(&settings, &drivers).unwrap()
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CrateState::Reinit.to_string(), "REINIT");
        assert_eq!(CrateState::Ready.to_string(), "READY");
    }

    #[test]
    fn test_sync_stack_overflows_at_eleven() {
        let mut crate_ = build("name = \"Sync\"\n");
        for i in 0..SYNC_MAX {
            crate_.sync_push(i as i32).unwrap();
        }
        assert_eq!(crate_.sync_get(3), Some(3));
        assert!(matches!(crate_.sync_push(99), Err(CrateError::SyncOverflow(11))));
        assert_eq!(crate_.sync_get(SYNC_MAX), None);
    }

    #[test]
    fn test_tag_counter_increase_and_diff() {
        let crate_ = build("name = \"Ctr\"\n");
        assert!(crate_.tag_counter_increase(None, 3));
        assert!(!crate_.tag_counter_increase(Some("Nope"), 1));
        assert_eq!(crate_.counter_get_diff("auto:Default"), Some(3));
        assert_eq!(crate_.counter_get_diff("missing"), None);
    }

    #[test]
    fn test_module_find_skips_barriers() {
        let crate_ = build(
            "[[module]]\nkind = \"mock\"\n[[module]]\nkind = \"barrier\"\n[[module]]\nkind = \"mock\"\n",
        );
        assert_eq!(crate_.module_list_len(), 3);
        assert_eq!(crate_.module_count(), 2);
        assert_eq!(crate_.module_find("mock", 0), Some(0));
        assert_eq!(crate_.module_find("mock", 1), Some(2));
        assert_eq!(crate_.module_find("mock", 2), None);
        assert_eq!(crate_.module_kind(1), Some("barrier"));
    }

    #[test]
    fn test_config_write_queues_once() {
        let crate_ = build("[[module]]\nkind = \"mock\"\n");
        let snippet: toml::Table = "event_max = 4".parse().unwrap();
        assert!(crate_.config_write(0, &snippet));
        assert!(crate_.config_write(0, &snippet));
        assert!(!crate_.config_write(5, &snippet));
        assert_eq!(crate_.handle().pending_reconfig(), vec![0]);
    }

    #[test]
    fn test_sequencer_program_markers() {
        let crate_ = build(
            "transport = \"sequencer\"\n[[module]]\nkind = \"mock\"\n[[module]]\nkind = \"mock\"\nevent_max = 0\n",
        );
        let dt = crate_.sequencer_program(SequencerPhase::Deadtime);
        assert_eq!(dt.len(), 1);
        assert_eq!(dt[0].marker, marker(DT_MARKER, 0));
        let data = crate_.sequencer_program(SequencerPhase::Data);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].marker, marker(DATA_MARKER, 0));
    }
}
