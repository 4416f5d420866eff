//! Deadtime release protocol.
//!
//! The DAQ backend holds deadtime while an event is read out. Modules that
//! latch their data on the trigger ([`ModuleFlags::EARLY_DT`]) do not need
//! that protection, so once every other module before them has been read the
//! crate may hand deadtime back early through a bound callback.
//!
//! A pending module reconfiguration arms a one-shot inhibit so no new trigger
//! is accepted while a register write is outstanding.
//!
//! [`ModuleFlags::EARLY_DT`]: crate::module::ModuleFlags::EARLY_DT

use tracing::trace;

/// Callback releasing deadtime in the DAQ backend.
pub type ReleaseFn = Box<dyn FnMut() + Send>;

/// Early deadtime release state.
pub struct DeadtimeRelease {
    enabled: bool,
    inhibit_once: bool,
    is_on: bool,
    func: Option<ReleaseFn>,
    /// Module index before which the release happens in the bulk phase.
    pub(crate) release_at: usize,
}

impl DeadtimeRelease {
    /// Release state, early release allowed if `enabled`.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inhibit_once: false,
            is_on: true,
            func: None,
            release_at: 0,
        }
    }

    /// True if early release is configured.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Bind the backend callback.
    pub fn bind(&mut self, func: ReleaseFn) {
        self.func = Some(func);
    }

    /// Block the next release.
    pub fn inhibit_once(&mut self) {
        self.inhibit_once = true;
    }

    /// True while deadtime is held.
    pub fn is_on(&self) -> bool {
        self.is_on
    }

    /// Release deadtime if allowed, otherwise keep holding it and consume the
    /// one-shot inhibit.
    pub fn release(&mut self) {
        match self.func.as_mut() {
            Some(func) if self.enabled && !self.inhibit_once => {
                trace!("Releasing deadtime early");
                func();
                self.is_on = false;
            }
            _ => {
                self.is_on = true;
                self.inhibit_once = false;
            }
        }
    }
}

impl std::fmt::Debug for DeadtimeRelease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadtimeRelease")
            .field("enabled", &self.enabled)
            .field("inhibit_once", &self.inhibit_once)
            .field("is_on", &self.is_on)
            .field("bound", &self.func.is_some())
            .field("release_at", &self.release_at)
            .finish()
    }
}
