//! Adaptive conversion timing.
//!
//! Additive-increase/additive-decrease controller for one timing parameter of
//! a designated module. Every deadtime-critical phase in which some module
//! had to be waited for asks the loop to grow; a long enough run of calm
//! phases lets it shrink again.

use tracing::debug;

use crate::config::TimingPolicy;

/// Controller state.
#[derive(Debug, Clone)]
pub struct AcvtLoop {
    module: Option<usize>,
    ns: u32,
    grow: bool,
    pioneer: u32,
    step_ns: u32,
    threshold: u32,
    max_ns: u32,
}

impl AcvtLoop {
    /// Controller without a target module.
    pub fn new(policy: &TimingPolicy) -> Self {
        Self {
            module: None,
            ns: 0,
            grow: false,
            pioneer: 0,
            step_ns: policy.acvt_step_ns,
            threshold: policy.acvt_threshold,
            max_ns: policy.acvt_max_ns,
        }
    }

    /// Attach to the module at list index `module`.
    pub fn attach(&mut self, module: usize) {
        self.module = Some(module);
    }

    /// Index of the controlled module.
    pub fn module(&self) -> Option<usize> {
        self.module
    }

    /// True if a module is attached.
    pub fn is_attached(&self) -> bool {
        self.module.is_some()
    }

    /// Current setting in ns.
    pub fn ns(&self) -> u32 {
        self.ns
    }

    /// Request an increase at the next adjustment.
    pub fn grow(&mut self) {
        self.grow = true;
    }

    /// Run one adjustment. Returns the new setting if it changed.
    pub fn adjust(&mut self) -> Option<u32> {
        let old = self.ns;
        if self.grow {
            self.pioneer = 0;
            self.ns = self.ns.saturating_add(self.step_ns).min(self.max_ns);
            self.grow = false;
        } else {
            self.pioneer += 1;
            if self.pioneer > self.threshold {
                self.pioneer = 0;
                self.ns = self.ns.saturating_sub(self.step_ns);
            }
        }
        if self.ns != old {
            debug!(old_ns = old, new_ns = self.ns, "Adaptive timing changed");
            Some(self.ns)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AcvtLoop {
        AcvtLoop::new(&TimingPolicy::default())
    }

    #[test]
    fn test_grows_by_step_per_request() {
        let mut acvt = controller();
        for n in 1..=5u32 {
            acvt.grow();
            assert_eq!(acvt.adjust(), Some(100 * n));
        }
        assert_eq!(acvt.ns(), 500);
    }

    #[test]
    fn test_shrinks_after_threshold_calm_phases() {
        let mut acvt = controller();
        acvt.grow();
        acvt.adjust();
        acvt.grow();
        acvt.adjust();
        assert_eq!(acvt.ns(), 200);

        for _ in 0..1000 {
            assert_eq!(acvt.adjust(), None);
        }
        assert_eq!(acvt.adjust(), Some(100));
        assert_eq!(acvt.ns(), 100);
    }

    #[test]
    fn test_floor_at_zero() {
        let mut acvt = controller();
        for _ in 0..5000 {
            acvt.adjust();
        }
        assert_eq!(acvt.ns(), 0);
    }

    #[test]
    fn test_ceiling() {
        let policy = TimingPolicy {
            acvt_max_ns: 250,
            ..TimingPolicy::default()
        };
        let mut acvt = AcvtLoop::new(&policy);
        for _ in 0..5 {
            acvt.grow();
            acvt.adjust();
        }
        assert_eq!(acvt.ns(), 250);
        acvt.grow();
        assert_eq!(acvt.adjust(), None);
    }

    #[test]
    fn test_grow_resets_calm_count() {
        let mut acvt = controller();
        acvt.grow();
        acvt.adjust();
        for _ in 0..900 {
            acvt.adjust();
        }
        acvt.grow();
        acvt.adjust();
        for _ in 0..900 {
            acvt.adjust();
        }
        assert_eq!(acvt.ns(), 200);
    }
}
