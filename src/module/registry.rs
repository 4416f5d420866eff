//! Driver registry for building modules from configuration.
//!
//! The application registers one factory per module type before building
//! crates. A crate entry `kind = "v785"` looks up the factory named `v785`,
//! hands it the entry's [`ConfigBlock`] and gets back a boxed [`Module`].
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                DriverRegistry                │
//! │  factories:  "mock" -> fn  "scaler" -> fn    │
//! │  joint init: "mock" -> fn                    │
//! │  shared:     "pex"  -> fn                    │
//! └──────────────────────────────────────────────┘
//!                       │ create
//!                       ▼
//!          ReadoutCrate { modules, tags, ... }
//! ```
//!
//! Besides module factories the registry holds joint-init passes (run over
//! all modules of one type after they were fast-initialized individually)
//! and factories for the optional shared prerequisite device.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Module, ModuleCore};
use crate::config::ConfigBlock;

// =============================================================================
// Build-time context
// =============================================================================

/// What a factory may declare while its module is created.
pub struct BuildContext<'a> {
    /// The core of the module being built.
    pub core: &'a mut ModuleCore,
    /// The entry's config items.
    pub config: &'a ConfigBlock,
    pub(crate) scalers: Vec<String>,
    pub(crate) acvt: bool,
    pub(crate) needs_shared_device: bool,
    pub(crate) event_limit_tag: Option<String>,
}

impl<'a> BuildContext<'a> {
    pub(crate) fn new(core: &'a mut ModuleCore, config: &'a ConfigBlock) -> Self {
        Self {
            core,
            config,
            scalers: Vec::new(),
            acvt: false,
            needs_shared_device: false,
            event_limit_tag: None,
        }
    }

    /// Publish a scaler under `name`. The channel index is the number of
    /// scalers added before it, as passed to [`Module::read_scaler`].
    pub fn add_scaler(&mut self, name: impl Into<String>) -> usize {
        self.scalers.push(name.into());
        self.scalers.len() - 1
    }

    /// Offer this module as the adaptive conversion timing target.
    pub fn provide_acvt(&mut self) {
        self.acvt = true;
    }

    /// Declare that this module depends on the shared prerequisite device.
    pub fn require_shared_device(&mut self) {
        self.needs_shared_device = true;
    }

    /// Ask to be told the final event_max of tag `name` after every init.
    pub fn request_event_limit(&mut self, name: impl Into<String>) {
        self.event_limit_tag = Some(name.into());
    }
}

// =============================================================================
// Shared prerequisite device
// =============================================================================

/// A device every module of some tags depends on, e.g. a bus controller.
pub trait SharedDevice: Send {
    /// Bring the device up before any module is initialized.
    fn init(&mut self, config: &ConfigBlock) -> anyhow::Result<()>;

    /// Reset after all modules are initialized.
    fn reset(&mut self) {}

    /// Called before counters of a dependent tag are advanced.
    fn readout_prepare(&mut self) {}

    /// Shut the device down.
    fn deinit(&mut self) {}
}

// =============================================================================
// Registry
// =============================================================================

/// Creates a module from its config block.
pub type ModuleFactory =
    Arc<dyn Fn(&mut BuildContext<'_>) -> anyhow::Result<Box<dyn Module>> + Send + Sync>;

/// Creates the shared prerequisite device.
pub type SharedDeviceFactory =
    Arc<dyn Fn(&ConfigBlock) -> anyhow::Result<Box<dyn SharedDevice>> + Send + Sync>;

/// A module in a joint-init pass.
pub struct JointMember<'a> {
    /// The module's core.
    pub core: &'a mut ModuleCore,
    /// The driver.
    pub module: &'a mut dyn Module,
}

/// Cross-module pass over all modules of one type, in crate order.
pub type JointInit = Arc<dyn Fn(&mut [JointMember<'_>]) -> anyhow::Result<()> + Send + Sync>;

/// Named factories for module types.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    factories: HashMap<String, ModuleFactory>,
    joint: HashMap<String, JointInit>,
    shared: HashMap<String, SharedDeviceFactory>,
}

impl DriverRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for entries of `kind`, replacing any earlier one.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&mut BuildContext<'_>) -> anyhow::Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    /// Register a joint pass for all modules of `kind`.
    pub fn register_joint_init<F>(&mut self, kind: impl Into<String>, pass: F) -> &mut Self
    where
        F: Fn(&mut [JointMember<'_>]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.joint.insert(kind.into(), Arc::new(pass));
        self
    }

    /// Register a shared prerequisite device type.
    pub fn register_shared_device<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ConfigBlock) -> anyhow::Result<Box<dyn SharedDevice>> + Send + Sync + 'static,
    {
        self.shared.insert(kind.into(), Arc::new(factory));
        self
    }

    /// Factory for `kind`.
    pub fn factory(&self, kind: &str) -> Option<&ModuleFactory> {
        self.factories.get(kind)
    }

    /// Joint pass for `kind`.
    pub fn joint_init(&self, kind: &str) -> Option<&JointInit> {
        self.joint.get(kind)
    }

    /// Shared device factory for `kind`.
    pub fn shared_device(&self, kind: &str) -> Option<&SharedDeviceFactory> {
        self.shared.get(kind)
    }

    /// Registered module type names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .field("joint", &self.joint.keys().collect::<Vec<_>>())
            .field("shared", &self.shared.keys().collect::<Vec<_>>())
            .finish()
    }
}
