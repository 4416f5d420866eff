//! Process-wide list of crates for control paths.
//!
//! The trigger thread owns each [`ReadoutCrate`]; the registry keeps
//! [`CrateHandle`]s so that control code (a slow-control server, the CLI) can
//! inspect crates and write module configuration without touching the
//! trigger path.

use serde::Serialize;

use crate::readout_crate::{CrateHandle, CrateInfo, CrateState, ModuleSummary, ReadoutCrate};
use crate::module::{Module, ModuleCore};

/// Description of one crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrateDescription {
    /// Crate name.
    pub name: String,
    /// Lifecycle state.
    pub state: CrateState,
    /// All list entries.
    pub modules: Vec<ModuleSummary>,
}

/// Handles of every crate in the process, in the order added.
#[derive(Debug, Default, Clone)]
pub struct CrateRegistry {
    crates: Vec<CrateHandle>,
}

impl CrateRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `crate_` and return its index.
    pub fn add(&mut self, crate_: &ReadoutCrate) -> usize {
        self.crates.push(crate_.handle());
        self.crates.len() - 1
    }

    /// Number of crates.
    pub fn len(&self) -> usize {
        self.crates.len()
    }

    /// True if no crate was added.
    pub fn is_empty(&self) -> bool {
        self.crates.is_empty()
    }

    /// Handle of crate `i`.
    pub fn get(&self, i: usize) -> Option<&CrateHandle> {
        self.crates.get(i)
    }

    /// Handle of the crate named `name`.
    pub fn find(&self, name: &str) -> Option<&CrateHandle> {
        self.crates.iter().find(|handle| handle.name() == name)
    }

    /// Describe every crate.
    pub fn describe(&self) -> Vec<CrateDescription> {
        self.crates
            .iter()
            .map(|handle| CrateDescription {
                name: handle.name().to_string(),
                state: handle.state(),
                modules: handle.modules(),
            })
            .collect()
    }

    /// Settings and readings of crate `i`.
    pub fn info(&self, i: usize) -> Option<CrateInfo> {
        self.crates.get(i).map(CrateHandle::info)
    }

    /// Write config items to module `j` of crate `i`. The module is
    /// reconfigured at the crate's next finalize with deadtime held.
    pub fn config_write(&self, i: usize, j: usize, snippet: &toml::Table) -> bool {
        self.crates
            .get(i)
            .map_or(false, |handle| handle.config_write(j, snippet))
    }

    /// Run `f` on module `j` of crate `i` under the crate mutex.
    pub fn module_access<R>(
        &self,
        i: usize,
        j: usize,
        f: impl FnOnce(&mut ModuleCore, &mut dyn Module) -> R,
    ) -> Option<R> {
        self.crates.get(i)?.module_access(j, f)
    }
}
