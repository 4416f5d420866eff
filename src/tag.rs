//! Tags and scalers.
//!
//! A tag is a named subset of the crate's modules read out under one trigger
//! type, together with the counters that count those triggers. Tags are built
//! once from configuration; every crate has the tag "Default".

/// Name of the tag every crate starts with.
pub const DEFAULT_TAG: &str = "Default";

/// Initial value when taking the minimum of module capacities.
pub const EVENT_MAX_UNBOUNDED: u32 = 1_000_000_000;

/// Named readout group.
#[derive(Debug, Clone)]
pub struct Tag {
    /// Tag name.
    pub name: String,
    /// Member module indices in crate order, barriers included.
    pub(crate) modules: Vec<usize>,
    /// Counter indices.
    pub(crate) counters: Vec<usize>,
    /// Events that may be accepted before a readout, computed at init.
    pub event_max: u32,
    /// Some member depends on the shared prerequisite device.
    pub needs_shared_device: bool,
    /// Non-barrier members.
    pub module_num: usize,
}

impl Tag {
    /// Empty tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modules: Vec::new(),
            counters: Vec::new(),
            event_max: 0,
            needs_shared_device: false,
            module_num: 0,
        }
    }

    /// Member module indices.
    pub fn modules(&self) -> &[usize] {
        &self.modules
    }

    /// Counter indices.
    pub fn counters(&self) -> &[usize] {
        &self.counters
    }

    /// Bind counter `index` unless already bound.
    pub(crate) fn add_counter(&mut self, index: usize) {
        if !self.counters.contains(&index) {
            self.counters.push(index);
        }
    }
}

/// Named hardware counter provided by a module.
#[derive(Debug, Clone)]
pub struct Scaler {
    /// Scaler name, referenced by tag entries.
    pub name: String,
    /// Providing module index.
    pub module: usize,
    /// Channel passed to the module's `read_scaler`.
    pub channel: usize,
}

/// Compute a tag's event_max from its members' capacities.
///
/// Members with a capacity of 0 produce no data and do not limit the tag.
/// An override replaces the result when shadow readout buffers the excess or
/// when it does not exceed what the modules can hold; otherwise the
/// requested override is returned as the error.
pub fn tag_event_max(
    capacities: impl IntoIterator<Item = u32>,
    override_max: u32,
    shadow_active: bool,
) -> Result<u32, (u32, u32)> {
    let capacity = capacities
        .into_iter()
        .filter(|&m| m > 0)
        .fold(EVENT_MAX_UNBOUNDED, u32::min);
    if override_max == 0 {
        return Ok(capacity);
    }
    if shadow_active || override_max <= capacity {
        Ok(override_max)
    } else {
        Err((override_max, capacity))
    }
}
