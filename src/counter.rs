//! Masked, wraparound-safe event counter arithmetic.
//!
//! Hardware event counters have differing widths (16, 24, 32 bits ...). Every
//! comparison is therefore done modulo 2^32 and then restricted to the bits
//! both sides implement.

/// A hardware event counter value together with its implemented bit mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter {
    /// Current counter value.
    pub value: u32,
    /// Implemented bits.
    pub mask: u32,
}

impl Counter {
    /// Full 32-bit counter at zero.
    pub const fn new() -> Self {
        Self {
            value: 0,
            mask: u32::MAX,
        }
    }

    /// Counter at zero with the given implemented bit mask.
    pub const fn with_mask(mask: u32) -> Self {
        Self { value: 0, mask }
    }

    /// Masked `l - r + add`, restricted to the bits of both counters.
    pub fn diff(l: Counter, r: Counter, add: u32) -> u32 {
        l.value.wrapping_sub(r.value).wrapping_add(add) & l.mask & r.mask
    }

    /// Masked `self - raw`, restricted to the bits of `self`.
    pub fn diff_raw(self, raw: u32) -> u32 {
        self.value.wrapping_sub(raw) & self.mask
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// A named crate counter, bound to a scaler or driven by external increments.
#[derive(Debug, Clone)]
pub struct CrateCounter {
    /// Counter name, `auto:` prefixed names need no scaler.
    pub name: String,
    /// Index into the crate scaler list, resolved at build time.
    pub scaler: Option<usize>,
    /// Latest value.
    pub cur: Counter,
    /// Value latched at the previous finalize.
    pub prev: Counter,
}

/// Prefix of counters that are not backed by a scaler.
pub const AUTO_PREFIX: &str = "auto:";

impl CrateCounter {
    /// Create a counter with a full-width mask.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scaler: None,
            cur: Counter::new(),
            prev: Counter::new(),
        }
    }

    /// True for counters that do not reference a scaler by name.
    pub fn is_auto(&self) -> bool {
        self.name.starts_with(AUTO_PREFIX)
    }

    /// Events counted since the previous latch.
    pub fn diff(&self) -> u32 {
        Counter::diff(self.cur, self.prev, 0)
    }

    /// Remember the current value.
    pub fn latch(&mut self) {
        self.prev = self.cur;
    }
}
