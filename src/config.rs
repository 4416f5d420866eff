//! Crate configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `CRATE_READOUT_` (nested keys split on `__`)
//!
//! A file describes one or more crates. Each crate lists its entries in order;
//! the order is the readout order.
//!
//! ```toml
//! log_level = "info"
//!
//! [[crate]]
//! name = "Main"
//! shadow_bytes = 65536
//! reinit_sleep = "1s"
//!
//! [[crate.module]]
//! kind = "tags"
//! names = ["Scalers1"]
//! scaler = "trig"
//!
//! [[crate.module]]
//! kind = "mock"
//! event_max = 32
//!
//! [[crate.module]]
//! kind = "barrier"
//! ```
//!
//! Entries with a `kind` other than `tags`, `barrier`, `id_skip` and
//! `shared_device` are modules; their remaining keys become the module's
//! [`ConfigBlock`].

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CrateError, CrateResult};

/// Largest shadow arena accepted.
pub const SHADOW_BYTES_MAX: usize = 1 << 30;
/// Largest event_max override accepted.
pub const EVENT_MAX_OVERRIDE_MAX: u32 = 200_000;
/// Longest reinit or postinit sleep accepted.
pub const SLEEP_MAX: Duration = Duration::from_secs(60);

// =============================================================================
// File layout
// =============================================================================

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadoutConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Crates, in registry order
    #[serde(default, rename = "crate")]
    pub crates: Vec<CrateSettings>,
}

/// Settings of one crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrateSettings {
    /// Crate name
    #[serde(default = "default_crate_name")]
    pub name: String,
    /// Enable adaptive conversion timing
    #[serde(default)]
    pub acvt: bool,
    /// Shadow arena size in bytes, 0 disables shadow readout
    #[serde(default)]
    pub shadow_bytes: usize,
    /// Allow early deadtime release
    #[serde(default)]
    pub deadtime_release: bool,
    /// Per-tag event_max override, 0 disables
    #[serde(default)]
    pub event_max_override: u32,
    /// Sleep before re-initializing after a failure
    #[serde(default = "default_reinit_sleep", with = "humantime_serde")]
    pub reinit_sleep: Duration,
    /// Settle time between fast-init and post-init
    #[serde(default, with = "humantime_serde")]
    pub postinit_sleep: Duration,
    /// Run without a trigger, skipping counter checks
    #[serde(default)]
    pub free_running: bool,
    /// How module data reaches the crate
    #[serde(default)]
    pub transport: TransportKind,
    /// Timing policy constants
    #[serde(default)]
    pub timing: TimingPolicy,
    /// Ordered crate entries
    #[serde(default, rename = "module")]
    pub entries: Vec<EntryConfig>,
}

/// Transport selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Modules access their hardware directly.
    #[default]
    Direct,
    /// Data arrives pre-fetched from a readout sequencer.
    Sequencer,
}

/// Policy constants of the deadtime-critical phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingPolicy {
    /// Adaptive timing step in ns
    #[serde(default = "default_acvt_step")]
    pub acvt_step_ns: u32,
    /// Calm phases before the adaptive timing steps down
    #[serde(default = "default_acvt_threshold")]
    pub acvt_threshold: u32,
    /// Adaptive timing ceiling in ns
    #[serde(default = "default_acvt_max")]
    pub acvt_max_ns: u32,
    /// Longest wait for module counters to match the crate counter
    #[serde(default = "default_mismatch_timeout", with = "humantime_serde")]
    pub mismatch_timeout: Duration,
}

/// One ordered crate entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Entry kind or module type
    pub kind: String,
    /// Remaining keys
    #[serde(flatten)]
    pub params: toml::Table,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_crate_name() -> String {
    "Crate".to_string()
}

fn default_reinit_sleep() -> Duration {
    Duration::from_secs(1)
}

fn default_acvt_step() -> u32 {
    100
}

fn default_acvt_threshold() -> u32 {
    1000
}

fn default_acvt_max() -> u32 {
    u32::from(u16::MAX)
}

fn default_mismatch_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for CrateSettings {
    fn default() -> Self {
        Self {
            name: default_crate_name(),
            acvt: false,
            shadow_bytes: 0,
            deadtime_release: false,
            event_max_override: 0,
            reinit_sleep: default_reinit_sleep(),
            postinit_sleep: Duration::ZERO,
            free_running: false,
            transport: TransportKind::Direct,
            timing: TimingPolicy::default(),
            entries: Vec::new(),
        }
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self {
            acvt_step_ns: default_acvt_step(),
            acvt_threshold: default_acvt_threshold(),
            acvt_max_ns: default_acvt_max(),
            mismatch_timeout: default_mismatch_timeout(),
        }
    }
}

impl ReadoutConfig {
    /// Load configuration from `crate.toml` in the working directory.
    pub fn load() -> CrateResult<Self> {
        Self::load_from("crate.toml")
    }

    /// Load configuration from a specific path, with environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CrateResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CRATE_READOUT_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml_str(text: &str) -> CrateResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate value ranges of every crate.
    pub fn validate(&self) -> CrateResult<()> {
        for settings in &self.crates {
            settings.validate()?;
        }
        Ok(())
    }
}

impl CrateSettings {
    /// Settings with the given name and defaults otherwise.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a single crate table.
    pub fn from_toml_str(text: &str) -> CrateResult<Self> {
        let settings: Self = Figment::new().merge(Toml::string(text)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate value ranges.
    pub fn validate(&self) -> CrateResult<()> {
        let fail = |msg: String| Err(CrateError::Validation(format!("{}: {}", self.name, msg)));

        if self.shadow_bytes >= SHADOW_BYTES_MAX {
            return fail(format!(
                "shadow_bytes {} must be below {}",
                self.shadow_bytes, SHADOW_BYTES_MAX
            ));
        }
        if self.event_max_override > EVENT_MAX_OVERRIDE_MAX {
            return fail(format!(
                "event_max_override {} must be at most {}",
                self.event_max_override, EVENT_MAX_OVERRIDE_MAX
            ));
        }
        if self.reinit_sleep > SLEEP_MAX || self.postinit_sleep > SLEEP_MAX {
            return fail("reinit_sleep and postinit_sleep must be at most 60s".into());
        }
        if self.shadow_bytes > 0 && self.transport == TransportKind::Sequencer {
            return fail("shadow readout cannot be combined with the sequencer transport".into());
        }
        if self.timing.acvt_step_ns == 0 {
            return fail("timing.acvt_step_ns must be positive".into());
        }
        Ok(())
    }
}

// =============================================================================
// ConfigBlock - per-module typed accessors
// =============================================================================

/// Config items of one module, with typed accessors and usage tracking.
///
/// Every accessor marks its key as consulted. After post-init the crate
/// asserts that nothing in the block went unread, which catches misspelled
/// keys.
#[derive(Debug, Default)]
pub struct ConfigBlock {
    items: toml::Table,
    consulted: Mutex<BTreeSet<String>>,
}

impl Clone for ConfigBlock {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
            consulted: Mutex::new(self.consulted.lock().clone()),
        }
    }
}

impl ConfigBlock {
    /// Wrap a table of items.
    pub fn new(items: toml::Table) -> Self {
        Self {
            items,
            consulted: Mutex::new(BTreeSet::new()),
        }
    }

    /// Parse items from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        Ok(Self::new(text.parse::<toml::Table>()?))
    }

    fn lookup(&self, key: &str) -> Option<&toml::Value> {
        self.consulted.lock().insert(key.to_string());
        self.items.get(key)
    }

    /// True if the item exists. Consults the key.
    pub fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }

    /// Boolean item.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.lookup(key) {
            Some(toml::Value::Boolean(b)) => *b,
            Some(other) => {
                warn!(key, value = %other, "Expected boolean, using default");
                default
            }
            None => default,
        }
    }

    /// Integer item clamped to `[min, max]`.
    pub fn get_int(&self, key: &str, min: i64, max: i64, default: i64) -> i64 {
        match self.lookup(key) {
            Some(toml::Value::Integer(i)) => clamp_logged(key, *i, min, max),
            Some(other) => {
                warn!(key, value = %other, "Expected integer, using default");
                default
            }
            None => default,
        }
    }

    /// Unsigned 32-bit item clamped to `[min, max]`.
    pub fn get_u32(&self, key: &str, min: u32, max: u32, default: u32) -> u32 {
        let v = self.get_int(key, i64::from(min), i64::from(max), i64::from(default));
        u32::try_from(v).unwrap_or(default)
    }

    /// String item.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.lookup(key) {
            Some(toml::Value::String(s)) => s.clone(),
            Some(other) => {
                warn!(key, value = %other, "Expected string, using default");
                default.to_string()
            }
            None => default.to_string(),
        }
    }

    /// Duration item, as a unit string (`"250us"`, `"2s"`) or plain seconds,
    /// clamped to `[min, max]`.
    pub fn get_duration(&self, key: &str, min: Duration, max: Duration, default: Duration) -> Duration {
        let parsed = match self.lookup(key) {
            Some(toml::Value::String(s)) => match humantime::parse_duration(s) {
                Ok(d) => d,
                Err(e) => {
                    warn!(key, value = %s, error = %e, "Unparsable duration, using default");
                    default
                }
            },
            Some(toml::Value::Integer(i)) => Duration::from_secs(u64::try_from(*i).unwrap_or(0)),
            Some(toml::Value::Float(f)) if *f >= 0.0 => Duration::from_secs_f64(*f),
            Some(other) => {
                warn!(key, value = %other, "Expected duration, using default");
                default
            }
            None => default,
        };
        if parsed < min || parsed > max {
            let clamped = parsed.clamp(min, max);
            warn!(key, ?parsed, ?clamped, "Duration out of range, clamped");
            clamped
        } else {
            parsed
        }
    }

    /// Integer array item, each element clamped to `[min, max]`.
    pub fn get_int_array(&self, key: &str, min: i64, max: i64) -> Vec<i64> {
        match self.lookup(key) {
            Some(toml::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_integer())
                .map(|i| clamp_logged(key, i, min, max))
                .collect(),
            Some(toml::Value::Integer(i)) => vec![clamp_logged(key, *i, min, max)],
            Some(other) => {
                warn!(key, value = %other, "Expected integer array");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Replace the items named in `snippet`. Replaced items count as not yet
    /// consulted.
    pub fn merge(&mut self, snippet: &toml::Table) {
        let consulted = self.consulted.get_mut();
        for (key, value) in snippet {
            consulted.remove(key);
            self.items.insert(key.clone(), value.clone());
        }
    }

    /// Item names nobody asked for.
    pub fn unconsulted(&self) -> Vec<String> {
        let consulted = self.consulted.lock();
        self.items
            .keys()
            .filter(|k| !consulted.contains(*k))
            .cloned()
            .collect()
    }

    /// Fail if any item was never consulted.
    pub fn assert_consulted(&self, kind: &str, id: u32) -> CrateResult<()> {
        let keys = self.unconsulted();
        if keys.is_empty() {
            Ok(())
        } else {
            Err(CrateError::UnusedConfig {
                kind: kind.to_string(),
                id,
                keys,
            })
        }
    }

    /// Raw items, for dumping.
    pub fn items(&self) -> &toml::Table {
        &self.items
    }
}

fn clamp_logged(key: &str, value: i64, min: i64, max: i64) -> i64 {
    if value < min || value > max {
        let clamped = value.clamp(min, max);
        warn!(key, value, min, max, clamped, "Config value out of range, clamped");
        clamped
    } else {
        value
    }
}
