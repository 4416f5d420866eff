//! Tracing setup and scoped log suppression.
//!
//! Logging uses `tracing` with structured fields throughout. This module
//! installs the `tracing-subscriber` stack:
//! - pretty, compact or JSON output
//! - `RUST_LOG` style environment filtering
//! - a per-thread suppression filter used while busy-waiting
//!
//! # Suppression
//!
//! The deadtime-critical phase polls modules in a tight loop while waiting
//! for counters to settle. Drivers may log on every poll; a [`SuppressGuard`]
//! held around the retries drops those events on the current thread only.
//! The first poll is always logged; the guard reports how many polls were
//! silenced when it is dropped.
//!
//! # Example
//! ```no_run
//! use crate_readout::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact);
//! logging::init(config)?;
//! # Ok(())
//! # }
//! ```

use std::cell::Cell;

use tracing::{debug, Level, Metadata};
use tracing_subscriber::{
    filter::filter_fn,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format (for the readout host)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include thread names, useful with shadow readout
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config with custom level
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Create tracing config from a level name
    pub fn from_level_str(level: &str) -> Result<Self, String> {
        Ok(Self::new(parse_log_level(level)?))
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing with custom configuration.
///
/// Idempotent: if a global subscriber is already set this returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let suppress = filter_fn(|meta| !is_suppressed(meta));

    let result = match config.format {
        OutputFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_thread_names(config.with_thread_names)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter)
                .with_filter(suppress);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        OutputFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_thread_names(config.with_thread_names)
                .with_ansi(config.with_ansi)
                .with_filter(env_filter)
                .with_filter(suppress);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
        OutputFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_thread_names(config.with_thread_names)
                .with_filter(env_filter)
                .with_filter(suppress);
            tracing_subscriber::registry().with(fmt_layer).try_init()
        }
    };

    result.map_err(|e| format!("Failed to initialize tracing: {}", e))
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

// =============================================================================
// Scoped suppression
// =============================================================================

thread_local! {
    static SUPPRESS_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// True while the current thread holds a [`SuppressGuard`] and the event is
/// below WARN.
fn is_suppressed(meta: &Metadata<'_>) -> bool {
    meta.is_event()
        && *meta.level() > Level::WARN
        && SUPPRESS_DEPTH.with(|depth| depth.get() > 0)
}

/// True while the current thread suppresses logging.
pub fn suppressed() -> bool {
    SUPPRESS_DEPTH.with(|depth| depth.get() > 0)
}

/// Silences INFO and below on the current thread while alive.
///
/// Warnings and errors always pass.
#[derive(Debug)]
pub struct SuppressGuard {
    what: &'static str,
    silenced: u32,
    active: bool,
}

impl SuppressGuard {
    /// A guard that does not suppress anything until [`engage`](Self::engage).
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            silenced: 0,
            active: false,
        }
    }

    /// Start suppressing, counting one silenced round per call.
    pub fn engage(&mut self) {
        if !self.active {
            SUPPRESS_DEPTH.with(|depth| depth.set(depth.get() + 1));
            self.active = true;
        }
        self.silenced += 1;
    }

    /// Rounds silenced so far.
    pub fn silenced(&self) -> u32 {
        self.silenced
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        if self.active {
            SUPPRESS_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
            debug!(what = self.what, silenced = self.silenced, "Log suppression lifted");
        }
    }
}
