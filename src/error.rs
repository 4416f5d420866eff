//! Error types for crate construction and readout.
//!
//! Two distinct failure channels exist:
//!
//! - **`ReadoutFail`**: an OR-able bitmask returned by every per-trigger module
//!   callback. Failures accumulate per module and per phase; a non-zero phase
//!   result sends the crate back to REINIT, which is retried indefinitely.
//! - **`CrateError`**: fatal misconfiguration detected while building or
//!   initializing a crate (ambiguous signatures, undefined scalers, duplicate
//!   module ids, ...). These are never retried; the binary prints the message
//!   and exits.
//!
//! Module init hooks return `anyhow::Result` so drivers can attach whatever
//! context they like; the crate only cares whether the attempt succeeded.

use bitflags::bitflags;
use thiserror::Error;

/// Convenience alias for results using the fatal crate error type.
pub type CrateResult<T> = std::result::Result<T, CrateError>;

bitflags! {
    /// Accumulated readout failure bits.
    ///
    /// An empty set means success.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadoutFail: u32 {
        /// Unspecified failure.
        const GENERAL = 1 << 0;
        /// Data failed validation while decoding.
        const DATA_CORRUPT = 1 << 1;
        /// Fewer events or words than expected.
        const DATA_MISSING = 1 << 2;
        /// More data than expected, or it did not fit the buffer.
        const DATA_TOO_MUCH = 1 << 3;
        /// Module and crate event counters did not agree in time.
        const EVENT_COUNTER_MISMATCH = 1 << 4;
        /// Driver-level or transport failure.
        const ERROR_DRIVER = 1 << 5;
        /// A trigger arrived that the module did not expect.
        const UNEXPECTED_TRIGGER = 1 << 6;
    }
}

impl ReadoutFail {
    /// True if no failure bit is set.
    pub fn is_ok(self) -> bool {
        self.is_empty()
    }
}

/// Fatal crate errors.
#[derive(Error, Debug)]
pub enum CrateError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Config item(s) {keys:?} under module {kind}[{id}] were never consulted")]
    UnusedConfig {
        kind: String,
        id: u32,
        keys: Vec<String>,
    },

    #[error("Unknown module type '{0}', no factory registered")]
    UnknownModuleType(String),

    #[error("Module '{kind}' could not be created: {source}")]
    ModuleCreate {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Tag list must not be empty")]
    EmptyTagList,

    #[error(
        "Module {new_kind}[{new_id}] has signature overlapping with {old_kind}[{old_id}] in tag \
         '{tag}', insert a barrier between them"
    )]
    AmbiguousSignature {
        tag: String,
        old_kind: String,
        old_id: u32,
        new_kind: String,
        new_id: u32,
    },

    #[error("Undefined reference to scaler '{0}'")]
    UndefinedScaler(String),

    #[error("Duplicate scaler '{0}'")]
    DuplicateScaler(String),

    #[error("Module id {id} used twice during init")]
    DuplicateModuleId { id: u32 },

    #[error("Module id remap from {from} does not match the module being initialized ({current})")]
    RemapMismatch { from: u32, current: u32 },

    #[error("A module requires the shared prerequisite device, but none is declared")]
    MissingSharedDevice,

    #[error("Only one shared prerequisite device may be declared")]
    DuplicateSharedDevice,

    #[error("No shared device factory named '{0}'")]
    UnknownSharedDevice(String),

    #[error(
        "Tag '{tag}' event_max_override={requested} > module capacity {capacity}, \
         this would busy lock the readout"
    )]
    EventMaxOverride {
        tag: String,
        requested: u32,
        capacity: u32,
    },

    #[error("Too many sync values ({0}), at most {max} may be pushed per trigger", max = crate::readout_crate::SYNC_MAX)]
    SyncOverflow(usize),

    #[error("Adaptive conversion timing enabled, but no module supports it")]
    AcvtWithoutModule,

    #[error("Only one module may take the event limit of a tag ({first} and {second})")]
    EventLimitConflict { first: String, second: String },

    #[error("Event limit requested for unknown tag '{0}'")]
    UnknownTag(String),

    #[error("Failed to spawn shadow readout thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl From<figment::Error> for CrateError {
    fn from(err: figment::Error) -> Self {
        CrateError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readout_fail_accumulates() {
        let mut result = ReadoutFail::empty();
        assert!(result.is_ok());

        result |= ReadoutFail::DATA_MISSING;
        result |= ReadoutFail::EVENT_COUNTER_MISMATCH;
        assert!(!result.is_ok());
        assert_eq!(result.bits(), (1 << 2) | (1 << 4));
    }

    #[test]
    fn test_crate_error_messages() {
        let err = CrateError::UndefinedScaler("s1".into());
        assert_eq!(err.to_string(), "Undefined reference to scaler 's1'");

        let err = CrateError::SyncOverflow(10);
        assert!(err.to_string().contains("at most 10"));
    }
}
