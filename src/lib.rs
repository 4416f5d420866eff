//! # Crate Readout Core Library
//!
//! Orchestrates the per-trigger readout of a DAQ crate: an ordered set of
//! hardware modules (digitizers, scalers, trigger logic) that are initialized
//! together, checked for event-counter consistency while deadtime is held,
//! and read out into one event buffer.
//!
//! ## Crate Structure
//!
//! - **`readout_crate`**: the `ReadoutCrate` state machine, its init pipeline,
//!   the deadtime-critical and bulk phases, and finalize/reconfigure.
//! - **`module`**: the `Module` trait vendor drivers implement, the driver
//!   registry, signatures, barriers and the per-round id registry.
//! - **`config`**: figment-based loading of crate files and the per-module
//!   `ConfigBlock` with typed, usage-tracked accessors.
//! - **`counter`**: masked, wraparound-safe event counter arithmetic.
//! - **`tag`**: named readout groups and scaler bindings.
//! - **`dt_release`**, **`acvt`**: early deadtime release and the adaptive
//!   conversion timing loop.
//! - **`shadow`**: double-buffered background draining of modules.
//! - **`transport`**: direct hardware access or a pre-fetched sequencer
//!   stream.
//! - **`event_buffer`**, **`spin`**, **`logging`**: buffer cursor, bounded
//!   busy-wait and tracing setup.
//! - **`registry`**: handles to all crates for control paths.
//! - **`mock`**: simulated modules for tests and the `simulate` command.

pub mod acvt;
pub mod config;
pub mod counter;
pub mod dt_release;
pub mod error;
pub mod event_buffer;
pub mod logging;
pub mod mock;
pub mod module;
pub mod readout_crate;
pub mod registry;
pub mod shadow;
pub mod spin;
pub mod tag;
pub mod transport;

pub use error::{CrateError, CrateResult, ReadoutFail};
pub use readout_crate::{CrateState, ReadoutCrate};
