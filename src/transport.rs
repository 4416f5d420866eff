//! How module data reaches the crate.
//!
//! The orchestration sequence is the same for every crate; the transport
//! decides what "read this module" means underneath it.
//!
//! - **Direct**: the module driver talks to its hardware itself.
//! - **Sequencer**: a readout controller executed a program containing every
//!   module's read commands and delivered the results as one stream of 32-bit
//!   words. The backend stages that stream before each phase; each module
//!   consumes its own segment, which must be followed by a per-module marker
//!   word. The data cannot be re-polled and no module may be skipped.

use tracing::error;

use crate::config::TransportKind;
use crate::error::ReadoutFail;
use crate::event_buffer::EventBuffer;
use crate::module::{Module, ModuleCore};

/// Marker base closing a module's deadtime segment.
pub const DT_MARKER: u32 = 0xfeed_0000;
/// Marker base closing a module's data segment.
pub const DATA_MARKER: u32 = 0xabba_0000;

/// Marker word for module `id`.
pub fn marker(base: u32, id: u32) -> u32 {
    base ^ id.wrapping_add(1)
}

/// Phase a sequencer stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerPhase {
    /// Counter words for the deadtime-critical phase.
    Deadtime,
    /// Event data for the bulk phase.
    Data,
}

/// One module's part of a sequencer program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerStep {
    /// Module list index.
    pub module: usize,
    /// Module-provided program words.
    pub words: Vec<u32>,
    /// Marker the controller must emit after the module's data.
    pub marker: u32,
}

#[derive(Debug, Default)]
struct Stream {
    words: Vec<u32>,
    pos: usize,
}

impl Stream {
    fn stage(&mut self, words: &[u32]) {
        self.words.clear();
        self.words.extend_from_slice(words);
        self.pos = 0;
    }

    /// Let `consume` take words, then check the trailing marker.
    fn take<F>(&mut self, core_id: u32, kind: &str, base: u32, consume: F) -> ReadoutFail
    where
        F: FnOnce(&[u32]) -> Result<usize, ReadoutFail>,
    {
        let rest = &self.words[self.pos..];
        let used = match consume(rest) {
            Ok(used) if used <= rest.len() => used,
            Ok(used) => {
                error!(
                    module_id = core_id,
                    kind,
                    used,
                    available = rest.len(),
                    "Module claims more sequencer words than available"
                );
                return ReadoutFail::ERROR_DRIVER;
            }
            Err(fail) => {
                error!(
                    module_id = core_id,
                    kind,
                    ?fail,
                    words = ?&rest[..rest.len().min(16)],
                    "Sequencer fetch failed, dumping words"
                );
                return fail;
            }
        };
        let expect = marker(base, core_id);
        match rest.get(used) {
            None => {
                error!(
                    module_id = core_id,
                    kind,
                    "Too few words for post-module marker in sequencer data"
                );
                ReadoutFail::ERROR_DRIVER
            }
            Some(&got) if got != expect => {
                error!(
                    module_id = core_id,
                    kind,
                    expect = format_args!("0x{:08x}", expect),
                    got = format_args!("0x{:08x}", got),
                    "Bad post-module marker in sequencer data"
                );
                ReadoutFail::ERROR_DRIVER
            }
            Some(_) => {
                self.pos += used + 1;
                ReadoutFail::empty()
            }
        }
    }
}

/// Transport strategy, chosen once when the crate is built.
#[derive(Debug)]
pub enum Transport {
    /// Drivers access hardware directly.
    Direct,
    /// Pre-fetched sequencer streams.
    Sequencer {
        /// Staged streams.
        streams: Box<SequencerStreams>,
    },
}

/// Staged sequencer streams of both phases.
#[derive(Debug, Default)]
pub struct SequencerStreams {
    dt: Stream,
    data: Stream,
}

impl Transport {
    /// Transport for `kind`.
    pub fn new(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Direct => Transport::Direct,
            TransportKind::Sequencer => Transport::Sequencer {
                streams: Box::default(),
            },
        }
    }

    /// Configured kind.
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Direct => TransportKind::Direct,
            Transport::Sequencer { .. } => TransportKind::Sequencer,
        }
    }

    /// True if a module may be polled again while waiting for its counter.
    pub fn can_repoll(&self) -> bool {
        matches!(self, Transport::Direct)
    }

    /// True if a module expecting no new events may be skipped.
    pub fn can_skip(&self) -> bool {
        matches!(self, Transport::Direct)
    }

    /// Stage the stream for `phase`. Ignored by the direct transport.
    pub fn stage(&mut self, phase: SequencerPhase, words: &[u32]) {
        if let Transport::Sequencer { streams } = self {
            match phase {
                SequencerPhase::Deadtime => streams.dt.stage(words),
                SequencerPhase::Data => streams.data.stage(words),
            }
        }
    }

    /// Words of `phase` consumed so far.
    pub fn consumed(&self, phase: SequencerPhase) -> usize {
        match self {
            Transport::Direct => 0,
            Transport::Sequencer { streams } => match phase {
                SequencerPhase::Deadtime => streams.dt.pos,
                SequencerPhase::Data => streams.data.pos,
            },
        }
    }

    /// Update the module's event counter.
    pub fn readout_dt(&mut self, module: &mut dyn Module, core: &mut ModuleCore) -> ReadoutFail {
        match self {
            Transport::Direct => module.readout_dt(core),
            Transport::Sequencer { streams } => {
                let id = core.id;
                let kind = core.kind.clone();
                streams
                    .dt
                    .take(id, &kind, DT_MARKER, |words| module.sequencer_readout_dt(core, words))
            }
        }
    }

    /// Move the module's event data into `eb`.
    pub fn readout(
        &mut self,
        module: &mut dyn Module,
        core: &mut ModuleCore,
        eb: &mut EventBuffer<'_>,
    ) -> ReadoutFail {
        match self {
            Transport::Direct => module.readout(core, eb),
            Transport::Sequencer { streams } => {
                let id = core.id;
                let kind = core.kind.clone();
                streams
                    .data
                    .take(id, &kind, DATA_MARKER, |words| module.sequencer_readout(core, eb, words))
            }
        }
    }
}
