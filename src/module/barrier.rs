//! Barrier pseudo-module.

use std::any::Any;

use super::{InitContext, Module, ModuleCore};
use crate::error::ReadoutFail;
use crate::event_buffer::EventBuffer;

/// Word emitted for every barrier in the bulk phase.
pub const BARRIER_WORD: u32 = 0xbabababa;

/// Structural separator between modules whose signatures collide.
///
/// Never polled for counters; in the bulk phase it only emits [`BARRIER_WORD`].
#[derive(Debug, Default)]
pub struct Barrier;

impl Module for Barrier {
    fn init_slow(&mut self, _ctx: &mut InitContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn init_fast(&mut self, _ctx: &mut InitContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn readout_dt(&mut self, _core: &mut ModuleCore) -> ReadoutFail {
        ReadoutFail::empty()
    }

    fn readout(&mut self, _core: &mut ModuleCore, eb: &mut EventBuffer<'_>) -> ReadoutFail {
        match eb.push_u32(BARRIER_WORD) {
            Ok(()) => ReadoutFail::empty(),
            Err(e) => e.into(),
        }
    }

    fn parse_data(&mut self, _core: &ModuleCore, _data: &[u8], _do_pedestals: bool) -> ReadoutFail {
        ReadoutFail::empty()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
