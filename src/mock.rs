//! Simulated modules.
//!
//! `MockModule` stands in for a digitizer: every trigger queues one event
//! tagged with a running sequence number, the event counter follows the
//! triggers (optionally with a scripted delay), and the data words identify
//! the module by id. `MockScaler` publishes a counter channel the crate can
//! bind a tag to. Both are used by the test suite and by the `simulate`
//! command of the binary.
//!
//! Data word layout: `id << 24 | sequence & 0x00ff_ffff`.
//!
//! Config keys of `mock`:
//!
//! | key              | meaning                                          |
//! |------------------|--------------------------------------------------|
//! | `event_max`      | event capacity, default 1                        |
//! | `counter_bits`   | implemented event counter bits, default 32       |
//! | `skip_dt`        | exclude from the counter check                   |
//! | `early_dt`       | data latched on trigger                          |
//! | `shadow`         | drainable in the background                      |
//! | `signature`      | `[id_mask, fixed_mask, fixed_value]`             |
//! | `catch_up_polls` | polls before the counter shows a new trigger     |
//! | `fail_init`      | fast-init attempts that fail                     |
//! | `fail_shadow`    | fail the next background drain                   |
//! | `remap_id`       | id reported by the "hardware" at slow-init       |
//! | `acvt`           | offer the adaptive timing                        |
//! | `shared_device`  | depend on the shared prerequisite device         |
//! | `event_limit`    | tag whose event_max the module wants to know     |

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::ConfigBlock;
use crate::counter::Counter;
use crate::error::ReadoutFail;
use crate::event_buffer::EventBuffer;
use crate::module::{
    BuildContext, DriverRegistry, InitContext, Module, ModuleCore, ModuleFlags, ModuleSignature,
    SharedDevice,
};

/// Sequence numbers wrap at this many bits in the data words.
const SEQ_MASK: u32 = 0x00ff_ffff;

/// Word a module with `id` emits for sequence number `seq`.
pub fn data_word(id: u32, seq: u32) -> u32 {
    (id << 24) | (seq & SEQ_MASK)
}

/// Scripted state of one simulated module, shared with the test.
#[derive(Debug, Default)]
pub struct MockHardware {
    /// Triggers seen since the last reset.
    pub counter: u32,
    /// Queued event sequence numbers.
    pub pending: VecDeque<u32>,
    /// Next sequence number.
    pub next_seq: u32,
    /// Polls left before `counter` becomes visible.
    pub stale_polls: u32,
    /// Polls to hide each new trigger for.
    pub catch_up_polls: u32,
    /// Fast-init attempts left to fail.
    pub fail_init: u32,
    /// Fail the next background drain after moving its data.
    pub fail_shadow: bool,
    /// Emit a word with a foreign id once.
    pub corrupt_next: bool,
    /// Report leftover data in `check_empty`.
    pub leftover: bool,
    /// Slow-init calls.
    pub slow_inits: u32,
    /// Fast-init calls, failed ones included.
    pub fast_inits: u32,
    /// Post-init calls.
    pub post_inits: u32,
    /// Joint-init passes this module took part in.
    pub joint_inits: u32,
    /// Deinit calls.
    pub deinits: u32,
    /// Memtest calls.
    pub memtests: u32,
    /// Last adaptive timing applied.
    pub acvt_ns: u32,
    /// Event limit told by the crate.
    pub event_limit: Option<u32>,
}

impl MockHardware {
    /// Simulate `n` triggers.
    pub fn trigger(&mut self, n: u32) {
        for _ in 0..n {
            self.pending.push_back(self.next_seq);
            self.next_seq = self.next_seq.wrapping_add(1);
        }
        self.counter = self.counter.wrapping_add(n);
        self.stale_polls = self.catch_up_polls;
    }

    fn reset(&mut self) {
        self.counter = 0;
        self.pending.clear();
        self.stale_polls = 0;
        self.leftover = false;
    }
}

/// Handle to the scripted state.
pub type MockHandle = Arc<Mutex<MockHardware>>;

/// A simulated data-producing module.
#[derive(Debug)]
pub struct MockModule {
    hw: MockHandle,
    flags: ModuleFlags,
    shadow: bool,
    signature: Vec<ModuleSignature>,
    remap_id: Option<u32>,
    counter_mask: u32,
    /// Counter value the driver reported last.
    visible: u32,
    last_seq: Option<u32>,
}

impl MockModule {
    /// Build from the entry's config items.
    pub fn from_context(ctx: &mut BuildContext<'_>) -> anyhow::Result<Self> {
        let config = ctx.config;
        ctx.core.event_max = config.get_u32("event_max", 0, 1 << 20, 1);
        ctx.core.skip_dt = config.get_bool("skip_dt", false);
        let bits = config.get_u32("counter_bits", 1, 32, 32);
        let counter_mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
        ctx.core.event_counter = Counter::with_mask(counter_mask);

        let mut flags = ModuleFlags::empty();
        if config.get_bool("early_dt", false) {
            flags |= ModuleFlags::EARLY_DT;
        }
        let signature = match config.get_int_array("signature", 0, i64::from(u32::MAX)).as_slice() {
            [] => Vec::new(),
            [id_mask, fixed_mask, fixed_value] => vec![ModuleSignature::new(
                *id_mask as u32,
                *fixed_mask as u32,
                *fixed_value as u32,
            )],
            other => anyhow::bail!("signature needs 3 integers, got {}", other.len()),
        };
        let remap_id = config
            .contains("remap_id")
            .then(|| config.get_u32("remap_id", 0, u32::MAX, 0));

        let hw = MockHardware {
            catch_up_polls: config.get_u32("catch_up_polls", 0, 1000, 0),
            fail_init: config.get_u32("fail_init", 0, 1000, 0),
            fail_shadow: config.get_bool("fail_shadow", false),
            ..Default::default()
        };

        if config.get_bool("acvt", false) {
            ctx.provide_acvt();
        }
        if config.get_bool("shared_device", false) {
            ctx.require_shared_device();
        }
        if config.contains("event_limit") {
            let tag = config.get_str("event_limit", "");
            ctx.request_event_limit(tag);
        }

        Ok(Self {
            hw: Arc::new(Mutex::new(hw)),
            flags,
            shadow: config.get_bool("shadow", false),
            signature,
            remap_id,
            counter_mask,
            visible: 0,
            last_seq: None,
        })
    }

    /// Typed access through the module trait object.
    pub fn downcast(module: &mut dyn Module) -> Option<&mut MockModule> {
        module.as_any_mut().downcast_mut::<MockModule>()
    }

    /// Shared handle to the scripted state.
    pub fn hardware(&self) -> MockHandle {
        Arc::clone(&self.hw)
    }

    /// Move queued events into `eb` while they fit.
    fn drain(&mut self, core: &ModuleCore, eb: &mut EventBuffer<'_>) -> (u32, ReadoutFail) {
        let mut hw = self.hw.lock();
        let mut drained = 0;
        while eb.remaining() >= 4 {
            let Some(seq) = hw.pending.pop_front() else {
                break;
            };
            let id = if hw.corrupt_next {
                hw.corrupt_next = false;
                core.id.wrapping_add(1)
            } else {
                core.id
            };
            if let Err(e) = eb.push_u32(data_word(id, seq)) {
                return (drained, e.into());
            }
            drained += 1;
        }
        (drained, ReadoutFail::empty())
    }
}

impl Module for MockModule {
    fn flags(&self) -> ModuleFlags {
        self.flags
    }

    fn signature(&self) -> &[ModuleSignature] {
        &self.signature
    }

    fn init_slow(&mut self, ctx: &mut InitContext<'_>) -> anyhow::Result<()> {
        let mut hw = self.hw.lock();
        hw.slow_inits += 1;
        hw.reset();
        drop(hw);
        if let Some(to) = self.remap_id {
            let from = ctx.core.id;
            ctx.remap_id(from, to)?;
        }
        Ok(())
    }

    fn init_fast(&mut self, ctx: &mut InitContext<'_>) -> anyhow::Result<()> {
        let mut hw = self.hw.lock();
        hw.fast_inits += 1;
        if hw.fail_init > 0 {
            hw.fail_init -= 1;
            anyhow::bail!("simulated init failure");
        }
        ctx.core.event_max = ctx.config.get_u32("event_max", 0, 1 << 20, ctx.core.event_max);
        self.visible = hw.counter;
        ctx.core.event_counter.value = hw.counter & self.counter_mask;
        self.last_seq = None;
        Ok(())
    }

    fn post_init(&mut self, _ctx: &mut InitContext<'_>) -> anyhow::Result<()> {
        self.hw.lock().post_inits += 1;
        Ok(())
    }

    fn readout_dt(&mut self, core: &mut ModuleCore) -> ReadoutFail {
        let mut hw = self.hw.lock();
        if hw.stale_polls > 0 {
            hw.stale_polls -= 1;
        } else {
            self.visible = hw.counter;
        }
        core.event_counter.value = self.visible & self.counter_mask;
        trace!(module_id = core.id, counter = core.event_counter.value, "mock readout_dt");
        ReadoutFail::empty()
    }

    fn readout(&mut self, core: &mut ModuleCore, eb: &mut EventBuffer<'_>) -> ReadoutFail {
        self.drain(core, eb).1
    }

    fn supports_shadow(&self) -> bool {
        self.shadow
    }

    fn readout_shadow(&mut self, core: &mut ModuleCore, eb: &mut EventBuffer<'_>) -> ReadoutFail {
        let (drained, result) = self.drain(core, eb);
        core.shadow_data_counter = core.shadow_data_counter.wrapping_add(drained);
        let mut hw = self.hw.lock();
        if hw.fail_shadow {
            hw.fail_shadow = false;
            return result | ReadoutFail::ERROR_DRIVER;
        }
        result
    }

    fn parse_data(&mut self, core: &ModuleCore, data: &[u8], _do_pedestals: bool) -> ReadoutFail {
        if data.len() % 4 != 0 {
            return ReadoutFail::DATA_CORRUPT;
        }
        for chunk in data.chunks_exact(4) {
            let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if word >> 24 != core.id & 0xff {
                return ReadoutFail::DATA_CORRUPT;
            }
            let seq = word & SEQ_MASK;
            if let Some(last) = self.last_seq {
                if seq.wrapping_sub(last) & SEQ_MASK != 1 {
                    return ReadoutFail::DATA_CORRUPT;
                }
            }
            self.last_seq = Some(seq);
        }
        ReadoutFail::empty()
    }

    fn check_empty(&mut self, _core: &ModuleCore) -> ReadoutFail {
        let hw = self.hw.lock();
        if hw.leftover || !hw.pending.is_empty() {
            ReadoutFail::DATA_TOO_MUCH
        } else {
            ReadoutFail::empty()
        }
    }

    fn deinit(&mut self, _core: &mut ModuleCore) {
        self.hw.lock().deinits += 1;
    }

    fn memtest(&mut self, _core: &ModuleCore, chunks: u32) {
        debug!(chunks, "mock memtest");
        self.hw.lock().memtests += 1;
    }

    fn set_acvt(&mut self, ns: u32) {
        self.hw.lock().acvt_ns = ns;
    }

    fn set_event_limit(&mut self, event_max: u32) {
        self.hw.lock().event_limit = Some(event_max);
    }

    fn sequencer_program(&self, core: &ModuleCore, deadtime: bool) -> Vec<u32> {
        let op = if deadtime { 0x1000_0000 } else { 0x2000_0000 };
        vec![op | core.id]
    }

    fn sequencer_readout_dt(&mut self, core: &mut ModuleCore, words: &[u32]) -> Result<usize, ReadoutFail> {
        let &counter = words.first().ok_or(ReadoutFail::DATA_MISSING)?;
        core.event_counter.value = counter & self.counter_mask;
        Ok(1)
    }

    fn sequencer_readout(
        &mut self,
        _core: &mut ModuleCore,
        eb: &mut EventBuffer<'_>,
        words: &[u32],
    ) -> Result<usize, ReadoutFail> {
        let &n = words.first().ok_or(ReadoutFail::DATA_MISSING)?;
        let n = n as usize;
        let data = words.get(1..=n).ok_or(ReadoutFail::DATA_MISSING)?;
        for &word in data {
            eb.push_u32(word)?;
        }
        Ok(1 + n)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// =============================================================================
// Scaler
// =============================================================================

/// A simulated scaler module with one channel, named by the `name` key.
#[derive(Debug)]
pub struct MockScaler {
    value: Arc<Mutex<u32>>,
}

impl MockScaler {
    /// Build from the entry's config items.
    pub fn from_context(ctx: &mut BuildContext<'_>) -> Self {
        let name = ctx.config.get_str("name", "trig");
        ctx.add_scaler(name);
        ctx.core.event_max = 0;
        Self {
            value: Arc::new(Mutex::new(0)),
        }
    }

    /// Typed access through the module trait object.
    pub fn downcast(module: &mut dyn Module) -> Option<&mut MockScaler> {
        module.as_any_mut().downcast_mut::<MockScaler>()
    }

    /// Shared counter value.
    pub fn value(&self) -> Arc<Mutex<u32>> {
        Arc::clone(&self.value)
    }
}

impl Module for MockScaler {
    fn init_slow(&mut self, _ctx: &mut InitContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn init_fast(&mut self, _ctx: &mut InitContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn readout_dt(&mut self, _core: &mut ModuleCore) -> ReadoutFail {
        ReadoutFail::empty()
    }

    fn readout(&mut self, _core: &mut ModuleCore, _eb: &mut EventBuffer<'_>) -> ReadoutFail {
        ReadoutFail::empty()
    }

    fn parse_data(&mut self, _core: &ModuleCore, _data: &[u8], _do_pedestals: bool) -> ReadoutFail {
        ReadoutFail::empty()
    }

    fn read_scaler(&mut self, _core: &ModuleCore, channel: usize) -> Result<u32, ReadoutFail> {
        match channel {
            0 => Ok(*self.value.lock()),
            _ => Err(ReadoutFail::GENERAL),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// =============================================================================
// Shared device
// =============================================================================

/// Call counts of the simulated shared device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCalls {
    /// Init calls.
    pub inits: u32,
    /// Reset calls.
    pub resets: u32,
    /// Readout-prepare calls.
    pub prepares: u32,
    /// Deinit calls.
    pub deinits: u32,
}

/// A simulated shared prerequisite device.
#[derive(Debug, Default)]
pub struct MockDevice {
    calls: Arc<Mutex<DeviceCalls>>,
}

impl SharedDevice for MockDevice {
    fn init(&mut self, config: &ConfigBlock) -> anyhow::Result<()> {
        let fail = config.get_bool("fail", false);
        self.calls.lock().inits += 1;
        if fail {
            anyhow::bail!("simulated shared device failure");
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.calls.lock().resets += 1;
    }

    fn readout_prepare(&mut self) {
        self.calls.lock().prepares += 1;
    }

    fn deinit(&mut self) {
        self.calls.lock().deinits += 1;
    }
}

/// Register `mock`, `mock_scaler` and the `mock_device` shared device.
///
/// All `mock` modules share a joint-init pass that counts its runs.
pub fn register(drivers: &mut DriverRegistry) {
    drivers
        .register("mock", |ctx| Ok(Box::new(MockModule::from_context(ctx)?)))
        .register("mock_scaler", |ctx| Ok(Box::new(MockScaler::from_context(ctx))))
        .register_joint_init("mock", |members| {
            for member in members.iter_mut() {
                if let Some(mock) = MockModule::downcast(&mut *member.module) {
                    mock.hw.lock().joint_inits += 1;
                }
            }
            Ok(())
        })
        .register_shared_device("mock_device", |_| Ok(Box::new(MockDevice::default())));
}
