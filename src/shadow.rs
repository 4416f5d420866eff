//! Shadow readout buffers and the background drainer thread.
//!
//! Some modules can be read without holding deadtime. With shadow readout
//! enabled, a background thread keeps draining those modules into one of two
//! alternating regions per module, while the trigger path only ever reads the
//! other region:
//!
//! ```text
//!              arena (one allocation, carved at rebuild)
//!  ┌──────────┬──────────┬──────────┬──────────┬─────┐
//!  │ mod0 [0] │ mod0 [1] │ mod1 [0] │ mod1 [1] │ ... │
//!  └──────────┴──────────┴──────────┴──────────┴─────┘
//!       ▲ drainer writes         ▲ bulk phase reads
//!       └── swapped in readout_dt under the module's buffer mutex
//! ```
//!
//! The deadtime-critical phase swaps the sides once the module's shadow data
//! covers every accepted event. The new write side starts empty.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::error::ReadoutFail;
use crate::event_buffer::EventBuffer;

// =============================================================================
// Regions
// =============================================================================

/// One region of a double buffer.
#[derive(Debug, Default)]
pub struct ShadowRegion {
    store: BytesMut,
    written: usize,
}

impl ShadowRegion {
    fn new(store: BytesMut) -> Self {
        Self { store, written: 0 }
    }

    /// Region size.
    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// Bytes written since the last reset.
    pub fn written(&self) -> &[u8] {
        &self.store[..self.written]
    }

    /// Forget written data, restoring the full capacity.
    pub fn reset(&mut self) {
        self.written = 0;
    }

    /// Append through an event buffer over the unwritten tail.
    pub fn fill<F>(&mut self, f: F) -> ReadoutFail
    where
        F: FnOnce(&mut EventBuffer<'_>) -> ReadoutFail,
    {
        let mut eb = EventBuffer::new(&mut self.store[self.written..]);
        let result = f(&mut eb);
        // The event buffer cannot hand out more than its slice, so the
        // written bytes remain a prefix of the region.
        self.written += eb.offset();
        result
    }
}

/// Two alternating regions of one module.
#[derive(Debug, Default)]
pub struct ShadowPair {
    regions: [ShadowRegion; 2],
    write_idx: usize,
}

impl ShadowPair {
    /// True once the arena was carved for this module.
    pub fn is_built(&self) -> bool {
        self.regions[0].capacity() > 0
    }

    /// Install freshly carved regions.
    pub fn rebuild(&mut self, a: BytesMut, b: BytesMut) {
        self.regions = [ShadowRegion::new(a), ShadowRegion::new(b)];
        self.write_idx = 0;
    }

    /// The region the drainer writes to.
    pub fn write_side(&mut self) -> &mut ShadowRegion {
        &mut self.regions[self.write_idx]
    }

    /// Data published by the last swap.
    pub fn published(&self) -> &[u8] {
        self.regions[self.write_idx ^ 1].written()
    }

    /// Publish the write side and start writing into the other one.
    pub fn swap(&mut self) {
        self.write_idx ^= 1;
        self.regions[self.write_idx].reset();
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Carve `count` region pairs for `readable` modules out of one allocation of
/// `bytes`. Each region is word aligned.
pub fn carve_arena(bytes: usize, readable: usize, count: usize) -> Vec<(BytesMut, BytesMut)> {
    if readable == 0 || count == 0 {
        return Vec::new();
    }
    let step = (bytes / (2 * readable)) / 4 * 4;
    let mut arena = BytesMut::zeroed(step * 2 * count);
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let a = arena.split_to(step);
        let b = arena.split_to(step);
        pairs.push((a, b));
    }
    debug!(bytes, readable, step, "Shadow arena carved");
    pairs
}

// =============================================================================
// Background task
// =============================================================================

/// Handle of the drainer thread.
///
/// Dropping the handle stops and joins the thread.
#[derive(Debug)]
pub struct ShadowTask {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ShadowTask {
    /// Spawn a thread calling `sweep` until stopped, yielding between sweeps.
    pub fn spawn<F>(name: &str, mut sweep: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name(format!("shadow-{}", name))
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    sweep();
                    thread::yield_now();
                }
                debug!("Shadow sweep loop exited");
            })?;
        info!(crate_name = name, "Shadow readout started");
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Shadow readout thread panicked");
            } else {
                info!("Shadow readout stopped");
            }
        }
    }
}

impl Drop for ShadowTask {
    fn drop(&mut self) {
        self.stop();
    }
}
