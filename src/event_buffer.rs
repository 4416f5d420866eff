//! Monotonic event buffer.
//!
//! Modules write event data into an [`EventBuffer`] wrapping a caller-owned
//! byte slice. The write offset only advances and the remaining capacity only
//! shrinks; the bytes a module produced are handed back to it for decoding as
//! a plain `&[u8]`.
//!
//! # Example
//!
//! ```
//! use crate_readout::event_buffer::EventBuffer;
//!
//! let mut storage = [0u8; 16];
//! let mut eb = EventBuffer::new(&mut storage);
//! eb.push_u32(0xbabababa).unwrap();
//! assert_eq!(eb.offset(), 4);
//! assert_eq!(eb.remaining(), 12);
//! ```

use crate::error::ReadoutFail;

/// Write cursor over a byte slice.
pub struct EventBuffer<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

/// Attempt to advance past the end of an event buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    /// Bytes requested.
    pub requested: usize,
    /// Bytes left.
    pub remaining: usize,
}

impl From<Overflow> for ReadoutFail {
    fn from(_: Overflow) -> Self {
        ReadoutFail::DATA_TOO_MUCH
    }
}

impl<'a> EventBuffer<'a> {
    /// Wrap `buf`, starting at its beginning.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Bytes written so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes that may still be written.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Total capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// The unwritten tail, for drivers that fill memory directly.
    ///
    /// Follow up with [`advance`](Self::advance) for the bytes actually written.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..]
    }

    /// Commit `bytes` written through [`unfilled_mut`](Self::unfilled_mut).
    pub fn advance(&mut self, bytes: usize) -> Result<(), Overflow> {
        if bytes > self.remaining() {
            return Err(Overflow {
                requested: bytes,
                remaining: self.remaining(),
            });
        }
        self.offset += bytes;
        Ok(())
    }

    /// Append raw bytes.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Overflow> {
        let remaining = self.remaining();
        if data.len() > remaining {
            return Err(Overflow {
                requested: data.len(),
                remaining,
            });
        }
        self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += data.len();
        Ok(())
    }

    /// Append one native-endian 32-bit word.
    pub fn push_u32(&mut self, word: u32) -> Result<(), Overflow> {
        self.write(&word.to_ne_bytes())
    }

    /// Everything written so far.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    /// Bytes written since `mark`, which must be an earlier [`offset`](Self::offset).
    pub fn written_since(&self, mark: usize) -> &[u8] {
        &self.buf[mark.min(self.offset)..self.offset]
    }
}

impl std::fmt::Debug for EventBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("offset", &self.offset)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Format up to `limit` bytes as 32-bit hex words for diagnostics.
pub fn hex_dump(data: &[u8], limit: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in data[..data.len().min(limit)].chunks(4).enumerate() {
        if i % 8 == 0 {
            if i != 0 {
                out.push('\n');
            }
            out.push_str(&format!("{:06x}:", i * 4));
        }
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        out.push_str(&format!(" {:08x}", u32::from_ne_bytes(word)));
    }
    if data.len() > limit {
        out.push_str(&format!("\n... {} more bytes", data.len() - limit));
    }
    out
}
