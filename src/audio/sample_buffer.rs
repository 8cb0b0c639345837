//! Byte-granular circular buffer for PCM payloads
//!
//! Bridges variable-sized USB packet payloads and fixed-size audio frame
//! consumption. The engine writes capture payloads and reads playback
//! payloads; the host side does the opposite through a shared handle.

use parking_lot::Mutex;
use std::sync::Arc;

/// Writer wrap callback; receives the new wrap count
pub type ByteWrapHook = Box<dyn FnMut(u64) + Send>;

/// Result of a `store_bytes` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    /// Bytes written before the first wrap (all of them when no wrap)
    pub pre_wrap: usize,
    /// Bytes written after the first wrap
    pub post_wrap: usize,
    pub wrapped: bool,
    /// The writer lapped the reader and the oldest bytes were dropped
    pub overrun: bool,
}

/// Result of a `consume_into` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub pre_wrap: usize,
    pub post_wrap: usize,
    pub wrapped: bool,
    /// Bytes zero-filled because the writer had not supplied them
    pub underrun_bytes: usize,
}

/// Fixed-capacity byte ring with one writer and one reader
///
/// Offsets wrap at `capacity`; the running totals never wrap and give the
/// fill level. Every byte of the capacity is usable.
pub struct SampleByteBuffer {
    data: Box<[u8]>,
    capacity: usize,
    /// Next byte the writer fills
    write_offset: usize,
    /// Next byte the reader takes
    read_offset: usize,
    /// Bytes ever stored
    total_written: u64,
    /// Bytes ever consumed, including those dropped on overrun
    total_read: u64,
    /// Times the write offset returned to 0
    wraps: u64,
    /// Times the read offset returned to 0
    read_wraps: u64,
    overruns: u64,
    underruns: u64,
    /// Called with the new wrap count each time the writer wraps
    wrap_hook: Option<ByteWrapHook>,
}

impl SampleByteBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Sample buffer needs capacity");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            capacity,
            write_offset: 0,
            read_offset: 0,
            total_written: 0,
            total_read: 0,
            wraps: 0,
            read_wraps: 0,
            overruns: 0,
            underruns: 0,
            wrap_hook: None,
        }
    }

    pub fn set_wrap_hook(&mut self, hook: ByteWrapHook) {
        self.wrap_hook = Some(hook);
    }

    /// Copy `src` in at the write offset, wrapping to 0 at capacity
    pub fn store_bytes(&mut self, src: &[u8]) -> StoreOutcome {
        let n = src.len();
        let mut outcome = StoreOutcome {
            pre_wrap: n,
            ..StoreOutcome::default()
        };

        let mut remaining = src;
        let mut written = 0;
        while !remaining.is_empty() {
            let chunk = remaining.len().min(self.capacity - self.write_offset);
            self.data[self.write_offset..self.write_offset + chunk].copy_from_slice(&remaining[..chunk]);
            self.write_offset += chunk;
            written += chunk;
            remaining = &remaining[chunk..];

            if self.write_offset == self.capacity {
                self.write_offset = 0;
                self.wraps += 1;
                if !outcome.wrapped {
                    outcome.wrapped = true;
                    outcome.pre_wrap = written;
                    outcome.post_wrap = n - written;
                }
                if let Some(hook) = self.wrap_hook.as_mut() {
                    hook(self.wraps);
                }
            }
        }

        self.total_written += n as u64;
        let lapped = self.total_written - self.total_read;
        if lapped > self.capacity as u64 {
            // Drop the oldest bytes so the reader never sees torn data.
            self.overruns += 1;
            outcome.overrun = true;
            tracing::warn!(
                "Sample buffer overrun: writer ahead by {} bytes (capacity {})",
                lapped,
                self.capacity
            );
            self.total_read = self.total_written - self.capacity as u64;
            self.read_offset = self.write_offset;
        }

        outcome
    }

    /// Read-only view of `n` bytes starting at `start`, split at the end
    ///
    /// Neither cursor moves. `start` is taken modulo capacity and `n` is
    /// clamped to capacity.
    pub fn peek_range(&self, start: usize, n: usize) -> (&[u8], &[u8]) {
        let start = start % self.capacity;
        let n = n.min(self.capacity);
        let first_len = n.min(self.capacity - start);
        (
            &self.data[start..start + first_len],
            &self.data[..n - first_len],
        )
    }

    /// Host-side pull of captured bytes; returns the count copied
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.available());
        let copied = self.copy_out(&mut dst[..n]);
        copied.0 + copied.1
    }

    /// Engine-side pull of playback bytes; always fills `dst`
    ///
    /// Missing bytes are zero-filled and reported as an underrun.
    pub fn consume_into(&mut self, dst: &mut [u8]) -> ConsumeOutcome {
        let available = dst.len().min(self.available());
        let wraps_before = self.read_wraps;
        let (pre, post) = self.copy_out(&mut dst[..available]);

        let underrun_bytes = dst.len() - available;
        if underrun_bytes > 0 {
            dst[available..].fill(0);
            self.underruns += 1;
            tracing::debug!("Sample buffer underrun: {} bytes of silence", underrun_bytes);
        }

        ConsumeOutcome {
            pre_wrap: pre,
            post_wrap: post,
            wrapped: self.read_wraps != wraps_before,
            underrun_bytes,
        }
    }

    /// Copy from the read offset, returning bytes before and after the wrap
    fn copy_out(&mut self, dst: &mut [u8]) -> (usize, usize) {
        let n = dst.len();
        let first = n.min(self.capacity - self.read_offset);
        dst[..first].copy_from_slice(&self.data[self.read_offset..self.read_offset + first]);
        dst[first..].copy_from_slice(&self.data[..n - first]);

        let crosses = self.read_offset + n >= self.capacity && n > 0;
        self.read_offset = (self.read_offset + n) % self.capacity;
        self.total_read += n as u64;
        if crosses {
            self.read_wraps += 1;
            (first, n - first)
        } else {
            (n, 0)
        }
    }

    /// Bytes written but not yet read
    pub fn available(&self) -> usize {
        (self.total_written - self.total_read) as usize
    }

    pub fn vacant(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    pub fn wrap_count(&self) -> u64 {
        self.wraps
    }

    /// Times the read cursor has passed the end
    pub fn read_wrap_count(&self) -> u64 {
        self.read_wraps
    }

    pub fn overrun_count(&self) -> u64 {
        self.overruns
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns
    }

    /// Rewind both cursors and clear statistics; storage is zeroed
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.write_offset = 0;
        self.read_offset = 0;
        self.total_written = 0;
        self.total_read = 0;
        self.wraps = 0;
        self.read_wraps = 0;
        self.overruns = 0;
        self.underruns = 0;
    }
}

impl std::fmt::Debug for SampleByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleByteBuffer")
            .field("capacity", &self.capacity)
            .field("write_offset", &self.write_offset)
            .field("read_offset", &self.read_offset)
            .field("available", &self.available())
            .finish()
    }
}

/// Sample buffer shared between the engine and the host side
pub type SharedSampleBuffer = Arc<Mutex<SampleByteBuffer>>;

pub fn create_shared_sample_buffer(capacity: usize) -> SharedSampleBuffer {
    Arc::new(Mutex::new(SampleByteBuffer::new(capacity)))
}
