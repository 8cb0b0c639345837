//! Lock-free ring buffer
//!
//! Single-producer single-consumer (SPSC) circular buffer with overrun and
//! underrun signalling and a wrap hook. One slot of the nominal capacity is
//! reserved so that `available() + vacant() == capacity() - 1` always holds.

use crossbeam::queue::ArrayQueue;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::BufferError;

/// Callback run each time the writer passes slot 0; receives the wrap count
pub type WrapHook = Box<dyn Fn(u64) + Send + Sync>;

/// Fixed-capacity SPSC ring buffer
///
/// Safe for one concurrent reader and one concurrent writer. Multiple
/// readers or multiple writers break the all-or-nothing batch guarantees.
pub struct RingBuffer<T> {
    queue: ArrayQueue<T>,
    capacity: usize,
    /// Writer slot index, advanced modulo `capacity`
    write_index: AtomicUsize,
    wraps: AtomicU64,
    wrap_hook: Option<WrapHook>,
    overrun_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl<T> RingBuffer<T> {
    /// Create a ring buffer with `capacity` slots (`capacity - 1` usable)
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "Capacity must leave one usable slot");

        Self {
            queue: ArrayQueue::new(capacity - 1),
            capacity,
            write_index: AtomicUsize::new(0),
            wraps: AtomicU64::new(0),
            wrap_hook: None,
            overrun_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Create a ring buffer that runs `hook` on every writer wrap
    pub fn with_wrap_hook(capacity: usize, hook: WrapHook) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.wrap_hook = Some(hook);
        buffer
    }

    /// Push one item, failing with `Overrun` when full
    pub fn push(&self, item: T) -> Result<(), BufferError> {
        match self.queue.push(item) {
            Ok(()) => {
                self.advance_writer(1);
                Ok(())
            }
            Err(_) => {
                self.overrun_count.fetch_add(1, Ordering::Relaxed);
                Err(BufferError::Overrun {
                    requested: 1,
                    vacant: 0,
                })
            }
        }
    }

    /// Push all of `items` or none of them
    pub fn push_slice(&self, items: &[T]) -> Result<(), BufferError>
    where
        T: Clone,
    {
        let vacant = self.vacant();
        if items.len() > vacant {
            self.overrun_count.fetch_add(1, Ordering::Relaxed);
            return Err(BufferError::Overrun {
                requested: items.len(),
                vacant,
            });
        }

        // Only this writer adds items, so the space checked above stays free.
        for item in items {
            if self.queue.push(item.clone()).is_err() {
                self.overrun_count.fetch_add(1, Ordering::Relaxed);
                return Err(BufferError::Overrun {
                    requested: items.len(),
                    vacant: 0,
                });
            }
            self.advance_writer(1);
        }
        Ok(())
    }

    /// Pop one item, failing with `Underrun` when empty
    pub fn pop(&self) -> Result<T, BufferError> {
        match self.queue.pop() {
            Some(item) => Ok(item),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                Err(BufferError::Underrun {
                    requested: 1,
                    available: 0,
                })
            }
        }
    }

    /// Fill `out` completely or leave the buffer untouched
    pub fn pop_slice(&self, out: &mut [T]) -> Result<(), BufferError> {
        let available = self.available();
        if out.len() > available {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
            return Err(BufferError::Underrun {
                requested: out.len(),
                available,
            });
        }

        for slot in out.iter_mut() {
            match self.queue.pop() {
                Some(item) => *slot = item,
                None => {
                    self.underrun_count.fetch_add(1, Ordering::Relaxed);
                    return Err(BufferError::Underrun {
                        requested: 1,
                        available: 0,
                    });
                }
            }
        }
        Ok(())
    }

    /// Pop without counting an underrun
    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    fn advance_writer(&self, n: usize) {
        for _ in 0..n {
            let next = (self.write_index.load(Ordering::Relaxed) + 1) % self.capacity;
            self.write_index.store(next, Ordering::Relaxed);
            if next == 0 {
                let wraps = self.wraps.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(hook) = &self.wrap_hook {
                    hook(wraps);
                }
            }
        }
    }

    /// Items ready to pop
    pub fn available(&self) -> usize {
        self.queue.len()
    }

    /// Items that can be pushed before overrun
    pub fn vacant(&self) -> usize {
        self.capacity - 1 - self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Nominal slot count, including the reserved slot
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of writer passes through slot 0
    pub fn wrap_count(&self) -> u64 {
        self.wraps.load(Ordering::Relaxed)
    }

    pub fn overrun_count(&self) -> usize {
        self.overrun_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.overrun_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
    }

    /// Fill level as a fraction of usable capacity
    pub fn fill_level(&self) -> f32 {
        self.available() as f32 / (self.capacity - 1) as f32
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("wraps", &self.wrap_count())
            .finish()
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer<T> = Arc<RingBuffer<T>>;

/// Create a new shared ring buffer
pub fn create_shared_buffer<T>(capacity: usize) -> SharedRingBuffer<T> {
    Arc::new(RingBuffer::new(capacity))
}
