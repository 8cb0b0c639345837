//! Per-packet frame-count ledger
//!
//! Capture packets report how many frames the device actually delivered in
//! each bus frame. Playback packets are sized from the same counts so that
//! both directions stay frame-count synchronized at rates such as 44.1 kHz
//! that do not divide evenly into 1 ms packets.

use std::collections::VecDeque;

/// Bounded FIFO of capture frame counts, one per packet
#[derive(Debug)]
pub struct FrameSizeLedger {
    /// Measured counts waiting to size playback packets
    entries: VecDeque<u32>,
    capacity: usize,
    /// Rate the fallback sizes packets for
    sample_rate: u32,
    /// Whole frames per 1 ms packet at `sample_rate`
    stock: u32,
    /// Fractional frames carried between fallback pops, in 1/1000 frame units
    remainder: u32,
    dropped: u64,
    fallbacks: u64,
}

impl FrameSizeLedger {
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        assert!(capacity > 0, "Ledger needs capacity");
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            sample_rate,
            stock: sample_rate / 1000,
            remainder: 0,
            dropped: 0,
            fallbacks: 0,
        }
    }

    /// Record a measured packet frame count, dropping the oldest when full
    pub fn push(&mut self, frames: u32) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
            tracing::trace!("Frame size ledger full, dropped oldest entry");
        }
        self.entries.push_back(frames);
    }

    /// Next packet frame count, falling back to the stock size when empty
    pub fn pop(&mut self) -> u32 {
        if let Some(frames) = self.entries.pop_front() {
            return frames;
        }

        self.fallbacks += 1;
        self.remainder += self.sample_rate - self.stock * 1000;
        if self.remainder >= 1000 {
            self.remainder -= 1000;
            self.stock + 1
        } else {
            self.stock
        }
    }

    /// Retarget the fallback to a new (possibly measured) rate
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        if sample_rate == self.sample_rate {
            return;
        }
        tracing::debug!("Ledger fallback rate {} -> {} Hz", self.sample_rate, sample_rate);
        self.sample_rate = sample_rate;
        self.stock = sample_rate / 1000;
        self.remainder = 0;
    }

    /// Nominal per-millisecond frame count
    pub fn stock_frames(&self) -> u32 {
        self.stock
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn fallback_count(&self) -> u64 {
        self.fallbacks
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.remainder = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pops_return_stock() {
        let mut ledger = FrameSizeLedger::new(8, 48000);
        for _ in 0..100 {
            assert_eq!(ledger.pop(), 48);
        }
        assert_eq!(ledger.fallback_count(), 100);
    }

    #[test]
    fn test_fractional_rate_converges() {
        let mut ledger = FrameSizeLedger::new(8, 44100);
        let total: u64 = (0..1000).map(|_| ledger.pop() as u64).sum();
        let average = total as f64 / 1000.0;
        assert!((average - 44.1).abs() < 1.0);
        // The remainder scheme is exact over whole periods.
        assert_eq!(total, 44100);
    }

    #[test]
    fn test_fallback_values_stay_within_one_of_stock() {
        let mut ledger = FrameSizeLedger::new(8, 88200);
        for _ in 0..50 {
            let frames = ledger.pop();
            assert!(frames == 88 || frames == 89);
        }
    }

    #[test]
    fn test_queued_counts_come_back_in_order() {
        let mut ledger = FrameSizeLedger::new(4, 44100);
        ledger.push(44);
        ledger.push(45);
        assert_eq!(ledger.pop(), 44);
        assert_eq!(ledger.pop(), 45);
        assert_eq!(ledger.pop(), 44);
        assert_eq!(ledger.fallback_count(), 1);
    }

    #[test]
    fn test_bounded_capacity_drops_oldest() {
        let mut ledger = FrameSizeLedger::new(2, 48000);
        ledger.push(1);
        ledger.push(2);
        ledger.push(3);
        assert_eq!(ledger.dropped_count(), 1);
        assert_eq!(ledger.pop(), 2);
        assert_eq!(ledger.pop(), 3);
    }

    #[test]
    fn test_measured_rate_retargets_fallback() {
        let mut ledger = FrameSizeLedger::new(4, 48000);
        ledger.push(47);
        ledger.set_sample_rate(47990);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.pop(), 47);
        let total: u64 = (0..100).map(|_| ledger.pop() as u64).sum();
        assert_eq!(total, 4799);
    }
}
