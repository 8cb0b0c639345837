//! Bus-sequence to wall-clock recovery
//!
//! Each completion of the clock-owning direction yields a raw anchor: the
//! bus sequence number at the end of the frame list and the wall time the
//! completion arrived. Those samples drive a `DampedFilter`; once it locks,
//! the filtered position is published as the current anchor together with
//! the smoothed wall time per sequence unit.
//!
//! Publication goes through a generation counter so readers on other
//! threads can detect a torn read and retry without blocking the writer.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::feedback::FeedbackTracker;
use crate::clock::filter::{DampedFilter, FilterState, FilterUpdate};
use crate::config::ClockSettings;
use crate::error::ClockError;

/// Read attempts before a reader gives up on a changing anchor
const MAX_READ_ATTEMPTS: usize = 8;

/// A correlated (sequence, wall time) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub sequence: u64,
    pub wall_time_ns: u64,
}

#[derive(Debug, Default)]
struct AnchorCell {
    /// Odd while a write is in progress; only ever increases
    generation: AtomicU64,
    /// Nonzero once an anchor is held; cleared on reset
    present: AtomicU64,
    sequence: AtomicU64,
    wall_time_ns: AtomicU64,
    ns_per_unit: AtomicU64,
}

impl AnchorCell {
    fn write(&self, anchor: Option<(Anchor, f64)>) {
        let generation = self.generation.load(Ordering::Relaxed);
        self.generation.store(generation + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        match anchor {
            Some((anchor, ns_per_unit)) => {
                self.sequence.store(anchor.sequence, Ordering::Relaxed);
                self.wall_time_ns.store(anchor.wall_time_ns, Ordering::Relaxed);
                self.ns_per_unit.store(ns_per_unit.to_bits(), Ordering::Relaxed);
                self.present.store(1, Ordering::Relaxed);
            }
            None => self.present.store(0, Ordering::Relaxed),
        }
        self.generation.store(generation + 2, Ordering::Release);
    }

    fn publish(&self, anchor: Anchor, ns_per_unit: f64) {
        self.write(Some((anchor, ns_per_unit)));
    }

    fn clear(&self) {
        self.write(None);
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn read(&self) -> Result<(Anchor, f64), ClockError> {
        for _ in 0..MAX_READ_ATTEMPTS {
            let before = self.generation.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let present = self.present.load(Ordering::Relaxed) != 0;
            let anchor = Anchor {
                sequence: self.sequence.load(Ordering::Relaxed),
                wall_time_ns: self.wall_time_ns.load(Ordering::Relaxed),
            };
            let ns_per_unit = f64::from_bits(self.ns_per_unit.load(Ordering::Relaxed));
            fence(Ordering::Acquire);

            if self.generation.load(Ordering::Relaxed) == before {
                if !present {
                    return Err(ClockError::NoAnchor);
                }
                return Ok((anchor, ns_per_unit));
            }
        }
        Err(ClockError::Inconsistent)
    }
}

/// Cloneable read side of the published anchor
#[derive(Debug, Clone)]
pub struct AnchorReader {
    cell: Arc<AnchorCell>,
}

impl AnchorReader {
    /// Current anchor and smoothed nanoseconds per sequence unit
    pub fn anchor(&self) -> Result<(Anchor, f64), ClockError> {
        self.cell.read()
    }

    pub fn estimate_wall_time(&self, sequence: u64) -> Result<u64, ClockError> {
        self.estimate_at(sequence as f64)
    }

    /// Extrapolate to a fractional sequence position, before or after the anchor
    pub fn estimate_at(&self, position: f64) -> Result<u64, ClockError> {
        let (anchor, ns_per_unit) = self.cell.read()?;
        let offset = (position - anchor.sequence as f64) * ns_per_unit;
        Ok((anchor.wall_time_ns as f64 + offset).max(0.0).round() as u64)
    }
}

/// Write side of bus-to-wall-clock recovery
#[derive(Debug)]
pub struct ClockRecovery {
    settings: ClockSettings,
    /// Sequence units between nominal anchor samples
    stride: u64,
    filter: DampedFilter,
    /// Wall time of the first raw sample; the filter works relative to it
    base_wall_ns: Option<u64>,
    last_sequence: Option<u64>,
    /// Published anchor shared with every `AnchorReader`
    cell: Arc<AnchorCell>,
    /// Device rate tracking, present for sync-feedback endpoints
    feedback: Option<FeedbackTracker>,
    published: u64,
}

impl ClockRecovery {
    pub fn new(settings: &ClockSettings, stride: u64) -> Self {
        let stride = stride.max(1);
        Self {
            settings: settings.clone(),
            stride,
            filter: DampedFilter::new((stride * settings.nominal_ns_per_sequence) as f64, settings),
            base_wall_ns: None,
            last_sequence: None,
            cell: Arc::new(AnchorCell::default()),
            feedback: None,
            published: 0,
        }
    }

    /// Track a device sync-feedback stream alongside the anchors
    pub fn enable_feedback(&mut self, nominal_rate: u32, report_interval_ms: u32) {
        self.feedback = Some(FeedbackTracker::new(nominal_rate, report_interval_ms, &self.settings));
    }

    /// Stop tracking sync feedback, e.g. after switching to an endpoint without it
    pub fn disable_feedback(&mut self) {
        if self.feedback.take().is_some() {
            tracing::debug!("Sync feedback tracking disabled");
        }
    }

    /// Feed a raw feedback report; returns the measured device rate once locked
    pub fn observe_feedback(&mut self, report: &[u8]) -> Option<u32> {
        self.feedback.as_mut().and_then(|tracker| tracker.observe(report))
    }

    pub fn device_rate_hz(&self) -> Option<u32> {
        self.feedback.as_ref().and_then(FeedbackTracker::device_rate_hz)
    }

    /// Feed a raw (sequence, wall time) sample
    pub fn observe(&mut self, sequence: u64, wall_time_ns: u64) -> Option<FilterUpdate> {
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                tracing::debug!("Ignoring stale clock sample at sequence {} (last {})", sequence, last);
                return None;
            }
        }
        let steps = match self.last_sequence {
            Some(last) => (sequence - last) as f64 / self.stride as f64,
            None => 1.0,
        };
        self.last_sequence = Some(sequence);

        let base = *self.base_wall_ns.get_or_insert(wall_time_ns);
        let raw = wall_time_ns as f64 - base as f64;
        let update = self.filter.update(raw, steps);

        match update {
            FilterUpdate::Locked { .. } => {
                tracing::info!("Clock recovery locked at sequence {}", sequence);
            }
            FilterUpdate::Rejected { error, .. } => {
                tracing::debug!("Clock sample rejected, error {:.0} ns", error);
            }
            _ => {}
        }

        if let Some(position) = update.position() {
            let anchor = Anchor {
                sequence,
                wall_time_ns: (base as f64 + position).max(0.0).round() as u64,
            };
            self.cell.publish(anchor, self.filter.velocity() / self.stride as f64);
            self.published += 1;
        }
        Some(update)
    }

    pub fn estimate_wall_time(&self, sequence: u64) -> Result<u64, ClockError> {
        self.reader().estimate_wall_time(sequence)
    }

    pub fn reader(&self) -> AnchorReader {
        AnchorReader {
            cell: self.cell.clone(),
        }
    }

    pub fn state(&self) -> FilterState {
        self.filter.state()
    }

    pub fn is_locked(&self) -> bool {
        self.filter.is_locked()
    }

    pub fn anchors_published(&self) -> u64 {
        self.published
    }

    pub fn rejected_count(&self) -> u64 {
        self.filter.rejected_count()
    }

    /// Forget all samples; readers see `NoAnchor` until relock
    pub fn reset(&mut self) {
        self.filter.reset();
        self.base_wall_ns = None;
        self.last_sequence = None;
        if let Some(tracker) = self.feedback.as_mut() {
            tracker.reset();
        }
        self.cell.clear();
    }
}
