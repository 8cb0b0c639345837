//! Transfer scheduling for one stream direction
//!
//! Keeps every frame list of the pool queued at the transport, re-arming
//! each slot as soon as its completion has been processed. Target bus
//! positions advance by one frame list per submission; when the target
//! drifts out of the acceptable lead window (or the transport reports a
//! failure) the target is reset to "now + safety offset" instead of being
//! chased exactly.
//!
//! Slots waiting to go out are parked in order. A slot whose submission
//! was rejected keeps its place at the front, so playback payloads leave
//! in the order they were filled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{SchedulerSettings, StreamConfig};
use crate::error::TransportError;
use crate::transport::{CompletionSender, FrameListPool, FrameListState, SharedFrameList, Transport};
use crate::StreamDirection;

/// What to do with a slot after its completion was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDisposition {
    /// Refill (playback) and send the slot again
    Rearm,
    /// Stop was requested; `complete` once every slot has drained
    Drained { drained: usize, complete: bool },
}

/// Counters since the last `begin`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Frame lists accepted by the transport
    pub submissions: u64,
    /// Times the target was moved back to "now + safety offset"
    pub resyncs: u64,
    /// Rejected submission attempts, retries included
    pub submit_failures: u64,
    /// Completions reporting a failed transfer
    pub failed_completions: u64,
    /// Completions that did not match the oldest queued slot
    pub out_of_order: u64,
}

/// Round-robin submission of one direction's frame list pool
#[derive(Debug)]
pub struct TransferScheduler {
    direction: StreamDirection,
    /// Preallocated frame lists, one per slot
    pool: FrameListPool,
    /// Bus frames covered by one frame list
    packets_per_list: u64,
    /// Lead over the bus counter applied on resync
    safety_offset: u64,
    /// Largest lead accepted before forcing a resync
    hysteresis: u64,
    /// Consecutive failures tolerated before giving up
    retry_budget: u32,
    /// Slots at the transport in submission order; the front completes next
    queued: VecDeque<usize>,
    /// Target sequence for the next submission
    next_sequence: u64,
    /// Resync on the next submission
    resync_pending: bool,
    /// Slots submitted and not yet released by `finish_completion`
    in_flight: usize,
    /// Slots waiting to be sent, oldest first
    parked: VecDeque<usize>,
    /// Slots released since stop was requested
    drained: usize,
    /// Consecutive submissions that failed twice
    submit_failures: u32,
    /// Consecutive failed completions
    failed_completions: u32,
    /// Shared stop request; set once no slot should be re-armed
    stop: Arc<AtomicBool>,
    stats: SchedulerStats,
}

impl TransferScheduler {
    pub fn new(
        direction: StreamDirection,
        config: &StreamConfig,
        settings: &SchedulerSettings,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let packets_per_list = config.packets_per_frame_list as u64;
        let full_lead = packets_per_list * config.frame_lists_in_flight as u64 + settings.safety_offset;
        Self {
            direction,
            pool: FrameListPool::new(direction, config),
            packets_per_list,
            safety_offset: settings.safety_offset,
            // Never narrower than the lead a full pool legitimately builds up
            hysteresis: settings.resync_hysteresis.max(full_lead),
            retry_budget: settings.retry_budget,
            queued: VecDeque::with_capacity(config.frame_lists_in_flight),
            next_sequence: 0,
            resync_pending: false,
            in_flight: 0,
            parked: VecDeque::with_capacity(config.frame_lists_in_flight),
            drained: 0,
            submit_failures: 0,
            failed_completions: 0,
            stop,
            stats: SchedulerStats::default(),
        }
    }

    /// Reset bookkeeping and place the first target ahead of the bus
    pub fn begin(&mut self, transport: &dyn Transport) -> u64 {
        self.next_sequence = transport.current_sequence_number() + self.safety_offset;
        self.queued.clear();
        self.resync_pending = false;
        self.in_flight = 0;
        self.parked.clear();
        self.drained = 0;
        self.submit_failures = 0;
        self.failed_completions = 0;
        self.stats = SchedulerStats::default();
        for slot in 0..self.pool.len() {
            let mut list = self.pool.get(slot).lock();
            list.reset_packets();
            list.set_state(FrameListState::Idle);
        }
        self.next_sequence
    }

    pub fn frame_list(&self, slot: usize) -> &SharedFrameList {
        self.pool.get(slot)
    }

    pub fn slot_count(&self) -> usize {
        self.pool.len()
    }

    /// Queue a slot behind any already waiting to be sent
    pub fn park(&mut self, slot: usize) {
        self.pool.get(slot).lock().set_state(FrameListState::Idle);
        if !self.parked.contains(&slot) {
            self.parked.push_back(slot);
        }
    }

    /// Oldest parked slot; `None` once stop was requested
    pub fn next_parked(&self) -> Option<usize> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        self.parked.front().copied()
    }

    pub fn has_parked(&self) -> bool {
        !self.parked.is_empty()
    }

    /// Submit a slot whose payload (playback) is already prepared
    ///
    /// A rejected submission is retried once after a resync. If that also
    /// fails the slot stays parked in its place for a later attempt.
    pub fn submit(
        &mut self,
        slot: usize,
        transport: &dyn Transport,
        completions: &CompletionSender,
    ) -> Result<u64, TransportError> {
        let mut last_error = None;
        for attempt in 0..2 {
            if attempt > 0 {
                self.resync_pending = true;
            }
            let first_sequence = self.target_sequence(transport);
            {
                let mut list = self.pool.get(slot).lock();
                list.set_first_sequence(first_sequence);
                list.set_state(FrameListState::Submitted);
            }

            let frame_list = self.pool.get(slot).clone();
            let result = match self.direction {
                StreamDirection::Capture => transport.submit_isochronous_read(frame_list, completions.clone()),
                StreamDirection::Playback => transport.submit_isochronous_write(frame_list, completions.clone()),
            };

            match result {
                Ok(()) => {
                    self.next_sequence = first_sequence + self.packets_per_list;
                    self.in_flight += 1;
                    self.queued.push_back(slot);
                    self.parked.retain(|&parked| parked != slot);
                    self.stats.submissions += 1;
                    self.submit_failures = 0;
                    tracing::trace!("{:?} slot {} queued at sequence {}", self.direction, slot, first_sequence);
                    return Ok(first_sequence);
                }
                Err(e) => {
                    tracing::warn!("{:?} slot {} submission failed: {}", self.direction, slot, e);
                    self.stats.submit_failures += 1;
                    last_error = Some(e);
                }
            }
        }

        self.park(slot);
        self.submit_failures += 1;
        if self.submit_failures > self.retry_budget {
            return Err(TransportError::RetryBudgetExhausted {
                direction: self.direction,
                failures: self.submit_failures,
            });
        }
        Err(last_error.unwrap_or(TransportError::Disconnected))
    }

    fn target_sequence(&mut self, transport: &dyn Transport) -> u64 {
        let now = transport.current_sequence_number();
        let in_window = self.next_sequence > now && self.next_sequence - now <= self.hysteresis;
        if self.resync_pending || !in_window {
            let target = now + self.safety_offset;
            tracing::warn!(
                "{:?} resync: target {} -> {} (bus at {})",
                self.direction,
                self.next_sequence,
                target,
                now
            );
            self.next_sequence = target;
            self.resync_pending = false;
            self.stats.resyncs += 1;
        }
        self.next_sequence
    }

    /// Mark a slot as receiving its completion
    ///
    /// A failed transfer schedules a resync; too many in a row exhaust the
    /// retry budget.
    pub fn begin_completion(&mut self, slot: usize, failed: bool) -> Result<(), TransportError> {
        if self.queued.front() == Some(&slot) {
            self.queued.pop_front();
        } else {
            tracing::warn!(
                "{:?} completion for slot {} while slot {:?} was oldest",
                self.direction,
                slot,
                self.queued.front()
            );
            self.stats.out_of_order += 1;
            self.queued.retain(|&queued| queued != slot);
        }
        self.pool.get(slot).lock().set_state(FrameListState::Completing);

        if failed {
            self.stats.failed_completions += 1;
            self.failed_completions += 1;
            self.resync_pending = true;
            if self.failed_completions > self.retry_budget {
                return Err(TransportError::RetryBudgetExhausted {
                    direction: self.direction,
                    failures: self.failed_completions,
                });
            }
        } else {
            self.failed_completions = 0;
        }
        Ok(())
    }

    /// Release a processed slot and decide whether it goes back out
    pub fn finish_completion(&mut self, slot: usize) -> SlotDisposition {
        {
            let mut list = self.pool.get(slot).lock();
            list.set_state(FrameListState::Idle);
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        if self.stop.load(Ordering::Acquire) {
            self.drained += 1;
            tracing::debug!("{:?} drained slot {} ({} left in flight)", self.direction, slot, self.in_flight);
            return SlotDisposition::Drained {
                drained: self.drained,
                complete: self.in_flight == 0,
            };
        }

        self.pool.get(slot).lock().reset_packets();
        SlotDisposition::Rearm
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_drained(&self) -> bool {
        self.in_flight == 0
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }
}
