//! In-memory transport with a virtual bus clock
//!
//! Stands in for a host controller in tests and in the demo binary. Frame
//! lists complete in submission order per direction; across directions the
//! list with the earlier bus position completes first. The bus counter
//! advances to the end of each completed list.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::TransportError;
use crate::transport::{
    Completion, CompletionSender, FeedbackReport, PacketStatus, SharedFrameList, TransferStatus,
    Transport,
};
use crate::StreamDirection;

struct PendingTransfer {
    frame_list: SharedFrameList,
    completions: CompletionSender,
    first_sequence: u64,
    packets: usize,
}

struct SimState {
    sequence: u64,
    ns_per_sequence: u64,
    jitter_ns: u64,
    capture: VecDeque<PendingTransfer>,
    playback: VecDeque<PendingTransfer>,
    bytes_per_frame: usize,
    cadence: Vec<u32>,
    cadence_index: usize,
    pattern_byte: u8,
    feedback: Option<FeedbackReport>,
    failing_submissions: u32,
    record_playback: bool,
    played: Vec<u8>,
    submissions: u64,
    completions: u64,
}

/// Host controller stand-in; frame lists complete only when told to
pub struct SimTransport {
    state: Mutex<SimState>,
}

impl SimTransport {
    /// Bus counter starts at `start_sequence`; one sequence unit is 1 ms
    pub fn new(start_sequence: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                sequence: start_sequence,
                ns_per_sequence: crate::constants::BUS_FRAME_NS,
                jitter_ns: 0,
                capture: VecDeque::new(),
                playback: VecDeque::new(),
                bytes_per_frame: 4,
                cadence: vec![48],
                cadence_index: 0,
                pattern_byte: 0,
                feedback: None,
                failing_submissions: 0,
                record_playback: false,
                played: Vec::new(),
                submissions: 0,
                completions: 0,
            }),
        }
    }

    /// Frames delivered per capture packet, cycled
    pub fn set_capture_cadence(&self, bytes_per_frame: usize, cadence: Vec<u32>) {
        let mut state = self.state.lock();
        state.bytes_per_frame = bytes_per_frame;
        state.cadence = if cadence.is_empty() { vec![0] } else { cadence };
        state.cadence_index = 0;
    }

    /// Peak deviation added to completion timestamps
    pub fn set_jitter_ns(&self, jitter_ns: u64) {
        self.state.lock().jitter_ns = jitter_ns;
    }

    /// Feedback report attached to every playback completion
    pub fn set_feedback_report(&self, report: Option<&[u8]>) {
        self.state.lock().feedback = report.and_then(FeedbackReport::new);
    }

    /// Reject the next `count` submissions
    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().failing_submissions = count;
    }

    pub fn record_playback(&self, enabled: bool) {
        self.state.lock().record_playback = enabled;
    }

    /// Playback bytes delivered so far, draining the record
    pub fn take_played(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().played)
    }

    /// Jump the bus counter forward, as if the host fell behind
    pub fn advance_sequence(&self, units: u64) {
        self.state.lock().sequence += units;
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state.capture.len() + state.playback.len()
    }

    pub fn pending(&self, direction: StreamDirection) -> usize {
        let state = self.state.lock();
        match direction {
            StreamDirection::Capture => state.capture.len(),
            StreamDirection::Playback => state.playback.len(),
        }
    }

    pub fn submission_count(&self) -> u64 {
        self.state.lock().submissions
    }

    pub fn completion_count(&self) -> u64 {
        self.state.lock().completions
    }

    /// Complete the earliest outstanding frame list successfully
    pub fn complete_next(&self) -> Option<(StreamDirection, usize)> {
        self.finish_next(TransferStatus::Success)
    }

    /// Complete the earliest outstanding frame list with an error status
    pub fn fail_next(&self) -> Option<(StreamDirection, usize)> {
        self.finish_next(TransferStatus::Error(-71))
    }

    /// Complete outstanding frame lists until none remain or `limit` is hit
    pub fn complete_all(&self, limit: usize) -> usize {
        let mut done = 0;
        while done < limit && self.complete_next().is_some() {
            done += 1;
        }
        done
    }

    fn finish_next(&self, status: TransferStatus) -> Option<(StreamDirection, usize)> {
        let (direction, transfer, completed_at_ns, feedback, frames, bytes_per_frame) = {
            let mut state = self.state.lock();
            let direction = match (state.capture.front(), state.playback.front()) {
                (Some(c), Some(p)) if p.first_sequence < c.first_sequence => StreamDirection::Playback,
                (Some(_), _) => StreamDirection::Capture,
                (None, Some(_)) => StreamDirection::Playback,
                (None, None) => return None,
            };
            let transfer = match direction {
                StreamDirection::Capture => state.capture.pop_front()?,
                StreamDirection::Playback => state.playback.pop_front()?,
            };

            let packets = transfer.packets;
            let end = transfer.first_sequence + packets as u64;
            state.sequence = state.sequence.max(end);
            state.completions += 1;

            let jitter = jitter(state.completions, state.jitter_ns);
            let completed_at_ns = (state.sequence * state.ns_per_sequence) as i64 + jitter;

            let frames: Vec<u32> = if direction == StreamDirection::Capture {
                (0..packets)
                    .map(|_| {
                        let frames = state.cadence[state.cadence_index % state.cadence.len()];
                        state.cadence_index += 1;
                        frames
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let feedback = match direction {
                StreamDirection::Playback => state.feedback,
                StreamDirection::Capture => None,
            };
            (
                direction,
                transfer,
                completed_at_ns.max(0) as u64,
                feedback,
                frames,
                state.bytes_per_frame,
            )
        };

        let slot = {
            let mut list = transfer.frame_list.lock();
            let failed = !status.is_success();
            for index in 0..list.packet_count() {
                match direction {
                    StreamDirection::Capture => {
                        let bytes = (frames[index] as usize * bytes_per_frame).min(list.max_packet_bytes());
                        if !failed {
                            let mut state = self.state.lock();
                            for byte in &mut list.packet_buffer_mut(index)[..bytes] {
                                *byte = state.pattern_byte;
                                state.pattern_byte = state.pattern_byte.wrapping_add(1);
                            }
                        }
                        let (actual, packet_status) = if failed {
                            (0, PacketStatus::Error)
                        } else {
                            (bytes, PacketStatus::Complete)
                        };
                        list.complete_packet(index, actual, packet_status);
                    }
                    StreamDirection::Playback => {
                        let requested = list.packet(index).requested_bytes;
                        if failed {
                            list.complete_packet(index, 0, PacketStatus::Error);
                        } else {
                            let mut state = self.state.lock();
                            if state.record_playback {
                                state.played.extend_from_slice(list.requested_data(index));
                            }
                            drop(state);
                            list.complete_packet(index, requested, PacketStatus::Complete);
                        }
                    }
                }
            }
            list.index()
        };

        let completion = Completion {
            direction,
            slot,
            status,
            completed_at_ns,
            feedback,
        };
        if transfer.completions.send(completion).is_err() {
            tracing::debug!("Completion receiver gone, dropping {:?} slot {}", direction, slot);
        }
        Some((direction, slot))
    }

    fn submit(
        &self,
        direction: StreamDirection,
        frame_list: SharedFrameList,
        completions: CompletionSender,
    ) -> Result<(), TransportError> {
        let (slot, first_sequence, packets) = {
            let list = frame_list.lock();
            (list.index(), list.first_sequence(), list.packet_count())
        };

        let mut state = self.state.lock();
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(TransportError::SubmitFailed {
                direction,
                slot,
                reason: "simulated rejection".into(),
            });
        }

        state.submissions += 1;
        let transfer = PendingTransfer {
            frame_list,
            completions,
            first_sequence,
            packets,
        };
        match direction {
            StreamDirection::Capture => state.capture.push_back(transfer),
            StreamDirection::Playback => state.playback.push_back(transfer),
        }
        Ok(())
    }
}

impl Transport for SimTransport {
    fn submit_isochronous_read(
        &self,
        frame_list: SharedFrameList,
        completions: CompletionSender,
    ) -> Result<(), TransportError> {
        self.submit(StreamDirection::Capture, frame_list, completions)
    }

    fn submit_isochronous_write(
        &self,
        frame_list: SharedFrameList,
        completions: CompletionSender,
    ) -> Result<(), TransportError> {
        self.submit(StreamDirection::Playback, frame_list, completions)
    }

    fn current_sequence_number(&self) -> u64 {
        self.state.lock().sequence
    }
}

/// Deterministic pseudo-random offset in [-amplitude, amplitude]
fn jitter(n: u64, amplitude: u64) -> i64 {
    if amplitude == 0 {
        return 0;
    }
    let mut x = n.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    x ^= x >> 33;
    (x % (2 * amplitude + 1)) as i64 - amplitude as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchedulerSettings, StreamConfig};
    use crate::transport::FrameListPool;

    #[test]
    fn test_capture_fill_follows_cadence() {
        let sim = SimTransport::new(100);
        sim.set_capture_cadence(4, vec![2, 3]);
        let config = StreamConfig::new(2, 16, 48000, 200, &SchedulerSettings::default()).unwrap();
        let pool = FrameListPool::new(StreamDirection::Capture, &config);
        let (tx, rx) = crossbeam_channel::unbounded();

        pool.get(0).lock().set_first_sequence(104);
        sim.submit_isochronous_read(pool.get(0).clone(), tx).unwrap();
        assert_eq!(sim.complete_next(), Some((StreamDirection::Capture, 0)));

        let completion = rx.try_recv().unwrap();
        assert!(completion.status.is_success());
        let end = 104 + config.packets_per_frame_list as u64;
        assert_eq!(sim.current_sequence_number(), end);
        assert_eq!(completion.completed_at_ns, end * 1_000_000);

        let list = pool.get(0).lock();
        assert_eq!(list.packet(0).actual_bytes, 8);
        assert_eq!(list.packet(1).actual_bytes, 12);
        assert_eq!(list.packet_data(1)[0], 8);
    }

    #[test]
    fn test_rejected_submission() {
        let sim = SimTransport::new(0);
        sim.fail_next_submissions(1);
        let config = StreamConfig::new(2, 16, 48000, 200, &SchedulerSettings::default()).unwrap();
        let pool = FrameListPool::new(StreamDirection::Playback, &config);
        let (tx, _rx) = crossbeam_channel::unbounded();

        assert!(sim.submit_isochronous_write(pool.get(0).clone(), tx.clone()).is_err());
        assert!(sim.submit_isochronous_write(pool.get(0).clone(), tx).is_ok());
        assert_eq!(sim.pending(StreamDirection::Playback), 1);
    }

    #[test]
    fn test_jitter_bounds() {
        for n in 0..1000 {
            assert!(jitter(n, 50).abs() <= 50);
        }
        assert_eq!(jitter(7, 0), 0);
    }
}
