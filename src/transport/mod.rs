//! Transport boundary
//!
//! The host controller driver is an external collaborator. It accepts frame
//! lists for isochronous reads and writes and reports completions as
//! messages on a channel owned by the streaming engine. Frame lists and
//! their payload areas are preallocated per direction and reused in place.

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::config::StreamConfig;
use crate::error::TransportError;
use crate::StreamDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    Pending,
    Complete,
    Error,
}

/// One isochronous packet slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescriptor {
    pub requested_bytes: usize,
    pub actual_bytes: usize,
    pub status: PacketStatus,
    /// Estimated wall time of the packet, filled on completion when known
    pub capture_timestamp: Option<u64>,
}

impl PacketDescriptor {
    fn idle() -> Self {
        Self {
            requested_bytes: 0,
            actual_bytes: 0,
            status: PacketStatus::Pending,
            capture_timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameListState {
    Idle,
    Submitted,
    Completing,
}

/// Packet index and split point of a playback buffer wrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapMarker {
    pub packet: usize,
    pub pre_wrap: usize,
    pub packet_bytes: usize,
}

/// A batch of packets submitted as one transfer
#[derive(Debug)]
pub struct FrameList {
    index: usize,
    direction: StreamDirection,
    state: FrameListState,
    first_sequence: u64,
    packets: Vec<PacketDescriptor>,
    /// Payload area, `max_packet_bytes` per packet
    data: Vec<u8>,
    packet_stride: usize,
    wrap: Option<WrapMarker>,
    /// Playback payload filled and not yet sent
    prepared: bool,
}

impl FrameList {
    fn new(index: usize, direction: StreamDirection, config: &StreamConfig) -> Self {
        Self {
            index,
            direction,
            state: FrameListState::Idle,
            first_sequence: 0,
            packets: vec![PacketDescriptor::idle(); config.packets_per_frame_list],
            data: vec![0u8; config.frame_list_bytes()],
            packet_stride: config.max_packet_bytes,
            wrap: None,
            prepared: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn state(&self) -> FrameListState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: FrameListState) {
        self.state = state;
    }

    /// Bus sequence number of the first packet
    pub fn first_sequence(&self) -> u64 {
        self.first_sequence
    }

    pub(crate) fn set_first_sequence(&mut self, sequence: u64) {
        self.first_sequence = sequence;
    }

    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    pub fn packet(&self, index: usize) -> &PacketDescriptor {
        &self.packets[index]
    }

    pub fn packets(&self) -> &[PacketDescriptor] {
        &self.packets
    }

    pub(crate) fn packet_mut(&mut self, index: usize) -> &mut PacketDescriptor {
        &mut self.packets[index]
    }

    /// Bytes the packet actually carried
    pub fn packet_data(&self, index: usize) -> &[u8] {
        let start = index * self.packet_stride;
        let len = self.packets[index].actual_bytes.min(self.packet_stride);
        &self.data[start..start + len]
    }

    /// Bytes requested for an outgoing packet
    pub fn requested_data(&self, index: usize) -> &[u8] {
        let start = index * self.packet_stride;
        let len = self.packets[index].requested_bytes.min(self.packet_stride);
        &self.data[start..start + len]
    }

    /// Whole payload slot of a packet
    pub fn packet_buffer_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.packet_stride;
        &mut self.data[start..start + self.packet_stride]
    }

    pub fn max_packet_bytes(&self) -> usize {
        self.packet_stride
    }

    /// Transport-side: record the outcome of one packet
    pub fn complete_packet(&mut self, index: usize, actual_bytes: usize, status: PacketStatus) {
        let packet = &mut self.packets[index];
        packet.actual_bytes = actual_bytes.min(self.packet_stride);
        packet.status = status;
    }

    pub fn wrap_marker(&self) -> Option<WrapMarker> {
        self.wrap
    }

    pub(crate) fn set_wrap_marker(&mut self, marker: Option<WrapMarker>) {
        self.wrap = marker;
    }

    /// Whether the playback payload is filled and still waiting to go out
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub(crate) fn set_prepared(&mut self, prepared: bool) {
        self.prepared = prepared;
    }

    /// Return every descriptor to pending before reuse
    pub(crate) fn reset_packets(&mut self) {
        for packet in &mut self.packets {
            *packet = PacketDescriptor::idle();
        }
        self.wrap = None;
        self.prepared = false;
    }
}

pub type SharedFrameList = Arc<Mutex<FrameList>>;

/// Fixed pool of frame lists for one direction
#[derive(Debug)]
pub struct FrameListPool {
    lists: Vec<SharedFrameList>,
}

impl FrameListPool {
    pub fn new(direction: StreamDirection, config: &StreamConfig) -> Self {
        let lists = (0..config.frame_lists_in_flight)
            .map(|index| Arc::new(Mutex::new(FrameList::new(index, direction, config))))
            .collect();
        Self { lists }
    }

    pub fn get(&self, slot: usize) -> &SharedFrameList {
        &self.lists[slot]
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    /// Host controller error code
    Error(i32),
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferStatus::Success)
    }
}

/// Raw sync-feedback report piggybacked on a playback completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackReport {
    bytes: [u8; 4],
    len: usize,
}

impl FeedbackReport {
    pub fn new(report: &[u8]) -> Option<Self> {
        if report.len() > 4 {
            return None;
        }
        let mut bytes = [0u8; 4];
        bytes[..report.len()].copy_from_slice(report);
        Some(Self {
            bytes,
            len: report.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Completion message for one frame list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub direction: StreamDirection,
    pub slot: usize,
    pub status: TransferStatus,
    /// Wall time at which the transport observed completion
    pub completed_at_ns: u64,
    pub feedback: Option<FeedbackReport>,
}

pub type CompletionSender = Sender<Completion>;

/// Host controller seam
pub trait Transport: Send + Sync {
    /// Queue a capture frame list; the transport fills payload and descriptors
    fn submit_isochronous_read(
        &self,
        frame_list: SharedFrameList,
        completions: CompletionSender,
    ) -> Result<(), TransportError>;

    /// Queue a playback frame list whose payload is already prepared
    fn submit_isochronous_write(
        &self,
        frame_list: SharedFrameList,
        completions: CompletionSender,
    ) -> Result<(), TransportError>;

    /// Free-running bus frame counter
    fn current_sequence_number(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerSettings;

    #[test]
    fn test_pool_layout() {
        let config = StreamConfig::new(2, 16, 48000, 200, &SchedulerSettings::default()).unwrap();
        let pool = FrameListPool::new(StreamDirection::Capture, &config);
        assert_eq!(pool.len(), config.frame_lists_in_flight);

        let mut list = pool.get(1).lock();
        assert_eq!(list.index(), 1);
        assert_eq!(list.packet_count(), config.packets_per_frame_list);

        list.packet_buffer_mut(2)[..4].copy_from_slice(&[1, 2, 3, 4]);
        list.complete_packet(2, 4, PacketStatus::Complete);
        assert_eq!(list.packet_data(2), &[1, 2, 3, 4]);
        assert!(list.packet_data(1).is_empty());

        list.complete_packet(3, 10_000, PacketStatus::Complete);
        assert_eq!(list.packet(3).actual_bytes, 200);
    }

    #[test]
    fn test_feedback_report_bounds() {
        assert_eq!(FeedbackReport::new(&[1, 2, 3]).unwrap().as_slice(), &[1, 2, 3]);
        assert!(FeedbackReport::new(&[0; 5]).is_none());
    }
}
