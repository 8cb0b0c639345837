//! Capture path: completed frame lists into the capture sample buffer

use crate::audio::ledger::FrameSizeLedger;
use crate::audio::sample_buffer::SharedSampleBuffer;
use crate::clock::AnchorReader;
use crate::engine::{DirectionState, PositionRef};
use crate::transport::PacketStatus;

/// Move every delivered packet of `slot` into the sample buffer
///
/// Frame counts go to the ledger when one is given. Packets get a wall-time
/// estimate once the clock has an anchor.
pub(crate) fn absorb(
    dir: &mut DirectionState,
    slot: usize,
    mut ledger: Option<&mut FrameSizeLedger>,
    anchors: &AnchorReader,
) {
    let bytes_per_frame = dir.config.bytes_per_frame;
    let frame_list = dir.scheduler.frame_list(slot).clone();
    let buffer_handle = dir.buffer.clone();
    let mut list = frame_list.lock();
    let mut buffer = buffer_handle.lock();
    let first_sequence = list.first_sequence();

    for index in 0..list.packet_count() {
        let packet = *list.packet(index);
        let sequence = first_sequence + index as u64;
        dir.stats.packets += 1;
        if packet.status != PacketStatus::Complete {
            dir.stats.packet_errors += 1;
            continue;
        }
        if packet.actual_bytes == 0 {
            continue;
        }
        if packet.actual_bytes % bytes_per_frame != 0 {
            tracing::debug!(
                "Capture packet at sequence {} carried a partial frame ({} bytes)",
                sequence,
                packet.actual_bytes
            );
            dir.stats.partial_frames += 1;
        }

        if let Some(ledger) = ledger.as_deref_mut() {
            ledger.push((packet.actual_bytes / bytes_per_frame) as u32);
        }

        let outcome = buffer.store_bytes(list.packet_data(index));
        dir.stats.bytes += packet.actual_bytes as u64;
        if outcome.overrun {
            dir.stats.overruns += 1;
        }
        if outcome.wrapped {
            let position = sequence as f64 + outcome.pre_wrap as f64 / packet.actual_bytes as f64;
            dir.record_wrap(position, buffer.wrap_count(), anchors);
        }

        list.packet_mut(index).capture_timestamp = anchors.estimate_wall_time(sequence).ok();
        dir.position = Some(PositionRef {
            total_bytes: buffer.total_written(),
            sequence: (sequence + 1) as f64,
        });
    }
}

/// Host-side pull handle for captured audio
#[derive(Debug, Clone)]
pub struct CaptureReader {
    buffer: SharedSampleBuffer,
}

impl CaptureReader {
    pub(crate) fn new(buffer: SharedSampleBuffer) -> Self {
        Self { buffer }
    }

    /// Copy and consume up to `dst.len()` captured bytes
    pub fn read(&self, dst: &mut [u8]) -> usize {
        self.buffer.lock().read_into(dst)
    }

    /// Copy unread bytes without consuming them
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let buffer = self.buffer.lock();
        let n = dst.len().min(buffer.available());
        let (head, tail) = buffer.peek_range(buffer.read_offset(), n);
        dst[..head.len()].copy_from_slice(head);
        dst[head.len()..head.len() + tail.len()].copy_from_slice(tail);
        head.len() + tail.len()
    }

    pub fn available(&self) -> usize {
        self.buffer.lock().available()
    }

    /// Host read offset in bytes
    pub fn cursor(&self) -> usize {
        self.buffer.lock().read_offset()
    }
}
