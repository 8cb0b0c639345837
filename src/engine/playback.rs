//! Playback path: sizing and filling outgoing frame lists

use crate::audio::ledger::FrameSizeLedger;
use crate::audio::sample_buffer::{SharedSampleBuffer, StoreOutcome};
use crate::clock::AnchorReader;
use crate::engine::{DirectionState, PositionRef, SlotMark};
use crate::transport::{PacketStatus, WrapMarker};

/// Fill `slot` from the playback buffer, one ledger entry per packet
///
/// A slot still holding a payload that never went out is left as is.
pub(crate) fn prepare(dir: &mut DirectionState, slot: usize, ledger: &mut FrameSizeLedger) {
    let bytes_per_frame = dir.config.bytes_per_frame;
    let max_frames = (dir.config.max_packet_bytes / bytes_per_frame) as u32;
    let frame_list = dir.scheduler.frame_list(slot).clone();
    let mut list = frame_list.lock();
    if list.is_prepared() {
        return;
    }
    let buffer_handle = dir.buffer.clone();
    let mut buffer = buffer_handle.lock();

    let mut marker = None;
    let mut wrap_count = 0;
    for index in 0..list.packet_count() {
        let mut frames = ledger.pop();
        if frames > max_frames {
            tracing::debug!("Clamping playback packet from {} to {} frames", frames, max_frames);
            dir.stats.clamped_packets += 1;
            frames = max_frames;
        }
        let bytes = frames as usize * bytes_per_frame;

        let outcome = buffer.consume_into(&mut list.packet_buffer_mut(index)[..bytes]);
        list.packet_mut(index).requested_bytes = bytes;
        if outcome.underrun_bytes > 0 {
            dir.stats.underruns += 1;
        }
        if outcome.wrapped && marker.is_none() {
            marker = Some(WrapMarker {
                packet: index,
                pre_wrap: outcome.pre_wrap,
                packet_bytes: bytes,
            });
            wrap_count = buffer.read_wrap_count();
        }
    }

    list.set_wrap_marker(marker);
    list.set_prepared(true);
    dir.slot_marks[slot] = SlotMark {
        end_bytes: buffer.total_read(),
        wrap_count,
    };
}

/// Account for a successfully sent frame list
pub(crate) fn complete(dir: &mut DirectionState, slot: usize, anchors: &AnchorReader) {
    let (first_sequence, packets, marker) = {
        let list = dir.scheduler.frame_list(slot).lock();
        for packet in list.packets() {
            if packet.status == PacketStatus::Complete {
                dir.stats.bytes += packet.actual_bytes as u64;
            } else {
                dir.stats.packet_errors += 1;
            }
        }
        (list.first_sequence(), list.packet_count() as u64, list.wrap_marker())
    };
    dir.stats.packets += packets;

    let mark = dir.slot_marks[slot];
    dir.position = Some(PositionRef {
        total_bytes: mark.end_bytes,
        sequence: (first_sequence + packets) as f64,
    });

    if let Some(marker) = marker {
        let fraction = if marker.packet_bytes == 0 {
            0.0
        } else {
            marker.pre_wrap as f64 / marker.packet_bytes as f64
        };
        let position = (first_sequence + marker.packet as u64) as f64 + fraction;
        dir.record_wrap(position, mark.wrap_count, anchors);
    }
}

/// Host-side push handle for playback audio
#[derive(Debug, Clone)]
pub struct PlaybackWriter {
    buffer: SharedSampleBuffer,
}

impl PlaybackWriter {
    pub(crate) fn new(buffer: SharedSampleBuffer) -> Self {
        Self { buffer }
    }

    /// Queue bytes for playback; the oldest unplayed bytes are dropped on overrun
    pub fn write(&self, src: &[u8]) -> StoreOutcome {
        self.buffer.lock().store_bytes(src)
    }

    pub fn vacant(&self) -> usize {
        self.buffer.lock().vacant()
    }

    /// Host write offset in bytes
    pub fn cursor(&self) -> usize {
        self.buffer.lock().write_offset()
    }
}
