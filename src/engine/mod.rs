//! Streaming engine
//!
//! Owns the per-direction schedulers and sample buffers, the frame size
//! ledger and clock recovery. Completions arrive as messages; every state
//! change happens on the thread that calls `start`, `process_pending` or
//! `drain_blocking`. Host-side readers and writers only touch the sample
//! buffers.

mod capture;
mod playback;

pub use capture::CaptureReader;
pub use playback::PlaybackWriter;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::buffer::{RingBuffer, SharedRingBuffer};
use crate::audio::device::CapabilitySource;
use crate::audio::format::{FormatNegotiator, FormatRequest, NegotiatedFormat};
use crate::audio::ledger::FrameSizeLedger;
use crate::audio::sample_buffer::{create_shared_sample_buffer, SharedSampleBuffer};
use crate::clock::{AnchorReader, ClockRecovery};
use crate::config::{EngineSettings, StreamConfig};
use crate::error::{ClockError, ConfigError, EngineError, Error, Result, TransportError};
use crate::scheduler::{SchedulerStats, SlotDisposition, TransferScheduler};
use crate::transport::{Completion, Transport};
use crate::StreamDirection;

/// Stream lifecycle; `Stopping` lasts until every queued transfer is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Wall-clock estimate recorded when a sample buffer wraps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WrapStamp {
    pub direction: StreamDirection,
    /// Bus sequence position of the wrapping byte, fractional within a packet
    pub sequence_position: f64,
    /// `None` when the clock had no anchor yet
    pub wall_time_ns: Option<u64>,
    pub wrap_count: u64,
}

/// Per-direction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub packet_errors: u64,
    pub partial_frames: u64,
    pub clamped_packets: u64,
    pub overruns: u64,
    pub underruns: u64,
    pub transfer_failures: u64,
    pub wraps: u64,
    pub untimed_wraps: u64,
    pub dropped_stamps: u64,
    pub in_flight: usize,
    pub buffered_bytes: usize,
    pub scheduler: SchedulerStats,
}

/// Snapshot of engine, clock and ledger counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub state: EngineState,
    pub capture: Option<DirectionStats>,
    pub playback: Option<DirectionStats>,
    pub clock_locked: bool,
    pub anchors_published: u64,
    pub clock_rejections: u64,
    pub device_rate_hz: Option<u32>,
    pub ledger_rate_hz: u32,
    pub ledger_fallbacks: u64,
    pub ledger_dropped: u64,
}

/// Total buffer bytes at a known bus position
#[derive(Debug, Clone, Copy)]
pub(crate) struct PositionRef {
    pub total_bytes: u64,
    pub sequence: f64,
}

/// Playback buffer position reached when a slot was prepared
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SlotMark {
    pub end_bytes: u64,
    pub wrap_count: u64,
}

pub(crate) struct DirectionState {
    direction: StreamDirection,
    config: StreamConfig,
    scheduler: TransferScheduler,
    buffer: SharedSampleBuffer,
    wrap_stamps: SharedRingBuffer<WrapStamp>,
    slot_marks: Vec<SlotMark>,
    position: Option<PositionRef>,
    stats: DirectionStats,
}

impl DirectionState {
    fn new(direction: StreamDirection, config: StreamConfig, settings: &EngineSettings, stop: Arc<AtomicBool>) -> Self {
        let scheduler = TransferScheduler::new(direction, &config, &settings.scheduler, stop);
        let buffer_bytes = config.sample_buffer_bytes(settings.buffer.frame_lists_per_buffer.max(1));
        Self {
            direction,
            config,
            slot_marks: vec![SlotMark::default(); scheduler.slot_count()],
            scheduler,
            buffer: create_shared_sample_buffer(buffer_bytes),
            wrap_stamps: Arc::new(RingBuffer::new(settings.buffer.wrap_stamp_capacity.max(2))),
            position: None,
            stats: DirectionStats::default(),
        }
    }

    fn reset_for_start(&mut self) {
        self.stats = DirectionStats::default();
        self.position = None;
        self.slot_marks.fill(SlotMark::default());
        while self.wrap_stamps.try_pop().is_some() {}
    }

    fn record_wrap(&mut self, position: f64, wrap_count: u64, anchors: &AnchorReader) {
        let wall_time_ns = match anchors.estimate_at(position) {
            Ok(time) => Some(time),
            Err(e) => {
                tracing::debug!("{:?} wrap at {:.3} left untimed: {}", self.direction, position, e);
                self.stats.untimed_wraps += 1;
                None
            }
        };
        self.stats.wraps += 1;
        let stamp = WrapStamp {
            direction: self.direction,
            sequence_position: position,
            wall_time_ns,
            wrap_count,
        };
        if self.wrap_stamps.push(stamp).is_err() {
            self.stats.dropped_stamps += 1;
        }
    }

    /// Send parked slots in order, filling playback payloads first
    ///
    /// A rejected slot keeps its payload and its place at the front. With
    /// nothing in flight no completion will prompt a later attempt, so it is
    /// retried at once until it goes out or the retry budget runs out.
    fn send_parked(
        &mut self,
        transport: &dyn Transport,
        completions: &Sender<Completion>,
        ledger: &mut FrameSizeLedger,
    ) -> Result<()> {
        while let Some(slot) = self.scheduler.next_parked() {
            if self.direction == StreamDirection::Playback {
                playback::prepare(self, slot, ledger);
            }
            match self.scheduler.submit(slot, transport, completions) {
                Ok(_) => {}
                Err(e @ TransportError::RetryBudgetExhausted { .. }) => return Err(e.into()),
                Err(e) => {
                    tracing::warn!("{:?} slot {} parked: {}", self.direction, slot, e);
                    if self.scheduler.in_flight() > 0 {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> DirectionStats {
        DirectionStats {
            in_flight: self.scheduler.in_flight(),
            buffered_bytes: self.buffer.lock().available(),
            scheduler: self.scheduler.stats(),
            ..self.stats
        }
    }
}

/// Isochronous streaming for one device's capture and playback endpoints
pub struct StreamingEngine {
    transport: Arc<dyn Transport>,
    settings: EngineSettings,
    state: EngineState,
    /// `None` until a format is installed for the direction
    capture: Option<DirectionState>,
    playback: Option<DirectionState>,
    /// Capture frame counts that size playback packets
    ledger: FrameSizeLedger,
    clock: ClockRecovery,
    anchors: AnchorReader,
    /// Last device rate pushed into the ledger
    feedback_rate: Option<u32>,
    /// Shared with both schedulers; set to stop re-arming
    stop: Arc<AtomicBool>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
}

impl StreamingEngine {
    pub fn new(transport: Arc<dyn Transport>, settings: EngineSettings) -> Self {
        let clock = ClockRecovery::new(&settings.clock, settings.scheduler.packets_per_frame_list as u64);
        let anchors = clock.reader();
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
        Self {
            transport,
            ledger: FrameSizeLedger::new(settings.buffer.ledger_capacity.max(1), crate::constants::DEFAULT_SAMPLE_RATE),
            settings,
            state: EngineState::Stopped,
            capture: None,
            playback: None,
            clock,
            anchors,
            feedback_rate: None,
            stop: Arc::new(AtomicBool::new(true)),
            completion_tx,
            completion_rx,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Install a new format for one direction; only allowed while stopped
    ///
    /// Handles returned earlier by `capture_reader`/`playback_writer` keep
    /// pointing at the replaced buffer.
    pub fn notify_format_changed(&mut self, direction: StreamDirection, config: StreamConfig) -> Result<()> {
        if self.state != EngineState::Stopped {
            return Err(EngineError::InvalidState(self.state).into());
        }
        config.validate()?;
        if config.packets_per_frame_list != self.settings.scheduler.packets_per_frame_list {
            return Err(ConfigError::InvalidStream(format!(
                "{} packets per frame list, engine clock expects {}",
                config.packets_per_frame_list, self.settings.scheduler.packets_per_frame_list
            ))
            .into());
        }

        tracing::info!(
            "{:?} format: {}ch {}-bit {} Hz, max packet {} bytes",
            direction,
            config.channel_count,
            config.bits_per_sample,
            config.sample_rate,
            config.max_packet_bytes
        );
        let state = DirectionState::new(direction, config, &self.settings, self.stop.clone());
        match direction {
            StreamDirection::Capture => self.capture = Some(state),
            StreamDirection::Playback => self.playback = Some(state),
        }
        Ok(())
    }

    /// Negotiate a format against the device table and install it
    pub fn select_format(
        &mut self,
        direction: StreamDirection,
        request: &FormatRequest,
        capabilities: &dyn CapabilitySource,
    ) -> Result<NegotiatedFormat> {
        if self.state != EngineState::Stopped {
            return Err(EngineError::InvalidState(self.state).into());
        }
        let format = FormatNegotiator::from_source(capabilities).negotiate(request)?;
        let endpoint = capabilities.endpoint_info(&format)?;
        if endpoint.poll_interval_exponent != 1 {
            tracing::warn!(
                "Endpoint polls every 2^{} frames; streaming assumes one packet per frame",
                endpoint.poll_interval_exponent.saturating_sub(1)
            );
        }

        let config = StreamConfig::new(
            format.channel_count,
            format.bit_depth,
            format.sample_rate,
            endpoint.max_packet_bytes,
            &self.settings.scheduler,
        )?;
        self.notify_format_changed(direction, config)?;

        if direction == StreamDirection::Playback {
            if endpoint.has_sync_feedback {
                tracing::info!("Tracking device clock through sync feedback");
                self.clock
                    .enable_feedback(format.sample_rate, self.settings.scheduler.packets_per_frame_list as u32);
            } else {
                self.clock.disable_feedback();
            }
        }
        Ok(format)
    }

    /// Arm every configured direction and wait for the first completion
    pub fn start(&mut self) -> Result<()> {
        if self.state != EngineState::Stopped {
            return Err(EngineError::InvalidState(self.state).into());
        }
        if self.capture.is_none() && self.playback.is_none() {
            return Err(EngineError::DirectionUnavailable(StreamDirection::Capture).into());
        }

        self.state = EngineState::Starting;
        tracing::info!("Starting stream");
        self.stop.store(false, Ordering::Release);
        self.clock.reset();
        self.ledger.clear();
        if let Some(rate) = self.ledger_rate() {
            self.ledger.set_sample_rate(rate);
        }
        self.feedback_rate = None;
        while self.completion_rx.try_recv().is_ok() {}

        if let Some(capture) = self.capture.as_mut() {
            capture.reset_for_start();
            capture.buffer.lock().reset();
        }
        if let Some(playback) = self.playback.as_mut() {
            playback.reset_for_start();
        }

        for direction in StreamDirection::ALL {
            if let Err(e) = self.arm(direction) {
                tracing::error!("Failed to arm {:?}: {}", direction, e);
                self.begin_stop();
                return Err(e);
            }
        }

        let interval = Duration::from_millis(self.settings.scheduler.start_poll_interval_ms);
        let retries = self.settings.scheduler.start_poll_retries;
        for attempt in 0..retries {
            match self.completion_rx.recv_timeout(interval) {
                Ok(completion) => {
                    self.state = EngineState::Running;
                    tracing::info!("Stream running after {} poll(s)", attempt + 1);
                    self.handle_completion(completion)?;
                    self.process_pending()?;
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::trace!("Start poll {} timed out", attempt + 1);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.begin_stop();
                    return Err(EngineError::ChannelClosed.into());
                }
            }
        }

        tracing::error!("No completion within {} polls, stopping", retries);
        self.begin_stop();
        Err(EngineError::StartTimeout { retries }.into())
    }

    fn arm(&mut self, direction: StreamDirection) -> Result<()> {
        let dir = match direction {
            StreamDirection::Capture => self.capture.as_mut(),
            StreamDirection::Playback => self.playback.as_mut(),
        };
        let Some(dir) = dir else {
            return Ok(());
        };

        let first = dir.scheduler.begin(self.transport.as_ref());
        tracing::debug!("Arming {:?} at sequence {}", direction, first);
        for slot in 0..dir.scheduler.slot_count() {
            dir.scheduler.park(slot);
        }
        dir.send_parked(self.transport.as_ref(), &self.completion_tx, &mut self.ledger)
    }

    /// Handle every completion already queued; never blocks
    ///
    /// Returns the number handled. A transfer failure beyond the retry
    /// budget is returned after the queue has been emptied.
    pub fn process_pending(&mut self) -> Result<usize> {
        let mut handled = 0;
        let mut first_error = None;
        while let Ok(completion) = self.completion_rx.try_recv() {
            handled += 1;
            if let Err(e) = self.handle_completion(completion) {
                tracing::error!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        if self.state == EngineState::Running {
            if let Err(e) = self.resubmit_parked() {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(handled),
        }
    }

    fn resubmit_parked(&mut self) -> Result<()> {
        for dir in [self.capture.as_mut(), self.playback.as_mut()].into_iter().flatten() {
            dir.send_parked(self.transport.as_ref(), &self.completion_tx, &mut self.ledger)?;
        }
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let owner = self.clock_owner();
        let ledger_follows_capture = self.ledger_follows_capture();
        let slot = completion.slot;

        let dir = match completion.direction {
            StreamDirection::Capture => self.capture.as_mut(),
            StreamDirection::Playback => self.playback.as_mut(),
        };
        let Some(dir) = dir else {
            tracing::warn!("Completion for unconfigured {:?} direction", completion.direction);
            return Ok(());
        };
        if slot >= dir.scheduler.slot_count() {
            tracing::warn!("Completion for unknown {:?} slot {}", completion.direction, slot);
            return Ok(());
        }

        let failed = !completion.status.is_success();
        let budget = dir.scheduler.begin_completion(slot, failed);
        if failed {
            dir.stats.transfer_failures += 1;
            tracing::warn!(
                "{:?} transfer on slot {} failed: {:?}",
                completion.direction,
                slot,
                completion.status
            );
        } else {
            if Some(completion.direction) == owner {
                let end_sequence = {
                    let list = dir.scheduler.frame_list(slot).lock();
                    list.first_sequence() + list.packet_count() as u64
                };
                self.clock.observe(end_sequence, completion.completed_at_ns);
            }

            match completion.direction {
                StreamDirection::Capture => {
                    let ledger = ledger_follows_capture.then_some(&mut self.ledger);
                    capture::absorb(dir, slot, ledger, &self.anchors);
                }
                StreamDirection::Playback => {
                    playback::complete(dir, slot, &self.anchors);
                    if let Some(report) = completion.feedback {
                        if let Some(rate) = self.clock.observe_feedback(report.as_slice()) {
                            if self.feedback_rate != Some(rate) {
                                tracing::debug!("Device clock measured at {} Hz", rate);
                                self.ledger.set_sample_rate(rate);
                                self.feedback_rate = Some(rate);
                            }
                        }
                    }
                }
            }
        }

        match dir.scheduler.finish_completion(slot) {
            SlotDisposition::Rearm => {
                dir.scheduler.park(slot);
                dir.send_parked(self.transport.as_ref(), &self.completion_tx, &mut self.ledger)?;
            }
            SlotDisposition::Drained { complete, .. } => {
                if complete {
                    self.finish_stop_if_drained();
                }
            }
        }

        budget.map_err(Error::from)
    }

    /// Ask every direction to stop re-arming
    ///
    /// In-flight transfers still complete; the engine reaches `Stopped` once
    /// they have all been handled.
    pub fn stop(&mut self) {
        match self.state {
            EngineState::Stopped | EngineState::Stopping => {}
            EngineState::Starting | EngineState::Running => {
                tracing::info!("Stopping stream");
                self.begin_stop();
            }
        }
    }

    /// Block until every in-flight transfer has drained or `timeout` passes
    ///
    /// Returns whether the engine reached `Stopped`.
    pub fn drain_blocking(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while self.state == EngineState::Stopping {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("Drain timed out with transfers still in flight");
                return Ok(false);
            }
            match self.completion_rx.recv_timeout(remaining) {
                Ok(completion) => {
                    if let Err(e) = self.handle_completion(completion) {
                        tracing::warn!("Failure while draining: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(EngineError::ChannelClosed.into()),
            }
        }
        Ok(self.state == EngineState::Stopped)
    }

    fn begin_stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.state = EngineState::Stopping;
        self.finish_stop_if_drained();
    }

    fn finish_stop_if_drained(&mut self) {
        if self.state != EngineState::Stopping {
            return;
        }
        let drained = [self.capture.as_ref(), self.playback.as_ref()]
            .into_iter()
            .flatten()
            .all(|dir| dir.scheduler.is_drained());
        if drained {
            self.state = EngineState::Stopped;
            tracing::info!("Stream stopped, all transfers drained");
        }
    }

    fn direction(&self, direction: StreamDirection) -> Result<&DirectionState> {
        let dir = match direction {
            StreamDirection::Capture => self.capture.as_ref(),
            StreamDirection::Playback => self.playback.as_ref(),
        };
        dir.ok_or_else(|| EngineError::DirectionUnavailable(direction).into())
    }

    /// Capture wins when both directions run
    fn clock_owner(&self) -> Option<StreamDirection> {
        if self.capture.is_some() {
            Some(StreamDirection::Capture)
        } else if self.playback.is_some() {
            Some(StreamDirection::Playback)
        } else {
            None
        }
    }

    /// Capture frame counts only size playback packets at a matching rate
    fn ledger_follows_capture(&self) -> bool {
        match (&self.capture, &self.playback) {
            (Some(capture), Some(playback)) => capture.config.sample_rate == playback.config.sample_rate,
            _ => false,
        }
    }

    fn ledger_rate(&self) -> Option<u32> {
        self.playback
            .as_ref()
            .or(self.capture.as_ref())
            .map(|dir| dir.config.sample_rate)
    }

    /// Byte offset the engine is writing captured audio to
    pub fn capture_cursor(&self) -> Result<usize> {
        Ok(self.direction(StreamDirection::Capture)?.buffer.lock().write_offset())
    }

    /// Byte offset the engine is reading playback audio from
    pub fn playback_cursor(&self) -> Result<usize> {
        Ok(self.direction(StreamDirection::Playback)?.buffer.lock().read_offset())
    }

    /// Estimated wall time at which the byte at `cursor` crossed the bus
    ///
    /// Capture cursors are taken as the latest written occurrence of that
    /// offset. Playback cursors are taken as the next occurrence the engine
    /// will send.
    pub fn estimated_timestamp(&self, direction: StreamDirection, cursor: usize) -> Result<u64> {
        let dir = self.direction(direction)?;
        let reference = dir.position.ok_or(ClockError::NoAnchor)?;
        let absolute = {
            let buffer = dir.buffer.lock();
            let capacity = buffer.capacity();
            let cursor = cursor % capacity;
            match direction {
                StreamDirection::Capture => {
                    let behind = (buffer.write_offset() + capacity - cursor) % capacity;
                    buffer.total_written() as f64 - behind as f64
                }
                StreamDirection::Playback => {
                    let ahead = (cursor + capacity - buffer.read_offset()) % capacity;
                    buffer.total_read() as f64 + ahead as f64
                }
            }
        };

        let bytes_per_sequence = dir.config.sample_rate as f64 / 1000.0 * dir.config.bytes_per_frame as f64;
        let position = reference.sequence + (absolute - reference.total_bytes as f64) / bytes_per_sequence;
        Ok(self.anchors.estimate_at(position)?)
    }

    pub fn capture_reader(&self) -> Result<CaptureReader> {
        Ok(CaptureReader::new(self.direction(StreamDirection::Capture)?.buffer.clone()))
    }

    pub fn playback_writer(&self) -> Result<PlaybackWriter> {
        Ok(PlaybackWriter::new(self.direction(StreamDirection::Playback)?.buffer.clone()))
    }

    /// Read side of the clock anchor, usable from any thread
    pub fn anchor_reader(&self) -> AnchorReader {
        self.anchors.clone()
    }

    /// Oldest unread wrap timestamp for a direction
    pub fn pop_wrap_stamp(&self, direction: StreamDirection) -> Option<WrapStamp> {
        self.direction(direction).ok()?.wrap_stamps.try_pop()
    }

    /// Shared queue of wrap timestamps, for consumers on other threads
    pub fn wrap_stamps(&self, direction: StreamDirection) -> Result<SharedRingBuffer<WrapStamp>> {
        Ok(self.direction(direction)?.wrap_stamps.clone())
    }

    pub fn stream_config(&self, direction: StreamDirection) -> Option<StreamConfig> {
        self.direction(direction).ok().map(|dir| dir.config)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state,
            capture: self.capture.as_ref().map(DirectionState::snapshot),
            playback: self.playback.as_ref().map(DirectionState::snapshot),
            clock_locked: self.clock.is_locked(),
            anchors_published: self.clock.anchors_published(),
            clock_rejections: self.clock.rejected_count(),
            device_rate_hz: self.clock.device_rate_hz(),
            ledger_rate_hz: self.ledger.sample_rate(),
            ledger_fallbacks: self.ledger.fallback_count(),
            ledger_dropped: self.ledger.dropped_count(),
        }
    }
}

impl Drop for StreamingEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{AlternateConfiguration, EndpointInfo, StaticCapabilities};
    use crate::transport::sim::SimTransport;

    fn stream_config(rate: u32) -> StreamConfig {
        StreamConfig::new(2, 16, rate, 200, &EngineSettings::default().scheduler).unwrap()
    }

    fn engine_with(
        sim: &Arc<SimTransport>,
        settings: EngineSettings,
        capture: Option<StreamConfig>,
        playback: Option<StreamConfig>,
    ) -> StreamingEngine {
        let mut engine = StreamingEngine::new(sim.clone(), settings);
        if let Some(config) = capture {
            engine.notify_format_changed(StreamDirection::Capture, config).unwrap();
        }
        if let Some(config) = playback {
            engine.notify_format_changed(StreamDirection::Playback, config).unwrap();
        }
        engine
    }

    /// Start the engine while another thread completes the first frame list
    fn start(engine: &mut StreamingEngine, sim: &SimTransport, expected_submissions: u64) {
        std::thread::scope(|s| {
            s.spawn(|| {
                while sim.submission_count() < expected_submissions {
                    std::thread::sleep(Duration::from_millis(1));
                }
                sim.complete_next();
            });
            engine.start().unwrap();
        });
        assert_eq!(engine.state(), EngineState::Running);
    }

    fn pump(engine: &mut StreamingEngine, sim: &SimTransport, completions: usize) {
        for _ in 0..completions {
            if sim.complete_next().is_none() {
                break;
            }
            engine.process_pending().unwrap();
        }
    }

    #[test]
    fn test_no_anchor_before_start() {
        let sim = Arc::new(SimTransport::new(1_000));
        let engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        assert!(matches!(
            engine.estimated_timestamp(StreamDirection::Capture, 0),
            Err(Error::Clock(ClockError::NoAnchor))
        ));
        assert!(matches!(
            engine.playback_cursor(),
            Err(Error::Engine(EngineError::DirectionUnavailable(StreamDirection::Playback)))
        ));
    }

    #[test]
    fn test_start_without_directions_fails() {
        let sim = Arc::new(SimTransport::new(0));
        let mut engine = StreamingEngine::new(sim, EngineSettings::default());
        assert!(matches!(engine.start(), Err(Error::Engine(EngineError::DirectionUnavailable(_)))));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_format_change_rejected_while_running() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        start(&mut engine, &sim, 4);
        assert!(matches!(
            engine.notify_format_changed(StreamDirection::Capture, stream_config(44100)),
            Err(Error::Engine(EngineError::InvalidState(EngineState::Running)))
        ));
    }

    #[test]
    fn test_start_timeout_drains_to_stopped() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut settings = EngineSettings::default();
        settings.scheduler.start_poll_interval_ms = 1;
        settings.scheduler.start_poll_retries = 2;
        let mut engine = engine_with(&sim, settings, Some(stream_config(48000)), None);

        assert!(matches!(
            engine.start(),
            Err(Error::Engine(EngineError::StartTimeout { retries: 2 }))
        ));
        assert_eq!(engine.state(), EngineState::Stopping);

        sim.complete_all(16);
        engine.process_pending().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(sim.pending_count(), 0);
    }

    fn playback_capabilities(has_sync_feedback: bool) -> StaticCapabilities {
        StaticCapabilities::new().with(
            AlternateConfiguration {
                alternate_setting: 1,
                channel_count: 2,
                bit_depth: 16,
                sample_rates: vec![48000],
            },
            EndpointInfo {
                max_packet_bytes: 200,
                poll_interval_exponent: 1,
                has_sync_feedback,
            },
        )
    }

    #[test]
    fn test_44100_playback_averages_device_rate() {
        let sim = Arc::new(SimTransport::new(1_000));
        // 352/360-byte capture packets of 32-bit stereo
        let mut cadence = vec![44; 9];
        cadence.push(45);
        sim.set_capture_cadence(8, cadence);

        let config = StreamConfig::new(2, 32, 44100, 360, &EngineSettings::default().scheduler).unwrap();
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(config), Some(config));
        start(&mut engine, &sim, 8);

        let packets_per_list = config.packets_per_frame_list as u64;
        while engine.stats().capture.map_or(0, |c| c.packets) < 10_000 * packets_per_list {
            pump(&mut engine, &sim, 1);
        }

        let stats = engine.stats();
        let playback = stats.playback.unwrap();
        let average = playback.bytes as f64 / 8.0 / playback.packets as f64;
        assert!((average - 44.1).abs() < 0.01, "average {}", average);
        assert_eq!(playback.clamped_packets, 0);
        assert_eq!(stats.ledger_dropped, 0);
    }

    #[test]
    fn test_capture_only_stream_leaves_ledger_alone() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        let reader = engine.capture_reader().unwrap();
        start(&mut engine, &sim, 4);

        let mut sink = vec![0u8; 4096];
        for _ in 0..20 {
            pump(&mut engine, &sim, 1);
            reader.read(&mut sink);
        }
        assert_eq!(engine.stats().capture.unwrap().packets, 21 * 8);
        assert_eq!(engine.stats().ledger_dropped, 0);
    }

    #[test]
    fn test_failed_transfers_keep_stream_running() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        start(&mut engine, &sim, 4);

        for n in 1..=30 {
            if n % 3 == 0 {
                sim.fail_next();
            } else {
                sim.complete_next();
            }
            engine.process_pending().unwrap();
            assert_eq!(engine.state(), EngineState::Running);
            assert_eq!(sim.pending(StreamDirection::Capture), 4);
        }

        let stats = engine.stats().capture.unwrap();
        assert_eq!(stats.transfer_failures, 10);
        assert!(stats.scheduler.resyncs >= 10);
    }

    #[test]
    fn test_repeated_failures_surface() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        start(&mut engine, &sim, 4);

        let budget = engine.settings().scheduler.retry_budget;
        for _ in 0..budget {
            sim.fail_next();
            engine.process_pending().unwrap();
        }
        sim.fail_next();
        assert!(matches!(
            engine.process_pending(),
            Err(Error::Transport(TransportError::RetryBudgetExhausted { .. }))
        ));
    }

    #[test]
    fn test_stop_drains_in_flight_transfers() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(
            &sim,
            EngineSettings::default(),
            Some(stream_config(48000)),
            Some(stream_config(48000)),
        );
        start(&mut engine, &sim, 8);
        pump(&mut engine, &sim, 10);

        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopping);
        sim.complete_all(64);
        assert!(engine.drain_blocking(Duration::from_secs(1)).unwrap());
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(sim.pending_count(), 0);

        // Restart after a clean stop
        start(&mut engine, &sim, sim.submission_count() + 8);
    }

    #[test]
    fn test_capture_data_is_continuous() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        let reader = engine.capture_reader().unwrap();
        start(&mut engine, &sim, 4);

        let mut received = Vec::new();
        let mut chunk = vec![0u8; 4096];
        for _ in 0..40 {
            pump(&mut engine, &sim, 1);
            let n = reader.read(&mut chunk);
            received.extend_from_slice(&chunk[..n]);
        }

        assert_eq!(received.len(), 41 * 8 * 48 * 4);
        for (i, byte) in received.iter().enumerate() {
            assert_eq!(*byte, i as u8);
        }
        assert_eq!(engine.stats().capture.unwrap().overruns, 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        let reader = engine.capture_reader().unwrap();
        start(&mut engine, &sim, 4);

        let mut peeked = [0u8; 16];
        assert_eq!(reader.peek(&mut peeked), 16);
        let mut read = [0u8; 16];
        assert_eq!(reader.read(&mut read), 16);
        assert_eq!(peeked, read);
        assert_eq!(reader.cursor(), 16);
    }

    #[test]
    fn test_playback_sends_host_audio() {
        let sim = Arc::new(SimTransport::new(1_000));
        sim.record_playback(true);
        let mut engine = engine_with(&sim, EngineSettings::default(), None, Some(stream_config(48000)));

        let pattern: Vec<u8> = (0..4 * 8 * 48 * 4).map(|i| (i % 251) as u8).collect();
        let writer = engine.playback_writer().unwrap();
        assert!(!writer.write(&pattern).overrun);

        start(&mut engine, &sim, 4);
        pump(&mut engine, &sim, 3);

        assert_eq!(sim.take_played(), pattern);
        let stats = engine.stats().playback.unwrap();
        assert_eq!(stats.packets, 32);
        assert!(stats.underruns > 0);
    }

    #[test]
    fn test_rejected_playback_submission_keeps_audio_order() {
        let sim = Arc::new(SimTransport::new(1_000));
        sim.record_playback(true);
        let mut engine = engine_with(&sim, EngineSettings::default(), None, Some(stream_config(48000)));

        let pattern: Vec<u8> = (0..4 * 8 * 48 * 4).map(|i| (i % 251) as u8).collect();
        let writer = engine.playback_writer().unwrap();
        assert!(!writer.write(&pattern).overrun);

        // The first list is rejected twice and must still go out first
        sim.fail_next_submissions(2);
        start(&mut engine, &sim, 4);
        pump(&mut engine, &sim, 7);

        let played = sim.take_played();
        assert_eq!(&played[..pattern.len()], &pattern[..]);
        let stats = engine.stats().playback.unwrap();
        assert_eq!(stats.scheduler.submit_failures, 2);
        assert_eq!(stats.scheduler.out_of_order, 0);
        assert_eq!(sim.pending(StreamDirection::Playback), 4);
    }

    #[test]
    fn test_playback_wrap_is_stamped_at_split_packet() {
        let sim = Arc::new(SimTransport::new(1_000));
        let config = stream_config(48000);
        let mut engine = engine_with(&sim, EngineSettings::default(), None, Some(config));
        let writer = engine.playback_writer().unwrap();

        let list_bytes = 8 * 48 * 4;
        let capacity = config.sample_buffer_bytes(EngineSettings::default().buffer.frame_lists_per_buffer);
        assert_eq!(capacity, 16 * list_bytes + 512);

        writer.write(&vec![1u8; 8 * list_bytes]);
        start(&mut engine, &sim, 4);
        for _ in 0..24 {
            writer.write(&vec![1u8; list_bytes]);
            pump(&mut engine, &sim, 1);
        }

        let stats = engine.stats().playback.unwrap();
        assert_eq!(stats.underruns, 0);
        assert_eq!(stats.wraps, 1);

        // List 16 starts at sequence 1004 + 16 * 8; the buffer end falls
        // 128 bytes into its third 192-byte packet.
        let stamp = engine.pop_wrap_stamp(StreamDirection::Playback).unwrap();
        let expected = (1004 + 16 * 8 + 2) as f64 + 128.0 / 192.0;
        assert_eq!(stamp.direction, StreamDirection::Playback);
        assert_eq!(stamp.wrap_count, 1);
        assert!((stamp.sequence_position - expected).abs() < 1e-9, "{}", stamp.sequence_position);
        let wall = stamp.wall_time_ns.unwrap() as f64;
        assert!((wall - expected * 1_000_000.0).abs() < 1_000.0, "{} vs {}", wall, expected);
        assert!(engine.pop_wrap_stamp(StreamDirection::Playback).is_none());
    }

    #[test]
    fn test_wrap_stamps_are_timed_once_locked() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        let reader = engine.capture_reader().unwrap();
        start(&mut engine, &sim, 4);

        let mut sink = vec![0u8; 4096];
        for _ in 0..40 {
            pump(&mut engine, &sim, 1);
            reader.read(&mut sink);
        }
        assert!(engine.stats().clock_locked);

        let stamp = engine.pop_wrap_stamp(StreamDirection::Capture).unwrap();
        assert_eq!(stamp.wrap_count, 1);
        let wall = stamp.wall_time_ns.unwrap() as f64;
        let expected = stamp.sequence_position * 1_000_000.0;
        assert!((wall - expected).abs() < 1_000.0, "{} vs {}", wall, expected);
    }

    #[test]
    fn test_estimated_timestamp_tracks_capture_cursor() {
        let sim = Arc::new(SimTransport::new(1_000));
        let mut engine = engine_with(&sim, EngineSettings::default(), Some(stream_config(48000)), None);
        let reader = engine.capture_reader().unwrap();
        start(&mut engine, &sim, 4);

        let mut sink = vec![0u8; 4096];
        for _ in 0..10 {
            pump(&mut engine, &sim, 1);
            reader.read(&mut sink);
        }

        // The write cursor sits at the end of the last completed list
        let cursor = engine.capture_cursor().unwrap();
        let now = engine.estimated_timestamp(StreamDirection::Capture, cursor).unwrap();
        assert_eq!(now, sim.current_sequence_number() * 1_000_000);

        // One packet (192 bytes) earlier is one bus frame earlier
        let earlier = engine.estimated_timestamp(StreamDirection::Capture, cursor - 192).unwrap();
        assert_eq!(now - earlier, 1_000_000);
    }

    #[test]
    fn test_sync_feedback_retargets_ledger() {
        let sim = Arc::new(SimTransport::new(1_000));
        let raw = (47.99f64 * 16_384.0).round() as u32;
        sim.set_feedback_report(Some(&raw.to_le_bytes()[..3]));

        let capabilities = playback_capabilities(true);
        let mut engine = StreamingEngine::new(sim.clone(), EngineSettings::default());
        let request = FormatRequest {
            channel_count: 2,
            bit_depth: 16,
            sample_rate: 48000,
        };
        let format = engine
            .select_format(StreamDirection::Playback, &request, &capabilities)
            .unwrap();
        assert_eq!(format.alternate_setting, 1);

        start(&mut engine, &sim, 4);
        pump(&mut engine, &sim, 300);

        let stats = engine.stats();
        assert_eq!(stats.device_rate_hz, Some(47990));
        assert_eq!(stats.ledger_rate_hz, 47990);
    }

    #[test]
    fn test_reselecting_format_without_feedback_stops_tracking() {
        let sim = Arc::new(SimTransport::new(1_000));
        let raw = (47.99f64 * 16_384.0).round() as u32;
        sim.set_feedback_report(Some(&raw.to_le_bytes()[..3]));

        let request = FormatRequest {
            channel_count: 2,
            bit_depth: 16,
            sample_rate: 48000,
        };
        let mut engine = StreamingEngine::new(sim.clone(), EngineSettings::default());
        engine
            .select_format(StreamDirection::Playback, &request, &playback_capabilities(true))
            .unwrap();
        engine
            .select_format(StreamDirection::Playback, &request, &playback_capabilities(false))
            .unwrap();

        start(&mut engine, &sim, 4);
        pump(&mut engine, &sim, 300);

        let stats = engine.stats();
        assert_eq!(stats.device_rate_hz, None);
        assert_eq!(stats.ledger_rate_hz, 48000);
    }
}
