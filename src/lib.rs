//! # USB Audio Stream
//!
//! Isochronous streaming core for USB Audio Class devices.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         HOST AUDIO LAYER                             │
//! │   CaptureReader / PlaybackWriter     cursors, estimated_timestamp    │
//! └───────────────┬──────────────────────────────────┬───────────────────┘
//!                 │                                  │
//!                 ▼                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    StreamingEngine (engine)                          │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌───────────────────┐   │
//! │  │ SampleByteBuffer │  │ SampleByteBuffer │  │  FrameSizeLedger  │   │
//! │  │    (capture)     │  │    (playback)    │  │ capture → playback│   │
//! │  └────────▲─────────┘  └────────┬─────────┘  └───────────────────┘   │
//! │           │ store_bytes         │ consume_into                       │
//! │  ┌────────┴─────────┐  ┌────────▼─────────┐  ┌───────────────────┐   │
//! │  │TransferScheduler │  │TransferScheduler │  │   ClockRecovery   │   │
//! │  │    (capture)     │  │    (playback)    │  │ seq ↔ wall clock  │   │
//! │  └────────┬─────────┘  └────────┬─────────┘  └─────────▲─────────┘   │
//! │           │   Completion messages (crossbeam-channel)  │ anchors     │
//! └───────────┼─────────────────────┼──────────────────────┼─────────────┘
//!             ▼                     ▼                      │
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │          Transport (host controller): frame lists, bus counter       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

/// Stream direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamDirection {
    /// Device to host
    Capture,
    /// Host to device
    Playback,
}

impl StreamDirection {
    pub const ALL: [StreamDirection; 2] = [StreamDirection::Capture, StreamDirection::Playback];
}

/// Crate-wide constants
pub mod constants {
    /// Ledger fallback rate before any format is installed
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Wall time of one full-speed bus frame
    pub const BUS_FRAME_NS: u64 = 1_000_000;

    /// Sample buffer size, in frame lists of nominal traffic
    pub const DEFAULT_FRAME_LISTS_PER_BUFFER: usize = 16;

    /// Frame counts remembered between capture and playback
    pub const DEFAULT_LEDGER_CAPACITY: usize = 64;

    /// Unread wrap timestamps kept per direction
    pub const DEFAULT_WRAP_STAMP_CAPACITY: usize = 32;

    /// Packets (bus frames) per submitted frame list
    pub const DEFAULT_PACKETS_PER_FRAME_LIST: usize = 8;

    /// Frame lists kept queued at the transport per direction
    pub const DEFAULT_FRAME_LISTS_IN_FLIGHT: usize = 4;

    /// Lead over the bus counter after a resync
    pub const DEFAULT_SAFETY_OFFSET: u64 = 4;

    /// Largest lead tolerated before resyncing
    pub const DEFAULT_RESYNC_HYSTERESIS: u64 = 64;

    /// Consecutive transfer failures tolerated
    pub const DEFAULT_RETRY_BUDGET: u32 = 3;
}
