//! Error types for the streaming core

use thiserror::Error;

use crate::StreamDirection;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Circular buffer capacity violations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer overrun: {requested} requested, {vacant} vacant")]
    Overrun { requested: usize, vacant: usize },

    #[error("Buffer underrun: {requested} requested, {available} available")]
    Underrun { requested: usize, available: usize },
}

/// Clock recovery errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    #[error("No clock anchor established")]
    NoAnchor,

    #[error("Anchor kept changing during read")]
    Inconsistent,
}

/// Transport (USB host controller) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Submission failed on {direction:?} frame list {slot}: {reason}")]
    SubmitFailed {
        direction: StreamDirection,
        slot: usize,
        reason: String,
    },

    #[error("Transport disconnected")]
    Disconnected,

    #[error("{direction:?} transfers failed {failures} times in a row")]
    RetryBudgetExhausted {
        direction: StreamDirection,
        failures: u32,
    },
}

/// Format negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Unsupported format: {channels}ch {bit_depth}-bit {sample_rate}Hz")]
    Unsupported {
        channels: u16,
        bit_depth: u16,
        sample_rate: u32,
    },

    #[error("No endpoint for alternate setting {0}")]
    NoEndpoint(u8),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid stream configuration: {0}")]
    InvalidStream(String),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Engine lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Operation not allowed while {0:?}")]
    InvalidState(crate::engine::EngineState),

    #[error("No completion within {retries} polls after start")]
    StartTimeout { retries: u32 },

    #[error("{0:?} direction is not configured")]
    DirectionUnavailable(StreamDirection),

    #[error("Completion channel closed")]
    ChannelClosed,
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
