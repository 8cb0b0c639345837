//! Audio buffering and format handling

pub mod buffer;
pub mod device;
pub mod format;
pub mod ledger;
pub mod sample_buffer;

pub use buffer::{RingBuffer, SharedRingBuffer};
pub use device::{AlternateConfiguration, CapabilitySource, EndpointInfo, StaticCapabilities};
pub use format::{FormatNegotiator, FormatRequest, NegotiatedFormat};
pub use ledger::FrameSizeLedger;
pub use sample_buffer::{SampleByteBuffer, SharedSampleBuffer};
