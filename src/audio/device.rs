//! Device capability boundary
//!
//! Descriptor parsing lives outside this crate. The streaming core only sees
//! the resulting alternate-setting table and per-format endpoint details.

use serde::{Deserialize, Serialize};

use crate::audio::format::NegotiatedFormat;
use crate::error::FormatError;

/// One device-advertised streaming configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateConfiguration {
    pub alternate_setting: u8,
    pub channel_count: u16,
    pub bit_depth: u16,
    pub sample_rates: Vec<u32>,
}

impl AlternateConfiguration {
    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }

    pub fn highest_rate(&self) -> Option<u32> {
        self.sample_rates.iter().copied().max()
    }
}

/// Isochronous endpoint details for a chosen configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub max_packet_bytes: usize,
    /// bInterval exponent; packets every 2^(n-1) bus frames
    pub poll_interval_exponent: u8,
    pub has_sync_feedback: bool,
}

/// Read-only capability table supplied by the descriptor layer
pub trait CapabilitySource {
    fn alternate_configurations(&self) -> Vec<AlternateConfiguration>;

    fn endpoint_info(&self, format: &NegotiatedFormat) -> Result<EndpointInfo, FormatError>;
}

/// In-memory capability table
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilities {
    entries: Vec<(AlternateConfiguration, EndpointInfo)>,
}

impl StaticCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, config: AlternateConfiguration, endpoint: EndpointInfo) -> Self {
        self.entries.push((config, endpoint));
        self
    }

    /// Distinct sample rates across all configurations, sorted
    pub fn sample_rates(&self) -> Vec<u32> {
        let mut rates: Vec<u32> = Vec::new();
        for (config, _) in &self.entries {
            for &rate in &config.sample_rates {
                if !rates.contains(&rate) {
                    rates.push(rate);
                }
            }
        }
        rates.sort();
        rates
    }

    /// Distinct channel counts across all configurations, sorted
    pub fn channel_counts(&self) -> Vec<u16> {
        let mut channels: Vec<u16> = self.entries.iter().map(|(c, _)| c.channel_count).collect();
        channels.sort();
        channels.dedup();
        channels
    }
}

impl CapabilitySource for StaticCapabilities {
    fn alternate_configurations(&self) -> Vec<AlternateConfiguration> {
        self.entries.iter().map(|(config, _)| config.clone()).collect()
    }

    fn endpoint_info(&self, format: &NegotiatedFormat) -> Result<EndpointInfo, FormatError> {
        self.entries
            .iter()
            .find(|(config, _)| config.alternate_setting == format.alternate_setting)
            .map(|(_, endpoint)| *endpoint)
            .ok_or(FormatError::NoEndpoint(format.alternate_setting))
    }
}
