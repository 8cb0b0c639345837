//! Format negotiation against a device capability table
//!
//! Search order for a requested format:
//!
//! 1. exact channel count, bit depth and rate
//! 2. same channels and depth at the closest supported rate
//! 3. two fewer channels (never below stereo), retrying 1 and 2
//! 4. 16-bit stereo at the highest rate the device offers

use serde::{Deserialize, Serialize};

use crate::audio::device::{AlternateConfiguration, CapabilitySource};
use crate::error::FormatError;

/// Format asked for by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRequest {
    pub channel_count: u16,
    pub bit_depth: u16,
    pub sample_rate: u32,
}

/// Format the device will actually run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedFormat {
    pub alternate_setting: u8,
    pub channel_count: u16,
    pub bit_depth: u16,
    pub sample_rate: u32,
}

/// Picks the alternate setting closest to a requested format
///
/// Tries an exact match, then the nearest sample rate, then fewer channels,
/// and finally plain 16-bit stereo.
pub struct FormatNegotiator {
    /// Candidate alternate settings in device order
    configurations: Vec<AlternateConfiguration>,
}

impl FormatNegotiator {
    pub fn new(configurations: Vec<AlternateConfiguration>) -> Self {
        Self { configurations }
    }

    pub fn from_source(source: &dyn CapabilitySource) -> Self {
        Self::new(source.alternate_configurations())
    }

    pub fn negotiate(&self, request: &FormatRequest) -> Result<NegotiatedFormat, FormatError> {
        let mut channels = request.channel_count;
        loop {
            if let Some(found) = self.exact(channels, request.bit_depth, request.sample_rate) {
                tracing::debug!("Format match: {:?}", found);
                return Ok(found);
            }
            if let Some(found) = self.closest_rate(channels, request.bit_depth, request.sample_rate) {
                tracing::debug!("Format match at alternate rate: {:?}", found);
                return Ok(found);
            }
            if channels <= 2 {
                break;
            }
            channels = channels.saturating_sub(2).max(2);
            tracing::debug!("Retrying format search with {} channels", channels);
        }

        if let Some(found) = self.stereo_fallback() {
            tracing::info!(
                "Falling back to 16-bit stereo at {} Hz for request {:?}",
                found.sample_rate,
                request
            );
            return Ok(found);
        }

        Err(FormatError::Unsupported {
            channels: request.channel_count,
            bit_depth: request.bit_depth,
            sample_rate: request.sample_rate,
        })
    }

    fn matching(&self, channels: u16, bit_depth: u16) -> impl Iterator<Item = &AlternateConfiguration> {
        self.configurations
            .iter()
            .filter(move |c| c.channel_count == channels && c.bit_depth == bit_depth)
    }

    fn exact(&self, channels: u16, bit_depth: u16, rate: u32) -> Option<NegotiatedFormat> {
        self.matching(channels, bit_depth)
            .find(|c| c.supports_rate(rate))
            .map(|c| negotiated(c, rate))
    }

    fn closest_rate(&self, channels: u16, bit_depth: u16, rate: u32) -> Option<NegotiatedFormat> {
        self.matching(channels, bit_depth)
            .flat_map(|c| c.sample_rates.iter().map(move |&r| (c, r)))
            // Closest first; on a tie the higher rate wins.
            .min_by_key(|&(_, r)| (r.abs_diff(rate), std::cmp::Reverse(r)))
            .map(|(c, r)| negotiated(c, r))
    }

    fn stereo_fallback(&self) -> Option<NegotiatedFormat> {
        self.matching(2, 16)
            .filter_map(|c| c.highest_rate().map(|r| (c, r)))
            .max_by_key(|&(_, r)| r)
            .map(|(c, r)| negotiated(c, r))
    }
}

fn negotiated(config: &AlternateConfiguration, rate: u32) -> NegotiatedFormat {
    NegotiatedFormat {
        alternate_setting: config.alternate_setting,
        channel_count: config.channel_count,
        bit_depth: config.bit_depth,
        sample_rate: rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alt(setting: u8, channels: u16, depth: u16, rates: &[u32]) -> AlternateConfiguration {
        AlternateConfiguration {
            alternate_setting: setting,
            channel_count: channels,
            bit_depth: depth,
            sample_rates: rates.to_vec(),
        }
    }

    fn request(channels: u16, depth: u16, rate: u32) -> FormatRequest {
        FormatRequest {
            channel_count: channels,
            bit_depth: depth,
            sample_rate: rate,
        }
    }

    fn negotiator() -> FormatNegotiator {
        FormatNegotiator::new(vec![
            alt(1, 2, 16, &[44100, 48000]),
            alt(2, 2, 24, &[44100, 48000, 96000]),
            alt(3, 4, 24, &[48000]),
            alt(4, 2, 32, &[88200, 96000]),
        ])
    }

    #[test]
    fn test_exact_match() {
        let found = negotiator().negotiate(&request(2, 24, 96000)).unwrap();
        assert_eq!(found.alternate_setting, 2);
        assert_eq!(found.sample_rate, 96000);
    }

    #[test]
    fn test_same_depth_closest_rate() {
        let found = negotiator().negotiate(&request(4, 24, 44100)).unwrap();
        assert_eq!(found.alternate_setting, 3);
        assert_eq!(found.sample_rate, 48000);

        // 92100 is equidistant from 88200 and 96000
        let found = negotiator().negotiate(&request(2, 32, 92100)).unwrap();
        assert_eq!(found.sample_rate, 96000);
    }

    #[test]
    fn test_channel_reduction() {
        let found = negotiator().negotiate(&request(6, 24, 48000)).unwrap();
        assert_eq!(found.alternate_setting, 3);
        assert_eq!(found.channel_count, 4);

        let found = negotiator().negotiate(&request(8, 32, 96000)).unwrap();
        assert_eq!(found.alternate_setting, 4);
        assert_eq!(found.channel_count, 2);
    }

    #[test]
    fn test_stereo_16_bit_fallback_at_highest_rate() {
        let found = negotiator().negotiate(&request(1, 8, 8000)).unwrap();
        assert_eq!(found.alternate_setting, 1);
        assert_eq!(found.channel_count, 2);
        assert_eq!(found.bit_depth, 16);
        assert_eq!(found.sample_rate, 48000);
    }

    #[test]
    fn test_unsupported_when_ladder_exhausted() {
        let negotiator = FormatNegotiator::new(vec![alt(1, 1, 24, &[48000])]);
        let err = negotiator.negotiate(&request(2, 16, 44100)).unwrap_err();
        assert!(matches!(err, FormatError::Unsupported { channels: 2, .. }));
    }
}
