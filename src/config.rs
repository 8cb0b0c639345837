//! Stream and engine configuration
//!
//! `StreamConfig` describes one direction's negotiated format and transfer
//! geometry. `EngineSettings` holds the tunables, loadable from TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::ConfigError;

/// Negotiated format and transfer geometry for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub channel_count: u16,
    pub bits_per_sample: u16,
    pub bytes_per_frame: usize,
    pub sample_rate: u32,
    pub packets_per_frame_list: usize,
    pub frame_lists_in_flight: usize,
    pub max_packet_bytes: usize,
}

impl StreamConfig {
    /// Build a validated configuration
    pub fn new(
        channel_count: u16,
        bits_per_sample: u16,
        sample_rate: u32,
        max_packet_bytes: usize,
        scheduler: &SchedulerSettings,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            channel_count,
            bits_per_sample,
            bytes_per_frame: channel_count as usize * (bits_per_sample as usize / 8),
            sample_rate,
            packets_per_frame_list: scheduler.packets_per_frame_list,
            frame_lists_in_flight: scheduler.frame_lists_in_flight,
            max_packet_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_count == 0 {
            return Err(ConfigError::InvalidStream("zero channels".into()));
        }
        if self.bits_per_sample == 0 || self.bits_per_sample % 8 != 0 {
            return Err(ConfigError::InvalidStream(format!(
                "bit depth {} is not a whole number of bytes",
                self.bits_per_sample
            )));
        }
        if self.bytes_per_frame != self.channel_count as usize * (self.bits_per_sample as usize / 8) {
            return Err(ConfigError::InvalidStream("bytes per frame mismatch".into()));
        }
        if self.sample_rate < 1000 {
            return Err(ConfigError::InvalidStream(format!(
                "sample rate {} below one frame per millisecond",
                self.sample_rate
            )));
        }
        if self.packets_per_frame_list == 0 || self.frame_lists_in_flight == 0 {
            return Err(ConfigError::InvalidStream("empty transfer geometry".into()));
        }
        if self.max_packet_bytes < self.bytes_per_frame {
            return Err(ConfigError::InvalidStream(format!(
                "max packet of {} bytes cannot hold one {}-byte frame",
                self.max_packet_bytes, self.bytes_per_frame
            )));
        }
        Ok(())
    }

    /// Nominal frames per 1 ms packet, rounded down
    pub fn stock_frames_per_packet(&self) -> u32 {
        self.sample_rate / 1000
    }

    /// Payload bytes reserved for one frame list
    pub fn frame_list_bytes(&self) -> usize {
        self.packets_per_frame_list * self.max_packet_bytes
    }

    /// Number of packet descriptors in the pool
    pub fn descriptor_pool_size(&self) -> usize {
        self.packets_per_frame_list * self.frame_lists_in_flight
    }

    /// Sample buffer size holding `frame_lists` windows of nominal traffic,
    /// rounded to whole audio frames.
    pub fn sample_buffer_bytes(&self, frame_lists: usize) -> usize {
        let frames = (self.stock_frames_per_packet() as usize + 1) * self.packets_per_frame_list * frame_lists;
        frames * self.bytes_per_frame
    }
}

/// Sample buffer and bookkeeping sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Sample buffer capacity, in frame lists of nominal traffic
    pub frame_lists_per_buffer: usize,
    pub ledger_capacity: usize,
    pub wrap_stamp_capacity: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            frame_lists_per_buffer: DEFAULT_FRAME_LISTS_PER_BUFFER,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            wrap_stamp_capacity: DEFAULT_WRAP_STAMP_CAPACITY,
        }
    }
}

/// Transfer scheduling tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub packets_per_frame_list: usize,
    pub frame_lists_in_flight: usize,
    /// Lead, in bus frames, applied after a resync
    pub safety_offset: u64,
    /// Maximum lead before the target is considered lost
    pub resync_hysteresis: u64,
    /// Consecutive failures tolerated before surfacing an error
    pub retry_budget: u32,
    pub start_poll_interval_ms: u64,
    pub start_poll_retries: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            packets_per_frame_list: DEFAULT_PACKETS_PER_FRAME_LIST,
            frame_lists_in_flight: DEFAULT_FRAME_LISTS_IN_FLIGHT,
            safety_offset: DEFAULT_SAFETY_OFFSET,
            resync_hysteresis: DEFAULT_RESYNC_HYSTERESIS,
            retry_budget: DEFAULT_RETRY_BUDGET,
            start_poll_interval_ms: 5,
            start_poll_retries: 40,
        }
    }
}

/// Clock filter tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSettings {
    /// Acceptance window relative to the expected interval
    pub tolerance_ppm: f64,
    pub lock_after_good_samples: u32,
    pub mass: f64,
    pub spring: f64,
    pub damping: f64,
    /// Wall time of one bus sequence unit
    pub nominal_ns_per_sequence: u64,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            tolerance_ppm: 1000.0,
            lock_after_good_samples: 5,
            mass: 100.0,
            spring: 1.0,
            damping: 19.0,
            nominal_ns_per_sequence: BUS_FRAME_NS,
        }
    }
}

/// Top-level engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub buffer: BufferSettings,
    pub scheduler: SchedulerSettings,
    pub clock: ClockSettings,
}

impl EngineSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&text)?)
    }

    /// Per-user settings location, if the platform has one
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "usb-audio", "usb-audio-stream")
            .map(|dirs| dirs.config_dir().join("engine.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load_or_default() -> Self {
        match Self::default_path() {
            Some(path) if path.exists() => match Self::load(&path) {
                Ok(settings) => {
                    tracing::info!("Loaded engine settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    tracing::warn!("Ignoring settings at {}: {}", path.display(), e);
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_derives_frame_size() {
        let config = StreamConfig::new(2, 32, 44100, 512, &SchedulerSettings::default()).unwrap();
        assert_eq!(config.bytes_per_frame, 8);
        assert_eq!(config.stock_frames_per_packet(), 44);
        assert_eq!(config.descriptor_pool_size(), DEFAULT_PACKETS_PER_FRAME_LIST * DEFAULT_FRAME_LISTS_IN_FLIGHT);
    }

    #[test]
    fn test_stream_config_rejects_bad_formats() {
        let scheduler = SchedulerSettings::default();
        assert!(StreamConfig::new(0, 16, 48000, 512, &scheduler).is_err());
        assert!(StreamConfig::new(2, 12, 48000, 512, &scheduler).is_err());
        assert!(StreamConfig::new(2, 16, 500, 512, &scheduler).is_err());
        assert!(StreamConfig::new(8, 32, 48000, 16, &scheduler).is_err());
    }

    #[test]
    fn test_settings_partial_toml() {
        let settings = EngineSettings::from_toml_str(
            "[scheduler]\nframe_lists_in_flight = 2\n\n[clock]\ntolerance_ppm = 500.0\n",
        )
        .unwrap();
        assert_eq!(settings.scheduler.frame_lists_in_flight, 2);
        assert_eq!(settings.scheduler.packets_per_frame_list, DEFAULT_PACKETS_PER_FRAME_LIST);
        assert_eq!(settings.clock.tolerance_ppm, 500.0);
        assert_eq!(settings.clock.lock_after_good_samples, 5);
    }

    #[test]
    fn test_settings_toml_round_trip() {
        let settings = EngineSettings::default();
        let text = settings.to_toml_string().unwrap();
        let parsed = EngineSettings::from_toml_str(&text).unwrap();
        assert_eq!(parsed.buffer.ledger_capacity, settings.buffer.ledger_capacity);
    }
}
