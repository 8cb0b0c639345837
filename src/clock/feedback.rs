//! Sync-feedback endpoint decoding and device rate tracking
//!
//! Asynchronous devices report their sample clock as frames per bus
//! interval: 10.14 fixed point in 3 bytes at full speed (per 1 ms frame),
//! 16.16 in 4 bytes at high speed (per 125 us microframe).

use crate::clock::filter::{DampedFilter, FilterUpdate};
use crate::config::ClockSettings;

/// Decode a feedback report into frames per millisecond
pub fn decode_feedback(report: &[u8]) -> Option<f64> {
    match report {
        [b0, b1, b2] => {
            let raw = u32::from_le_bytes([*b0, *b1, *b2, 0]);
            Some(raw as f64 / 16_384.0)
        }
        [b0, b1, b2, b3] => {
            let raw = u32::from_le_bytes([*b0, *b1, *b2, *b3]);
            Some(raw as f64 / 65_536.0 * 8.0)
        }
        _ => None,
    }
}

/// Smooths feedback reports into a measured device sample rate
#[derive(Debug)]
pub struct FeedbackTracker {
    filter: DampedFilter,
    report_interval_ms: f64,
    accumulated: f64,
    reports: u64,
    malformed: u64,
}

impl FeedbackTracker {
    pub fn new(nominal_rate: u32, report_interval_ms: u32, settings: &ClockSettings) -> Self {
        let report_interval_ms = report_interval_ms.max(1) as f64;
        let expected = nominal_rate as f64 / 1000.0 * report_interval_ms;
        Self {
            filter: DampedFilter::new(expected, settings),
            report_interval_ms,
            accumulated: 0.0,
            reports: 0,
            malformed: 0,
        }
    }

    /// Feed one raw report; returns the measured rate once locked
    pub fn observe(&mut self, report: &[u8]) -> Option<u32> {
        let Some(frames_per_ms) = decode_feedback(report) else {
            self.malformed += 1;
            tracing::debug!("Ignoring {}-byte feedback report", report.len());
            return None;
        };
        self.observe_frames_per_ms(frames_per_ms)
    }

    pub fn observe_frames_per_ms(&mut self, frames_per_ms: f64) -> Option<u32> {
        self.reports += 1;
        self.accumulated += frames_per_ms * self.report_interval_ms;
        if let FilterUpdate::Locked { .. } = self.filter.update(self.accumulated, 1.0) {
            tracing::info!("Feedback clock locked");
        }
        self.device_rate_hz()
    }

    /// Filtered device rate, available once the filter has locked
    pub fn device_rate_hz(&self) -> Option<u32> {
        self.filter
            .is_locked()
            .then(|| (self.filter.velocity() / self.report_interval_ms * 1000.0).round() as u32)
    }

    pub fn reset(&mut self) {
        self.filter.reset();
        self.accumulated = 0.0;
    }

    pub fn report_count(&self) -> u64 {
        self.reports
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_speed_10_14() {
        // 44.1 frames/ms = 722534.4 in 10.14; the device rounds to 722534
        let raw: u32 = 722_534;
        let bytes = raw.to_le_bytes();
        let value = decode_feedback(&bytes[..3]).unwrap();
        assert!((value - 44.1).abs() < 0.001);
    }

    #[test]
    fn test_decode_high_speed_16_16() {
        // 6 frames per microframe at 48 kHz
        let raw: u32 = 6 << 16;
        assert_eq!(decode_feedback(&raw.to_le_bytes()), Some(48.0));
    }

    #[test]
    fn test_rejects_odd_lengths() {
        assert_eq!(decode_feedback(&[1, 2]), None);
        let mut tracker = FeedbackTracker::new(48000, 1, &ClockSettings::default());
        assert_eq!(tracker.observe(&[0; 5]), None);
        assert_eq!(tracker.malformed_count(), 1);
    }

    #[test]
    fn test_tracker_measures_slow_device() {
        let mut tracker = FeedbackTracker::new(48000, 8, &ClockSettings::default());
        let mut rate = None;
        for _ in 0..300 {
            rate = tracker.observe_frames_per_ms(47.99);
        }
        assert_eq!(rate, Some(47990));
    }
}
