//! Critically damped second-order tracking filter
//!
//! Tracks a quantity that advances by a nominal interval per step (wall time
//! per anchor stride, or device samples per feedback report). Raw samples go
//! through an acquisition phase before the filter locks; once locked, each
//! sample nudges the velocity through a mass-spring-damper update and the
//! predicted position is published instead of the raw value.
//!
//! With `a = spring / mass` and `b = damping / mass` the error recursion is
//! `e[n+1] = (2 - a - b) e[n] - (1 - b) e[n-1]`. It is critically damped
//! (a double pole) when `(2 - a - b)^2 == 4 (1 - b)`. The defaults
//! (mass 100, spring 1, damping 19) put both poles at 0.9.

use crate::config::ClockSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Uninitialized,
    Acquiring { good_samples: u32 },
    Locked,
}

/// What a single observation did to the filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterUpdate {
    /// Still acquiring; the sample was (or was not) within tolerance
    Acquiring { good: bool },
    /// This sample completed acquisition
    Locked { position: f64 },
    /// Locked and the sample adjusted the velocity
    Tracked { position: f64, error: f64 },
    /// Locked but the error jump exceeded tolerance; velocity untouched
    Rejected { position: f64, error: f64 },
}

impl FilterUpdate {
    pub fn position(&self) -> Option<f64> {
        match *self {
            FilterUpdate::Acquiring { .. } => None,
            FilterUpdate::Locked { position }
            | FilterUpdate::Tracked { position, .. }
            | FilterUpdate::Rejected { position, .. } => Some(position),
        }
    }
}

/// Second-order position and velocity tracker
#[derive(Debug, Clone)]
pub struct DampedFilter {
    /// Nominal advance per step
    expected_interval: f64,
    /// Largest accepted deviation per step
    tolerance: f64,
    /// Good samples in a row needed to lock
    lock_after: u32,
    mass: f64,
    spring: f64,
    damping: f64,
    state: FilterState,
    /// Filtered position, published once locked
    position: f64,
    /// Smoothed advance per step
    velocity: f64,
    /// Error of the previous locked sample
    previous_error: f64,
    /// Last raw sample seen during acquisition
    last_raw: f64,
    rejected: u64,
}

impl DampedFilter {
    /// `expected_interval` is the nominal advance per step
    pub fn new(expected_interval: f64, settings: &ClockSettings) -> Self {
        Self {
            expected_interval,
            tolerance: expected_interval * settings.tolerance_ppm / 1_000_000.0,
            lock_after: settings.lock_after_good_samples.max(1),
            mass: settings.mass,
            spring: settings.spring,
            damping: settings.damping,
            state: FilterState::Uninitialized,
            position: 0.0,
            velocity: expected_interval,
            previous_error: 0.0,
            last_raw: 0.0,
            rejected: 0,
        }
    }

    /// Feed a raw sample taken `steps` nominal intervals after the previous one
    pub fn update(&mut self, raw: f64, steps: f64) -> FilterUpdate {
        match self.state {
            FilterState::Uninitialized => {
                self.last_raw = raw;
                self.state = FilterState::Acquiring { good_samples: 0 };
                FilterUpdate::Acquiring { good: false }
            }
            FilterState::Acquiring { good_samples } => {
                let interval = raw - self.last_raw;
                let expected = self.expected_interval * steps;
                self.last_raw = raw;

                if (interval - expected).abs() > self.tolerance * steps.max(1.0) {
                    tracing::trace!("Clock sample off by {:.0}, restarting acquisition", interval - expected);
                    self.state = FilterState::Acquiring { good_samples: 0 };
                    return FilterUpdate::Acquiring { good: false };
                }

                let good_samples = good_samples + 1;
                if good_samples >= self.lock_after {
                    self.state = FilterState::Locked;
                    self.position = raw;
                    self.velocity = self.expected_interval;
                    self.previous_error = 0.0;
                    FilterUpdate::Locked { position: raw }
                } else {
                    self.state = FilterState::Acquiring { good_samples };
                    FilterUpdate::Acquiring { good: true }
                }
            }
            FilterState::Locked => {
                self.last_raw = raw;
                let predicted = self.position + self.velocity * steps;
                let error = raw - predicted;
                let delta = error - self.previous_error;
                self.previous_error = error;
                self.position = predicted;

                if delta.abs() <= self.tolerance {
                    self.velocity += (self.spring * error + self.damping * delta) / self.mass;
                    FilterUpdate::Tracked {
                        position: predicted,
                        error,
                    }
                } else {
                    self.rejected += 1;
                    FilterUpdate::Rejected {
                        position: predicted,
                        error,
                    }
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = FilterState::Uninitialized;
        self.velocity = self.expected_interval;
        self.previous_error = 0.0;
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == FilterState::Locked
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    /// Filtered advance per step
    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn expected_interval(&self) -> f64 {
        self.expected_interval
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }
}
