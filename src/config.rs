//! Probe configuration and its validation.
use std::time::Duration;
use thiserror::Error;

/// Smallest accepted analysis window, in frames.
pub const MIN_WINDOW_SIZE: usize = 32;
/// Largest accepted analysis window, in frames.
pub const MAX_WINDOW_SIZE: usize = 32768;

/// Configuration of a probe attachment. Immutable for the lifetime of a tap; changing it means
/// attaching again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeConfig {
    /// Number of frames analyzed per tick. Must be a power of two within
    /// [`MIN_WINDOW_SIZE`]`..=`[`MAX_WINDOW_SIZE`].
    pub window_size: usize,
    /// Multiplicative release applied to the peak hold on every tick where the new peak is lower.
    /// Must lie in `(0, 1)`; smaller values fall faster.
    pub decay_rate: f32,
    /// Peak level in dBFS from which a block is reported as clipping.
    pub clip_threshold_db: f32,
    /// Minimum wall-clock spacing between two level computations.
    pub update_interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            decay_rate: 0.95,
            clip_threshold_db: -0.5,
            update_interval: Duration::from_millis(50),
        }
    }
}

/// Invalid [`ProbeConfig`] values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Window size is not a power of two in the supported range.
    #[error("window size {0} is not a power of two between 32 and 32768")]
    WindowSize(usize),
    /// Decay rate is not within `(0, 1)`.
    #[error("decay rate {0} is outside (0, 1)")]
    DecayRate(f32),
    /// Clip threshold is NaN.
    #[error("clip threshold is not a number")]
    ClipThreshold,
}

impl ProbeConfig {
    /// Check every field against its documented range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.window_size.is_power_of_two()
            || !(MIN_WINDOW_SIZE..=MAX_WINDOW_SIZE).contains(&self.window_size)
        {
            return Err(ConfigError::WindowSize(self.window_size));
        }
        if !(self.decay_rate > 0.0 && self.decay_rate < 1.0) {
            return Err(ConfigError::DecayRate(self.decay_rate));
        }
        if self.clip_threshold_db.is_nan() {
            return Err(ConfigError::ClipThreshold);
        }
        Ok(())
    }
}
