//! Time-domain level estimation.
//!
//! The free functions are pure. [`LevelEstimator`] adds the only state carried between blocks:
//! the peak hold envelope.
use crate::buffer::AudioRef;
use crate::levels::{clamp01, is_clipping, linear_to_db, AudioLevels};

/// Magnitude of a single sample. NaN contributes nothing and infinities saturate at full scale,
/// so that neither can leak into held state.
#[inline]
fn magnitude(sample: f32) -> f32 {
    if sample.is_nan() {
        0.0
    } else if sample.is_infinite() {
        1.0
    } else {
        sample.abs()
    }
}

/// Maximum absolute sample value of the block; 0 for an empty block.
pub fn compute_peak<'a>(samples: impl IntoIterator<Item = &'a f32>) -> f32 {
    samples
        .into_iter()
        .map(|&s| magnitude(s))
        .fold(0.0, f32::max)
}

/// Root-mean-square of the block; 0 for an empty block.
///
/// ```rust
/// use tapmeter_core::estimator::compute_rms;
/// assert_eq!(compute_rms(&[0.5, -0.5, 0.5, -0.5]), 0.5);
/// assert_eq!(compute_rms(&[] as &[f32]), 0.0);
/// ```
pub fn compute_rms<'a>(samples: impl IntoIterator<Item = &'a f32>) -> f32 {
    let (sum, count) = samples
        .into_iter()
        .map(|&s| magnitude(s) as f64)
        .fold((0.0f64, 0usize), |(sum, count), m| (sum + m * m, count + 1));
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt() as f32
}

/// One step of the peak hold envelope: instant attack, per-tick exponential release.
///
/// The release does not depend on elapsed time, so the perceived release speed follows the
/// meter's update interval.
///
/// ```rust
/// use tapmeter_core::estimator::apply_peak_hold;
/// assert_eq!(apply_peak_hold(0.2, 0.8, 0.9), 0.8);
/// assert_eq!(apply_peak_hold(0.8, 0.2, 0.5), 0.4);
/// ```
pub fn apply_peak_hold(prior_hold: f32, new_peak: f32, decay_rate: f32) -> f32 {
    let new_peak = magnitude(new_peak);
    if new_peak > prior_hold {
        new_peak
    } else {
        prior_hold * decay_rate
    }
}

/// Peak hold state of one signal (or channel). Starts at 0.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PeakHold {
    value: f32,
}

impl PeakHold {
    /// Currently held value. Not clamped.
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Feed the peak of a new block into the envelope, returning the new held value.
    pub fn update(&mut self, new_peak: f32, decay_rate: f32) -> f32 {
        self.value = apply_peak_hold(self.value, new_peak, decay_rate);
        self.value
    }

    /// Drop the held value back to 0.
    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

/// Turns successive sample blocks into [`AudioLevels`].
#[derive(Debug, Clone)]
pub struct LevelEstimator {
    decay_rate: f32,
    clip_threshold_db: f32,
    hold: PeakHold,
    left: PeakHold,
    right: PeakHold,
}

impl LevelEstimator {
    /// Create an estimator with an empty peak hold.
    pub fn new(decay_rate: f32, clip_threshold_db: f32) -> Self {
        Self {
            decay_rate,
            clip_threshold_db,
            hold: PeakHold::default(),
            left: PeakHold::default(),
            right: PeakHold::default(),
        }
    }

    /// Per-tick release factor of the peak hold.
    pub fn decay_rate(&self) -> f32 {
        self.decay_rate
    }

    /// Peak level, in dB, from which a block counts as clipping.
    pub fn clip_threshold_db(&self) -> f32 {
        self.clip_threshold_db
    }

    /// Current peak hold state.
    pub fn peak_hold(&self) -> PeakHold {
        self.hold
    }

    /// Reset every peak hold, as on (re)attachment.
    pub fn reset(&mut self) {
        self.hold.reset();
        self.left.reset();
        self.right.reset();
    }

    /// Measure one block. All channels contribute to the overall peak and RMS; two-channel
    /// blocks additionally report per-side peaks.
    pub fn process(&mut self, block: AudioRef<f32>) -> AudioLevels {
        let block_peak = compute_peak(block.samples());
        let rms = clamp01(compute_rms(block.samples()));
        let peak = clamp01(self.hold.update(block_peak, self.decay_rate));

        let (left_peak, right_peak) = if block.num_channels() == 2 {
            let left = self
                .left
                .update(compute_peak(block.get_channel(0).iter()), self.decay_rate);
            let right = self
                .right
                .update(compute_peak(block.get_channel(1).iter()), self.decay_rate);
            (Some(clamp01(left)), Some(clamp01(right)))
        } else {
            self.left.reset();
            self.right.reset();
            (None, None)
        };

        let peak_db = linear_to_db(peak);
        AudioLevels {
            peak,
            rms,
            peak_db,
            rms_db: linear_to_db(rms),
            is_clipping: is_clipping(peak_db, self.clip_threshold_db),
            left_peak,
            right_peak,
        }
    }
}
