//! Level values exposed to meter consumers, and the decibel helpers they are derived with.

/// Snapshot of the measured levels of one signal path, recomputed on every meter tick.
///
/// Linear values are clamped to `[0, 1]`. Decibel values are `-inf` for silence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioLevels {
    /// Decayed peak amplitude (peak hold), linear.
    pub peak: f32,
    /// Root-mean-square amplitude of the latest sample block, linear.
    pub rms: f32,
    /// [`Self::peak`] in decibels full scale.
    pub peak_db: f32,
    /// [`Self::rms`] in decibels full scale.
    pub rms_db: f32,
    /// Whether [`Self::peak_db`] reached the configured clip threshold.
    pub is_clipping: bool,
    /// Decayed peak of the left channel, only measured on two-channel blocks.
    pub left_peak: Option<f32>,
    /// Decayed peak of the right channel, only measured on two-channel blocks.
    pub right_peak: Option<f32>,
}

impl AudioLevels {
    /// Levels of a silent or unmetered signal.
    pub const SILENT: Self = Self {
        peak: 0.0,
        rms: 0.0,
        peak_db: f32::NEG_INFINITY,
        rms_db: f32::NEG_INFINITY,
        is_clipping: false,
        left_peak: None,
        right_peak: None,
    };

    /// Whether these are the baseline levels meters fall back to.
    pub fn is_silent(&self) -> bool {
        self.peak == 0.0 && self.rms == 0.0 && !self.is_clipping
    }
}

impl Default for AudioLevels {
    fn default() -> Self {
        Self::SILENT
    }
}

/// Convert a linear amplitude into decibels full scale. Non-positive amplitudes (and NaN) map
/// to negative infinity.
///
/// ```rust
/// use tapmeter_core::levels::linear_to_db;
/// assert_eq!(linear_to_db(1.0), 0.0);
/// assert_eq!(linear_to_db(0.0), f32::NEG_INFINITY);
/// assert!((linear_to_db(0.5) + 6.0206).abs() < 1e-4);
/// ```
pub fn linear_to_db(x: f32) -> f32 {
    if x > 0.0 {
        20.0 * x.log10()
    } else {
        f32::NEG_INFINITY
    }
}

/// Clamp a value into `[0, 1]`. NaN clamps to 0.
pub fn clamp01(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

/// Clipping decision: the threshold itself counts as clipping.
pub fn is_clipping(peak_db: f32, clip_threshold_db: f32) -> bool {
    peak_db >= clip_threshold_db
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_silent_baseline() {
        let levels = AudioLevels::default();
        assert_eq!(0.0, levels.peak);
        assert_eq!(0.0, levels.rms);
        assert_eq!(f32::NEG_INFINITY, levels.peak_db);
        assert_eq!(f32::NEG_INFINITY, levels.rms_db);
        assert!(!levels.is_clipping);
        assert!(levels.is_silent());
    }

    #[test]
    fn test_db_of_non_positive() {
        assert_eq!(f32::NEG_INFINITY, linear_to_db(-0.5));
        assert_eq!(f32::NEG_INFINITY, linear_to_db(f32::NAN));
    }

    #[test]
    fn test_clamp() {
        assert_eq!(1.0, clamp01(3.5));
        assert_eq!(0.0, clamp01(-0.1));
        assert_eq!(0.0, clamp01(f32::NAN));
        assert_eq!(0.25, clamp01(0.25));
    }

    #[test]
    fn test_clipping_boundary() {
        let threshold = -0.5f32;
        assert!(is_clipping(threshold, threshold));
        let below = f32::from_bits(threshold.to_bits() + 1);
        assert!(below < threshold);
        assert!(!is_clipping(below, threshold));
        assert!(!is_clipping(f32::NEG_INFINITY, threshold));
    }
}
