//! Conversion of PCM sample formats into the `f32` representation used for metering.
use duplicate::duplicate_item;

/// Sample formats a feed can accept. Every format maps onto the nominal `[-1, 1]` full-scale range
/// of `f32` audio.
pub trait ConvertSample: Sized + Copy {
    /// Value for which the amplitude of the signal is zero. This is not the numerical zero for
    /// unsigned formats.
    const ZERO: Self;

    /// Convert this sample into its `f32` equivalent.
    fn convert_to_f32(self) -> f32;
}

#[duplicate_item(
float;
[f32];
[f64];
)]
impl ConvertSample for float {
    const ZERO: Self = 0.0;

    #[inline]
    fn convert_to_f32(self) -> f32 {
        self as f32
    }
}

#[duplicate_item(
int;
[i8];
[i16];
[i32];
)]
impl ConvertSample for int {
    const ZERO: Self = 0;

    #[inline]
    fn convert_to_f32(self) -> f32 {
        self as f32 / Self::MAX as f32
    }
}

#[duplicate_item(
uint    zero;
[u8]    [128];
[u16]   [32768];
)]
impl ConvertSample for uint {
    const ZERO: Self = zero;

    #[inline]
    fn convert_to_f32(self) -> f32 {
        (self as f32 - zero as f32) / zero as f32
    }
}
