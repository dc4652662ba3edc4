//! Sample block storage.
//!
//! Blocks are stored non-interleaved, one row per channel, and can be viewed immutably
//! ([`AudioRef`], the block handed to the estimator) or mutably ([`AudioMut`], the view a probe
//! fills in place).
use std::fmt;

use ndarray::{
    Array2, ArrayBase, ArrayView1, ArrayView2, ArrayViewMut1, Axis, Data, DataMut, Ix2, OwnedRepr,
    RawData, ViewRepr,
};

use crate::sample::ConvertSample;

/// Block owning its samples.
pub type AudioBuffer<T> = AudioBufferBase<OwnedRepr<T>>;
/// Read-only view of a block.
pub type AudioRef<'a, T> = AudioBufferBase<ViewRepr<&'a T>>;
/// Writable view of a block.
pub type AudioMut<'a, T> = AudioBufferBase<ViewRepr<&'a mut T>>;

/// Channels x frames block of samples, generic over ownership.
pub struct AudioBufferBase<S: RawData> {
    storage: ArrayBase<S, Ix2>,
}

impl<S: RawData> fmt::Debug for AudioBufferBase<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AudioBufferBase({} ch x {} frames of {})",
            self.num_channels(),
            self.num_samples(),
            std::any::type_name::<S::Elem>()
        )
    }
}

impl<T> Clone for AudioRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AudioRef<'_, T> {}

impl<S: RawData> AudioBufferBase<S> {
    /// Frames per channel.
    pub fn num_samples(&self) -> usize {
        self.storage.ncols()
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.storage.nrows()
    }

    /// Whether the block holds no sample at all.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

impl<S: Data> AudioBufferBase<S> {
    /// Borrow the block read-only.
    pub fn as_ref(&self) -> AudioRef<'_, S::Elem> {
        AudioRef {
            storage: self.storage.view(),
        }
    }

    /// Samples of one channel. Panics if `channel` is out of range.
    pub fn get_channel(&self, channel: usize) -> ArrayView1<'_, S::Elem> {
        self.storage.row(channel)
    }

    /// Every sample, channel after channel.
    pub fn samples(&self) -> impl '_ + Iterator<Item = &S::Elem> {
        self.storage.iter()
    }
}

impl<S: DataMut> AudioBufferBase<S> {
    /// Borrow the block for writing.
    pub fn as_mut(&mut self) -> AudioMut<'_, S::Elem> {
        AudioMut {
            storage: self.storage.view_mut(),
        }
    }

    /// Writable channels, in order.
    pub fn channels_mut(&mut self) -> impl '_ + Iterator<Item = ArrayViewMut1<'_, S::Elem>> {
        self.storage.rows_mut().into_iter()
    }

    /// Overwrite every sample with `value`.
    pub fn fill(&mut self, value: S::Elem)
    where
        S::Elem: Clone,
    {
        self.storage.fill(value);
    }
}

impl<T: ConvertSample> AudioBuffer<T> {
    /// Block of `channels` x `frames` equilibrium samples. Allocates.
    pub fn zeroed(channels: usize, frames: usize) -> Self {
        Self {
            storage: Array2::from_elem((channels, frames), T::ZERO),
        }
    }
}

impl<'a, T> AudioRef<'a, T> {
    /// View interleaved `data` as a block, without copying.
    ///
    /// Returns `None` when `channels` is zero or `data` does not hold whole frames.
    pub fn from_interleaved(data: &'a [T], channels: usize) -> Option<Self> {
        if channels == 0 || data.len() % channels != 0 {
            return None;
        }
        let frames = ArrayView2::from_shape((data.len() / channels, channels), data).ok()?;
        Some(Self {
            storage: frames.reversed_axes(),
        })
    }

    /// View `data` as a single-channel block.
    pub fn from_mono(data: &'a [T]) -> Self {
        Self {
            storage: ArrayView1::from(data).insert_axis(Axis(0)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_interleaved_view() {
        let data = [0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0];
        let buffer = AudioRef::from_interleaved(&data, 2).unwrap();
        assert_eq!(2, buffer.num_channels());
        assert_eq!(3, buffer.num_samples());
        assert_eq!(vec![0.0, 2.0, 4.0], buffer.get_channel(0).to_vec());
        assert_eq!(vec![1.0, 3.0, 5.0], buffer.get_channel(1).to_vec());
    }

    #[test]
    fn test_interleaved_rejects_ragged_data() {
        let data = [0.0f32; 5];
        assert!(AudioRef::from_interleaved(&data, 2).is_none());
        assert!(AudioRef::from_interleaved(&data, 0).is_none());
    }

    #[test]
    fn test_write_through_mut_view() {
        let mut buffer = AudioBuffer::<f32>::zeroed(2, 4);
        {
            let mut view = buffer.as_mut();
            if let Some(mut right) = view.channels_mut().nth(1) {
                right.fill(0.5);
            };
        }
        assert!(buffer.get_channel(0).iter().all(|&s| s == 0.0));
        assert!(buffer.get_channel(1).iter().all(|&s| s == 0.5));
        for (i, mut channel) in buffer.channels_mut().enumerate() {
            channel.fill(i as f32);
        }
        let samples: Vec<f32> = buffer.samples().copied().collect();
        assert_eq!([0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0], samples[..]);
        buffer.fill(0.0);
        assert!(buffer.samples().all(|&s| s == 0.0));
    }

    #[test]
    fn test_empty() {
        let buffer = AudioBuffer::<f32>::zeroed(1, 0);
        assert!(buffer.is_empty());
        assert!(AudioRef::<f32>::from_mono(&[]).is_empty());
        assert!(!AudioBuffer::<u8>::zeroed(1, 1).is_empty());
    }
}
