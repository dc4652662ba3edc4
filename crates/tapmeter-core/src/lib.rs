//! Numeric core of `tapmeter`: sample block storage and level estimation.
//!
//! Nothing in this crate performs I/O or keeps time; it turns blocks of samples into
//! [`levels::AudioLevels`].
#![warn(missing_docs)]

pub mod buffer;
pub mod estimator;
pub mod levels;
pub mod sample;
