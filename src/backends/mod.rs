//! # Backends
//!
//! Implementations of [`AudioEngine`](crate::engine::AudioEngine) bundled with the crate.
//!
//! - [`memory`]: paths written by the host on the UI thread, for offline analysis and tests.
//! - [`ring`]: paths fed from real-time audio threads through lock-free ring buffers.

pub mod memory;
pub mod ring;
