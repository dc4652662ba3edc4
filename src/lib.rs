//! # tapmeter
//!
//! Real-time audio level metering for user interfaces. Probes observe live signal paths without
//! altering them, and meters turn the observed samples into peak, RMS and clipping readings at a
//! bounded refresh rate.
//!
//! - [`single::SingleMeter`] follows one signal path.
//! - [`multi::MultiMeter`] follows a changing set of tracks under a single frame registration.
//!
//! Meters are driven by the host through a [`schedule::FrameLoop`], from its rendering loop. The
//! audio engine owning the signal graph is abstracted by [`engine::AudioEngine`]; the
//! [`backends`] module has an in-memory engine and a real-time engine fed through ring buffers.
#![warn(missing_docs)]

pub mod backends;
pub mod config;
pub mod engine;
pub mod error;
pub mod multi;
pub mod prelude;
pub mod schedule;
pub mod single;
pub mod tap;

pub use tapmeter_core::{buffer, estimator, levels, sample};

/// Marker for values handed over to audio threads: [Send] everywhere but on wasm, where the
/// host runs everything on one thread.
#[cfg(not(wasm))]
pub trait SendEverywhereButOnWeb: 'static + Send {}
#[cfg(not(wasm))]
impl<T: 'static + Send> SendEverywhereButOnWeb for T {}

/// Marker for values handed over to audio threads. No bound on wasm.
#[cfg(wasm)]
pub trait SendEverywhereButOnWeb {}
#[cfg(wasm)]
impl<T> SendEverywhereButOnWeb for T {}
