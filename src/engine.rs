//! Capability interface between the metering layer and the audio engine that owns the signal
//! graph.
//!
//! The engine is shared ambient state with its own lifecycle; meters receive it explicitly and
//! only ever ask it for probes. Backends live in [`crate::backends`].
use std::fmt;

use bitflags::bitflags;
use duplicate::duplicate_item;
use tapmeter_core::buffer::AudioMut;

use crate::config::ProbeConfig;
use crate::error::{AttachError, DetachError};

/// Lifecycle state of an audio engine/context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// The engine is processing audio; probes can be attached.
    Running,
    /// The engine exists but is not processing audio (e.g. waiting for a user gesture).
    Suspended,
    /// The engine has been shut down and will not run again.
    Closed,
}

impl EngineState {
    /// Whether the engine accepts new probes in this state.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

bitflags! {
    /// Conditions reported by a probe alongside a sample block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TapFlags: u32 {
        /// No new samples arrived since the previous read; the block repeats the last window.
        const STALE = 1 << 0;
        /// The observed signal path is gone; the block is silence.
        const SOURCE_LOST = 1 << 1;
        /// The producer outran the probe and samples were dropped.
        const OVERRUN = 1 << 2;
    }
}

/// An audio engine which can attach measurement probes to its signal paths.
pub trait AudioEngine {
    /// Handle to a live signal path. Equality must distinguish a path from one that replaced it.
    type Source: Clone + PartialEq + fmt::Debug;
    /// Probe type created by this engine.
    type Probe: Probe;

    /// Current engine state.
    fn state(&self) -> EngineState;

    /// Insert an observation point on `source`. This adds a fan-out in the graph, but must not
    /// change the gain, latency or routing of the observed path.
    fn attach(
        &self,
        source: &Self::Source,
        config: &ProbeConfig,
    ) -> Result<Self::Probe, AttachError>;
}

/// Non-destructive observation point on a signal path.
///
/// Object safe, so that backends can be erased behind `Box<dyn Probe>`.
pub trait Probe {
    /// Number of channels delivered by [`Self::read_into`].
    fn channels(&self) -> usize;

    /// Fill `block` with the most recent window of samples, one row per channel. Must not
    /// allocate.
    fn read_into(&mut self, block: AudioMut<f32>) -> TapFlags;

    /// Remove the observation point from the graph. Must not pause, mute or otherwise perturb the
    /// observed path.
    fn detach(&mut self) -> Result<(), DetachError>;
}

#[duplicate_item(
    ty;
    [Box<P>];
    [&mut P];
)]
impl<P: Probe + ?Sized> Probe for ty {
    fn channels(&self) -> usize {
        (**self).channels()
    }

    fn read_into(&mut self, block: AudioMut<f32>) -> TapFlags {
        (**self).read_into(block)
    }

    fn detach(&mut self) -> Result<(), DetachError> {
        (**self).detach()
    }
}
