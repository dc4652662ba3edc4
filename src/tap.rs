//! Lifecycle of one probe attached to one signal path.
use tapmeter_core::buffer::{AudioBuffer, AudioRef};
use tapmeter_core::estimator::LevelEstimator;
use tapmeter_core::levels::AudioLevels;

use crate::config::ProbeConfig;
use crate::engine::{AudioEngine, Probe, TapFlags};
use crate::error::AttachError;

/// Binds exactly one signal path to exactly one probe, and owns the sample buffer blocks are read
/// into.
///
/// The buffer is allocated once on attach and reused by every [`Self::read_block`]. Detaching is
/// idempotent and also happens on drop.
#[derive(Debug)]
pub struct SourceTap<P: Probe> {
    probe: Option<P>,
    /// Debug rendering of the observed source, carried on every lifecycle record.
    source: String,
    buffer: AudioBuffer<f32>,
    config: ProbeConfig,
}

impl<P: Probe> SourceTap<P> {
    /// Attach a probe to `source`.
    ///
    /// Fails with [`AttachError::EngineUnavailable`] when the engine is not running, and
    /// otherwise with whatever the engine reports.
    pub fn attach<E>(
        engine: &E,
        source: &E::Source,
        config: ProbeConfig,
    ) -> Result<Self, AttachError>
    where
        E: AudioEngine<Probe = P>,
    {
        config.validate()?;
        let state = engine.state();
        if !state.is_running() {
            return Err(AttachError::EngineUnavailable(state));
        }
        let probe = engine.attach(source, &config)?;
        let buffer = AudioBuffer::zeroed(probe.channels(), config.window_size);
        log::debug!(source:? = source, channels = probe.channels(),
            window_size = config.window_size; "Probe attached");
        Ok(Self {
            probe: Some(probe),
            source: format!("{source:?}"),
            buffer,
            config,
        })
    }

    /// Whether the probe is still attached.
    pub fn is_attached(&self) -> bool {
        self.probe.is_some()
    }

    /// Debug rendering of the source the tap was attached to.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Configuration the tap was attached with.
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Number of channels in the blocks returned by [`Self::read_block`].
    pub fn channels(&self) -> usize {
        self.buffer.num_channels()
    }

    /// Read the latest window of samples. A detached tap yields silence flagged
    /// [`TapFlags::SOURCE_LOST`].
    pub fn read_block(&mut self) -> (AudioRef<'_, f32>, TapFlags) {
        let flags = match self.probe.as_mut() {
            Some(probe) => probe.read_into(self.buffer.as_mut()),
            None => {
                self.buffer.fill(0.0);
                TapFlags::SOURCE_LOST
            }
        };
        (self.buffer.as_ref(), flags)
    }

    /// Remove the probe from the graph. Calling this again, or on a tap whose source has already
    /// gone away, does nothing. Detach failures are logged and otherwise ignored, as the
    /// observed path must keep playing regardless.
    pub fn detach(&mut self) {
        let Some(mut probe) = self.probe.take() else {
            return;
        };
        match probe.detach() {
            Ok(()) => log::debug!(source:? = self.source; "Probe detached"),
            Err(err) => log::debug!(source:? = self.source, reason:% = err;
                "Probe detach failed, dropping it anyway"),
        }
    }
}

impl<P: Probe> Drop for SourceTap<P> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Result of one [`MeteredTap::measure`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Levels after this measurement.
    pub levels: AudioLevels,
    /// Conditions reported with the block.
    pub flags: TapFlags,
    /// Whether the source was found gone on this measurement and not before.
    pub newly_lost: bool,
}

/// A [`SourceTap`] paired with the level estimator that measures it.
#[derive(Debug)]
pub struct MeteredTap<P: Probe> {
    tap: SourceTap<P>,
    estimator: LevelEstimator,
    levels: AudioLevels,
    lost: bool,
}

impl<P: Probe> MeteredTap<P> {
    /// Start metering an attached tap, with an empty peak hold.
    pub fn new(tap: SourceTap<P>) -> Self {
        let config = tap.config();
        let estimator = LevelEstimator::new(config.decay_rate, config.clip_threshold_db);
        Self {
            tap,
            estimator,
            levels: AudioLevels::SILENT,
            lost: false,
        }
    }

    /// Read the latest block and update the levels.
    ///
    /// A lost source keeps being measured: it yields silence, so the peak hold decays to rest.
    pub fn measure(&mut self) -> Reading {
        let (block, flags) = self.tap.read_block();
        self.levels = self.estimator.process(block);
        if !flags.is_empty() {
            log::trace!(flags:? = flags; "Probe flagged block");
        }
        let lost = flags.contains(TapFlags::SOURCE_LOST);
        let newly_lost = lost && !self.lost;
        self.lost = lost;
        Reading {
            levels: self.levels,
            flags,
            newly_lost,
        }
    }

    /// Levels computed by the last [`Self::measure`].
    pub fn levels(&self) -> AudioLevels {
        self.levels
    }

    /// The underlying tap.
    pub fn tap(&self) -> &SourceTap<P> {
        &self.tap
    }

    /// Detach the probe. Levels are left as they were.
    pub fn detach(&mut self) {
        self.tap.detach();
    }
}
