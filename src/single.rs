//! # Single source metering
//!
//! A [`SingleMeter`] follows one signal path and keeps its [`AudioLevels`] up to date from the
//! host's frame loop.
//!
//! ```rust
//! use std::time::Duration;
//! use tapmeter::backends::memory::MemoryEngine;
//! use tapmeter::prelude::*;
//!
//! let engine = MemoryEngine::new();
//! let frame_loop = FrameLoop::new();
//! let source = engine.create_path(1);
//!
//! let mut meter = SingleMeter::new(engine.clone(), frame_loop.clone());
//! meter.enable(source, ProbeConfig::default());
//! assert_eq!(MeterState::Active, meter.state());
//!
//! engine.write(&source, &[0.5, -0.5]);
//! frame_loop.run_frame(Duration::ZERO);
//! assert_eq!(0.5, meter.levels().peak);
//!
//! meter.disable();
//! assert!(meter.levels().is_silent());
//! ```
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tapmeter_core::levels::AudioLevels;

use crate::config::ProbeConfig;
use crate::engine::{AudioEngine, Probe};
use crate::schedule::{FrameLoop, FrameRegistration, Throttle};
use crate::tap::{MeteredTap, SourceTap};

/// Lifecycle state of a [`SingleMeter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterState {
    /// No source, no probe.
    Idle,
    /// Waiting for the engine to accept a probe. Levels stay at baseline.
    Attaching,
    /// Metering. A meter whose attachment failed is also `Active`, with baseline levels; see
    /// [`SingleMeter::is_degraded`].
    Active,
}

struct Shared<P: Probe> {
    metered: Option<MeteredTap<P>>,
    throttle: Throttle,
}

impl<P: Probe> Shared<P> {
    /// Returns whether the source was found lost on this tick.
    fn tick(&mut self, now: Duration) -> bool {
        let Some(metered) = self.metered.as_mut() else {
            return false;
        };
        if !self.throttle.ready(now) {
            return false;
        }
        metered.measure().newly_lost
    }
}

/// Meter of a single signal path.
///
/// Errors never escape the meter: a failed attachment leaves it at baseline levels and is
/// logged with the source and the reason.
pub struct SingleMeter<E: AudioEngine> {
    engine: E,
    frame_loop: FrameLoop,
    shared: Rc<RefCell<Shared<E::Probe>>>,
    registration: Option<FrameRegistration>,
    source: Option<E::Source>,
    config: ProbeConfig,
    state: MeterState,
}

impl<E: AudioEngine> fmt::Debug for SingleMeter<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleMeter")
            .field("state", &self.state)
            .field("source", &self.source)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: AudioEngine> SingleMeter<E>
where
    E::Source: 'static,
    E::Probe: 'static,
{
    /// Create an idle meter on `engine`, ticking from `frame_loop`.
    pub fn new(engine: E, frame_loop: FrameLoop) -> Self {
        let config = ProbeConfig::default();
        Self {
            engine,
            frame_loop,
            shared: Rc::new(RefCell::new(Shared {
                metered: None,
                throttle: Throttle::new(config.update_interval),
            })),
            registration: None,
            source: None,
            config,
            state: MeterState::Idle,
        }
    }

    /// Start metering `source`.
    ///
    /// Calling this again with the same source and config is a no-op once active, and retries
    /// the attachment while the engine was not ready. Any other change tears the current tap
    /// down and attaches anew, with an empty peak hold.
    pub fn enable(&mut self, source: E::Source, config: ProbeConfig) {
        if self.source.as_ref() == Some(&source) && self.config == config {
            match self.state {
                MeterState::Active => return,
                MeterState::Attaching => {
                    self.attach();
                    return;
                }
                MeterState::Idle => {}
            }
        }
        self.release();
        self.source = Some(source);
        self.config = config;
        self.attach();
    }

    fn attach(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        self.state = MeterState::Attaching;
        match SourceTap::attach(&self.engine, &source, self.config) {
            Ok(tap) => {
                {
                    let mut shared = self.shared.borrow_mut();
                    shared.metered = Some(MeteredTap::new(tap));
                    shared.throttle = Throttle::new(self.config.update_interval);
                }
                let shared = self.shared.clone();
                self.registration = Some(self.frame_loop.request(move |now| {
                    if shared.borrow_mut().tick(now) {
                        log::warn!(source:? = source;
                            "Metered source lost, levels fall to silence");
                    }
                }));
                self.state = MeterState::Active;
            }
            Err(err) if err.is_retryable() => {
                log::debug!(source:? = source, reason:% = err; "Attachment pending");
            }
            Err(err) => {
                log::warn!(source:? = source, reason:% = err;
                    "Cannot meter source, levels stay at baseline");
                self.state = MeterState::Active;
            }
        }
    }
}

impl<E: AudioEngine> SingleMeter<E> {
    /// Stop metering and return to [`MeterState::Idle`]. Levels fall back to baseline.
    pub fn disable(&mut self) {
        if self.state == MeterState::Idle {
            return;
        }
        self.release();
        self.source = None;
        self.state = MeterState::Idle;
        log::debug!("Meter disabled");
    }

    /// Latest levels; baseline unless a tap is attached.
    pub fn levels(&self) -> AudioLevels {
        self.shared
            .borrow()
            .metered
            .as_ref()
            .map_or(AudioLevels::SILENT, MeteredTap::levels)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MeterState {
        self.state
    }

    /// Whether the meter is active but could not attach to its source.
    pub fn is_degraded(&self) -> bool {
        self.state == MeterState::Active && self.registration.is_none()
    }

    /// Source given to the last [`Self::enable`], if still enabled.
    pub fn source(&self) -> Option<&E::Source> {
        self.source.as_ref()
    }

    /// Configuration given to the last [`Self::enable`].
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    fn release(&mut self) {
        // The registration must be gone before the tap is detached.
        if let Some(registration) = self.registration.take() {
            registration.cancel();
        }
        let metered = self.shared.borrow_mut().metered.take();
        if let Some(mut metered) = metered {
            metered.detach();
        }
        self.shared.borrow_mut().throttle.reset();
    }
}

impl<E: AudioEngine> Drop for SingleMeter<E> {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backends::memory::{MemoryEngine, MemorySource};
    use crate::backends::ring::{RingEngine, MAX_TAPS_PER_PATH};
    use crate::engine::EngineState;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn setup() -> (MemoryEngine, FrameLoop, MemorySource, SingleMeter<MemoryEngine>) {
        let engine = MemoryEngine::new();
        let frame_loop = FrameLoop::new();
        let source = engine.create_path(1);
        let meter = SingleMeter::new(engine.clone(), frame_loop.clone());
        (engine, frame_loop, source, meter)
    }

    #[test]
    fn test_burst_then_silence() {
        let (engine, frame_loop, source, mut meter) = setup();
        meter.enable(source, ProbeConfig::default());

        let burst: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        engine.write(&source, &burst);
        frame_loop.run_frame(ms(0));
        assert_eq!(1.0, meter.levels().peak);
        assert!(meter.levels().is_clipping);

        let mut expected = 1.0f32;
        for tick in 1..=10 {
            engine.write(&source, &[0.0; 256]);
            // Frames between two ticks do not recompute.
            frame_loop.run_frame(ms(tick * 50 - 34));
            expected *= 0.95;
            frame_loop.run_frame(ms(tick * 50));
            let levels = meter.levels();
            assert!((levels.peak - expected).abs() < 1e-6);
            assert_eq!(0.0, levels.rms);
        }
        assert_eq!(11, engine.read_count(&source));
    }

    #[test]
    fn test_disable_cancels_then_resets() {
        let (engine, frame_loop, source, mut meter) = setup();
        meter.enable(source, ProbeConfig::default());
        engine.write(&source, &[0.7]);
        frame_loop.run_frame(ms(0));
        assert_eq!(0.7, meter.levels().peak);
        assert_eq!(1, frame_loop.len());

        meter.disable();
        assert_eq!(MeterState::Idle, meter.state());
        assert!(frame_loop.is_empty());
        assert_eq!(0, engine.tap_count(&source));
        assert_eq!(AudioLevels::SILENT, meter.levels());

        assert_eq!(0, frame_loop.run_frame(ms(100)));
        assert_eq!(1, engine.read_count(&source));
        assert_eq!(None, meter.source());
    }

    #[test]
    fn test_same_inputs_are_a_noop() {
        let (engine, frame_loop, source, mut meter) = setup();
        meter.enable(source, ProbeConfig::default());
        meter.enable(source, ProbeConfig::default());
        assert_eq!(1, engine.attach_count());
        assert_eq!(0, engine.detach_count());
        assert_eq!(1, frame_loop.len());
    }

    #[test]
    fn test_changed_inputs_reattach() {
        let (engine, frame_loop, first, mut meter) = setup();
        let second = engine.create_path(2);
        meter.enable(first, ProbeConfig::default());
        engine.write(&first, &[0.9]);
        frame_loop.run_frame(ms(0));

        meter.enable(second, ProbeConfig::default());
        assert_eq!(0, engine.tap_count(&first));
        assert_eq!(1, engine.tap_count(&second));
        assert_eq!(1, frame_loop.len());
        assert_eq!(Some(&second), meter.source());
        assert!(meter.levels().is_silent());

        let config = ProbeConfig {
            window_size: 512,
            ..Default::default()
        };
        meter.enable(second, config);
        assert_eq!(3, engine.attach_count());
        assert_eq!(2, engine.detach_count());
        assert_eq!(512, meter.config().window_size);
    }

    #[test]
    fn test_engine_not_ready() {
        let (engine, frame_loop, source, mut meter) = setup();
        engine.set_state(EngineState::Suspended);
        meter.enable(source, ProbeConfig::default());
        assert_eq!(MeterState::Attaching, meter.state());
        assert!(frame_loop.is_empty());
        assert!(meter.levels().is_silent());

        engine.set_state(EngineState::Running);
        meter.enable(source, ProbeConfig::default());
        assert_eq!(MeterState::Active, meter.state());
        assert!(!meter.is_degraded());
        assert_eq!(1, frame_loop.len());
    }

    #[test]
    fn test_rejected_source_degrades() {
        let (engine, frame_loop, source, mut meter) = setup();
        engine.reject_next_attach("no free tap slot");
        meter.enable(source, ProbeConfig::default());
        assert_eq!(MeterState::Active, meter.state());
        assert!(meter.is_degraded());
        assert!(frame_loop.is_empty());
        assert!(meter.levels().is_silent());

        // Not retried until the caller hands over something new.
        meter.enable(source, ProbeConfig::default());
        assert!(meter.is_degraded());
        assert_eq!(0, engine.attach_count());

        let fresh = engine.replace_path(&source).unwrap();
        meter.enable(fresh, ProbeConfig::default());
        assert!(!meter.is_degraded());
        assert_eq!(1, engine.attach_count());
    }

    #[test]
    fn test_invalid_config_degrades() {
        let (engine, _frame_loop, source, mut meter) = setup();
        let config = ProbeConfig {
            decay_rate: 1.5,
            ..Default::default()
        };
        meter.enable(source, config);
        assert!(meter.is_degraded());
        assert_eq!(0, engine.attach_count());
    }

    #[test]
    fn test_source_lost_while_active() {
        let (engine, frame_loop, source, mut meter) = setup();
        meter.enable(source, ProbeConfig::default());
        engine.write(&source, &[0.8]);
        frame_loop.run_frame(ms(0));
        engine.close_path(&source);
        frame_loop.run_frame(ms(50));
        frame_loop.run_frame(ms(100));
        let levels = meter.levels();
        assert!((levels.peak - 0.8 * 0.95 * 0.95).abs() < 1e-6);
        assert_eq!(0.0, levels.rms);
        assert_eq!(MeterState::Active, meter.state());
    }

    #[test]
    fn test_reattach_cycles_on_idle_ring_path() {
        let engine = RingEngine::default();
        let frame_loop = FrameLoop::new();
        let (source, mut feed) = engine.create_path(1);
        let mut meter = SingleMeter::new(engine.clone(), frame_loop.clone());
        for i in 0..2 * MAX_TAPS_PER_PATH {
            let config = ProbeConfig {
                window_size: 64 << (i % 2),
                ..Default::default()
            };
            meter.enable(source.clone(), config);
            assert!(!meter.is_degraded());
        }
        assert_eq!(MeterState::Active, meter.state());

        feed.push(&[0.5f32; 512]);
        frame_loop.run_frame(ms(0));
        feed.push(&[0.5f32; 512]);
        frame_loop.run_frame(ms(50));
        assert!((meter.levels().peak - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_drop_releases() {
        let (engine, frame_loop, source, mut meter) = setup();
        meter.enable(source, ProbeConfig::default());
        drop(meter);
        assert!(frame_loop.is_empty());
        assert_eq!(0, engine.tap_count(&source));
    }
}
