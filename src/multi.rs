//! # Multi-track metering
//!
//! A [`MultiMeter`] meters a changing set of tracks under one frame registration. The host
//! hands it the full map of live sources with [`MultiMeter::reconcile`] whenever that map may
//! have changed; the meter attaches what is new and detaches what is gone.
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use tapmeter::backends::memory::MemoryEngine;
//! use tapmeter::prelude::*;
//!
//! let engine = MemoryEngine::new();
//! let frame_loop = FrameLoop::new();
//! let drums = engine.create_path(2);
//! let bass = engine.create_path(1);
//!
//! let config = MultiMeterConfig::default();
//! let mut meter = MultiMeter::new(engine.clone(), frame_loop.clone(), config);
//! let report = meter.reconcile(&HashMap::from([("drums", drums), ("bass", bass)]));
//! assert_eq!(2, report.attached.len());
//! assert_eq!(1, frame_loop.len());
//!
//! engine.write(&bass, &[0.25]);
//! frame_loop.run_frame(Duration::ZERO);
//! assert_eq!(0.25, meter.levels(&"bass").peak);
//! assert!(meter.levels(&"drums").is_silent());
//! ```
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::Rc;
use std::time::Duration;

use tapmeter_core::levels::AudioLevels;

use crate::config::ProbeConfig;
use crate::engine::{AudioEngine, Probe};
use crate::error::AttachError;
use crate::schedule::{FrameLoop, FrameRegistration, Throttle};
use crate::tap::{MeteredTap, SourceTap};

/// What to do when a tracked id comes back with a different source handle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebindPolicy {
    /// Detach from the old path and attach to the new one, with an empty peak hold.
    #[default]
    OnHandleChange,
    /// Keep observing the path the id was first bound to until the id disappears.
    Never,
}

/// Configuration of a [`MultiMeter`].
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct MultiMeterConfig {
    /// Probe configuration shared by every track.
    pub probe: ProbeConfig,
    /// Handling of replaced sources.
    pub rebind: RebindPolicy,
}

/// Changes made by one [`MultiMeter::reconcile`]. Id order is unspecified.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport<K> {
    /// Ids that started being metered.
    pub attached: Vec<K>,
    /// Ids that stopped being metered.
    pub detached: Vec<K>,
    /// Ids moved over to a new source handle.
    pub rebound: Vec<K>,
    /// Ids whose attachment failed on this call.
    pub failed: Vec<(K, AttachError)>,
}

impl<K> Default for ReconcileReport<K> {
    fn default() -> Self {
        Self {
            attached: Vec::new(),
            detached: Vec::new(),
            rebound: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<K> ReconcileReport<K> {
    /// Whether the call changed nothing and nothing failed.
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty()
            && self.detached.is_empty()
            && self.rebound.is_empty()
            && self.failed.is_empty()
    }
}

struct Entry<S, P: Probe> {
    source: S,
    metered: MeteredTap<P>,
}

struct Registry<K, S, P: Probe> {
    entries: HashMap<K, Entry<S, P>>,
    throttle: Throttle,
}

impl<K: fmt::Debug, S: fmt::Debug, P: Probe> Registry<K, S, P> {
    fn tick(&mut self, now: Duration) {
        if !self.throttle.ready(now) {
            return;
        }
        for (id, entry) in &mut self.entries {
            if entry.metered.measure().newly_lost {
                log::warn!(track:? = id, source:? = entry.source;
                    "Metered source lost, levels fall to silence");
            }
        }
    }
}

/// Meter of many tracks, keyed by a host-chosen id.
///
/// Every track is measured on the same tick, behind a single elapsed-time gate, from a single
/// frame registration which only exists while there is something to meter.
pub struct MultiMeter<K, E: AudioEngine> {
    engine: E,
    frame_loop: FrameLoop,
    registry: Rc<RefCell<Registry<K, E::Source, E::Probe>>>,
    /// Ids whose attachment failed for good, with the handle that was rejected.
    rejected: HashMap<K, E::Source>,
    registration: Option<FrameRegistration>,
    enabled: bool,
    config: MultiMeterConfig,
}

impl<K: fmt::Debug, E: AudioEngine> fmt::Debug for MultiMeter<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.borrow();
        f.debug_struct("MultiMeter")
            .field("tracks", &registry.entries.keys().collect::<Vec<_>>())
            .field("rejected", &self.rejected)
            .field("enabled", &self.enabled)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K, E> MultiMeter<K, E>
where
    K: Eq + Hash + Clone + fmt::Debug + 'static,
    E: AudioEngine,
    E::Source: 'static,
    E::Probe: 'static,
{
    /// Create an enabled meter tracking nothing yet.
    pub fn new(engine: E, frame_loop: FrameLoop, config: MultiMeterConfig) -> Self {
        Self {
            engine,
            frame_loop,
            registry: Rc::new(RefCell::new(Registry {
                entries: HashMap::new(),
                throttle: Throttle::new(config.probe.update_interval),
            })),
            rejected: HashMap::new(),
            registration: None,
            enabled: true,
            config,
        }
    }

    /// Bring the tracked set in line with `sources`, the complete map of live sources.
    ///
    /// Ids missing from the map are detached, new ids are attached, and ids whose handle changed
    /// are rebound according to [`MultiMeterConfig::rebind`]. Attachments refused because the
    /// engine is not running are retried on the next call; other refusals are only retried once
    /// the id comes with a different handle. A disabled meter ignores the call.
    pub fn reconcile(&mut self, sources: &HashMap<K, E::Source>) -> ReconcileReport<K> {
        let mut report = ReconcileReport::default();
        if !self.enabled {
            return report;
        }
        self.rejected
            .retain(|id, source| sources.get(id) == Some(&*source));

        let rebind = self.config.rebind;
        let (stale, remaining) = {
            let registry = self.registry.borrow();
            let stale: Vec<K> = registry
                .entries
                .iter()
                .filter(|(id, entry)| match sources.get(*id) {
                    None => true,
                    Some(source) => {
                        rebind == RebindPolicy::OnHandleChange && *source != entry.source
                    }
                })
                .map(|(id, _)| id.clone())
                .collect();
            let remaining = registry.entries.len() - stale.len();
            (stale, remaining)
        };
        if remaining == 0 {
            self.cancel_registration();
        }

        let mut rebinding = Vec::new();
        for id in stale {
            let entry = self.registry.borrow_mut().entries.remove(&id);
            let Some(mut entry) = entry else {
                continue;
            };
            if sources.contains_key(&id) {
                log::debug!(track:? = id, old:? = entry.source; "Source handle changed, rebinding");
                entry.metered.detach();
                rebinding.push(id);
            } else {
                log::debug!(track:? = id, source:? = entry.source; "Track removed");
                entry.metered.detach();
                report.detached.push(id);
            }
        }

        for (id, source) in sources {
            if self.registry.borrow().entries.contains_key(id) || self.rejected.contains_key(id) {
                continue;
            }
            match SourceTap::attach(&self.engine, source, self.config.probe) {
                Ok(tap) => {
                    self.registry.borrow_mut().entries.insert(
                        id.clone(),
                        Entry {
                            source: source.clone(),
                            metered: MeteredTap::new(tap),
                        },
                    );
                    if rebinding.contains(id) {
                        report.rebound.push(id.clone());
                    } else {
                        report.attached.push(id.clone());
                    }
                }
                Err(err) => {
                    if err.is_retryable() {
                        log::debug!(track:? = id, reason:% = err; "Track attachment pending");
                    } else {
                        log::warn!(track:? = id, source:? = source, reason:% = err;
                            "Cannot meter track, levels stay at baseline");
                        self.rejected.insert(id.clone(), source.clone());
                    }
                    report.failed.push((id.clone(), err));
                }
            }
        }
        let lost_rebinds: Vec<K> = rebinding
            .into_iter()
            .filter(|id| !report.rebound.contains(id))
            .collect();
        report.detached.extend(lost_rebinds);

        self.sync_registration();
        report
    }

    /// Enable or disable metering. Disabling detaches every track and forgets every failure;
    /// re-enabling takes effect on the next [`Self::reconcile`].
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        if !enabled {
            self.release();
            log::debug!("Multi meter disabled");
        }
    }

    fn sync_registration(&mut self) {
        let has_entries = !self.registry.borrow().entries.is_empty();
        if !(self.enabled && has_entries) {
            self.cancel_registration();
            return;
        }
        if self.registration.is_none() {
            let registry = self.registry.clone();
            self.registration = Some(
                self.frame_loop
                    .request(move |now| registry.borrow_mut().tick(now)),
            );
        }
    }

    /// Latest levels of the track `id`; baseline for an id that is not metered.
    pub fn levels(&self, id: &K) -> AudioLevels {
        self.registry
            .borrow()
            .entries
            .get(id)
            .map_or(AudioLevels::SILENT, |entry| entry.metered.levels())
    }

    /// Latest levels of every metered track.
    pub fn snapshot(&self) -> HashMap<K, AudioLevels> {
        self.registry
            .borrow()
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.metered.levels()))
            .collect()
    }

    /// Ids currently metered.
    pub fn tracked(&self) -> Vec<K> {
        self.registry.borrow().entries.keys().cloned().collect()
    }

    /// Ids whose attachment was refused and which wait for a new handle.
    pub fn rejected(&self) -> Vec<K> {
        self.rejected.keys().cloned().collect()
    }
}

impl<K, E: AudioEngine> MultiMeter<K, E> {
    /// Number of metered tracks.
    pub fn len(&self) -> usize {
        self.registry.borrow().entries.len()
    }

    /// Whether no track is metered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the meter is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Meter configuration.
    pub fn config(&self) -> &MultiMeterConfig {
        &self.config
    }

    /// Detach every track and drop the meter.
    pub fn teardown(mut self) {
        self.release();
    }

    fn cancel_registration(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.cancel();
        }
        self.registry.borrow_mut().throttle.reset();
    }

    fn release(&mut self) {
        // The registration must be gone before any tap is detached.
        self.cancel_registration();
        let entries: Vec<_> = self.registry.borrow_mut().entries.drain().collect();
        for (_, mut entry) in entries {
            entry.metered.detach();
        }
        self.rejected.clear();
    }
}

impl<K, E: AudioEngine> Drop for MultiMeter<K, E> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backends::memory::{MemoryEngine, MemorySource};
    use crate::engine::EngineState;

    type Meter = MultiMeter<&'static str, MemoryEngine>;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn setup(config: MultiMeterConfig) -> (MemoryEngine, FrameLoop, Meter) {
        let engine = MemoryEngine::new();
        let frame_loop = FrameLoop::new();
        let meter = MultiMeter::new(engine.clone(), frame_loop.clone(), config);
        (engine, frame_loop, meter)
    }

    fn sorted(mut ids: Vec<&'static str>) -> Vec<&'static str> {
        ids.sort_unstable();
        ids
    }

    fn two_tracks(engine: &MemoryEngine) -> HashMap<&'static str, MemorySource> {
        HashMap::from([("a", engine.create_path(1)), ("b", engine.create_path(2))])
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (engine, frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let sources = two_tracks(&engine);

        let report = meter.reconcile(&sources);
        assert_eq!(vec!["a", "b"], sorted(report.attached));
        assert!(report.failed.is_empty());
        assert_eq!(2, meter.len());
        assert_eq!(1, frame_loop.len());

        assert!(meter.reconcile(&sources).is_empty());
        assert_eq!(2, engine.attach_count());
        assert_eq!(0, engine.detach_count());
        assert_eq!(1, frame_loop.len());
    }

    #[test]
    fn test_fan_out_behind_one_gate() {
        let (engine, frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let sources = two_tracks(&engine);
        meter.reconcile(&sources);
        engine.write(&sources["a"], &[0.5]);
        engine.write(&sources["b"], &[0.2, -0.6]);

        frame_loop.run_frame(ms(0));
        frame_loop.run_frame(ms(16));
        frame_loop.run_frame(ms(50));
        for source in sources.values() {
            assert_eq!(2, engine.read_count(source));
        }

        let snapshot = meter.snapshot();
        assert_eq!(2, snapshot.len());
        assert!((snapshot["a"].peak - 0.5 * 0.95).abs() < 1e-6);
        let b = meter.levels(&"b");
        assert!((b.peak - 0.6 * 0.95).abs() < 1e-6);
        assert!(b.left_peak.is_some_and(|left| (left - 0.2 * 0.95).abs() < 1e-6));
        assert_eq!(None, snapshot["a"].left_peak);
        assert!(meter.levels(&"unknown").is_silent());
    }

    #[test]
    fn test_removed_track_is_detached() {
        let (engine, frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let mut sources = two_tracks(&engine);
        meter.reconcile(&sources);
        engine.write(&sources["b"], &[0.4, 0.4]);
        frame_loop.run_frame(ms(0));

        let b = sources.remove("b").unwrap();
        let report = meter.reconcile(&sources);
        assert_eq!(vec!["b"], report.detached);
        assert_eq!(0, engine.tap_count(&b));
        assert_eq!(vec!["a"], meter.tracked());
        assert!(meter.levels(&"b").is_silent());
        assert_eq!(1, frame_loop.len());

        let report = meter.reconcile(&HashMap::new());
        assert_eq!(vec!["a"], report.detached);
        assert!(meter.is_empty());
        assert!(frame_loop.is_empty());
    }

    #[test]
    fn test_rebind_on_replaced_path() {
        let (engine, frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let mut sources = two_tracks(&engine);
        meter.reconcile(&sources);
        engine.write(&sources["a"], &[0.9]);
        frame_loop.run_frame(ms(0));
        assert_eq!(0.9, meter.levels(&"a").peak);

        let old = sources["a"];
        let new = engine.replace_path(&old).unwrap();
        sources.insert("a", new);
        let report = meter.reconcile(&sources);
        assert_eq!(vec!["a"], report.rebound);
        assert!(report.attached.is_empty());
        assert!(report.detached.is_empty());
        assert_eq!(0, engine.tap_count(&old));
        assert_eq!(1, engine.tap_count(&new));
        assert!(meter.levels(&"a").is_silent());
        assert_eq!(1, frame_loop.len());
    }

    #[test]
    fn test_stable_binding() {
        let config = MultiMeterConfig {
            rebind: RebindPolicy::Never,
            ..Default::default()
        };
        let (engine, _frame_loop, mut meter) = setup(config);
        let mut sources = two_tracks(&engine);
        meter.reconcile(&sources);

        let old = sources["a"];
        sources.insert("a", engine.replace_path(&old).unwrap());
        assert!(meter.reconcile(&sources).is_empty());
        assert_eq!(1, engine.tap_count(&old));
    }

    #[test]
    fn test_rebind_failure_reports_detach() {
        let (engine, _frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let mut sources = two_tracks(&engine);
        meter.reconcile(&sources);

        let new = engine.replace_path(&sources["a"]).unwrap();
        engine.close_path(&new);
        sources.insert("a", new);
        let report = meter.reconcile(&sources);
        assert_eq!(vec!["a"], report.detached);
        assert!(report.rebound.is_empty());
        assert_eq!(vec![("a", AttachError::InvalidSource)], report.failed);
        assert_eq!(vec!["a"], meter.rejected());
    }

    #[test]
    fn test_pending_while_engine_suspended() {
        let (engine, frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let sources = two_tracks(&engine);
        engine.set_state(EngineState::Suspended);

        let report = meter.reconcile(&sources);
        assert_eq!(2, report.failed.len());
        assert!(report
            .failed
            .iter()
            .all(|(_, err)| *err == AttachError::EngineUnavailable(EngineState::Suspended)));
        assert!(meter.is_empty());
        assert!(meter.rejected().is_empty());
        assert!(frame_loop.is_empty());

        engine.set_state(EngineState::Running);
        let report = meter.reconcile(&sources);
        assert_eq!(vec!["a", "b"], sorted(report.attached));
        assert_eq!(1, frame_loop.len());
    }

    #[test]
    fn test_rejected_until_new_handle() {
        let (engine, _frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let mut sources = HashMap::from([("a", engine.create_path(1))]);
        engine.reject_next_attach("graph full");

        let report = meter.reconcile(&sources);
        assert_eq!(1, report.failed.len());
        assert!(meter.reconcile(&sources).is_empty());
        assert_eq!(0, engine.attach_count());

        let fresh = engine.replace_path(&sources["a"]).unwrap();
        sources.insert("a", fresh);
        assert_eq!(vec!["a"], meter.reconcile(&sources).attached);
        assert!(meter.rejected().is_empty());
    }

    #[test]
    fn test_disable_detaches_everything() {
        let (engine, frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let sources = two_tracks(&engine);
        meter.reconcile(&sources);
        engine.write(&sources["a"], &[0.5]);
        frame_loop.run_frame(ms(0));

        meter.set_enabled(false);
        assert!(!meter.is_enabled());
        assert!(frame_loop.is_empty());
        assert!(meter.is_empty());
        assert!(meter.levels(&"a").is_silent());
        for source in sources.values() {
            assert_eq!(0, engine.tap_count(source));
        }
        assert_eq!(0, frame_loop.run_frame(ms(50)));
        assert_eq!(1, engine.read_count(&sources["a"]));

        assert!(meter.reconcile(&sources).is_empty());
        assert!(meter.is_empty());

        meter.set_enabled(true);
        assert_eq!(2, meter.reconcile(&sources).attached.len());
        assert_eq!(1, frame_loop.len());
    }

    #[test]
    fn test_teardown() {
        let (engine, frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let sources = two_tracks(&engine);
        meter.reconcile(&sources);
        meter.teardown();
        assert!(frame_loop.is_empty());
        assert_eq!(2, engine.detach_count());
        for source in sources.values() {
            assert_eq!(0, engine.tap_count(source));
        }
    }

    #[test]
    fn test_drop_releases() {
        let (engine, frame_loop, mut meter) = setup(MultiMeterConfig::default());
        let sources = two_tracks(&engine);
        meter.reconcile(&sources);
        drop(meter);
        assert!(frame_loop.is_empty());
        assert_eq!(2, engine.detach_count());
    }
}
