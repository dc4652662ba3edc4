//! # In-memory backend
//!
//! An engine whose signal paths are plain sample histories written by the host. It makes the
//! metering layer usable without a real audio graph: offline analysis, tests, and hosts that
//! already hold decoded blocks in memory.
//!
//! ```rust
//! use tapmeter::backends::memory::MemoryEngine;
//! use tapmeter::prelude::*;
//!
//! let engine = MemoryEngine::new();
//! let source = engine.create_path(1);
//! let mut tap = SourceTap::attach(&engine, &source, ProbeConfig::default()).unwrap();
//! engine.write(&source, &[0.5, -0.5]);
//! let (block, flags) = tap.read_block();
//! assert!(flags.is_empty());
//! assert_eq!(Some(&-0.5), block.samples().last());
//! ```
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use tapmeter_core::buffer::AudioMut;

use crate::config::{ProbeConfig, MAX_WINDOW_SIZE};
use crate::engine::{AudioEngine, EngineState, Probe, TapFlags};
use crate::error::{AttachError, DetachError};

/// Handle to a signal path of a [`MemoryEngine`]. Replacing the path gives a handle with a new
/// generation, which does not compare equal to the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemorySource {
    id: u64,
    generation: u64,
}

impl MemorySource {
    /// Identifier of the path, stable across replacements.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replacement counter of the path.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
struct Path {
    channels: usize,
    generation: u64,
    /// Interleaved, most recent frames last; never longer than `MAX_WINDOW_SIZE` frames.
    history: Vec<f32>,
    frames_written: u64,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    state: EngineState,
    next_id: u64,
    paths: HashMap<u64, Path>,
    taps: HashMap<MemorySource, usize>,
    reads: HashMap<MemorySource, usize>,
    attach_count: usize,
    detach_count: usize,
    reject_next: Option<String>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: EngineState::Running,
            next_id: 0,
            paths: HashMap::new(),
            taps: HashMap::new(),
            reads: HashMap::new(),
            attach_count: 0,
            detach_count: 0,
            reject_next: None,
        }
    }
}

impl Inner {
    fn live_path(&self, source: &MemorySource) -> Option<&Path> {
        self.paths
            .get(&source.id)
            .filter(|path| !path.closed && path.generation == source.generation)
    }
}

/// In-process audio engine. Cloning gives another handle to the same engine.
#[derive(Clone, Default)]
pub struct MemoryEngine {
    inner: Rc<RefCell<Inner>>,
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("MemoryEngine")
            .field("state", &inner.state)
            .field("paths", &inner.paths.len())
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Create a running engine without any path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the engine state. Existing probes keep reading; only new attachments are affected.
    pub fn set_state(&self, state: EngineState) {
        self.inner.borrow_mut().state = state;
    }

    /// Create a signal path with the given number of channels.
    pub fn create_path(&self, channels: usize) -> MemorySource {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.paths.insert(
            id,
            Path {
                channels: channels.max(1),
                generation: 0,
                history: Vec::new(),
                frames_written: 0,
                closed: false,
            },
        );
        MemorySource { id, generation: 0 }
    }

    /// Append interleaved samples to the path. Writes to a closed or replaced path are ignored.
    pub fn write(&self, source: &MemorySource, interleaved: &[f32]) {
        let mut inner = self.inner.borrow_mut();
        let Some(path) = inner
            .paths
            .get_mut(&source.id)
            .filter(|path| !path.closed && path.generation == source.generation)
        else {
            log::debug!(source:? = source; "Write to stale path ignored");
            return;
        };
        let whole = interleaved.len() - interleaved.len() % path.channels;
        path.history.extend_from_slice(&interleaved[..whole]);
        let max_len = MAX_WINDOW_SIZE * path.channels;
        if path.history.len() > max_len {
            let excess = path.history.len() - max_len;
            path.history.drain(..excess);
        }
        path.frames_written += (whole / path.channels) as u64;
    }

    /// Close the path. Probes on it read silence flagged [`TapFlags::SOURCE_LOST`], and new
    /// attachments fail with [`AttachError::InvalidSource`].
    pub fn close_path(&self, source: &MemorySource) {
        if let Some(path) = self.inner.borrow_mut().paths.get_mut(&source.id) {
            path.closed = true;
        }
    }

    /// Replace the path behind `source` with a fresh one under the same id, returning its new
    /// handle. The old handle becomes stale.
    pub fn replace_path(&self, source: &MemorySource) -> Option<MemorySource> {
        let mut inner = self.inner.borrow_mut();
        let path = inner.paths.get_mut(&source.id)?;
        path.generation += 1;
        path.history.clear();
        path.frames_written = 0;
        path.closed = false;
        Some(MemorySource {
            id: source.id,
            generation: path.generation,
        })
    }

    /// Make the next attachment fail with [`AttachError::AttachFailed`].
    pub fn reject_next_attach(&self, reason: impl Into<String>) {
        self.inner.borrow_mut().reject_next = Some(reason.into());
    }

    /// Number of successful attachments so far.
    pub fn attach_count(&self) -> usize {
        self.inner.borrow().attach_count
    }

    /// Number of probe detachments so far.
    pub fn detach_count(&self) -> usize {
        self.inner.borrow().detach_count
    }

    /// Number of probes currently attached to `source`.
    pub fn tap_count(&self, source: &MemorySource) -> usize {
        self.inner.borrow().taps.get(source).copied().unwrap_or(0)
    }

    /// Number of block reads performed on `source`.
    pub fn read_count(&self, source: &MemorySource) -> usize {
        self.inner.borrow().reads.get(source).copied().unwrap_or(0)
    }
}

impl AudioEngine for MemoryEngine {
    type Source = MemorySource;
    type Probe = MemoryProbe;

    fn state(&self) -> EngineState {
        self.inner.borrow().state
    }

    fn attach(
        &self,
        source: &MemorySource,
        _config: &ProbeConfig,
    ) -> Result<MemoryProbe, AttachError> {
        let mut inner = self.inner.borrow_mut();
        if !inner.state.is_running() {
            return Err(AttachError::EngineUnavailable(inner.state));
        }
        if let Some(reason) = inner.reject_next.take() {
            return Err(AttachError::AttachFailed(reason));
        }
        let channels = inner
            .live_path(source)
            .ok_or(AttachError::InvalidSource)?
            .channels;
        inner.attach_count += 1;
        *inner.taps.entry(*source).or_default() += 1;
        Ok(MemoryProbe {
            engine: Rc::downgrade(&self.inner),
            source: *source,
            channels,
            last_seen: 0,
        })
    }
}

/// Probe on a [`MemoryEngine`] path, reading the most recent frames written to it.
#[derive(Debug)]
pub struct MemoryProbe {
    engine: Weak<RefCell<Inner>>,
    source: MemorySource,
    channels: usize,
    last_seen: u64,
}

impl Probe for MemoryProbe {
    fn channels(&self) -> usize {
        self.channels
    }

    fn read_into(&mut self, mut block: AudioMut<f32>) -> TapFlags {
        let Some(inner) = self.engine.upgrade() else {
            block.fill(0.0);
            return TapFlags::SOURCE_LOST;
        };
        let mut inner = inner.borrow_mut();
        *inner.reads.entry(self.source).or_default() += 1;
        let Some(path) = inner.live_path(&self.source) else {
            block.fill(0.0);
            return TapFlags::SOURCE_LOST;
        };

        let frames = block.num_samples();
        let available = path.history.len() / path.channels;
        let taken = frames.min(available);
        let padding = frames - taken;
        let start = available - taken;
        for (channel, mut samples) in block.channels_mut().enumerate() {
            for (i, sample) in samples.iter_mut().enumerate() {
                *sample = if i < padding || channel >= path.channels {
                    0.0
                } else {
                    path.history[(start + i - padding) * path.channels + channel]
                };
            }
        }

        let flags = if path.frames_written == self.last_seen {
            TapFlags::STALE
        } else {
            TapFlags::empty()
        };
        self.last_seen = path.frames_written;
        flags
    }

    fn detach(&mut self) -> Result<(), DetachError> {
        let Some(inner) = self.engine.upgrade() else {
            return Ok(());
        };
        let mut inner = inner.borrow_mut();
        inner.detach_count += 1;
        if let Some(count) = inner.taps.get_mut(&self.source) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.taps.remove(&self.source);
            }
        }
        if inner.live_path(&self.source).is_none() {
            return Err(DetachError("signal path already closed".into()));
        }
        Ok(())
    }
}
