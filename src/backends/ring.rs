//! # Ring buffer backend
//!
//! Signal paths produced on a real-time audio thread. The audio thread owns a [`SignalFeed`] and
//! pushes every block it plays through it; the UI thread holds the matching [`RingSource`] and
//! attaches probes to it.
//!
//! Attaching a probe creates a lock-free ring buffer and hands its producer to the feed through a
//! control queue, so neither attaching nor detaching ever blocks the audio thread. Producers the
//! queue cannot take yet wait on the UI thread until the feed drains it. A detached probe drops
//! its consumer, and the feed forgets the abandoned producer on its next push.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use rtrb::{Consumer, PushError, Producer, RingBuffer};
use tapmeter_core::buffer::AudioMut;
use tapmeter_core::sample::ConvertSample;

use crate::config::ProbeConfig;
use crate::engine::{AudioEngine, EngineState, Probe, TapFlags};
use crate::error::{AttachError, DetachError};
use crate::SendEverywhereButOnWeb;

/// Maximum number of probes a single feed serves at once.
pub const MAX_TAPS_PER_PATH: usize = 16;
/// Ring capacity of a probe, in analysis windows.
const WINDOWS_PER_RING: usize = 8;

/// Audio-thread side of a signal path.
pub struct SignalFeed {
    channels: usize,
    control: Consumer<Producer<f32>>,
    taps: Vec<Producer<f32>>,
}

impl fmt::Debug for SignalFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalFeed")
            .field("channels", &self.channels)
            .field("taps", &self.taps.len())
            .finish_non_exhaustive()
    }
}

impl SignalFeed {
    /// Number of interleaved channels expected by [`Self::push`].
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of probes currently served.
    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }

    /// Turn the feed into a block callback, for hosts whose audio thread hands each block to a
    /// closure.
    pub fn into_callback<T: ConvertSample + 'static>(
        mut self,
    ) -> impl FnMut(&[T]) + SendEverywhereButOnWeb {
        move |samples: &[T]| self.push(samples)
    }

    /// Fan the interleaved `samples` out to every attached probe. Trailing samples that do not
    /// form a whole frame are ignored, and probes whose ring is full only get the newest frames
    /// that fit.
    ///
    /// Realtime-safe: does not block and does not allocate.
    pub fn push<T: ConvertSample>(&mut self, samples: &[T]) {
        self.taps.retain(|producer| !producer.is_abandoned());
        while let Ok(producer) = self.control.pop() {
            if producer.is_abandoned() {
                continue;
            }
            if self.taps.len() == MAX_TAPS_PER_PATH {
                // At most MAX_TAPS_PER_PATH probes are live at once, so one of these is gone.
                self.taps.retain(|producer| !producer.is_abandoned());
            }
            self.taps.push(producer);
        }

        let whole = samples.len() - samples.len() % self.channels;
        let frames = whole / self.channels;
        for producer in &mut self.taps {
            let writable = (producer.slots() / self.channels).min(frames) * self.channels;
            if writable == 0 {
                continue;
            }
            if let Ok(chunk) = producer.write_chunk_uninit(writable) {
                chunk.fill_from_iter(
                    samples[whole - writable..whole]
                        .iter()
                        .map(|sample| sample.convert_to_f32()),
                );
            }
        }
    }
}

/// UI-thread end of the control queue of a path.
struct Control {
    queue: Producer<Producer<f32>>,
    /// Producers of attached probes the queue had no room for yet, oldest first.
    backlog: VecDeque<Producer<f32>>,
    /// Probes attached and not yet detached.
    live: usize,
}

impl Control {
    /// Move waiting producers into the queue, forgetting those whose probe is already gone.
    fn flush(&mut self) {
        if self.queue.is_abandoned() {
            let queued = self.queue.buffer().capacity() - self.queue.slots();
            if !self.backlog.is_empty() || queued > 0 {
                // Dropping the producers, queued ones included, lets their probes see the path
                // as lost.
                self.backlog.clear();
                self.queue = RingBuffer::new(1).0;
            }
            return;
        }
        self.backlog.retain(|producer| !producer.is_abandoned());
        while let Some(producer) = self.backlog.pop_front() {
            if let Err(PushError::Full(producer)) = self.queue.push(producer) {
                self.backlog.push_front(producer);
                break;
            }
        }
    }
}

/// UI-thread handle to a signal path of a [`RingEngine`].
#[derive(Clone)]
pub struct RingSource {
    id: u64,
    channels: usize,
    control: Rc<RefCell<Control>>,
}

impl fmt::Debug for RingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingSource")
            .field("id", &self.id)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl PartialEq for RingSource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl RingSource {
    /// Unique identifier of the path.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of channels of the path.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Whether the audio thread still holds the path's feed.
    pub fn is_live(&self) -> bool {
        !self.control.borrow().queue.is_abandoned()
    }
}

#[derive(Debug)]
struct Inner {
    state: EngineState,
    next_id: u64,
}

/// Engine whose paths are fed from real-time audio threads. Cloning gives another handle to the
/// same engine.
#[derive(Debug, Clone)]
pub struct RingEngine {
    inner: Rc<RefCell<Inner>>,
}

impl Default for RingEngine {
    fn default() -> Self {
        Self::new(EngineState::Running)
    }
}

impl RingEngine {
    /// Create an engine in the given state.
    pub fn new(state: EngineState) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner { state, next_id: 0 })),
        }
    }

    /// Change the engine state, e.g. when the host's audio context is resumed or closed.
    pub fn set_state(&self, state: EngineState) {
        self.inner.borrow_mut().state = state;
    }

    /// Create a signal path. The feed goes to the audio thread, the source stays with the meters.
    pub fn create_path(&self, channels: usize) -> (RingSource, SignalFeed) {
        let channels = channels.max(1);
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        let (control_tx, control_rx) = RingBuffer::new(MAX_TAPS_PER_PATH);
        let source = RingSource {
            id,
            channels,
            control: Rc::new(RefCell::new(Control {
                queue: control_tx,
                backlog: VecDeque::with_capacity(MAX_TAPS_PER_PATH),
                live: 0,
            })),
        };
        let feed = SignalFeed {
            channels,
            control: control_rx,
            taps: Vec::with_capacity(MAX_TAPS_PER_PATH),
        };
        (source, feed)
    }
}

impl AudioEngine for RingEngine {
    type Source = RingSource;
    type Probe = RingProbe;

    fn state(&self) -> EngineState {
        self.inner.borrow().state
    }

    fn attach(&self, source: &RingSource, config: &ProbeConfig) -> Result<RingProbe, AttachError> {
        let state = self.state();
        if !state.is_running() {
            return Err(AttachError::EngineUnavailable(state));
        }
        let mut control = source.control.borrow_mut();
        if control.queue.is_abandoned() {
            return Err(AttachError::InvalidSource);
        }
        if control.live >= MAX_TAPS_PER_PATH {
            return Err(AttachError::AttachFailed(format!(
                "path already serves {MAX_TAPS_PER_PATH} taps"
            )));
        }
        let window_len = config.window_size * source.channels;
        let (producer, consumer) = RingBuffer::new(window_len * WINDOWS_PER_RING);
        control.live += 1;
        control.backlog.push_back(producer);
        control.flush();
        Ok(RingProbe {
            control: Rc::clone(&source.control),
            consumer: Some(consumer),
            channels: source.channels,
            history: vec![0.0; window_len].into_boxed_slice(),
            write_pos: 0,
        })
    }
}

/// Probe on a [`RingEngine`] path. Keeps a sliding history of the last analysis window.
pub struct RingProbe {
    control: Rc<RefCell<Control>>,
    consumer: Option<Consumer<f32>>,
    channels: usize,
    /// Interleaved circular history; `write_pos` is the oldest sample.
    history: Box<[f32]>,
    write_pos: usize,
}

impl fmt::Debug for RingProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingProbe")
            .field("attached", &self.consumer.is_some())
            .field("channels", &self.channels)
            .field("window", &(self.history.len() / self.channels))
            .finish_non_exhaustive()
    }
}

impl RingProbe {
    fn release(&mut self) {
        if self.consumer.take().is_some() {
            let mut control = self.control.borrow_mut();
            control.live -= 1;
            control.flush();
        }
    }

    fn drain(&mut self) -> (usize, bool) {
        let Some(consumer) = self.consumer.as_mut() else {
            return (0, false);
        };
        let available = consumer.slots();
        let overrun = available == consumer.buffer().capacity();
        let Ok(chunk) = consumer.read_chunk(available) else {
            return (0, overrun);
        };
        let (first, second) = chunk.as_slices();
        let len = self.history.len();
        for &sample in first.iter().chain(second) {
            self.history[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % len;
        }
        chunk.commit_all();
        (available, overrun)
    }
}

impl Probe for RingProbe {
    fn channels(&self) -> usize {
        self.channels
    }

    fn read_into(&mut self, mut block: AudioMut<f32>) -> TapFlags {
        self.control.borrow_mut().flush();
        let lost = self
            .consumer
            .as_ref()
            .map_or(true, |consumer| consumer.is_abandoned() && consumer.is_empty());
        if lost {
            block.fill(0.0);
            return TapFlags::SOURCE_LOST;
        }

        let (read, overrun) = self.drain();
        let mut flags = TapFlags::empty();
        flags.set(TapFlags::STALE, read == 0);
        flags.set(TapFlags::OVERRUN, overrun);

        let history_frames = self.history.len() / self.channels;
        let oldest_frame = self.write_pos / self.channels;
        let frames = block.num_samples();
        for (channel, mut samples) in block.channels_mut().enumerate() {
            for (i, sample) in samples.iter_mut().enumerate() {
                // Align the end of the block with the newest frame.
                let Some(offset) = (i + history_frames).checked_sub(frames) else {
                    *sample = 0.0;
                    continue;
                };
                if channel >= self.channels || offset >= history_frames {
                    *sample = 0.0;
                    continue;
                }
                let frame = (oldest_frame + offset) % history_frames;
                *sample = self.history[frame * self.channels + channel];
            }
        }
        flags
    }

    fn detach(&mut self) -> Result<(), DetachError> {
        self.release();
        Ok(())
    }
}

impl Drop for RingProbe {
    fn drop(&mut self) {
        self.release();
    }
}
