//! Cooperative per-frame scheduling.
//!
//! Meters do not own timers or threads. The host drives a [`FrameLoop`] from its rendering loop,
//! and every registered callback runs synchronously inside [`FrameLoop::run_frame`].
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

type FrameCallback = Rc<RefCell<dyn FnMut(Duration)>>;

#[derive(Default)]
struct LoopState {
    next_id: u64,
    callbacks: Vec<(u64, FrameCallback)>,
}

impl LoopState {
    fn is_registered(&self, id: u64) -> bool {
        self.callbacks.iter().any(|(i, _)| *i == id)
    }
}

/// Host-driven frame loop. Cloning gives another handle to the same loop.
#[derive(Clone, Default)]
pub struct FrameLoop {
    state: Rc<RefCell<LoopState>>,
}

impl fmt::Debug for FrameLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLoop")
            .field("registrations", &self.len())
            .finish()
    }
}

impl FrameLoop {
    /// Create an empty frame loop.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` to run on every frame until the returned registration is cancelled or
    /// dropped.
    pub fn request(&self, callback: impl FnMut(Duration) + 'static) -> FrameRegistration {
        let callback: FrameCallback = Rc::new(RefCell::new(callback));
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, callback));
        FrameRegistration {
            id,
            state: Rc::downgrade(&self.state),
        }
    }

    /// Run one frame at host time `now`, returning how many callbacks ran.
    ///
    /// Callbacks may cancel registrations (including their own) while the frame runs; a
    /// registration cancelled this way does not run later in the same frame. Callbacks registered
    /// during the frame first run on the next one.
    pub fn run_frame(&self, now: Duration) -> usize {
        let snapshot: Vec<(u64, FrameCallback)> = self.state.borrow().callbacks.clone();
        let mut ran = 0;
        for (id, callback) in snapshot {
            if !self.state.borrow().is_registered(id) {
                continue;
            }
            let Ok(mut callback) = callback.try_borrow_mut() else {
                log::warn!(registration = id; "Frame callback re-entered, skipping");
                continue;
            };
            (&mut *callback)(now);
            ran += 1;
        }
        ran
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.state.borrow().callbacks.len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration of a callback on a [`FrameLoop`]. Cancelled on drop.
pub struct FrameRegistration {
    id: u64,
    state: Weak<RefCell<LoopState>>,
}

impl fmt::Debug for FrameRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRegistration")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl FrameRegistration {
    /// Whether the callback is still registered.
    pub fn is_active(&self) -> bool {
        self.state
            .upgrade()
            .is_some_and(|state| state.borrow().is_registered(self.id))
    }

    /// Remove the callback from the loop. It will not run again, not even later in the current
    /// frame.
    pub fn cancel(self) {
        drop(self)
    }

    fn remove(&self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        // Take the callback out before dropping it, so that its captures are released without
        // the loop state borrowed.
        let removed = {
            let mut state = state.borrow_mut();
            let index = state.callbacks.iter().position(|(i, _)| *i == self.id);
            index.map(|index| state.callbacks.remove(index))
        };
        drop(removed);
    }
}

impl Drop for FrameRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Elapsed-time gate between two level computations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    interval: Duration,
    last: Option<Duration>,
}

impl Throttle {
    /// Gate passing at most once per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Minimum spacing between two passes.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether work should run at `now`. The first call always passes; later calls pass once at
    /// least `interval` elapsed since the last pass, which then becomes the new reference.
    pub fn ready(&mut self, now: Duration) -> bool {
        if let Some(last) = self.last {
            if now.saturating_sub(last) < self.interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }

    /// Forget the last pass, so that the next call passes.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
