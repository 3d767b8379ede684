use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

/// Handle for cancelling a scheduled callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameToken(pub u64);

/// Which host signal a callback waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameCallbackKind {
    /// The next display refresh.
    AnimationFrame,
    /// The next decoded video frame being presented.
    VideoFrame,
}

/// A one-shot frame callback.
pub type FrameCallback = Box<dyn FnOnce()>;

/// The host's frame scheduling facility.
pub trait FrameClock {
    /// Whether [`FrameCallbackKind::VideoFrame`] callbacks are supported.
    fn supports_video_frames(&self) -> bool {
        false
    }

    /// Run `callback` once at the next signal of `kind`.
    fn schedule(&self, kind: FrameCallbackKind, callback: FrameCallback) -> FrameToken;

    /// Drop a pending callback. Unknown or already-run tokens are ignored.
    fn cancel(&self, token: FrameToken);
}

struct Pending {
    token: FrameToken,
    kind: FrameCallbackKind,
    callback: FrameCallback,
}

/// A [`FrameClock`] driven explicitly by the host (or a test).
#[derive(Default)]
pub struct ManualFrameClock {
    video_frames: bool,
    next_token: Cell<u64>,
    pending: RefCell<Vec<Pending>>,
}

impl ManualFrameClock {
    /// A clock offering animation-frame callbacks only.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that also offers video-frame callbacks.
    pub fn with_video_frames() -> Self {
        Self {
            video_frames: true,
            ..Self::default()
        }
    }

    /// Fire one display refresh. Returns how many callbacks ran.
    pub fn tick(&self) -> usize {
        self.fire(FrameCallbackKind::AnimationFrame)
    }

    /// Signal that a new video frame was presented. Returns how many callbacks ran.
    pub fn present_video_frame(&self) -> usize {
        self.fire(FrameCallbackKind::VideoFrame)
    }

    /// Number of callbacks waiting to run.
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    fn fire(&self, kind: FrameCallbackKind) -> usize {
        // Callbacks scheduled while this batch runs wait for the next signal.
        let batch: Vec<Pending> = {
            let mut pending = self.pending.borrow_mut();
            let (due, rest) = pending.drain(..).partition(|p| p.kind == kind);
            *pending = rest;
            due
        };
        let ran = batch.len();
        for p in batch {
            (p.callback)();
        }
        ran
    }
}

impl FrameClock for ManualFrameClock {
    fn supports_video_frames(&self) -> bool {
        self.video_frames
    }

    fn schedule(&self, kind: FrameCallbackKind, callback: FrameCallback) -> FrameToken {
        let token = FrameToken(self.next_token.get());
        self.next_token.set(token.0 + 1);
        self.pending.borrow_mut().push(Pending {
            token,
            kind,
            callback,
        });
        token
    }

    fn cancel(&self, token: FrameToken) {
        self.pending.borrow_mut().retain(|p| p.token != token);
    }
}

#[derive(Default)]
struct LoopState {
    generation: Cell<u64>,
    running: Cell<bool>,
    token: Cell<Option<FrameToken>>,
    iterations: Cell<u64>,
}

/// Drives a per-frame tick on a [`FrameClock`] until the tick reports the loop is no longer live.
///
/// The loop holds the clock weakly; the host owns it.
pub struct FrameLoop {
    clock: Weak<dyn FrameClock>,
    prefer_video_frames: bool,
    state: Rc<LoopState>,
}

impl FrameLoop {
    /// A stopped loop on `clock`, preferring video-frame callbacks when offered.
    pub fn new<C: FrameClock + 'static>(clock: &Rc<C>) -> Self {
        let clock: Rc<dyn FrameClock> = clock.clone();
        Self {
            clock: Rc::downgrade(&clock),
            prefer_video_frames: true,
            state: Rc::new(LoopState::default()),
        }
    }

    /// Always use animation-frame callbacks.
    pub fn with_prefer_video_frames(mut self, prefer: bool) -> Self {
        self.prefer_video_frames = prefer;
        self
    }

    /// Start calling `tick` once per frame. `tick` returns whether the loop is still live; the
    /// loop ends the first time it returns `false`.
    ///
    /// Returns `false` (and drops `tick`) if the loop is already running.
    pub fn start(&self, tick: impl FnMut() -> bool + 'static) -> bool {
        if self.state.running.get() {
            return false;
        }
        let Some(clock) = self.clock.upgrade() else {
            return false;
        };
        self.state.running.set(true);
        self.state.generation.set(self.state.generation.get() + 1);
        let kind = if self.prefer_video_frames && clock.supports_video_frames() {
            FrameCallbackKind::VideoFrame
        } else {
            FrameCallbackKind::AnimationFrame
        };
        let tick: Rc<RefCell<dyn FnMut() -> bool>> = Rc::new(RefCell::new(tick));
        schedule_next(
            &clock,
            self.clock.clone(),
            kind,
            Rc::clone(&self.state),
            self.state.generation.get(),
            tick,
        );
        true
    }

    /// Stop the loop and cancel the pending callback. Idempotent.
    pub fn stop(&self) {
        if !self.state.running.replace(false) {
            return;
        }
        self.state.generation.set(self.state.generation.get() + 1);
        if let (Some(token), Some(clock)) = (self.state.token.take(), self.clock.upgrade()) {
            clock.cancel(token);
        }
    }

    /// Whether a callback is scheduled or running.
    pub fn is_running(&self) -> bool {
        self.state.running.get()
    }

    /// Ticks run since creation.
    pub fn iterations(&self) -> u64 {
        self.state.iterations.get()
    }
}

impl Drop for FrameLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn schedule_next(
    clock: &Rc<dyn FrameClock>,
    weak_clock: Weak<dyn FrameClock>,
    kind: FrameCallbackKind,
    state: Rc<LoopState>,
    generation: u64,
    tick: Rc<RefCell<dyn FnMut() -> bool>>,
) {
    let token = clock.schedule(
        kind,
        Box::new({
            let state = Rc::clone(&state);
            move || {
                // Stopped or restarted after this callback was queued.
                if state.generation.get() != generation || !state.running.get() {
                    return;
                }
                state.token.set(None);
                state.iterations.set(state.iterations.get() + 1);
                let live = match tick.try_borrow_mut() {
                    Ok(mut f) => (*f)(),
                    Err(_) => false,
                };
                if state.generation.get() != generation {
                    return;
                }
                match (live, weak_clock.upgrade()) {
                    (true, Some(clock)) => {
                        schedule_next(&clock, weak_clock, kind, Rc::clone(&state), generation, tick)
                    }
                    _ => state.running.set(false),
                }
            }
        }),
    );
    state.token.set(Some(token));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_until_tick_reports_not_live() {
        let clock = Rc::new(ManualFrameClock::new());
        let frame_loop = FrameLoop::new(&clock);
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        assert!(frame_loop.start(move || {
            c.set(c.get() + 1);
            c.get() < 3
        }));
        for _ in 0..10 {
            clock.tick();
        }
        assert_eq!(count.get(), 3);
        assert!(!frame_loop.is_running());
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn start_is_idempotent() {
        let clock = Rc::new(ManualFrameClock::new());
        let frame_loop = FrameLoop::new(&clock);
        assert!(frame_loop.start(|| true));
        assert!(!frame_loop.start(|| true));
        assert_eq!(clock.pending(), 1);
    }

    #[test]
    fn stop_cancels_pending_callback() {
        let clock = Rc::new(ManualFrameClock::new());
        let frame_loop = FrameLoop::new(&clock);
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        frame_loop.start(move || {
            c.set(c.get() + 1);
            true
        });
        clock.tick();
        frame_loop.stop();
        frame_loop.stop();
        clock.tick();
        assert_eq!(count.get(), 1);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn prefers_video_frame_callbacks_when_offered() {
        let clock = Rc::new(ManualFrameClock::with_video_frames());
        let frame_loop = FrameLoop::new(&clock);
        frame_loop.start(|| true);
        assert_eq!(clock.tick(), 0);
        assert_eq!(clock.present_video_frame(), 1);

        let fallback = FrameLoop::new(&clock).with_prefer_video_frames(false);
        fallback.start(|| true);
        assert_eq!(clock.tick(), 1);
    }

    #[test]
    fn stale_callback_from_previous_run_is_ignored() {
        struct Leaky(RefCell<Vec<FrameCallback>>);
        impl FrameClock for Leaky {
            fn schedule(&self, _: FrameCallbackKind, callback: FrameCallback) -> FrameToken {
                self.0.borrow_mut().push(callback);
                FrameToken(0)
            }
            // Models a callback that was already dequeued when cancel arrived.
            fn cancel(&self, _: FrameToken) {}
        }

        let clock = Rc::new(Leaky(RefCell::new(Vec::new())));
        let frame_loop = FrameLoop::new(&clock);
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        frame_loop.start(move || {
            c.set(c.get() + 1);
            true
        });
        frame_loop.stop();
        let stale: Vec<_> = clock.0.borrow_mut().drain(..).collect();
        for cb in stale {
            cb();
        }
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn dropping_the_clock_ends_the_loop() {
        let clock = Rc::new(ManualFrameClock::new());
        let frame_loop = FrameLoop::new(&clock);
        drop(clock);
        assert!(!frame_loop.start(|| true));
        assert!(!frame_loop.is_running());
    }
}
