use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use crate::{
    foundation::error::{StackedAlphaError, StackedAlphaResult},
    kernel::BackendKind,
    media::source::MediaSource,
    renderer::{BackendMode, Renderer, create_renderer_with_fallback},
    schedule::frame_loop::{FrameClock, FrameLoop},
    surface::SharedSurface,
};

/// Whether an instance is currently in the viewport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Out of the viewport. No frames are drawn.
    #[default]
    Hidden,
    /// In the viewport.
    Visible,
}

/// Builds the renderer for one scheduled instance.
///
/// Called synchronously on the frame thread when a visible instance has no renderer. A factory
/// that negotiates a GPU device (such as [`fallback_factory`]) blocks that thread until the device
/// is ready; hosts that must not block use [`VisibilityScheduler::with_external_renderer`] and
/// hand in a renderer built with [`crate::create_renderer_async`].
pub type RendererFactory = Rc<dyn Fn(SharedSurface, bool) -> StackedAlphaResult<Renderer>>;

/// A [`RendererFactory`] trying `modes` in order, blocking on each.
pub fn fallback_factory(modes: Vec<BackendMode>) -> RendererFactory {
    Rc::new(move |surface, premultiplied_alpha| {
        create_renderer_with_fallback(surface, premultiplied_alpha, &modes)
    })
}

/// Per-instance scheduling behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Initial output encoding.
    pub premultiplied_alpha: bool,
    /// Destroy the renderer (and its pool lease) while hidden, rebuilding it on return.
    pub release_renderer_when_hidden: bool,
    /// Use video-frame callbacks when the clock offers them.
    pub prefer_video_frame_callbacks: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            premultiplied_alpha: false,
            release_renderer_when_hidden: false,
            prefer_video_frame_callbacks: true,
        }
    }
}

struct SchedulerInner {
    source: Rc<dyn MediaSource>,
    surface: SharedSurface,
    // `None` when the host installs renderers itself.
    factory: Option<RendererFactory>,
    options: SchedulerOptions,
    renderer: RefCell<Option<Renderer>>,
    visibility: Cell<Visibility>,
    premultiplied_alpha: Cell<bool>,
    destroyed: Cell<bool>,
    draws: Cell<u64>,
    frame_loop: FrameLoop,
}

impl SchedulerInner {
    fn is_live(&self) -> bool {
        !self.destroyed.get()
            && self.visibility.get() == Visibility::Visible
            && !self.source.paused()
            && self.renderer.try_borrow().is_ok_and(|r| r.is_some())
    }

    fn ensure_renderer(&self) -> StackedAlphaResult<()> {
        if self.renderer.borrow().is_some() {
            return Ok(());
        }
        let Some(factory) = self.factory.as_ref() else {
            return Ok(());
        };
        let renderer = factory(self.surface.clone(), self.premultiplied_alpha.get())?;
        *self.renderer.borrow_mut() = Some(renderer);
        Ok(())
    }

    fn draw(&self) {
        let Ok(mut slot) = self.renderer.try_borrow_mut() else {
            return;
        };
        if let Some(renderer) = slot.as_mut()
            && renderer.draw_frame(self.source.as_ref()).is_drawn()
        {
            self.draws.set(self.draws.get() + 1);
        }
    }

    fn drop_renderer(&self) {
        if let Some(mut renderer) = self.renderer.borrow_mut().take() {
            renderer.destroy();
        }
    }
}

/// Drives one source/renderer pair from viewport visibility and media state.
///
/// `Hidden -> Visible` draws the current frame once and starts the frame loop if the source is
/// playing; `Visible -> Hidden` stops the loop. The loop re-checks liveness on every frame and
/// ends on its own when the source pauses.
pub struct VisibilityScheduler {
    inner: Rc<SchedulerInner>,
}

impl fmt::Debug for VisibilityScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityScheduler")
            .field("visibility", &self.visibility())
            .field("loop_running", &self.is_loop_running())
            .field("draws", &self.draws())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl VisibilityScheduler {
    /// A hidden scheduler. No renderer is built until [`VisibilityScheduler::attach`] or the first
    /// transition to visible.
    pub fn new<C: FrameClock + 'static>(
        source: Rc<dyn MediaSource>,
        surface: SharedSurface,
        clock: &Rc<C>,
        factory: RendererFactory,
        options: SchedulerOptions,
    ) -> Self {
        Self::build(source, surface, clock, Some(factory), options)
    }

    /// A hidden scheduler that never builds renderers itself. Nothing is drawn until the host
    /// calls [`VisibilityScheduler::install_renderer`], typically with a renderer created by
    /// [`crate::create_renderer_async`]. With
    /// [`SchedulerOptions::release_renderer_when_hidden`] a new renderer must be installed after
    /// every return to the viewport.
    pub fn with_external_renderer<C: FrameClock + 'static>(
        source: Rc<dyn MediaSource>,
        surface: SharedSurface,
        clock: &Rc<C>,
        options: SchedulerOptions,
    ) -> Self {
        Self::build(source, surface, clock, None, options)
    }

    fn build<C: FrameClock + 'static>(
        source: Rc<dyn MediaSource>,
        surface: SharedSurface,
        clock: &Rc<C>,
        factory: Option<RendererFactory>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                source,
                surface,
                factory,
                options,
                renderer: RefCell::new(None),
                visibility: Cell::new(Visibility::Hidden),
                premultiplied_alpha: Cell::new(options.premultiplied_alpha),
                destroyed: Cell::new(false),
                draws: Cell::new(0),
                frame_loop: FrameLoop::new(clock)
                    .with_prefer_video_frames(options.prefer_video_frame_callbacks),
            }),
        }
    }

    /// Build the renderer now, surfacing construction errors to the caller.
    pub fn attach(&self) -> StackedAlphaResult<BackendKind> {
        if self.inner.destroyed.get() {
            return Err(StackedAlphaError::validation("scheduler was destroyed"));
        }
        self.inner.ensure_renderer()?;
        self.renderer_backend()
            .ok_or_else(|| {
                StackedAlphaError::validation("no renderer factory and none installed")
            })
    }

    /// Use `renderer` from now on, destroying any previous one. A visible instance draws the
    /// current frame immediately and starts its loop if the source is playing.
    pub fn install_renderer(&self, mut renderer: Renderer) -> StackedAlphaResult<()> {
        let inner = &self.inner;
        if inner.destroyed.get() {
            return Err(StackedAlphaError::validation("scheduler was destroyed"));
        }
        renderer.set_premultiplied_alpha(inner.premultiplied_alpha.get());
        inner.drop_renderer();
        *inner.renderer.borrow_mut() = Some(renderer);
        if inner.visibility.get() == Visibility::Visible {
            inner.draw();
            self.update();
        }
        Ok(())
    }

    /// Apply one viewport intersection change.
    pub fn set_intersecting(&self, is_intersecting: bool) {
        let inner = &self.inner;
        if inner.destroyed.get() {
            return;
        }
        let next = if is_intersecting {
            Visibility::Visible
        } else {
            Visibility::Hidden
        };
        if inner.visibility.replace(next) == next {
            return;
        }
        match next {
            Visibility::Visible => {
                if let Err(err) = inner.ensure_renderer() {
                    tracing::warn!(error = %err, "no renderer available for visible instance");
                    return;
                }
                inner.draw();
                self.update();
            }
            Visibility::Hidden => {
                inner.frame_loop.stop();
                if inner.options.release_renderer_when_hidden {
                    inner.drop_renderer();
                }
            }
        }
    }

    /// Re-evaluate after the source played, paused, seeked or loaded data.
    pub fn notify_media_state(&self) {
        if self.inner.destroyed.get() || self.inner.visibility.get() != Visibility::Visible {
            return;
        }
        self.inner.draw();
        self.update();
    }

    fn update(&self) {
        let inner = &self.inner;
        if !inner.is_live() {
            inner.frame_loop.stop();
            return;
        }
        let weak: Weak<SchedulerInner> = Rc::downgrade(inner);
        inner.frame_loop.start(move || {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            if !inner.is_live() {
                return false;
            }
            inner.draw();
            inner.is_live()
        });
    }

    /// Choose the output encoding. Returns whether the current backend honors it; see
    /// [`Renderer::set_premultiplied_alpha`].
    pub fn set_premultiplied_alpha(&self, premultiplied_alpha: bool) -> bool {
        if self.inner.destroyed.get() {
            return false;
        }
        self.inner.premultiplied_alpha.set(premultiplied_alpha);
        match self.inner.renderer.borrow_mut().as_mut() {
            Some(renderer) => renderer.set_premultiplied_alpha(premultiplied_alpha),
            None => true,
        }
    }

    /// Current visibility.
    pub fn visibility(&self) -> Visibility {
        self.inner.visibility.get()
    }

    /// Whether the frame loop is running.
    pub fn is_loop_running(&self) -> bool {
        self.inner.frame_loop.is_running()
    }

    /// Backend of the current renderer, if one is built.
    pub fn renderer_backend(&self) -> Option<BackendKind> {
        self.inner.renderer.borrow().as_ref().map(Renderer::backend)
    }

    /// Frames drawn by this scheduler.
    pub fn draws(&self) -> u64 {
        self.inner.draws.get()
    }

    /// Stop the loop and destroy the renderer. Idempotent; afterwards every call is a no-op.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        self.inner.frame_loop.stop();
        self.inner.drop_renderer();
    }

    /// Whether [`VisibilityScheduler::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }
}

impl Drop for VisibilityScheduler {
    fn drop(&mut self) {
        self.destroy();
    }
}
