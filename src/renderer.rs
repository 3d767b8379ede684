use std::fmt;

#[cfg(feature = "gpu")]
use crate::kernel::gpu::{GpuContextPool, GpuKernel, SharedGpuKernel};
use crate::{
    foundation::{
        error::{StackedAlphaError, StackedAlphaResult},
        geometry::{Geometry, derive_geometry},
    },
    kernel::{
        BackendKind, CompositeConfig, CompositeKernel, cpu::CpuKernel, filter::FilterGraphKernel,
    },
    media::source::{MediaSource, VideoFrame},
    surface::SharedSurface,
};

/// Which kernel a renderer is built on, plus any shared service it needs.
#[derive(Clone, Debug, Default)]
pub enum BackendMode {
    /// A private wgpu device.
    #[cfg(feature = "gpu")]
    Gpu,
    /// A lease on a shared wgpu device.
    #[cfg(feature = "gpu")]
    SharedGpu(GpuContextPool),
    /// The CPU kernel.
    #[default]
    Cpu,
    /// The resvg filter-graph kernel.
    FilterGraph,
}

impl BackendMode {
    /// Backend family of this mode.
    pub fn kind(&self) -> BackendKind {
        match self {
            #[cfg(feature = "gpu")]
            BackendMode::Gpu | BackendMode::SharedGpu(_) => BackendKind::Gpu,
            BackendMode::Cpu => BackendKind::Cpu,
            BackendMode::FilterGraph => BackendKind::FilterGraph,
        }
    }
}

/// Everything needed to construct a [`Renderer`].
#[derive(Clone, Debug)]
pub struct RendererOptions {
    /// Destination the renderer writes decoded frames into.
    pub surface: SharedSurface,
    /// Initial output encoding.
    pub premultiplied_alpha: bool,
    /// Backend to build.
    pub mode: BackendMode,
}

impl RendererOptions {
    /// CPU mode, straight alpha.
    pub fn new(surface: SharedSurface) -> Self {
        Self {
            surface,
            premultiplied_alpha: false,
            mode: BackendMode::default(),
        }
    }

    /// Set the initial output encoding.
    pub fn with_premultiplied_alpha(mut self, premultiplied_alpha: bool) -> Self {
        self.premultiplied_alpha = premultiplied_alpha;
        self
    }

    /// Set the backend.
    pub fn with_mode(mut self, mode: BackendMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Why a frame was not drawn. Skips are normal during playback and are never logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The renderer was destroyed.
    StaleHandle,
    /// The source has no decodable frame yet.
    NotReady,
    /// The source has not reported usable dimensions yet.
    InvalidGeometry,
    /// The kernel could not composite this frame, or the surface was busy.
    Failed,
}

/// Result of one [`Renderer::draw_frame`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DrawOutcome {
    /// The frame was composited into the surface.
    Drawn(Geometry),
    /// Nothing was written.
    Skipped(SkipReason),
}

impl DrawOutcome {
    /// Whether a frame was composited.
    pub fn is_drawn(&self) -> bool {
        matches!(self, DrawOutcome::Drawn(_))
    }
}

/// A handle that composites frames of one source into one caller-owned surface.
///
/// [`Renderer::destroy`] is terminal: afterwards every operation is a silent no-op.
pub struct Renderer {
    kernel: Option<Box<dyn CompositeKernel>>,
    kind: BackendKind,
    surface: SharedSurface,
    config: CompositeConfig,
    draws: u64,
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.kind)
            .field("config", &self.config)
            .field("destroyed", &self.is_destroyed())
            .field("draws", &self.draws)
            .finish()
    }
}

impl Renderer {
    /// Wrap an already built kernel.
    pub fn from_kernel(
        kernel: Box<dyn CompositeKernel>,
        surface: SharedSurface,
        premultiplied_alpha: bool,
    ) -> Self {
        Self {
            kind: kernel.kind(),
            kernel: Some(kernel),
            surface,
            config: CompositeConfig {
                premultiplied: premultiplied_alpha,
            },
            draws: 0,
        }
    }

    /// Composite the source's current frame.
    pub fn draw_frame(&mut self, source: &dyn MediaSource) -> DrawOutcome {
        if self.kernel.is_none() {
            return DrawOutcome::Skipped(SkipReason::StaleHandle);
        }
        if derive_geometry(source.video_width(), source.video_height()).is_err() {
            return DrawOutcome::Skipped(SkipReason::InvalidGeometry);
        }
        if !source.ready_state().has_current_frame() {
            return DrawOutcome::Skipped(SkipReason::NotReady);
        }
        match source.current_frame() {
            Some(frame) => self.draw_video_frame(&frame),
            None => DrawOutcome::Skipped(SkipReason::NotReady),
        }
    }

    /// Composite one decoded frame. Geometry is derived from the frame itself.
    pub fn draw_video_frame(&mut self, frame: &VideoFrame) -> DrawOutcome {
        let Some(kernel) = self.kernel.as_mut() else {
            return DrawOutcome::Skipped(SkipReason::StaleHandle);
        };
        let Ok(geometry) = derive_geometry(frame.width, frame.height) else {
            return DrawOutcome::Skipped(SkipReason::InvalidGeometry);
        };
        let Ok(mut dst) = self.surface.try_borrow_mut() else {
            return DrawOutcome::Skipped(SkipReason::Failed);
        };
        match kernel.composite(frame, geometry, self.config, &mut dst) {
            Ok(()) => {
                self.draws += 1;
                DrawOutcome::Drawn(geometry)
            }
            Err(_) => DrawOutcome::Skipped(SkipReason::Failed),
        }
    }

    /// Choose the output encoding for subsequent frames.
    ///
    /// Returns whether the backend honors the choice; the filter-graph backend always outputs
    /// premultiplied data and returns `false`. Returns `false` after destroy.
    pub fn set_premultiplied_alpha(&mut self, premultiplied_alpha: bool) -> bool {
        let Some(kernel) = self.kernel.as_ref() else {
            return false;
        };
        self.config.premultiplied = premultiplied_alpha;
        kernel.honors_premultiplied()
    }

    /// The requested output encoding.
    pub fn premultiplied_alpha(&self) -> bool {
        self.config.premultiplied
    }

    /// Release the kernel and any pool lease. Idempotent.
    pub fn destroy(&mut self) {
        if let Some(mut kernel) = self.kernel.take() {
            kernel.release();
            tracing::debug!(backend = %self.kind, draws = self.draws, "renderer destroyed");
        }
    }

    /// Whether [`Renderer::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.kernel.is_none()
    }

    /// Backend family.
    pub fn backend(&self) -> BackendKind {
        self.kind
    }

    /// The destination surface.
    pub fn surface(&self) -> &SharedSurface {
        &self.surface
    }

    /// Frames composited so far.
    pub fn draws(&self) -> u64 {
        self.draws
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Build a renderer. GPU modes acquire their device asynchronously; failures propagate so the
/// caller can choose another backend.
#[tracing::instrument(level = "debug", skip(options), fields(backend = %options.mode.kind()))]
pub async fn create_renderer_async(options: RendererOptions) -> StackedAlphaResult<Renderer> {
    let RendererOptions {
        surface,
        premultiplied_alpha,
        mode,
    } = options;
    let kernel: Box<dyn CompositeKernel> = match mode {
        #[cfg(feature = "gpu")]
        BackendMode::Gpu => Box::new(GpuKernel::new().await?),
        #[cfg(feature = "gpu")]
        BackendMode::SharedGpu(pool) => Box::new(SharedGpuKernel::new(&pool).await?),
        BackendMode::Cpu => Box::new(CpuKernel::new()),
        BackendMode::FilterGraph => Box::new(FilterGraphKernel::new()),
    };
    tracing::debug!(backend = %kernel.kind(), "renderer created");
    Ok(Renderer::from_kernel(kernel, surface, premultiplied_alpha))
}

/// [`create_renderer_async`], blocking the current thread.
pub fn create_renderer(options: RendererOptions) -> StackedAlphaResult<Renderer> {
    pollster::block_on(create_renderer_async(options))
}

/// Try `modes` in order and return the first renderer that builds.
///
/// Only [`StackedAlphaError::is_backend_fallback_candidate`] errors move on to the next mode;
/// anything else is returned immediately.
pub async fn create_renderer_with_fallback_async(
    surface: SharedSurface,
    premultiplied_alpha: bool,
    modes: &[BackendMode],
) -> StackedAlphaResult<Renderer> {
    let mut last_err = None;
    for mode in modes {
        let options = RendererOptions {
            surface: surface.clone(),
            premultiplied_alpha,
            mode: mode.clone(),
        };
        match create_renderer_async(options).await {
            Ok(renderer) => return Ok(renderer),
            Err(err) if err.is_backend_fallback_candidate() => {
                tracing::warn!(backend = %mode.kind(), error = %err, "backend unavailable, falling back");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| StackedAlphaError::validation("no backend modes to try")))
}

/// [`create_renderer_with_fallback_async`], blocking the current thread.
pub fn create_renderer_with_fallback(
    surface: SharedSurface,
    premultiplied_alpha: bool,
    modes: &[BackendMode],
) -> StackedAlphaResult<Renderer> {
    pollster::block_on(create_renderer_with_fallback_async(
        surface,
        premultiplied_alpha,
        modes,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        media::{
            sequence::FrameSequence,
            source::{Playable, ReadyState},
        },
        surface::{AlphaMode, shared_surface},
    };

    fn red_over_gray() -> VideoFrame {
        VideoFrame::stack(4, 2, &[255, 0, 0, 128].repeat(8)).unwrap()
    }

    #[test]
    fn draws_then_destroy_is_terminal() {
        let surface = shared_surface();
        let mut r = create_renderer(RendererOptions::new(surface.clone())).unwrap();
        let seq = FrameSequence::still(red_over_gray());
        assert!(r.draw_frame(&seq).is_drawn());
        assert_eq!(surface.borrow().pixel(0, 0), [255, 0, 0, 128]);

        r.destroy();
        r.destroy();
        assert!(r.is_destroyed());
        assert_eq!(
            r.draw_frame(&seq),
            DrawOutcome::Skipped(SkipReason::StaleHandle)
        );
        assert!(!r.set_premultiplied_alpha(true));
        assert_eq!(surface.borrow().presented_frames(), 1);
    }

    #[test]
    fn unloaded_source_is_skipped_without_touching_surface() {
        let surface = shared_surface();
        let mut r = create_renderer(RendererOptions::new(surface.clone())).unwrap();
        let empty = FrameSequence::new(vec![], 30.0).unwrap();
        assert_eq!(
            r.draw_frame(&empty),
            DrawOutcome::Skipped(SkipReason::InvalidGeometry)
        );

        let loading = FrameSequence::still(red_over_gray());
        loading.set_ready_state(ReadyState::HaveMetadata);
        assert_eq!(
            r.draw_frame(&loading),
            DrawOutcome::Skipped(SkipReason::NotReady)
        );
        assert_eq!(surface.borrow().reallocations(), 0);
        assert!(loading.paused());
    }

    #[test]
    fn toggle_applies_to_next_frame() {
        let surface = shared_surface();
        let mut r = create_renderer(RendererOptions::new(surface.clone())).unwrap();
        let seq = FrameSequence::still(red_over_gray());
        r.draw_frame(&seq);
        assert!(r.set_premultiplied_alpha(true));
        assert_eq!(surface.borrow().pixel(0, 0), [255, 0, 0, 128]);
        r.draw_frame(&seq);
        assert_eq!(surface.borrow().pixel(0, 0), [128, 0, 0, 128]);
        assert_eq!(surface.borrow().alpha_mode(), AlphaMode::Premultiplied);
    }

    #[test]
    fn filter_graph_reports_noop_toggle() {
        let mut r = create_renderer(
            RendererOptions::new(shared_surface()).with_mode(BackendMode::FilterGraph),
        )
        .unwrap();
        assert!(!r.set_premultiplied_alpha(true));
        assert_eq!(r.backend(), BackendKind::FilterGraph);
    }

    #[test]
    fn busy_surface_skips_frame() {
        let surface = shared_surface();
        let mut r = create_renderer(RendererOptions::new(surface.clone())).unwrap();
        let _held = surface.borrow();
        assert_eq!(
            r.draw_video_frame(&red_over_gray()),
            DrawOutcome::Skipped(SkipReason::Failed)
        );
    }

    #[test]
    fn fallback_with_no_modes_is_a_validation_error() {
        assert!(matches!(
            create_renderer_with_fallback(shared_surface(), false, &[]),
            Err(StackedAlphaError::Validation(_))
        ));
    }

    #[test]
    fn fallback_picks_first_buildable_mode() {
        let r = create_renderer_with_fallback(
            shared_surface(),
            false,
            &[BackendMode::FilterGraph, BackendMode::Cpu],
        )
        .unwrap();
        assert_eq!(r.backend(), BackendKind::FilterGraph);
    }
}
