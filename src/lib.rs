#![forbid(unsafe_code)]

//! Real-time decoding of stacked-alpha video.
//!
//! A stacked-alpha frame carries color in its top half and a grayscale alpha mask in its bottom
//! half. This crate composites such frames into transparent `(width, floor(height / 2))` images
//! with one of three interchangeable kernels:
//!
//! - a WGSL shader on a wgpu device (`gpu` feature, on by default), optionally sharing one device
//!   between many renderers through a [`ContextPool`]
//! - a CPU pixel loop, always available
//! - a declarative SVG filter graph evaluated by resvg
//!
//! On top of the [`Renderer`] handle sit the scheduling pieces: a [`FrameLoop`] driven by a
//! [`FrameClock`], a shared [`ViewportObserver`], the per-instance [`VisibilityScheduler`] and
//! the [`AutoPause`] utility.
//!
//! Everything is single-threaded (`Rc`/`RefCell`); services are constructed explicitly and passed
//! to the components that use them.

pub mod config;
pub mod foundation;
pub mod kernel;
pub mod media;
pub mod pool;
pub mod renderer;
pub mod schedule;
pub mod surface;

pub use config::KitConfig;
pub use foundation::{
    error::{StackedAlphaError, StackedAlphaResult},
    geometry::{Geometry, derive_geometry},
};
#[cfg(feature = "gpu")]
pub use kernel::gpu::{GpuContext, GpuContextPool, GpuKernel, SharedGpuKernel, gpu_context_pool};
pub use kernel::{
    BackendKind, CompositeConfig, CompositeKernel, cpu::CpuKernel, filter::FilterGraphKernel,
};
pub use media::{
    sequence::{FrameSequence, decode_stacked_image},
    source::{MediaSource, Playable, ReadyState, VideoFrame},
};
pub use pool::{ContextFactory, ContextPool, Lease};
pub use renderer::{
    BackendMode, DrawOutcome, Renderer, RendererOptions, SkipReason, create_renderer,
    create_renderer_async, create_renderer_with_fallback, create_renderer_with_fallback_async,
};
pub use schedule::{
    autopause::{AutoPause, VisibilityState},
    frame_loop::{FrameCallbackKind, FrameClock, FrameLoop, FrameToken, ManualFrameClock},
    viewport::{ElementId, IntersectionEntry, ViewportObserver},
    visibility::{
        RendererFactory, SchedulerOptions, Visibility, VisibilityScheduler, fallback_factory,
    },
};
pub use surface::{AlphaMode, SharedSurface, Surface, shared_surface};
