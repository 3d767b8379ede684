//! Compositing kernels: the per-backend algorithms that turn one stacked frame into one
//! transparent image.
//!
//! Every kernel computes the same transform:
//!
//! - `out.a = alpha`, where `alpha` is channel 0 of the mask row `half_height + y`
//! - `out.rgb = premultiplied ? color.rgb * alpha / 255 : color.rgb`
//!
//! and writes a `(width, half_height)` image into a caller-owned [`Surface`].

use std::str::FromStr;

use crate::{
    foundation::{error::StackedAlphaError, error::StackedAlphaResult, geometry::Geometry},
    media::source::VideoFrame,
    surface::Surface,
};

pub mod cpu;
pub mod filter;
#[cfg(feature = "gpu")]
pub mod gpu;

/// Output encoding of composited frames. Takes effect on the next composited frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CompositeConfig {
    /// Whether color channels are pre-multiplied by alpha.
    pub premultiplied: bool,
}

/// Backend families.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// WGSL shader kernel on a wgpu device.
    Gpu,
    /// Pixel-buffer kernel on the CPU. Always available.
    Cpu,
    /// Declarative SVG filter graph evaluated by resvg.
    #[value(alias = "filter", alias = "svg")]
    FilterGraph,
}

impl BackendKind {
    /// Stable lowercase name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Gpu => "gpu",
            BackendKind::Cpu => "cpu",
            BackendKind::FilterGraph => "filter-graph",
        }
    }

    /// Whether this build includes the backend.
    pub fn is_compiled_in(self) -> bool {
        match self {
            BackendKind::Gpu => cfg!(feature = "gpu"),
            BackendKind::Cpu | BackendKind::FilterGraph => true,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StackedAlphaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Ok(BackendKind::Gpu),
            "cpu" => Ok(BackendKind::Cpu),
            "filter-graph" | "filter" | "svg" => Ok(BackendKind::FilterGraph),
            other => Err(StackedAlphaError::validation(format!(
                "unknown backend '{other}' (expected gpu, cpu or filter-graph)"
            ))),
        }
    }
}

/// One compositing algorithm bound to whatever device state it needs.
pub trait CompositeKernel {
    /// Backend family.
    fn kind(&self) -> BackendKind;

    /// Whether [`CompositeConfig::premultiplied`] has any effect on this kernel's output.
    fn honors_premultiplied(&self) -> bool {
        true
    }

    /// Composite `frame` into `dst`, resizing `dst` to the output geometry if it changed.
    ///
    /// `frame` must match `geometry`.
    fn composite(
        &mut self,
        frame: &VideoFrame,
        geometry: Geometry,
        config: CompositeConfig,
        dst: &mut Surface,
    ) -> StackedAlphaResult<()>;

    /// Release any device resources early. Called once when the owning renderer is destroyed.
    fn release(&mut self) {}
}

pub(crate) fn check_frame(frame: &VideoFrame, geometry: Geometry) -> StackedAlphaResult<()> {
    if frame.width != geometry.width || frame.height != geometry.full_height {
        return Err(StackedAlphaError::invalid_frame(format!(
            "frame is {}x{}, geometry expects {}x{}",
            frame.width, frame.height, geometry.width, geometry.full_height
        )));
    }
    if frame.rgba8.len() != geometry.source_len() {
        return Err(StackedAlphaError::invalid_frame(format!(
            "frame buffer is {} bytes, expected {}",
            frame.rgba8.len(),
            geometry.source_len()
        )));
    }
    Ok(())
}
