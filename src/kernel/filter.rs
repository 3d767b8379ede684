use std::{io::Cursor, sync::Arc};

use anyhow::Context;

use crate::{
    foundation::{error::StackedAlphaResult, geometry::Geometry},
    kernel::{BackendKind, CompositeConfig, CompositeKernel, check_frame},
    media::source::VideoFrame,
    surface::{AlphaMode, Surface},
};

const FRAME_HREF: &str = "frame.png";

/// The geometry-dependent part of the filter graph: the SVG document wrapping one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
struct FilterGraph {
    geometry: Geometry,
    document: String,
}

impl FilterGraph {
    fn build(geometry: Geometry) -> Self {
        let Geometry {
            width,
            full_height,
            half_height,
        } = geometry;
        // Canvas is the full stacked frame; only its top `half_height` rows are kept.
        let document = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{width}" height="{full_height}" viewBox="0 0 {width} {full_height}">
  <defs>
    <filter id="stacked-alpha" filterUnits="userSpaceOnUse" x="0" y="0" width="{width}" height="{full_height}" color-interpolation-filters="sRGB">
      <feOffset in="SourceGraphic" dx="0" dy="-{half_height}" result="shifted"/>
      <feColorMatrix in="shifted" type="matrix" values="0 0 0 0 0  0 0 0 0 0  0 0 0 0 0  1 0 0 0 0" result="mask"/>
      <feComposite in="SourceGraphic" in2="mask" operator="in"/>
    </filter>
  </defs>
  <image x="0" y="0" width="{width}" height="{full_height}" preserveAspectRatio="none" image-rendering="optimizeSpeed" xlink:href="{FRAME_HREF}" filter="url(#stacked-alpha)"/>
</svg>"#
        );
        Self { geometry, document }
    }
}

/// Kernel that expresses the transform as a static SVG filter graph and lets resvg evaluate it.
///
/// The graph offsets the frame up by `half_height`, moves channel 0 into alpha and composites the
/// original frame "in" that mask. There is no control point for the output encoding: resvg
/// rasterizes into a premultiplied pixmap, so output is always premultiplied.
#[derive(Debug, Default)]
pub struct FilterGraphKernel {
    graph: Option<FilterGraph>,
    rebuilds: u64,
}

impl FilterGraphKernel {
    /// A kernel with no graph built yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the geometry-dependent graph was rebuilt.
    pub fn graph_rebuilds(&self) -> u64 {
        self.rebuilds
    }

    fn graph_for(&mut self, geometry: Geometry) -> &FilterGraph {
        if self.graph.as_ref().map(|g| g.geometry) != Some(geometry) {
            self.rebuilds += 1;
        }
        let graph = self
            .graph
            .take()
            .filter(|g| g.geometry == geometry)
            .unwrap_or_else(|| FilterGraph::build(geometry));
        self.graph.insert(graph)
    }
}

impl CompositeKernel for FilterGraphKernel {
    fn kind(&self) -> BackendKind {
        BackendKind::FilterGraph
    }

    fn honors_premultiplied(&self) -> bool {
        false
    }

    fn composite(
        &mut self,
        frame: &VideoFrame,
        geometry: Geometry,
        _config: CompositeConfig,
        dst: &mut Surface,
    ) -> StackedAlphaResult<()> {
        check_frame(frame, geometry)?;

        let png = Arc::new(encode_opaque_png(frame)?);
        let graph = self.graph_for(geometry);

        let mut opts = usvg::Options::default();
        opts.image_href_resolver = usvg::ImageHrefResolver {
            resolve_string: Box::new(move |href: &str, _: &usvg::Options| {
                (href == FRAME_HREF).then(|| usvg::ImageKind::PNG(png.clone()))
            }),
            ..Default::default()
        };
        let tree =
            usvg::Tree::from_str(&graph.document, &opts).context("parse stacked-alpha filter graph")?;

        let mut pixmap = resvg::tiny_skia::Pixmap::new(geometry.width, geometry.full_height)
            .context("allocate filter-graph pixmap")?;
        resvg::render(
            &tree,
            resvg::tiny_skia::Transform::default(),
            &mut pixmap.as_mut(),
        );

        dst.resize(geometry.width, geometry.half_height);
        let out_len = geometry.output_len();
        dst.pixels_mut().copy_from_slice(&pixmap.data()[..out_len]);
        dst.mark_presented(AlphaMode::Premultiplied);
        Ok(())
    }

    fn release(&mut self) {
        self.graph = None;
    }
}

/// Encode a frame as PNG with alpha forced to opaque; the stacked layout carries alpha in the
/// bottom half, not in the alpha channel.
fn encode_opaque_png(frame: &VideoFrame) -> StackedAlphaResult<Vec<u8>> {
    let mut rgba = frame.rgba8.as_slice().to_vec();
    for px in rgba.chunks_exact_mut(4) {
        px[3] = 255;
    }
    let img = image::RgbaImage::from_raw(frame.width, frame.height, rgba)
        .context("wrap frame as rgba image")?;
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .context("encode frame as png")?;
    Ok(buf)
}
