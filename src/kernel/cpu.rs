use crate::{
    foundation::{
        error::{StackedAlphaError, StackedAlphaResult},
        geometry::Geometry,
        pixel::mul_div255,
    },
    kernel::{BackendKind, CompositeConfig, CompositeKernel, check_frame},
    media::source::VideoFrame,
    surface::{AlphaMode, Surface},
};

/// Pixel-buffer kernel. Needs no device and is available everywhere.
#[derive(Debug, Default)]
pub struct CpuKernel;

impl CpuKernel {
    /// A new CPU kernel.
    pub fn new() -> Self {
        Self
    }
}

impl CompositeKernel for CpuKernel {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn composite(
        &mut self,
        frame: &VideoFrame,
        geometry: Geometry,
        config: CompositeConfig,
        dst: &mut Surface,
    ) -> StackedAlphaResult<()> {
        check_frame(frame, geometry)?;
        dst.resize(geometry.width, geometry.half_height);
        composite_stacked_rgba8(&frame.rgba8, geometry, config.premultiplied, dst.pixels_mut())?;
        dst.mark_presented(if config.premultiplied {
            AlphaMode::Premultiplied
        } else {
            AlphaMode::Straight
        });
        Ok(())
    }
}

/// Composite a stacked straight-RGBA8 buffer into `out`.
///
/// Color comes from row `y`, alpha from channel 0 of row `half_height + y`.
pub fn composite_stacked_rgba8(
    src: &[u8],
    geometry: Geometry,
    premultiplied: bool,
    out: &mut [u8],
) -> StackedAlphaResult<()> {
    if src.len() != geometry.source_len() || out.len() != geometry.output_len() {
        return Err(StackedAlphaError::invalid_frame(
            "composite_stacked_rgba8 expects buffers matching the geometry",
        ));
    }

    let stride = (geometry.width as usize) * 4;
    let (color, mask) = src.split_at(stride * geometry.half_height as usize);

    for ((out_row, color_row), mask_row) in out
        .chunks_exact_mut(stride)
        .zip(color.chunks_exact(stride))
        .zip(mask.chunks_exact(stride))
    {
        for ((o, c), m) in out_row
            .chunks_exact_mut(4)
            .zip(color_row.chunks_exact(4))
            .zip(mask_row.chunks_exact(4))
        {
            let a = m[0];
            if premultiplied {
                o[0] = mul_div255(c[0], a);
                o[1] = mul_div255(c[1], a);
                o[2] = mul_div255(c[2], a);
            } else {
                o[0] = c[0];
                o[1] = c[1];
                o[2] = c[2];
            }
            o[3] = a;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::geometry::derive_geometry;

    fn frame(width: u32, rows: &[[u8; 4]]) -> VideoFrame {
        let mut data = Vec::new();
        for px in rows {
            for _ in 0..width {
                data.extend_from_slice(px);
            }
        }
        VideoFrame::new(width, rows.len() as u32, data).unwrap()
    }

    #[test]
    fn straight_keeps_color() {
        let f = frame(2, &[[200, 100, 50, 255], [64, 0, 0, 255]]);
        let g = derive_geometry(2, 2).unwrap();
        let mut dst = Surface::default();
        CpuKernel::new()
            .composite(&f, g, CompositeConfig::default(), &mut dst)
            .unwrap();
        assert_eq!(dst.pixel(0, 0), [200, 100, 50, 64]);
        assert_eq!(dst.alpha_mode(), AlphaMode::Straight);
    }

    #[test]
    fn premultiplied_scales_color_only() {
        let f = frame(1, &[[200, 100, 50, 255], [128, 9, 9, 255]]);
        let g = derive_geometry(1, 2).unwrap();
        let mut dst = Surface::default();
        CpuKernel::new()
            .composite(&f, g, CompositeConfig { premultiplied: true }, &mut dst)
            .unwrap();
        assert_eq!(dst.pixel(0, 0), [100, 50, 25, 128]);
        assert_eq!(dst.alpha_mode(), AlphaMode::Premultiplied);
    }

    #[test]
    fn odd_height_ignores_last_row() {
        let f = frame(1, &[[10, 10, 10, 255], [20, 0, 0, 255], [99, 0, 0, 255]]);
        let g = derive_geometry(1, 3).unwrap();
        let mut dst = Surface::default();
        CpuKernel::new()
            .composite(&f, g, CompositeConfig::default(), &mut dst)
            .unwrap();
        assert_eq!((dst.width(), dst.height()), (1, 1));
        assert_eq!(dst.pixel(0, 0), [10, 10, 10, 20]);
    }

    #[test]
    fn rejects_mismatched_geometry() {
        let f = frame(2, &[[0; 4], [0; 4]]);
        let g = derive_geometry(4, 2).unwrap();
        let mut dst = Surface::default();
        assert!(
            CpuKernel::new()
                .composite(&f, g, CompositeConfig::default(), &mut dst)
                .is_err()
        );
    }
}
