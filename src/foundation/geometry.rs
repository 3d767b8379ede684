use std::ops::Range;

use crate::foundation::error::{StackedAlphaError, StackedAlphaResult};

/// Dimensions of a stacked-alpha frame and of the transparent image it decodes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Geometry {
    /// Frame and output width in pixels.
    pub width: u32,
    /// Height of the stacked source frame (color + alpha halves).
    pub full_height: u32,
    /// Height of the decoded output, `floor(full_height / 2)`.
    pub half_height: u32,
}

impl Geometry {
    /// Rows carrying color.
    pub fn color_rows(self) -> Range<u32> {
        0..self.half_height
    }

    /// Rows carrying the alpha mask. For odd heights this includes the extra bottom row, which is
    /// never sampled.
    pub fn alpha_rows(self) -> Range<u32> {
        self.half_height..self.full_height
    }

    /// Output size as `(width, height)`.
    pub fn output_size(self) -> (u32, u32) {
        (self.width, self.half_height)
    }

    /// Byte length of a tightly packed RGBA8 output buffer.
    pub fn output_len(self) -> usize {
        (self.width as usize) * (self.half_height as usize) * 4
    }

    /// Byte length of a tightly packed RGBA8 source buffer.
    pub fn source_len(self) -> usize {
        (self.width as usize) * (self.full_height as usize) * 4
    }
}

/// Derive output geometry from the reported dimensions of a stacked frame.
///
/// Fails with [`StackedAlphaError::InvalidGeometry`] while the source has not reported its
/// dimensions yet (zero width or height), and for one-row frames that have no room for a color
/// half.
pub fn derive_geometry(frame_width: u32, frame_height: u32) -> StackedAlphaResult<Geometry> {
    let half_height = frame_height / 2;
    if frame_width == 0 || half_height == 0 {
        return Err(StackedAlphaError::invalid_geometry(frame_width, frame_height));
    }
    Ok(Geometry {
        width: frame_width,
        full_height: frame_height,
        half_height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_height_is_floor_of_full_height() {
        for full in 2..64u32 {
            let g = derive_geometry(7, full).unwrap();
            assert_eq!(g.half_height, full / 2);
            assert_eq!(g.output_size(), (7, full / 2));
        }
    }

    #[test]
    fn odd_height_pushes_extra_row_into_alpha_half() {
        let g = derive_geometry(4, 5).unwrap();
        assert_eq!(g.color_rows(), 0..2);
        assert_eq!(g.alpha_rows(), 2..5);
    }

    #[test]
    fn unloaded_source_is_invalid() {
        assert!(matches!(
            derive_geometry(640, 0),
            Err(StackedAlphaError::InvalidGeometry {
                width: 640,
                height: 0
            })
        ));
        assert!(derive_geometry(0, 720).is_err());
        assert!(derive_geometry(16, 1).is_err());
    }

    #[test]
    fn buffer_lengths() {
        let g = derive_geometry(3, 4).unwrap();
        assert_eq!(g.output_len(), 3 * 2 * 4);
        assert_eq!(g.source_len(), 3 * 4 * 4);
    }
}
