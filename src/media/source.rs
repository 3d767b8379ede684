use std::sync::Arc;

use crate::foundation::error::{StackedAlphaError, StackedAlphaResult};

/// How much media data a source has available, ordered like the platform media element levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ReadyState {
    /// Nothing is known about the media yet.
    #[default]
    HaveNothing,
    /// Dimensions and duration are known, no frame is decodable yet.
    HaveMetadata,
    /// The frame at the current position is available.
    HaveCurrentData,
    /// The current frame and at least the next one are available.
    HaveFutureData,
    /// Enough data is buffered to play through.
    HaveEnoughData,
}

impl ReadyState {
    /// Whether a decodable frame is guaranteed to be available.
    pub fn has_current_frame(self) -> bool {
        self >= ReadyState::HaveCurrentData
    }
}

/// A decoded stacked-alpha frame: straight RGBA8, tightly packed, row-major.
///
/// The pixel buffer is shared, so cloning a frame is cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoFrame {
    /// Width in pixels.
    pub width: u32,
    /// Full stacked height in pixels (color + alpha halves).
    pub height: u32,
    /// RGBA8 bytes, `width * height * 4` long.
    pub rgba8: Arc<Vec<u8>>,
}

impl VideoFrame {
    /// Wrap a pixel buffer, checking it matches the declared dimensions.
    pub fn new(width: u32, height: u32, rgba8: Vec<u8>) -> StackedAlphaResult<Self> {
        let expected = (width as usize) * (height as usize) * 4;
        if rgba8.len() != expected {
            return Err(StackedAlphaError::invalid_frame(format!(
                "{width}x{height} frame expects {expected} bytes, got {}",
                rgba8.len()
            )));
        }
        Ok(Self {
            width,
            height,
            rgba8: Arc::new(rgba8),
        })
    }

    /// Build a stacked frame from a straight-alpha color image, the way an encoder would: color in
    /// the top half, alpha replicated into the gray levels of the bottom half.
    pub fn stack(width: u32, height: u32, straight_rgba8: &[u8]) -> StackedAlphaResult<Self> {
        let expected = (width as usize) * (height as usize) * 4;
        if straight_rgba8.len() != expected {
            return Err(StackedAlphaError::invalid_frame(format!(
                "{width}x{height} image expects {expected} bytes, got {}",
                straight_rgba8.len()
            )));
        }
        let mut out = Vec::with_capacity(expected * 2);
        for px in straight_rgba8.chunks_exact(4) {
            out.extend_from_slice(&[px[0], px[1], px[2], 255]);
        }
        for px in straight_rgba8.chunks_exact(4) {
            out.extend_from_slice(&[px[3], px[3], px[3], 255]);
        }
        Self::new(width, height * 2, out)
    }

    /// The RGBA8 bytes of row `y`.
    pub fn row(&self, y: u32) -> &[u8] {
        let stride = (self.width as usize) * 4;
        let start = (y as usize) * stride;
        &self.rgba8[start..start + stride]
    }

    /// The pixel at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let row = self.row(y);
        let i = (x as usize) * 4;
        [row[i], row[i + 1], row[i + 2], row[i + 3]]
    }
}

/// Anything that can be played and paused. Auto-pause operates on this capability alone.
pub trait Playable {
    /// Start or resume playback.
    fn play(&self);
    /// Pause playback.
    fn pause(&self);
    /// Whether playback is paused.
    fn paused(&self) -> bool;
}

/// The decoded media collaborator every backend consumes.
///
/// Methods take `&self`: sources are shared between a scheduler, its renderer and host code on a
/// single thread, and keep their mutable state behind interior mutability.
pub trait MediaSource: Playable {
    /// Intrinsic width of the stacked stream, 0 while unknown.
    fn video_width(&self) -> u32;
    /// Intrinsic height of the stacked stream (twice the logical height), 0 while unknown.
    fn video_height(&self) -> u32;
    /// Current readiness level.
    fn ready_state(&self) -> ReadyState;
    /// The frame at the current position, if one is decoded.
    fn current_frame(&self) -> Option<VideoFrame>;
    /// Playback position in seconds.
    fn current_time(&self) -> f64;
    /// Move the playback position.
    fn seek(&self, time_s: f64);

    /// Height reported to consumers of the decoded (transparent) output.
    fn logical_height(&self) -> u32 {
        self.video_height() / 2
    }
}
