use std::{
    cell::{Cell, RefCell},
    path::Path,
};

use anyhow::Context;

use crate::{
    foundation::error::{StackedAlphaError, StackedAlphaResult},
    media::source::{MediaSource, Playable, ReadyState, VideoFrame},
};

/// An in-memory, seekable sequence of already-decoded stacked frames.
///
/// Stands in for the platform decoder: the host advances it once per decoded frame (or per
/// display refresh) and it reports readiness, dimensions and play state like a media element.
pub struct FrameSequence {
    frames: RefCell<Vec<VideoFrame>>,
    fps: f64,
    position: Cell<usize>,
    paused: Cell<bool>,
    looping: Cell<bool>,
    ready_cap: Cell<ReadyState>,
    play_calls: Cell<u64>,
    pause_calls: Cell<u64>,
}

impl FrameSequence {
    /// A paused sequence over `frames`, played back at `fps`.
    pub fn new(frames: Vec<VideoFrame>, fps: f64) -> StackedAlphaResult<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(StackedAlphaError::validation(format!(
                "frame rate must be positive, got {fps}"
            )));
        }
        Ok(Self::with_frames(frames, fps))
    }

    /// A single still frame.
    pub fn still(frame: VideoFrame) -> Self {
        Self::with_frames(vec![frame], 1.0)
    }

    fn with_frames(frames: Vec<VideoFrame>, fps: f64) -> Self {
        Self {
            frames: RefCell::new(frames),
            fps,
            position: Cell::new(0),
            paused: Cell::new(true),
            looping: Cell::new(false),
            ready_cap: Cell::new(ReadyState::HaveEnoughData),
            play_calls: Cell::new(0),
            pause_calls: Cell::new(0),
        }
    }

    /// Load a sequence of stacked images (PNG, JPEG, ... anything `image` decodes).
    pub fn from_stacked_images<P: AsRef<Path>>(paths: &[P], fps: f64) -> StackedAlphaResult<Self> {
        let mut frames = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let bytes =
                std::fs::read(path).with_context(|| format!("read '{}'", path.display()))?;
            frames.push(decode_stacked_image(&bytes)?);
        }
        Self::new(frames, fps)
    }

    /// Append a decoded frame (e.g. as a stream buffers).
    pub fn push_frame(&self, frame: VideoFrame) {
        self.frames.borrow_mut().push(frame);
    }

    /// Cap the reported readiness, e.g. to emulate buffering or a source still loading metadata.
    pub fn set_ready_state(&self, cap: ReadyState) {
        self.ready_cap.set(cap);
    }

    /// Restart from the first frame after the last one instead of pausing.
    pub fn set_looping(&self, looping: bool) {
        self.looping.set(looping);
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Whether no frame has been decoded yet.
    pub fn is_empty(&self) -> bool {
        self.frames.borrow().is_empty()
    }

    /// Index of the current frame.
    pub fn position(&self) -> usize {
        self.position.get()
    }

    /// How many times `play()` was called.
    pub fn play_calls(&self) -> u64 {
        self.play_calls.get()
    }

    /// How many times `pause()` was called.
    pub fn pause_calls(&self) -> u64 {
        self.pause_calls.get()
    }

    /// Move to the next frame while playing. Returns whether a new frame became current.
    ///
    /// At the end the sequence wraps when looping, otherwise it pauses like an ended media
    /// element.
    pub fn advance(&self) -> bool {
        if self.paused.get() || !self.ready_state().has_current_frame() {
            return false;
        }
        let len = self.len();
        let next = self.position.get() + 1;
        if next < len {
            self.position.set(next);
            true
        } else if self.looping.get() && len > 1 {
            self.position.set(0);
            true
        } else {
            self.paused.set(true);
            false
        }
    }
}

impl Playable for FrameSequence {
    fn play(&self) {
        self.play_calls.set(self.play_calls.get() + 1);
        self.paused.set(false);
    }

    fn pause(&self) {
        self.pause_calls.set(self.pause_calls.get() + 1);
        self.paused.set(true);
    }

    fn paused(&self) -> bool {
        self.paused.get()
    }
}

impl MediaSource for FrameSequence {
    fn video_width(&self) -> u32 {
        self.current_frame().map(|f| f.width).unwrap_or(0)
    }

    fn video_height(&self) -> u32 {
        self.current_frame().map(|f| f.height).unwrap_or(0)
    }

    fn ready_state(&self) -> ReadyState {
        if self.is_empty() {
            return ReadyState::HaveNothing;
        }
        self.ready_cap.get()
    }

    fn current_frame(&self) -> Option<VideoFrame> {
        if self.ready_cap.get() < ReadyState::HaveMetadata {
            return None;
        }
        self.frames.borrow().get(self.position.get()).cloned()
    }

    fn current_time(&self) -> f64 {
        self.position.get() as f64 / self.fps
    }

    fn seek(&self, time_s: f64) {
        let len = self.len();
        if len == 0 {
            return;
        }
        let idx = (time_s.max(0.0) * self.fps).round() as usize;
        self.position.set(idx.min(len - 1));
    }
}

/// Decode an encoded stacked image into a [`VideoFrame`].
pub fn decode_stacked_image(bytes: &[u8]) -> StackedAlphaResult<VideoFrame> {
    let rgba = image::load_from_memory(bytes)
        .context("decode stacked image from memory")?
        .to_rgba8();
    let (width, height) = rgba.dimensions();
    VideoFrame::new(width, height, rgba.into_raw())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn solid(width: u32, height: u32, v: u8) -> VideoFrame {
        VideoFrame::new(width, height, vec![v; (width * height * 4) as usize]).unwrap()
    }

    #[test]
    fn empty_sequence_reports_nothing() {
        let seq = FrameSequence::new(vec![], 30.0).unwrap();
        assert_eq!(seq.ready_state(), ReadyState::HaveNothing);
        assert_eq!(seq.video_width(), 0);
        assert_eq!(seq.video_height(), 0);
        assert!(seq.current_frame().is_none());
    }

    #[test]
    fn rejects_non_positive_fps() {
        assert!(FrameSequence::new(vec![], 0.0).is_err());
        assert!(FrameSequence::new(vec![], f64::NAN).is_err());
    }

    #[test]
    fn advance_only_while_playing_and_pauses_at_end() {
        let seq = FrameSequence::new(vec![solid(2, 4, 1), solid(2, 4, 2)], 30.0).unwrap();
        assert!(!seq.advance());
        seq.play();
        assert!(seq.advance());
        assert_eq!(seq.position(), 1);
        assert!(!seq.advance());
        assert!(seq.paused());
    }

    #[test]
    fn looping_wraps() {
        let seq = FrameSequence::new(vec![solid(2, 4, 1), solid(2, 4, 2)], 30.0).unwrap();
        seq.set_looping(true);
        seq.play();
        assert!(seq.advance());
        assert!(seq.advance());
        assert_eq!(seq.position(), 0);
        assert!(!seq.paused());
    }

    #[test]
    fn seek_clamps_and_reports_time() {
        let seq = FrameSequence::new(vec![solid(1, 2, 0); 10], 10.0).unwrap();
        seq.seek(0.5);
        assert_eq!(seq.position(), 5);
        assert!((seq.current_time() - 0.5).abs() < 1e-9);
        seq.seek(99.0);
        assert_eq!(seq.position(), 9);
    }

    #[test]
    fn metadata_only_has_dimensions_but_no_current_frame_guarantee() {
        let seq = FrameSequence::still(solid(4, 8, 0));
        seq.set_ready_state(ReadyState::HaveMetadata);
        assert_eq!(seq.video_height(), 8);
        assert_eq!(seq.logical_height(), 4);
        assert!(!seq.ready_state().has_current_frame());
    }

    #[test]
    fn decodes_png_bytes() {
        let img = image::RgbaImage::from_raw(1, 2, vec![9, 8, 7, 255, 50, 50, 50, 255]).unwrap();
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        let frame = decode_stacked_image(&buf).unwrap();
        assert_eq!((frame.width, frame.height), (1, 2));
        assert_eq!(frame.pixel(0, 1), [50, 50, 50, 255]);
    }
}
