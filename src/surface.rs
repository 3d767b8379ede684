use std::{cell::RefCell, rc::Rc};

use crate::foundation::pixel::{Rgba8, unpremultiply_in_place};

/// How the color channels of a [`Surface`] relate to its alpha channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum AlphaMode {
    /// Color channels are independent of alpha.
    #[default]
    Straight,
    /// Color channels are pre-multiplied by alpha (`rgb <= a`).
    Premultiplied,
}

/// A caller-owned RGBA8 destination a renderer writes decoded frames into.
///
/// Renderers only ever resize a surface when the decoded geometry actually changes, so
/// [`Surface::reallocations`] counts real size changes.
#[derive(Clone, Debug, Default)]
pub struct Surface {
    width: u32,
    height: u32,
    data: Vec<u8>,
    alpha_mode: AlphaMode,
    reallocations: u64,
    presented_frames: u64,
}

/// A surface shared between its owner and the renderer bound to it.
pub type SharedSurface = Rc<RefCell<Surface>>;

/// Create an empty, zero-sized shared surface.
pub fn shared_surface() -> SharedSurface {
    Rc::new(RefCell::new(Surface::default()))
}

impl Surface {
    /// A transparent surface of the given size.
    pub fn with_size(width: u32, height: u32) -> Self {
        let mut s = Self::default();
        s.resize(width, height);
        s
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Tightly packed RGBA8 bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encoding of the last presented frame.
    pub fn alpha_mode(&self) -> AlphaMode {
        self.alpha_mode
    }

    /// How many times the backing buffer was reallocated for a new size.
    pub fn reallocations(&self) -> u64 {
        self.reallocations
    }

    /// How many frames have been composited into this surface.
    pub fn presented_frames(&self) -> u64 {
        self.presented_frames
    }

    /// Resize to `(width, height)`, clearing to transparent. Returns `false` (and keeps the
    /// current contents) when the size is unchanged.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if self.width == width && self.height == height && !self.data.is_empty() {
            return false;
        }
        self.width = width;
        self.height = height;
        self.data = vec![0; (width as usize) * (height as usize) * 4];
        self.reallocations += 1;
        true
    }

    /// Pixel at `(x, y)` as stored.
    pub fn pixel(&self, x: u32, y: u32) -> Rgba8 {
        let i = ((y as usize) * (self.width as usize) + (x as usize)) * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }

    /// Contents converted to straight alpha, regardless of how they are stored.
    pub fn to_straight_rgba8(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        if self.alpha_mode == AlphaMode::Premultiplied {
            unpremultiply_in_place(&mut out);
        }
        out
    }

    pub(crate) fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn mark_presented(&mut self, alpha_mode: AlphaMode) {
        self.alpha_mode = alpha_mode;
        self.presented_frames += 1;
    }
}
