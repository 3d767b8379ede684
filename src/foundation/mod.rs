//! Errors, frame geometry and pixel arithmetic shared by every backend.

pub mod error;
pub mod geometry;
pub mod pixel;
