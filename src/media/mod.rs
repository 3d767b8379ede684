//! The decoded-media collaborator consumed by renderers and schedulers.

pub mod sequence;
pub mod source;
