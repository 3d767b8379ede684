//! Visibility-driven scheduling: frame loop, shared viewport observer, per-instance scheduler and
//! auto-pause.

pub mod autopause;
pub mod frame_loop;
pub mod viewport;
pub mod visibility;
