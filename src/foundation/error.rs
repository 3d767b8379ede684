/// Result alias used throughout the crate.
pub type StackedAlphaResult<T> = Result<T, StackedAlphaError>;

/// Errors surfaced by renderer construction, configuration and frame validation.
///
/// Per-frame problems during steady-state playback are never reported through this type; see
/// [`crate::DrawOutcome`] instead.
#[derive(thiserror::Error, Debug)]
pub enum StackedAlphaError {
    /// No hardware context of the requested family could be created. Callers are expected to fall
    /// back to a different backend.
    #[error("context unavailable: {0}")]
    ContextUnavailable(String),

    /// Shader compilation or pipeline linking failed. Indicates an environment defect.
    #[error("shader build failed: {0}")]
    ShaderBuildFailed(String),

    /// The source reported zero or unset dimensions (metadata not loaded yet).
    #[error("invalid geometry: {width}x{height}")]
    InvalidGeometry {
        /// Reported frame width.
        width: u32,
        /// Reported (stacked) frame height.
        height: u32,
    },

    /// A pixel buffer did not match its declared dimensions.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Configuration rejected by validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serde(String),

    /// Anything else, with context attached.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StackedAlphaError {
    /// Build a [`StackedAlphaError::ContextUnavailable`].
    pub fn context_unavailable(msg: impl Into<String>) -> Self {
        Self::ContextUnavailable(msg.into())
    }

    /// Build a [`StackedAlphaError::ShaderBuildFailed`].
    pub fn shader_build_failed(msg: impl Into<String>) -> Self {
        Self::ShaderBuildFailed(msg.into())
    }

    /// Build a [`StackedAlphaError::InvalidGeometry`].
    pub fn invalid_geometry(width: u32, height: u32) -> Self {
        Self::InvalidGeometry { width, height }
    }

    /// Build a [`StackedAlphaError::InvalidFrame`].
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Build a [`StackedAlphaError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Build a [`StackedAlphaError::Serde`].
    pub fn serde(msg: impl Into<String>) -> Self {
        Self::Serde(msg.into())
    }

    /// Whether a caller should try another backend after this error.
    pub fn is_backend_fallback_candidate(&self) -> bool {
        matches!(self, Self::ContextUnavailable(_) | Self::ShaderBuildFailed(_))
    }
}
