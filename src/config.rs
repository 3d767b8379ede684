use std::path::Path;

use anyhow::Context;

#[cfg(feature = "gpu")]
use crate::kernel::gpu::GpuContextPool;
use crate::{
    foundation::error::{StackedAlphaError, StackedAlphaResult},
    kernel::BackendKind,
    renderer::BackendMode,
    schedule::visibility::SchedulerOptions,
};

/// Comma-separated backend order, e.g. `gpu,cpu`.
pub const ENV_BACKENDS: &str = "STACKED_ALPHA_BACKENDS";
/// `1`/`true`/`on` or `0`/`false`/`off`.
pub const ENV_PREMULTIPLIED: &str = "STACKED_ALPHA_PREMULTIPLIED";

/// Host-level settings for building renderers and schedulers.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct KitConfig {
    /// Initial output encoding.
    pub premultiplied_alpha: bool,
    /// Backends to try, in order.
    pub backends: Vec<BackendKind>,
    /// Share one GPU device between all renderers instead of one device each.
    pub share_gpu_context: bool,
    /// See [`SchedulerOptions::release_renderer_when_hidden`].
    pub release_renderer_when_hidden: bool,
    /// See [`SchedulerOptions::prefer_video_frame_callbacks`].
    pub prefer_video_frame_callbacks: bool,
}

impl Default for KitConfig {
    fn default() -> Self {
        let mut backends = Vec::new();
        if BackendKind::Gpu.is_compiled_in() {
            backends.push(BackendKind::Gpu);
        }
        backends.push(BackendKind::Cpu);
        Self {
            premultiplied_alpha: false,
            backends,
            share_gpu_context: true,
            release_renderer_when_hidden: false,
            prefer_video_frame_callbacks: true,
        }
    }
}

impl KitConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> StackedAlphaResult<Self> {
        serde_json::from_str(s).map_err(|e| StackedAlphaError::serde(e.to_string()))
    }

    /// Read and parse a JSON file.
    pub fn from_json_file(path: &Path) -> StackedAlphaResult<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config '{}'", path.display()))?;
        Self::from_json_str(&s)
    }

    /// Apply `STACKED_ALPHA_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> StackedAlphaResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> StackedAlphaResult<()> {
        if let Some(v) = lookup(ENV_BACKENDS) {
            self.backends = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<StackedAlphaResult<Vec<_>>>()?;
        }
        if let Some(v) = lookup(ENV_PREMULTIPLIED) {
            self.premultiplied_alpha = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                other => {
                    return Err(StackedAlphaError::validation(format!(
                        "{ENV_PREMULTIPLIED} must be a boolean, got '{other}'"
                    )));
                }
            };
        }
        Ok(())
    }

    /// Reject configurations no renderer can be built from.
    pub fn validate(&self) -> StackedAlphaResult<()> {
        if self.backends.is_empty() {
            return Err(StackedAlphaError::validation(
                "backends must list at least one backend",
            ));
        }
        for kind in &self.backends {
            if !kind.is_compiled_in() {
                return Err(StackedAlphaError::validation(format!(
                    "backend '{kind}' is not compiled in (enable the 'gpu' feature)"
                )));
            }
        }
        Ok(())
    }

    /// Backend modes in fallback order, each GPU backend on its own device.
    pub fn backend_modes(&self) -> Vec<BackendMode> {
        self.backends
            .iter()
            .filter_map(|kind| match kind {
                #[cfg(feature = "gpu")]
                BackendKind::Gpu => Some(BackendMode::Gpu),
                #[cfg(not(feature = "gpu"))]
                BackendKind::Gpu => None,
                BackendKind::Cpu => Some(BackendMode::Cpu),
                BackendKind::FilterGraph => Some(BackendMode::FilterGraph),
            })
            .collect()
    }

    /// Backend modes in fallback order, using `pool` for GPU backends when
    /// [`KitConfig::share_gpu_context`] is set.
    #[cfg(feature = "gpu")]
    pub fn backend_modes_with_pool(&self, pool: &GpuContextPool) -> Vec<BackendMode> {
        self.backend_modes()
            .into_iter()
            .map(|mode| match mode {
                BackendMode::Gpu if self.share_gpu_context => BackendMode::SharedGpu(pool.clone()),
                other => other,
            })
            .collect()
    }

    /// Per-instance scheduler options.
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            premultiplied_alpha: self.premultiplied_alpha,
            release_renderer_when_hidden: self.release_renderer_when_hidden,
            prefer_video_frame_callbacks: self.prefer_video_frame_callbacks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates_and_ends_with_cpu() {
        let cfg = KitConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.backends.last(), Some(&BackendKind::Cpu));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = KitConfig::from_json_str(r#"{"backends":["filter-graph","cpu"]}"#).unwrap();
        assert_eq!(
            cfg.backends,
            vec![BackendKind::FilterGraph, BackendKind::Cpu]
        );
        assert!(cfg.share_gpu_context);
        assert!(cfg.prefer_video_frame_callbacks);
    }

    #[test]
    fn bad_json_is_serde_error() {
        assert!(matches!(
            KitConfig::from_json_str(r#"{"backends":["metal"]}"#),
            Err(StackedAlphaError::Serde(_))
        ));
    }

    #[test]
    fn env_overrides() {
        let mut cfg = KitConfig::default();
        cfg.apply_env_from(|key| match key {
            ENV_BACKENDS => Some("cpu, filter-graph".to_string()),
            ENV_PREMULTIPLIED => Some("on".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(
            cfg.backends,
            vec![BackendKind::Cpu, BackendKind::FilterGraph]
        );
        assert!(cfg.premultiplied_alpha);

        assert!(
            cfg.apply_env_from(|key| (key == ENV_PREMULTIPLIED).then(|| "maybe".to_string()))
                .is_err()
        );
    }

    #[test]
    fn empty_backends_rejected() {
        let cfg = KitConfig {
            backends: vec![],
            ..KitConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn modes_follow_backend_order() {
        let cfg = KitConfig {
            backends: vec![BackendKind::FilterGraph, BackendKind::Cpu],
            ..KitConfig::default()
        };
        let kinds: Vec<_> = cfg.backend_modes().iter().map(BackendMode::kind).collect();
        assert_eq!(kinds, vec![BackendKind::FilterGraph, BackendKind::Cpu]);
    }
}
