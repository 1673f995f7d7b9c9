use tracing::debug;

use crate::state::FramebufferFormats;

pub const ENV_PIPELINE_CACHE_CAPACITY: &str = "AERO_GLES_PIPELINE_CACHE_CAPACITY";
pub const ENV_DEPTH_STENCIL_CACHE_CAPACITY: &str = "AERO_GLES_DEPTH_STENCIL_CACHE_CAPACITY";
pub const ENV_RING_SIZE: &str = "AERO_GLES_RING_SIZE";
pub const ENV_FRAMES_IN_FLIGHT: &str = "AERO_GLES_FRAMES_IN_FLIGHT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineCacheConfig {
    /// Maximum number of cached render pipelines. Least-recently-used entries are evicted once
    /// the cache is full.
    pub render_pipeline_capacity: usize,
    pub depth_stencil_capacity: usize,
}

impl Default for PipelineCacheConfig {
    fn default() -> Self {
        Self {
            render_pipeline_capacity: 256,
            depth_stencil_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingConfig {
    /// Bytes of ring scratch space per in-flight segment.
    pub ring_size_per_frame: u64,
    /// Number of ring segments. A segment is recycled only once the GPU finished every
    /// submission that referenced it.
    pub frames_in_flight: usize,
    /// Dynamic buffers larger than this keep using their resident copy.
    pub dynamic_buffer_threshold: u64,
    /// Consecutive draws that must observe new contents before a dynamic buffer is streamed
    /// through the ring.
    pub dynamic_update_streak: u32,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            ring_size_per_frame: 1024 * 1024,
            frames_in_flight: 3,
            dynamic_buffer_threshold: 64 * 1024,
            dynamic_update_streak: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    pub pipeline_cache: PipelineCacheConfig,
    pub staging: StagingConfig,
    pub max_vertex_attribs: usize,
    pub max_uniform_buffer_bindings: usize,
    pub max_transform_feedback_buffers: usize,
    pub max_texture_units: usize,
    /// Attachment formats of framebuffer 0.
    pub default_framebuffer: FramebufferFormats,
    /// Size of framebuffer 0; seeds the initial viewport and scissor box.
    pub surface_size: (u32, u32),
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            pipeline_cache: PipelineCacheConfig::default(),
            staging: StagingConfig::default(),
            max_vertex_attribs: crate::state::MAX_VERTEX_ATTRIBS,
            max_uniform_buffer_bindings: 24,
            max_transform_feedback_buffers: 4,
            max_texture_units: 16,
            default_framebuffer: FramebufferFormats::default(),
            surface_size: (1, 1),
        }
    }
}

impl ContextConfig {
    /// Defaults with `AERO_GLES_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_override(&lookup, ENV_PIPELINE_CACHE_CAPACITY) {
            self.pipeline_cache.render_pipeline_capacity = v as usize;
        }
        if let Some(v) = parse_override(&lookup, ENV_DEPTH_STENCIL_CACHE_CAPACITY) {
            self.pipeline_cache.depth_stencil_capacity = v as usize;
        }
        if let Some(v) = parse_override(&lookup, ENV_RING_SIZE) {
            self.staging.ring_size_per_frame = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_FRAMES_IN_FLIGHT) {
            self.staging.frames_in_flight = v as usize;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pipeline_cache.render_pipeline_capacity == 0 {
            return Err("render_pipeline_capacity must be non-zero".into());
        }
        if self.pipeline_cache.depth_stencil_capacity == 0 {
            return Err("depth_stencil_capacity must be non-zero".into());
        }
        if self.staging.frames_in_flight == 0 {
            return Err("frames_in_flight must be non-zero".into());
        }
        if self.staging.ring_size_per_frame == 0 || self.staging.ring_size_per_frame % 4 != 0 {
            return Err(format!(
                "ring_size_per_frame must be a non-zero multiple of 4 (got {})",
                self.staging.ring_size_per_frame
            ));
        }
        if self.max_vertex_attribs == 0 || self.max_vertex_attribs > crate::state::MAX_VERTEX_ATTRIBS
        {
            return Err(format!(
                "max_vertex_attribs must be in 1..={} (got {})",
                crate::state::MAX_VERTEX_ATTRIBS,
                self.max_vertex_attribs
            ));
        }
        if self.max_uniform_buffer_bindings == 0 || self.max_texture_units == 0 {
            return Err("binding tables must have at least one slot".into());
        }
        Ok(())
    }
}

fn parse_override(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            debug!(name, value = %raw, "ignoring invalid config override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn overrides_apply_and_invalid_values_are_ignored() {
        let env: HashMap<&str, &str> = [
            (ENV_PIPELINE_CACHE_CAPACITY, " 32 "),
            (ENV_RING_SIZE, "not-a-number"),
            (ENV_FRAMES_IN_FLIGHT, "0"),
        ]
        .into_iter()
        .collect();

        let mut config = ContextConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.pipeline_cache.render_pipeline_capacity, 32);
        assert_eq!(config.pipeline_cache.depth_stencil_capacity, 64);
        assert_eq!(config.staging.ring_size_per_frame, 1024 * 1024);
        assert_eq!(config.staging.frames_in_flight, 3);
    }

    #[test]
    fn validate_rejects_empty_tables() {
        assert!(ContextConfig::default().validate().is_ok());

        let mut config = ContextConfig::default();
        config.pipeline_cache.render_pipeline_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = ContextConfig::default();
        config.max_vertex_attribs = 0;
        assert!(config.validate().is_err());

        let mut config = ContextConfig::default();
        config.staging.ring_size_per_frame = 6;
        assert!(config.validate().is_err());
    }
}
