/// Snapshot of pipeline cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineCacheStats {
    pub render_pipeline_hits: u64,
    pub render_pipeline_misses: u64,
    pub render_pipeline_evictions: u64,
    pub render_pipelines: u64,

    pub depth_stencil_hits: u64,
    pub depth_stencil_misses: u64,
    pub depth_stencil_evictions: u64,
    pub depth_stencil_states: u64,

    /// Entries purged because the program or vertex array they reference was destroyed.
    pub invalidations: u64,
    pub compile_failures: u64,
    /// Native objects waiting for in-flight submissions before destruction.
    pub retired: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StagingStats {
    pub index_conversions: u64,
    pub vertex_conversions: u64,
    /// Conversions skipped because the previous result was still valid.
    pub conversions_reused: u64,
    pub resident_uploads: u64,
    pub resident_upload_bytes: u64,
    pub ring_allocations: u64,
    pub ring_bytes: u64,
    pub ring_fallbacks: u64,
    pub staging_buffers: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub draws_submitted: u64,
    pub draws_failed: u64,
    /// Draws that produce no fragments (rasterizer discard, full culling, empty ranges).
    pub draws_skipped: u64,
    pub native_commands: u64,
}

/// Counters for one rendering context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub pipelines: PipelineCacheStats,
    pub staging: StagingStats,
    pub draws: DrawStats,
}

impl ContextStats {
    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        let p = &self.pipelines;
        let s = &self.staging;
        let d = &self.draws;
        format!(
            "{{\"pipelines\":{{\"render_hits\":{},\"render_misses\":{},\"render_evictions\":{},\"render_entries\":{},\"depth_stencil_hits\":{},\"depth_stencil_misses\":{},\"depth_stencil_evictions\":{},\"depth_stencil_entries\":{},\"invalidations\":{},\"compile_failures\":{},\"retired\":{}}},\"staging\":{{\"index_conversions\":{},\"vertex_conversions\":{},\"conversions_reused\":{},\"resident_uploads\":{},\"resident_upload_bytes\":{},\"ring_allocations\":{},\"ring_bytes\":{},\"ring_fallbacks\":{},\"staging_buffers\":{}}},\"draws\":{{\"submitted\":{},\"failed\":{},\"skipped\":{},\"native_commands\":{}}}}}",
            p.render_pipeline_hits,
            p.render_pipeline_misses,
            p.render_pipeline_evictions,
            p.render_pipelines,
            p.depth_stencil_hits,
            p.depth_stencil_misses,
            p.depth_stencil_evictions,
            p.depth_stencil_states,
            p.invalidations,
            p.compile_failures,
            p.retired,
            s.index_conversions,
            s.vertex_conversions,
            s.conversions_reused,
            s.resident_uploads,
            s.resident_upload_bytes,
            s.ring_allocations,
            s.ring_bytes,
            s.ring_fallbacks,
            s.staging_buffers,
            d.draws_submitted,
            d.draws_failed,
            d.draws_skipped,
            d.native_commands,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let mut stats = ContextStats::default();
        stats.pipelines.render_pipeline_hits = 3;
        stats.staging.ring_bytes = 256;
        stats.draws.draws_submitted = 1;

        let json = stats.to_json();
        assert!(json.contains("\"render_hits\":3"));
        assert!(json.contains("\"ring_bytes\":256"));
        assert!(json.contains("\"submitted\":1"));
        assert!(json.starts_with('{') && json.ends_with('}'));
        assert_eq!(json.matches('{').count(), json.matches('}').count());
    }
}
