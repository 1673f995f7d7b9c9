//! Content-addressed cache of native pipeline and depth/stencil objects.
//!
//! Keys are descriptors with their XXH3 fingerprint precomputed ([`CacheKey`]); lookups compare
//! the fingerprint first and the full descriptor only on a fingerprint match. Both caches are
//! bounded and evict in least-recently-used order, skipping entries that a submission still in
//! flight may reference. Native objects that leave the cache while in flight are retired and
//! destroyed once the backend reports their last submission complete.

use std::hash::{Hash, Hasher};

use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::backend::{NativeDepthStencilHandle, NativePipelineHandle, PipelineBackend, SubmissionId};
use crate::config::PipelineCacheConfig;
use crate::descriptor::{fingerprint, DepthStencilDescriptor, RenderPipelineDescriptor};
use crate::error::BackendError;
use crate::shader::LinkedProgram;
use crate::share_group::{ObjectId, ProgramKey};
use crate::stats::PipelineCacheStats;

/// A descriptor together with its fingerprint.
#[derive(Debug, Clone)]
pub struct CacheKey<K> {
    hash: u64,
    key: K,
}

impl<K: Hash> CacheKey<K> {
    pub fn new(key: K) -> Self {
        Self {
            hash: fingerprint(&key),
            key,
        }
    }
}

impl<K> CacheKey<K> {
    pub fn fingerprint(&self) -> u64 {
        self.hash
    }

    pub fn get(&self) -> &K {
        &self.key
    }
}

impl<K: PartialEq> PartialEq for CacheKey<K> {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key == other.key
    }
}

impl<K: Eq> Eq for CacheKey<K> {}

impl<K> Hash for CacheKey<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry<V> {
    value: V,
    /// Latest submission that used the value.
    last_used: SubmissionId,
}

enum Insert<V> {
    Cached { evicted: Option<V> },
    /// Every entry is pinned by in-flight work; the value was not cached.
    Uncached,
}

/// Bounded LRU map that never evicts an entry used by an unfinished submission.
struct ObjectCache<K: Hash + Eq, V> {
    entries: LruCache<CacheKey<K>, Entry<V>>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V: Copy> ObjectCache<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity: capacity.max(1),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, key: &CacheKey<K>) -> bool {
        self.entries.contains(key)
    }

    /// Looks up `key`, promoting it to most recently used and stamping it with `serial`.
    fn get(&mut self, key: &CacheKey<K>, serial: SubmissionId) -> Option<V> {
        let entry = self.entries.get_mut(key)?;
        entry.last_used = entry.last_used.max(serial);
        Some(entry.value)
    }

    fn insert(
        &mut self,
        key: CacheKey<K>,
        value: V,
        serial: SubmissionId,
        completed: SubmissionId,
    ) -> Insert<V> {
        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            // Oldest first.
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(_, entry)| entry.last_used <= completed)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                return Insert::Uncached;
            };
            evicted = self.entries.pop(&victim).map(|entry| entry.value);
        }
        self.entries.put(
            key,
            Entry {
                value,
                last_used: serial,
            },
        );
        Insert::Cached { evicted }
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&K) -> bool) -> Vec<Entry<V>> {
        let doomed: Vec<CacheKey<K>> = self
            .entries
            .iter()
            .filter(|(key, _)| pred(&key.key))
            .map(|(key, _)| key.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|key| self.entries.pop(key))
            .collect()
    }

    fn drain(&mut self) -> Vec<Entry<V>> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some((_, entry)) = self.entries.pop_lru() {
            out.push(entry);
        }
        out
    }
}

/// Object whose cache entries must be purged when it is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInvalidation {
    Program(ProgramKey),
    VertexArray(ObjectId),
}

impl CacheInvalidation {
    fn matches(&self, desc: &RenderPipelineDescriptor) -> bool {
        match *self {
            Self::Program(program) => desc.program == program,
            Self::VertexArray(vao) => desc.vertex_array == Some(vao),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Pipeline(NativePipelineHandle),
    DepthStencil(NativeDepthStencilHandle),
}

pub struct PipelineCache {
    render: ObjectCache<RenderPipelineDescriptor, NativePipelineHandle>,
    depth_stencil: ObjectCache<DepthStencilDescriptor, NativeDepthStencilHandle>,
    /// Native objects out of the cache, waiting for their last submission.
    retired: Vec<(SubmissionId, Retired)>,
    completed: SubmissionId,
    stats: PipelineCacheStats,
}

impl PipelineCache {
    pub fn new(config: &PipelineCacheConfig) -> Self {
        Self {
            render: ObjectCache::new(config.render_pipeline_capacity),
            depth_stencil: ObjectCache::new(config.depth_stencil_capacity),
            retired: Vec::new(),
            completed: SubmissionId::NONE,
            stats: PipelineCacheStats::default(),
        }
    }

    /// Returns the native pipeline for `key` and whether it came from the cache. On a miss the
    /// backend compiles it; a failed compile leaves the cache untouched.
    pub fn get_or_create_render_pipeline<B: PipelineBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: &CacheKey<RenderPipelineDescriptor>,
        program: &LinkedProgram,
        serial: SubmissionId,
    ) -> Result<(NativePipelineHandle, bool), BackendError> {
        if let Some(handle) = self.render.get(key, serial) {
            self.stats.render_pipeline_hits += 1;
            trace!(fingerprint = key.fingerprint(), "render pipeline cache hit");
            return Ok((handle, true));
        }

        self.stats.render_pipeline_misses += 1;
        let handle = backend
            .compile_pipeline(key.get(), program)
            .map_err(|err| {
                self.stats.compile_failures += 1;
                warn!(fingerprint = key.fingerprint(), %err, "render pipeline compilation failed");
                err
            })?;
        debug!(
            fingerprint = key.fingerprint(),
            entries = self.render.len() + 1,
            "compiled render pipeline"
        );

        match self.render.insert(key.clone(), handle, serial, self.completed) {
            Insert::Cached { evicted: Some(old) } => {
                self.stats.render_pipeline_evictions += 1;
                debug!(?old, "evicted render pipeline");
                backend.destroy_pipeline(old);
            }
            Insert::Cached { evicted: None } => {}
            Insert::Uncached => {
                debug!("render pipeline cache pinned by in-flight work; not caching");
                self.retired.push((serial, Retired::Pipeline(handle)));
            }
        }
        Ok((handle, false))
    }

    pub fn get_or_create_depth_stencil<B: PipelineBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: &CacheKey<DepthStencilDescriptor>,
        serial: SubmissionId,
    ) -> Result<(NativeDepthStencilHandle, bool), BackendError> {
        if let Some(handle) = self.depth_stencil.get(key, serial) {
            self.stats.depth_stencil_hits += 1;
            return Ok((handle, true));
        }

        self.stats.depth_stencil_misses += 1;
        let handle = backend.compile_depth_stencil(key.get()).map_err(|err| {
            self.stats.compile_failures += 1;
            warn!(%err, "depth/stencil object creation failed");
            err
        })?;

        match self
            .depth_stencil
            .insert(key.clone(), handle, serial, self.completed)
        {
            Insert::Cached { evicted: Some(old) } => {
                self.stats.depth_stencil_evictions += 1;
                backend.destroy_depth_stencil(old);
            }
            Insert::Cached { evicted: None } => {}
            Insert::Uncached => self.retired.push((serial, Retired::DepthStencil(handle))),
        }
        Ok((handle, false))
    }

    /// Re-stamps a cached pipeline with `serial` without a full lookup miss path. Returns
    /// `false` if the entry is gone.
    pub fn touch_render_pipeline(
        &mut self,
        key: &CacheKey<RenderPipelineDescriptor>,
        serial: SubmissionId,
    ) -> bool {
        self.render.get(key, serial).is_some()
    }

    pub fn touch_depth_stencil(
        &mut self,
        key: &CacheKey<DepthStencilDescriptor>,
        serial: SubmissionId,
    ) -> bool {
        self.depth_stencil.get(key, serial).is_some()
    }

    pub fn contains_render_pipeline(&self, key: &CacheKey<RenderPipelineDescriptor>) -> bool {
        self.render.contains(key)
    }

    pub fn render_pipeline_count(&self) -> usize {
        self.render.len()
    }

    pub fn depth_stencil_count(&self) -> usize {
        self.depth_stencil.len()
    }

    /// Purges every render pipeline whose descriptor references `target`. Returns the number
    /// of entries removed.
    pub fn invalidate_associated_with<B: PipelineBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        target: CacheInvalidation,
    ) -> usize {
        let removed = self.render.remove_where(|desc| target.matches(desc));
        let count = removed.len();
        for entry in removed {
            self.release(backend, entry.last_used, Retired::Pipeline(entry.value));
        }
        self.stats.invalidations += count as u64;
        if count > 0 {
            debug!(?target, removed = count, "purged render pipelines");
        }
        count
    }

    /// Destroys retired objects whose last submission has completed.
    pub fn on_submissions_completed<B: PipelineBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        completed: SubmissionId,
    ) {
        self.completed = self.completed.max(completed);
        let completed = self.completed;
        let mut ready = Vec::new();
        self.retired.retain(|&(serial, object)| {
            if serial <= completed {
                ready.push(object);
                false
            } else {
                true
            }
        });
        for object in ready {
            destroy(backend, object);
        }
    }

    /// Drops every cached object.
    pub fn clear<B: PipelineBackend + ?Sized>(&mut self, backend: &mut B) {
        for entry in self.render.drain() {
            self.release(backend, entry.last_used, Retired::Pipeline(entry.value));
        }
        for entry in self.depth_stencil.drain() {
            self.release(backend, entry.last_used, Retired::DepthStencil(entry.value));
        }
    }

    /// Destroys every object immediately, retired ones included. Only valid once the backend
    /// is idle.
    pub fn destroy_all<B: PipelineBackend + ?Sized>(&mut self, backend: &mut B) {
        self.clear(backend);
        for (_, object) in self.retired.drain(..) {
            destroy(backend, object);
        }
    }

    pub fn stats(&self) -> PipelineCacheStats {
        PipelineCacheStats {
            render_pipelines: self.render.len() as u64,
            depth_stencil_states: self.depth_stencil.len() as u64,
            retired: self.retired.len() as u64,
            ..self.stats
        }
    }

    fn release<B: PipelineBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        last_used: SubmissionId,
        object: Retired,
    ) {
        if last_used > self.completed {
            self.retired.push((last_used, object));
        } else {
            destroy(backend, object);
        }
    }
}

fn destroy<B: PipelineBackend + ?Sized>(backend: &mut B, object: Retired) {
    match object {
        Retired::Pipeline(handle) => backend.destroy_pipeline(handle),
        Retired::DepthStencil(handle) => backend.destroy_depth_stencil(handle),
    }
}
