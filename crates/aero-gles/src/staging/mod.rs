//! Per-context buffer staging.
//!
//! GL buffers live as CPU shadows in the share group. Before a draw, [`BufferStaging`] makes
//! every byte the draw reads available to the backend:
//!
//! - buffers the backend can read in place get a resident copy that is kept in sync with the
//!   shadow (partial updates are uploaded as ranges),
//! - small dynamic buffers that change between consecutive draws stream through the
//!   [`RingAllocator`] instead,
//! - index and vertex data that needs converting (fans, loops, `u8` indices, unaligned or
//!   non-native vertex formats) is written to dedicated staging buffers and reused until its
//!   source changes.
//!
//! Anything replaced while a submission may still read it is retired and freed once the
//! backend reports that submission complete.

pub mod index;
pub mod ring;
pub mod vertex;

use std::ops::Range;

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::backend::{
    BackendCaps, BufferBackend, BufferHandle, BufferUsageHint, RenderCommand, SubmissionId,
};
use crate::config::StagingConfig;
use crate::descriptor::IndexFormat;
use crate::error::{BackendError, StagingError};
use crate::gl::{IndexType, PrimitiveMode};
use crate::share_group::{BufferKey, BufferObject, ProgramKey, SharedObjects};
use crate::stats::StagingStats;
use crate::vertex_layout::{StreamPlan, StreamSource, VertexBufferLayout, VertexStreamPlan};

pub use index::ConversionMode;
pub use ring::{RingAllocation, RingAllocator};

use ring::{align_up, padded_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawKind {
    Arrays {
        first: u32,
        count: u32,
    },
    Elements {
        buffer: BufferKey,
        count: u32,
        index_type: IndexType,
        offset: u64,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct StagingRequest<'a> {
    pub mode: PrimitiveMode,
    pub kind: DrawKind,
    pub instance_count: u32,
    pub primitive_restart: bool,
    pub streams: &'a VertexStreamPlan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: BufferHandle,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBinding {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub format: IndexFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawRange {
    Vertices(Range<u32>),
    Indexed {
        indices: Range<u32>,
        base_vertex: i32,
    },
}

/// Everything the native draw needs once staging is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDraw {
    /// Indexed by native vertex-buffer slot.
    pub vertex_buffers: Vec<BufferBinding>,
    pub index_buffer: Option<IndexBinding>,
    pub range: DrawRange,
    pub instances: Range<u32>,
}

impl PreparedDraw {
    pub fn draw_command(&self) -> RenderCommand {
        match &self.range {
            DrawRange::Vertices(vertices) => RenderCommand::Draw {
                vertices: vertices.clone(),
                instances: self.instances.clone(),
            },
            DrawRange::Indexed {
                indices,
                base_vertex,
            } => RenderCommand::DrawIndexed {
                indices: indices.clone(),
                base_vertex: *base_vertex,
                instances: self.instances.clone(),
            },
        }
    }
}

/// A bound uniform-buffer range a program block reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBufferRange {
    pub binding: u32,
    pub buffer: BufferKey,
    pub offset: u64,
    /// `None` binds the rest of the buffer.
    pub size: Option<u64>,
    /// Size of the block the program declares.
    pub min_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub binding: u32,
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct StagingSlot {
    handle: BufferHandle,
    capacity: u64,
    last_used: SubmissionId,
}

#[derive(Debug)]
struct Residency {
    handle: BufferHandle,
    capacity: u64,
    /// Version of the GL buffer the resident copy holds.
    version: u64,
    /// Version observed by the previous draw that read the buffer.
    seen_version: u64,
    /// Consecutive draws that observed new contents.
    streak: u32,
    last_used: SubmissionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexConversionKey {
    mode: ConversionMode,
    version: u64,
    offset: u64,
    first: u32,
    count: u32,
    index_type: Option<IndexType>,
    restart: bool,
}

#[derive(Debug)]
struct IndexConversion {
    key: IndexConversionKey,
    slot: StagingSlot,
    format: IndexFormat,
    count: u32,
    bounds: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VertexStreamKey {
    buffer: BufferKey,
    base_offset: u64,
    source_stride: u32,
    divisor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VertexConversionKey {
    version: u64,
    first: u64,
    count: u64,
    repeat: u32,
    sources: Vec<StreamSource>,
    layout: VertexBufferLayout,
}

#[derive(Debug)]
struct VertexConversion {
    key: VertexConversionKey,
    slot: StagingSlot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexBoundsKey {
    buffer: BufferKey,
    version: u64,
    offset: u64,
    count: u32,
    index_type: IndexType,
    restart: bool,
}

#[derive(Debug)]
enum UniformBacking {
    Ring(RingAllocation),
    Dedicated {
        handle: BufferHandle,
        last_used: SubmissionId,
    },
}

/// The most recent default-block upload.
#[derive(Debug)]
struct DefaultUniforms {
    program: ProgramKey,
    version: u64,
    binding: UniformBinding,
    backing: UniformBacking,
}

/// Resolved index side of a draw.
struct IndexPlan {
    binding: IndexBinding,
    first: u32,
    count: u32,
}

pub struct BufferStaging {
    config: StagingConfig,
    caps: BackendCaps,
    ring: RingAllocator,
    resident: HashMap<BufferKey, Residency>,
    /// Keyed by source element buffer; `None` for conversions of non-indexed draws.
    index_conversions: HashMap<Option<BufferKey>, IndexConversion>,
    vertex_conversions: HashMap<VertexStreamKey, VertexConversion>,
    index_bounds: Option<(IndexBoundsKey, Option<(u32, u32)>)>,
    /// Buffers already resolved for the draw being prepared.
    draw_bindings: Vec<(BufferKey, BufferBinding)>,
    default_uniforms: Option<DefaultUniforms>,
    retired: Vec<(SubmissionId, BufferHandle)>,
    completed: SubmissionId,
    stats: StagingStats,
}

impl BufferStaging {
    pub fn new(config: &StagingConfig, caps: BackendCaps) -> Self {
        Self {
            config: *config,
            caps,
            ring: RingAllocator::new(config.ring_size_per_frame, config.frames_in_flight as u32),
            resident: HashMap::new(),
            index_conversions: HashMap::new(),
            vertex_conversions: HashMap::new(),
            index_bounds: None,
            draw_bindings: Vec::new(),
            default_uniforms: None,
            retired: Vec::new(),
            completed: SubmissionId::NONE,
            stats: StagingStats::default(),
        }
    }

    pub fn stats(&self) -> StagingStats {
        StagingStats {
            staging_buffers: (self.index_conversions.len() + self.vertex_conversions.len()) as u64,
            ..self.stats
        }
    }

    pub fn completed(&self) -> SubmissionId {
        self.completed
    }

    /// Number of GL buffers with a resident native copy.
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Buffers waiting for in-flight submissions before they are freed.
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Starts staging for one draw. Every buffer is resolved at most once per draw.
    pub fn begin_draw(&mut self) {
        self.draw_bindings.clear();
    }

    /// Stages vertex and index data for `request`. Returns `None` when the draw produces no
    /// primitives.
    pub fn prepare_draw<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        objects: &SharedObjects,
        request: &StagingRequest<'_>,
        submission: SubmissionId,
    ) -> Result<Option<PreparedDraw>, StagingError> {
        if request.instance_count == 0 {
            return Ok(None);
        }

        let index_type = match request.kind {
            DrawKind::Elements { index_type, .. } => Some(index_type),
            DrawKind::Arrays { .. } => None,
        };
        let mode = index::index_conversion(request.mode, index_type, &self.caps);
        let restart = request.primitive_restart && index_type.is_some();
        let needs_vertex_range = request
            .streams
            .streams
            .iter()
            .any(|s| s.repack && s.divisor == 0);

        let (index_plan, bounds) = match request.kind {
            DrawKind::Arrays { first, count } => {
                if count == 0 {
                    return Ok(None);
                }
                let bounds = Some((first, first.saturating_add(count - 1)));
                match mode {
                    ConversionMode::TriangleFan | ConversionMode::LineLoop => {
                        let key = IndexConversionKey {
                            mode,
                            version: 0,
                            offset: 0,
                            first,
                            count,
                            index_type: None,
                            restart: false,
                        };
                        let source: Vec<u32> = (first..first.saturating_add(count)).collect();
                        let Some(conversion) =
                            self.convert_indices(backend, None, key, || source, submission)?
                        else {
                            return Ok(None);
                        };
                        (Some(conversion.0), conversion.1)
                    }
                    _ => (None, bounds),
                }
            }
            DrawKind::Elements {
                buffer,
                count,
                index_type,
                offset,
            } => {
                if count == 0 {
                    return Ok(None);
                }
                let object = objects.buffer(buffer).ok_or(StagingError::MissingBuffer)?;
                let size = index_type.size();
                let len = u64::from(count) * size;
                if offset.checked_add(len).map_or(true, |end| end > object.len()) {
                    return Err(StagingError::IndexRangeOutOfBounds {
                        offset,
                        len,
                        buffer_len: object.len(),
                    });
                }
                let bytes = &object.data()[offset as usize..(offset + len) as usize];

                if mode != ConversionMode::None {
                    let key = IndexConversionKey {
                        mode,
                        version: object.version(),
                        offset,
                        first: 0,
                        count,
                        index_type: Some(index_type),
                        restart,
                    };
                    let source = || index::read_indices(bytes, index_type);
                    let Some(conversion) = self.convert_indices(
                        backend,
                        Some((buffer, bytes, restart)),
                        key,
                        source,
                        submission,
                    )?
                    else {
                        return Ok(None);
                    };
                    (Some(conversion.0), conversion.1)
                } else {
                    if offset % size != 0 {
                        return Err(StagingError::MisalignedIndexOffset { offset, size });
                    }
                    let base = self.bind_source(backend, objects, buffer, submission)?;
                    let bounds = if needs_vertex_range {
                        let bounds = self.scan_index_bounds(
                            buffer, object, offset, count, index_type, restart,
                        );
                        if bounds.is_none() {
                            return Ok(None);
                        }
                        bounds
                    } else {
                        None
                    };
                    let plan = IndexPlan {
                        binding: IndexBinding {
                            buffer: base.buffer,
                            offset: base.offset,
                            format: IndexFormat::native(index_type, &self.caps),
                        },
                        first: (offset / size) as u32,
                        count,
                    };
                    (Some(plan), bounds)
                }
            }
        };

        let rebase = match bounds {
            Some((lo, _)) if needs_vertex_range => lo,
            _ => 0,
        };

        let mut vertex_buffers = Vec::with_capacity(request.streams.streams.len());
        for stream in &request.streams.streams {
            let binding = if stream.divisor == 0 {
                self.stage_vertex_stream(
                    backend,
                    objects,
                    stream,
                    &request.kind,
                    bounds,
                    rebase,
                    submission,
                )?
            } else {
                self.stage_instance_stream(
                    backend,
                    objects,
                    stream,
                    request.instance_count,
                    submission,
                )?
            };
            vertex_buffers.push(binding);
        }

        let range = match (&index_plan, request.kind) {
            (Some(plan), _) => DrawRange::Indexed {
                indices: plan.first..plan.first + plan.count,
                base_vertex: -(rebase as i32),
            },
            (None, DrawKind::Arrays { first, count }) => {
                let start = first - rebase;
                DrawRange::Vertices(start..start + count)
            }
            (None, DrawKind::Elements { .. }) => return Ok(None),
        };

        trace!(
            streams = vertex_buffers.len(),
            indexed = index_plan.is_some(),
            rebase,
            "staged draw"
        );
        Ok(Some(PreparedDraw {
            vertex_buffers,
            index_buffer: index_plan.map(|plan| plan.binding),
            range,
            instances: 0..request.instance_count,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    fn stage_vertex_stream<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        objects: &SharedObjects,
        stream: &StreamPlan,
        kind: &DrawKind,
        bounds: Option<(u32, u32)>,
        rebase: u32,
        submission: SubmissionId,
    ) -> Result<BufferBinding, StagingError> {
        let stride = u64::from(stream.source_stride);
        if stream.repack {
            let (lo, hi) = bounds.ok_or(StagingError::MissingBuffer)?;
            let count = u64::from(hi - lo) + 1;
            return self.repack(backend, objects, stream, u64::from(lo), count, 1, submission);
        }

        if let DrawKind::Arrays { first, count } = *kind {
            let object = objects.buffer(stream.buffer).ok_or(StagingError::MissingBuffer)?;
            check_stream_range(stream, object, u64::from(first), u64::from(count))?;
        }
        let base = self.bind_source(backend, objects, stream.buffer, submission)?;
        Ok(BufferBinding {
            buffer: base.buffer,
            offset: base.offset + stream.base_offset + u64::from(rebase) * stride,
        })
    }

    fn stage_instance_stream<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        objects: &SharedObjects,
        stream: &StreamPlan,
        instance_count: u32,
        submission: SubmissionId,
    ) -> Result<BufferBinding, StagingError> {
        let elements = u64::from(instance_count.div_ceil(stream.divisor));
        if stream.repack {
            let unroll = stream.divisor > 1 && !self.caps.supports_instance_divisor;
            return if unroll {
                self.repack(
                    backend,
                    objects,
                    stream,
                    0,
                    u64::from(instance_count),
                    stream.divisor,
                    submission,
                )
            } else {
                self.repack(backend, objects, stream, 0, elements, 1, submission)
            };
        }

        let object = objects.buffer(stream.buffer).ok_or(StagingError::MissingBuffer)?;
        check_stream_range(stream, object, 0, elements)?;
        let base = self.bind_source(backend, objects, stream.buffer, submission)?;
        Ok(BufferBinding {
            buffer: base.buffer,
            offset: base.offset + stream.base_offset,
        })
    }

    /// Binds the range of each uniform block the program reads.
    pub fn prepare_uniform_buffers<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        objects: &SharedObjects,
        ranges: &[UniformBufferRange],
        submission: SubmissionId,
    ) -> Result<Vec<UniformBinding>, StagingError> {
        let mut bindings = Vec::with_capacity(ranges.len());
        for range in ranges {
            let object = objects.buffer(range.buffer).ok_or(StagingError::MissingBuffer)?;
            let size = range
                .size
                .unwrap_or_else(|| object.len().saturating_sub(range.offset));
            let in_bounds = range
                .offset
                .checked_add(size)
                .is_some_and(|end| end <= object.len());
            if !in_bounds || size < range.min_size {
                return Err(StagingError::UniformRangeOutOfBounds {
                    offset: range.offset,
                    len: size.max(range.min_size),
                    buffer_len: object.len(),
                });
            }
            let base = self.bind_source(backend, objects, range.buffer, submission)?;
            bindings.push(UniformBinding {
                binding: range.binding,
                buffer: base.buffer,
                offset: base.offset + range.offset,
                size,
            });
        }
        Ok(bindings)
    }

    /// Places the default uniform block of `program` at `binding`. The previous upload is kept
    /// while `(program, version)` is unchanged and its memory is still intact; otherwise `data`
    /// goes through the ring, or a dedicated buffer when the ring is full.
    pub fn stage_default_uniforms<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        program: ProgramKey,
        version: u64,
        data: &[u8],
        binding: u32,
        submission: SubmissionId,
    ) -> Result<UniformBinding, StagingError> {
        if let Some(current) = self.default_uniforms.as_mut() {
            if current.program == program
                && current.version == version
                && current.binding.binding == binding
            {
                let intact = match &mut current.backing {
                    UniformBacking::Ring(allocation) => self.ring.retain(allocation, submission),
                    UniformBacking::Dedicated { last_used, .. } => {
                        *last_used = (*last_used).max(submission);
                        true
                    }
                };
                if intact {
                    return Ok(current.binding);
                }
            }
        }
        if let Some(previous) = self.default_uniforms.take() {
            if let UniformBacking::Dedicated { handle, last_used } = previous.backing {
                self.retire(last_used, handle);
            }
        }

        let size = align_up((data.len() as u64).max(1), 4);
        let alignment = self.ring_alignment();
        let (uniform_binding, backing) = match self
            .ring
            .upload(backend, data, alignment, submission, self.completed)
        {
            Ok(allocation) => {
                self.stats.ring_allocations += 1;
                self.stats.ring_bytes += allocation.size;
                let uniform_binding = UniformBinding {
                    binding,
                    buffer: allocation.buffer,
                    offset: allocation.offset,
                    size,
                };
                (uniform_binding, UniformBacking::Ring(allocation))
            }
            Err(StagingError::RingOutOfSpace { requested, remaining }) => {
                debug!(requested, remaining, "ring exhausted, staging uniforms separately");
                self.stats.ring_fallbacks += 1;
                let handle =
                    allocate(backend, size, BufferUsageHint::UNIFORM | BufferUsageHint::COPY_DST)?;
                if let Err(err) = backend.write_buffer(handle, 0, &padded_bytes(data)) {
                    backend.free_buffer(handle);
                    return Err(err.into());
                }
                let uniform_binding = UniformBinding {
                    binding,
                    buffer: handle,
                    offset: 0,
                    size,
                };
                let backing = UniformBacking::Dedicated {
                    handle,
                    last_used: submission,
                };
                (uniform_binding, backing)
            }
            Err(err) => return Err(err),
        };
        trace!(?program, version, size, "staged default uniforms");
        self.default_uniforms = Some(DefaultUniforms {
            program,
            version,
            binding: uniform_binding,
            backing,
        });
        Ok(uniform_binding)
    }

    /// Drops the retained default uniform upload of `program`, if any.
    pub fn forget_program(&mut self, program: ProgramKey) {
        if self
            .default_uniforms
            .as_ref()
            .is_some_and(|current| current.program == program)
        {
            if let Some(DefaultUniforms {
                backing: UniformBacking::Dedicated { handle, last_used },
                ..
            }) = self.default_uniforms.take()
            {
                self.retire(last_used, handle);
            }
        }
    }

    /// Frees everything retired by submissions up to `completed`.
    pub fn on_submissions_completed<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        completed: SubmissionId,
    ) {
        self.completed = self.completed.max(completed);
        let completed = self.completed;
        self.retired.retain(|&(after, handle)| {
            if after <= completed {
                backend.free_buffer(handle);
                false
            } else {
                true
            }
        });
    }

    /// Drops every native copy derived from a destroyed GL buffer.
    pub fn forget_buffer(&mut self, key: BufferKey) {
        if let Some(residency) = self.resident.remove(&key) {
            self.retire(residency.last_used, residency.handle);
        }
        if let Some(conversion) = self.index_conversions.remove(&Some(key)) {
            self.retire(conversion.slot.last_used, conversion.slot.handle);
        }
        let stale: Vec<VertexStreamKey> = self
            .vertex_conversions
            .keys()
            .filter(|k| k.buffer == key)
            .copied()
            .collect();
        for stream in stale {
            if let Some(conversion) = self.vertex_conversions.remove(&stream) {
                self.retire(conversion.slot.last_used, conversion.slot.handle);
            }
        }
        if self
            .index_bounds
            .as_ref()
            .is_some_and(|(bounds_key, _)| bounds_key.buffer == key)
        {
            self.index_bounds = None;
        }
    }

    /// Frees every native buffer immediately. Only valid once the backend is idle.
    pub fn destroy_all<B: BufferBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, residency) in self.resident.drain() {
            backend.free_buffer(residency.handle);
        }
        for (_, conversion) in self.index_conversions.drain() {
            backend.free_buffer(conversion.slot.handle);
        }
        for (_, conversion) in self.vertex_conversions.drain() {
            backend.free_buffer(conversion.slot.handle);
        }
        for (_, handle) in self.retired.drain(..) {
            backend.free_buffer(handle);
        }
        if let Some(DefaultUniforms {
            backing: UniformBacking::Dedicated { handle, .. },
            ..
        }) = self.default_uniforms.take()
        {
            backend.free_buffer(handle);
        }
        self.ring.destroy(backend);
        self.index_bounds = None;
    }

    fn ring_alignment(&self) -> u64 {
        u64::from(
            self.caps
                .uniform_offset_alignment
                .max(self.caps.vertex_buffer_alignment)
                .max(4),
        )
    }

    fn retire(&mut self, after: SubmissionId, handle: BufferHandle) {
        self.retired.push((after, handle));
    }

    /// Native location of GL buffer `key` for this draw: the ring for streaming dynamic
    /// buffers, otherwise the resident copy.
    fn bind_source<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        objects: &SharedObjects,
        key: BufferKey,
        submission: SubmissionId,
    ) -> Result<BufferBinding, StagingError> {
        if let Some((_, binding)) = self.draw_bindings.iter().find(|(k, _)| *k == key) {
            return Ok(*binding);
        }
        let object = objects.buffer(key).ok_or(StagingError::MissingBuffer)?;
        let version = object.version();

        let streak = match self.resident.get_mut(&key) {
            Some(residency) => {
                if residency.seen_version != version {
                    residency.streak += 1;
                    residency.seen_version = version;
                } else {
                    residency.streak = 0;
                }
                residency.streak
            }
            None => 0,
        };

        let streaming = object.usage().is_dynamic()
            && !object.is_empty()
            && object.len() <= self.config.dynamic_buffer_threshold
            && streak >= self.config.dynamic_update_streak;

        let mut binding = None;
        if streaming {
            let alignment = self.ring_alignment();
            match self
                .ring
                .upload(backend, object.data(), alignment, submission, self.completed)
            {
                Ok(allocation) => {
                    self.stats.ring_allocations += 1;
                    self.stats.ring_bytes += allocation.size;
                    binding = Some(BufferBinding {
                        buffer: allocation.buffer,
                        offset: allocation.offset,
                    });
                }
                Err(StagingError::RingOutOfSpace { requested, remaining }) => {
                    debug!(?key, requested, remaining, "ring exhausted, using resident copy");
                    self.stats.ring_fallbacks += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let binding = match binding {
            Some(binding) => binding,
            None => self.sync_resident(backend, key, object, submission)?,
        };
        self.draw_bindings.push((key, binding));
        Ok(binding)
    }

    fn sync_resident<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        key: BufferKey,
        object: &BufferObject,
        submission: SubmissionId,
    ) -> Result<BufferBinding, StagingError> {
        let version = object.version();
        let capacity = align_up(object.len().max(1), 4);

        match self.resident.get_mut(&key) {
            Some(residency) if residency.capacity >= capacity => {
                if residency.version != version {
                    let range = match object.last_update() {
                        Some(range) if version == residency.version + 1 => range,
                        _ => 0..object.len(),
                    };
                    let bytes = upload_range(backend, residency.handle, object.data(), range)?;
                    residency.version = version;
                    self.stats.resident_uploads += 1;
                    self.stats.resident_upload_bytes += bytes;
                }
                residency.last_used = residency.last_used.max(submission);
                return Ok(BufferBinding {
                    buffer: residency.handle,
                    offset: 0,
                });
            }
            _ => {}
        }

        let previous = self.resident.remove(&key);
        let (seen_version, streak) = previous
            .as_ref()
            .map_or((version, 0), |r| (r.seen_version, r.streak));
        if let Some(previous) = previous {
            self.retire(previous.last_used, previous.handle);
        }

        let handle = allocate(backend, capacity, BufferUsageHint::ANY_DRAW)?;
        let bytes = match upload_range(backend, handle, object.data(), 0..object.len()) {
            Ok(bytes) => bytes,
            Err(err) => {
                backend.free_buffer(handle);
                return Err(err);
            }
        };
        self.stats.resident_uploads += 1;
        self.stats.resident_upload_bytes += bytes;
        trace!(?key, capacity, "allocated resident buffer");

        self.resident.insert(
            key,
            Residency {
                handle,
                capacity,
                version,
                seen_version,
                streak,
                last_used: submission,
            },
        );
        Ok(BufferBinding {
            buffer: handle,
            offset: 0,
        })
    }

    /// Converts indices into a staging buffer, or reuses the previous conversion of the same
    /// source when nothing it depends on changed. `None` means no primitives remain.
    fn convert_indices<B, F>(
        &mut self,
        backend: &mut B,
        source: Option<(BufferKey, &[u8], bool)>,
        key: IndexConversionKey,
        read: F,
        submission: SubmissionId,
    ) -> Result<Option<(IndexPlan, Option<(u32, u32)>)>, StagingError>
    where
        B: BufferBackend + ?Sized,
        F: FnOnce() -> Vec<u32>,
    {
        let cache_key = source.map(|(buffer, _, _)| buffer);
        if let Some(existing) = self.index_conversions.get_mut(&cache_key) {
            if existing.key == key {
                existing.slot.last_used = existing.slot.last_used.max(submission);
                self.stats.conversions_reused += 1;
                return Ok(existing_plan(existing));
            }
        }

        let (format, bytes, count, bounds) = match key.mode {
            ConversionMode::WidenIndices => {
                let (raw, restart) = source.map_or((&[][..], false), |(_, raw, r)| (raw, r));
                let wide = index::widen_u8_indices(raw, restart);
                let as_u32: Vec<u32> = wide.iter().map(|&i| u32::from(i)).collect();
                let bounds = index::index_bounds(&as_u32, restart.then_some(0xFFFF));
                let mut bytes = bytemuck::cast_slice::<u16, u8>(&wide).to_vec();
                bytes.resize(bytes.len().next_multiple_of(4), 0);
                (IndexFormat::U16, bytes, wide.len() as u32, bounds)
            }
            ConversionMode::TriangleFan | ConversionMode::LineLoop => {
                let indices = read();
                let restart = match (key.restart, key.index_type) {
                    (true, Some(ty)) => Some(ty.restart_index()),
                    _ => None,
                };
                let expanded = if key.mode == ConversionMode::TriangleFan {
                    index::expand_triangle_fan(&indices, restart)
                } else {
                    index::expand_line_loop(&indices, restart)
                };
                let bounds = index::index_bounds(&expanded, None);
                let (format, bytes) = index::pack_indices(&expanded);
                (format, bytes, expanded.len() as u32, bounds)
            }
            ConversionMode::None | ConversionMode::StrideRepack => return Ok(None),
        };

        if count == 0 || bounds.is_none() {
            return Ok(None);
        }

        let previous = self.index_conversions.remove(&cache_key).map(|c| c.slot);
        let slot = self.write_staging(
            backend,
            previous,
            &bytes,
            BufferUsageHint::INDEX | BufferUsageHint::COPY_DST,
            submission,
        )?;
        self.stats.index_conversions += 1;
        debug!(mode = ?key.mode, count, ?format, "converted indices");

        let conversion = IndexConversion {
            key,
            slot,
            format,
            count,
            bounds,
        };
        let plan = existing_plan(&conversion);
        self.index_conversions.insert(cache_key, conversion);
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn repack<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        objects: &SharedObjects,
        stream: &StreamPlan,
        first: u64,
        count: u64,
        repeat: u32,
        submission: SubmissionId,
    ) -> Result<BufferBinding, StagingError> {
        let object = objects.buffer(stream.buffer).ok_or(StagingError::MissingBuffer)?;
        let stream_key = VertexStreamKey {
            buffer: stream.buffer,
            base_offset: stream.base_offset,
            source_stride: stream.source_stride,
            divisor: stream.divisor,
        };
        let key = VertexConversionKey {
            version: object.version(),
            first,
            count,
            repeat,
            sources: stream.sources.clone(),
            layout: stream.layout.clone(),
        };

        if let Some(existing) = self.vertex_conversions.get_mut(&stream_key) {
            if existing.key == key {
                existing.slot.last_used = existing.slot.last_used.max(submission);
                self.stats.conversions_reused += 1;
                return Ok(BufferBinding {
                    buffer: existing.slot.handle,
                    offset: 0,
                });
            }
        }

        let bytes = vertex::repack_stream(object.data(), stream, first, count, repeat)?;
        let previous = self.vertex_conversions.remove(&stream_key).map(|c| c.slot);
        let slot = self.write_staging(
            backend,
            previous,
            &bytes,
            BufferUsageHint::VERTEX | BufferUsageHint::COPY_DST,
            submission,
        )?;
        self.stats.vertex_conversions += 1;
        debug!(buffer = ?stream.buffer, first, count, "repacked vertex stream");

        self.vertex_conversions
            .insert(stream_key, VertexConversion { key, slot });
        Ok(BufferBinding {
            buffer: slot.handle,
            offset: 0,
        })
    }

    /// Writes `bytes` into `previous` when it is large enough and idle, otherwise into a fresh
    /// buffer (retiring `previous`).
    fn write_staging<B: BufferBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        previous: Option<StagingSlot>,
        bytes: &[u8],
        usage: BufferUsageHint,
        submission: SubmissionId,
    ) -> Result<StagingSlot, StagingError> {
        let padded = padded_bytes(bytes);
        let size = padded.len() as u64;

        if let Some(mut slot) = previous {
            if slot.capacity >= size && slot.last_used <= self.completed {
                if let Err(err) = backend.write_buffer(slot.handle, 0, &padded) {
                    self.retire(slot.last_used, slot.handle);
                    return Err(err.into());
                }
                slot.last_used = submission;
                return Ok(slot);
            }
            self.retire(slot.last_used, slot.handle);
        }

        let handle = allocate(backend, size, usage)?;
        if let Err(err) = backend.write_buffer(handle, 0, &padded) {
            backend.free_buffer(handle);
            return Err(err.into());
        }
        Ok(StagingSlot {
            handle,
            capacity: size,
            last_used: submission,
        })
    }

    fn scan_index_bounds(
        &mut self,
        buffer: BufferKey,
        object: &BufferObject,
        offset: u64,
        count: u32,
        index_type: IndexType,
        restart: bool,
    ) -> Option<(u32, u32)> {
        let key = IndexBoundsKey {
            buffer,
            version: object.version(),
            offset,
            count,
            index_type,
            restart,
        };
        if let Some((cached, bounds)) = &self.index_bounds {
            if *cached == key {
                return *bounds;
            }
        }
        let len = u64::from(count) * index_type.size();
        let bytes = &object.data()[offset as usize..(offset + len) as usize];
        let indices = index::read_indices(bytes, index_type);
        let bounds = index::index_bounds(&indices, restart.then(|| index_type.restart_index()));
        self.index_bounds = Some((key, bounds));
        bounds
    }
}

fn existing_plan(conversion: &IndexConversion) -> Option<(IndexPlan, Option<(u32, u32)>)> {
    Some((
        IndexPlan {
            binding: IndexBinding {
                buffer: conversion.slot.handle,
                offset: 0,
                format: conversion.format,
            },
            first: 0,
            count: conversion.count,
        },
        conversion.bounds,
    ))
}

fn check_stream_range(
    stream: &StreamPlan,
    object: &BufferObject,
    first: u64,
    count: u64,
) -> Result<(), StagingError> {
    if count == 0 {
        return Ok(());
    }
    let stride = u64::from(stream.source_stride);
    let start = stream.base_offset + first * stride;
    let end = stream.base_offset + (first + count - 1) * stride + u64::from(stream.element_span());
    if end > object.len() {
        return Err(StagingError::VertexRangeOutOfBounds {
            offset: start,
            len: end - start,
            buffer_len: object.len(),
        });
    }
    Ok(())
}

fn allocate<B: BufferBackend + ?Sized>(
    backend: &mut B,
    size: u64,
    usage: BufferUsageHint,
) -> Result<BufferHandle, StagingError> {
    backend.allocate_buffer(size, usage).map_err(|err| match err {
        BackendError::OutOfMemory { requested } => StagingError::OutOfMemory { requested },
        other => StagingError::Backend(other),
    })
}

/// Uploads `range` of `data`, widened to four-byte boundaries. Returns the bytes written.
fn upload_range<B: BufferBackend + ?Sized>(
    backend: &mut B,
    handle: BufferHandle,
    data: &[u8],
    range: Range<u64>,
) -> Result<u64, StagingError> {
    let start = range.start & !3;
    let end = align_up(range.end.max(start + 1), 4);
    let available = (data.len() as u64).min(end);
    let mut bytes = data[start as usize..available.max(start) as usize].to_vec();
    bytes.resize((end - start) as usize, 0);
    backend.write_buffer(handle, start, &bytes)?;
    Ok(end - start)
}
