//! Rendering context: the surface the GL entry points drive.
//!
//! A [`Context`] owns one [`StateStore`], one [`PipelineCache`] and one [`BufferStaging`] and
//! drives a [`Backend`]. GL calls mutate the store; [`Context::draw`] turns the store into
//! native commands. Commands are diffed against the state the backend already has bound, so a
//! draw with no intervening state change re-sends nothing but the draw itself.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::backend::{
    Backend, BackendCaps, NativeDepthStencilHandle, NativePipelineHandle, RenderCommand,
    SubmissionId,
};
use crate::config::ContextConfig;
use crate::descriptor::{
    culls_everything, DepthStencilDescriptor, DescriptorBuilder, DrawShape,
    RenderPipelineDescriptor,
};
use crate::error::{BackendError, ContextError, DrawError, ErrorState, GlError};
use crate::gl::{
    BufferTarget, FramebufferTarget, IndexType, IndexedBufferTarget, PrimitiveMode, TextureTarget,
};
use crate::pipeline_cache::{CacheInvalidation, CacheKey, PipelineCache};
use crate::shader::{LinkedProgram, ProgramReflection};
use crate::share_group::{
    BufferObject, BufferRef, ContextTag, DestroyedObject, ObjectId, ProgramKey, ProgramObject,
    ShareGroup, TextureKey, TextureRef,
};
use crate::staging::{
    BufferBinding, BufferStaging, DrawKind, IndexBinding, PreparedDraw, StagingRequest,
    UniformBinding, UniformBufferRange,
};
use crate::state::{
    DirtyFlags, FramebufferFormats, ScissorRect, StateChange, StateLimits, StateStore,
    TextureUnit, Viewport,
};
use crate::stats::{ContextStats, DrawStats};
use crate::vertex_layout::VertexStreamPlan;

/// Binding point for [`Context::bind_object`]. Payloads are the application's raw `GLenum`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindTarget {
    Buffer(u32),
    Texture(u32),
    VertexArray,
    Framebuffer(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Buffer,
    Program,
    Texture,
    VertexArray,
    Framebuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawSource {
    /// `glDrawArrays`.
    Arrays { first: i32, count: i32 },
    /// `glDrawElements`; `offset` is a byte offset into the bound element array buffer.
    Elements {
        count: i32,
        index_type: u32,
        offset: u64,
    },
}

/// One draw call as issued by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub mode: u32,
    pub source: DrawSource,
    pub instance_count: i32,
}

impl DrawCall {
    pub fn arrays(mode: u32, first: i32, count: i32) -> Self {
        Self {
            mode,
            source: DrawSource::Arrays { first, count },
            instance_count: 1,
        }
    }

    pub fn elements(mode: u32, count: i32, index_type: u32, offset: u64) -> Self {
        Self {
            mode,
            source: DrawSource::Elements {
                count,
                index_type,
                offset,
            },
            instance_count: 1,
        }
    }

    pub fn instanced(self, instance_count: i32) -> Self {
        Self {
            instance_count,
            ..self
        }
    }
}

/// Native state as of the last successful submission.
#[derive(Debug, Clone, Default)]
struct BoundState {
    pipeline: Option<NativePipelineHandle>,
    depth_stencil: Option<NativeDepthStencilHandle>,
    viewport: Option<Viewport>,
    scissor: Option<Option<ScissorRect>>,
    blend_constant: Option<[f32; 4]>,
    stencil_reference: Option<u32>,
    vertex_buffers: Vec<Option<BufferBinding>>,
    index_buffer: Option<IndexBinding>,
    uniform_buffers: HashMap<u32, UniformBinding>,
    textures: HashMap<u32, Option<TextureKey>>,
}

/// The render pipeline the previous draw resolved, with the stream plan it was built from.
struct PipelineSelection {
    shape: DrawShape,
    key: CacheKey<RenderPipelineDescriptor>,
    streams: VertexStreamPlan,
    handle: NativePipelineHandle,
}

/// Everything about a validated draw that staging and command emission need.
struct DrawPlan<'a> {
    mode: PrimitiveMode,
    kind: DrawKind,
    instance_count: u32,
    program: ProgramKey,
    reflection: &'a ProgramReflection,
    depth_stencil: NativeDepthStencilHandle,
    serial: SubmissionId,
}

enum DrawOutcome {
    Submitted,
    Skipped,
}

pub struct Context {
    group: Arc<ShareGroup>,
    tag: Arc<ContextTag>,
    backend: Box<dyn Backend>,
    caps: BackendCaps,
    state: StateStore,
    errors: ErrorState,
    cache: PipelineCache,
    staging: BufferStaging,
    pipeline: Option<PipelineSelection>,
    depth_stencil: Option<(CacheKey<DepthStencilDescriptor>, NativeDepthStencilHandle)>,
    bound: BoundState,
    last_submitted: SubmissionId,
    completed: SubmissionId,
    stats: DrawStats,
}

impl Context {
    pub fn new(
        share_group: Arc<ShareGroup>,
        backend: Box<dyn Backend>,
        config: ContextConfig,
    ) -> Result<Self, ContextError> {
        config.validate().map_err(ContextError::InvalidConfig)?;
        let caps = backend.caps();
        if caps.max_vertex_buffers == 0 || caps.vertex_buffer_alignment == 0 {
            return Err(ContextError::Backend(format!(
                "unusable backend capabilities: {caps:?}"
            )));
        }

        let limits = StateLimits {
            max_vertex_attribs: config.max_vertex_attribs,
            max_uniform_buffer_bindings: config.max_uniform_buffer_bindings,
            max_transform_feedback_buffers: config.max_transform_feedback_buffers,
            max_texture_units: config.max_texture_units,
            uniform_buffer_offset_alignment: u64::from(caps.uniform_offset_alignment.max(1)),
        };
        let tag = share_group.register_context();
        debug!(context = tag.id(), ?limits, "created GLES context");

        Ok(Self {
            group: share_group,
            tag,
            backend,
            caps,
            state: StateStore::new(limits, config.default_framebuffer, config.surface_size),
            errors: ErrorState::default(),
            cache: PipelineCache::new(&config.pipeline_cache),
            staging: BufferStaging::new(&config.staging, caps),
            pipeline: None,
            depth_stencil: None,
            bound: BoundState::default(),
            last_submitted: SubmissionId::NONE,
            completed: SubmissionId::NONE,
            stats: DrawStats::default(),
        })
    }

    pub fn share_group(&self) -> &Arc<ShareGroup> {
        &self.group
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn caps(&self) -> BackendCaps {
        self.caps
    }

    /// `glGetError`: returns and clears the latched error.
    pub fn get_error(&mut self) -> u32 {
        self.errors.take()
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            pipelines: self.cache.stats(),
            staging: self.staging.stats(),
            draws: self.stats,
        }
    }

    /// Serial of the most recent successful submission.
    pub fn last_submission(&self) -> SubmissionId {
        self.last_submitted
    }

    fn latch<T>(&mut self, result: Result<T, GlError>) -> Result<T, GlError> {
        if let Err(err) = &result {
            self.errors.record(*err);
        }
        result
    }

    pub fn set_state(&mut self, change: StateChange) -> Result<(), GlError> {
        let result = self.state.apply(change);
        self.latch(result)
    }

    pub fn bind_object(&mut self, target: BindTarget, name: ObjectId) -> Result<(), GlError> {
        let result = self.bind_object_inner(target, name);
        self.latch(result)
    }

    fn bind_object_inner(&mut self, target: BindTarget, name: ObjectId) -> Result<(), GlError> {
        match target {
            BindTarget::Buffer(raw) => {
                let target = BufferTarget::from_gl(raw).ok_or_else(|| {
                    debug!(target = raw, "unknown buffer target");
                    GlError::InvalidEnum
                })?;
                let buffer = self.acquire_buffer(name)?;
                self.state.bind_buffer(target, buffer);
            }
            BindTarget::Texture(raw) => {
                let target = TextureTarget::from_gl(raw).ok_or_else(|| {
                    debug!(target = raw, "unknown texture target");
                    GlError::InvalidEnum
                })?;
                let texture = match name {
                    0 => None,
                    name => Some(self.group.acquire_texture(name, target)?),
                };
                self.state.bind_texture(target, texture);
            }
            BindTarget::VertexArray => self.state.bind_vertex_array(name)?,
            BindTarget::Framebuffer(raw) => {
                let target = FramebufferTarget::from_gl(raw).ok_or_else(|| {
                    debug!(target = raw, "unknown framebuffer target");
                    GlError::InvalidEnum
                })?;
                self.state.bind_framebuffer(target, name)?;
            }
        }
        Ok(())
    }

    fn acquire_buffer(&self, name: ObjectId) -> Result<Option<BufferRef>, GlError> {
        match name {
            0 => Ok(None),
            name => self.group.acquire::<BufferObject>(name).map(Some),
        }
    }

    /// `glBindBufferRange` (`size: Some`) / `glBindBufferBase` (`size: None`).
    pub fn bind_buffer_range(
        &mut self,
        target: u32,
        index: u32,
        name: ObjectId,
        offset: u64,
        size: Option<u64>,
    ) -> Result<(), GlError> {
        let result = match IndexedBufferTarget::from_gl(target) {
            Some(target) => self
                .acquire_buffer(name)
                .and_then(|buffer| self.state.bind_buffer_range(target, index, buffer, offset, size)),
            None => {
                debug!(target, "unknown indexed buffer target");
                Err(GlError::InvalidEnum)
            }
        };
        self.latch(result)
    }

    /// `glVertexAttribPointer`.
    pub fn vertex_attrib_pointer(
        &mut self,
        index: u32,
        size: i32,
        ty: u32,
        normalized: bool,
        stride: i32,
        offset: u64,
    ) -> Result<(), GlError> {
        let result = self
            .state
            .vertex_attrib_pointer(index, size, ty, normalized, false, stride, offset);
        self.latch(result)
    }

    /// `glVertexAttribIPointer`.
    pub fn vertex_attrib_i_pointer(
        &mut self,
        index: u32,
        size: i32,
        ty: u32,
        stride: i32,
        offset: u64,
    ) -> Result<(), GlError> {
        let result = self
            .state
            .vertex_attrib_pointer(index, size, ty, false, true, stride, offset);
        self.latch(result)
    }

    pub fn enable_vertex_attrib(&mut self, index: u32, enabled: bool) -> Result<(), GlError> {
        let result = self.state.enable_vertex_attrib(index, enabled);
        self.latch(result)
    }

    pub fn vertex_attrib_divisor(&mut self, index: u32, divisor: u32) -> Result<(), GlError> {
        let result = self.state.vertex_attrib_divisor(index, divisor);
        self.latch(result)
    }

    /// `glUseProgram`; `0` unbinds.
    pub fn use_program(&mut self, name: ObjectId) -> Result<(), GlError> {
        let program = match name {
            0 => Ok(None),
            name => self.group.acquire::<ProgramObject>(name).map(Some),
        };
        let result = program.map(|program| self.state.use_program(program));
        self.latch(result)
    }

    /// `glUniform*` on the current program's default block.
    pub fn set_uniform(&mut self, location: u32, bytes: &[u8]) -> Result<(), GlError> {
        let result = match self.state.program().map(|program| program.key()) {
            Some(program) => self.group.set_program_uniform(program, location, bytes),
            None => Err(GlError::InvalidOperation),
        };
        if result.is_ok() {
            self.state.mark_dirty(DirtyFlags::UNIFORMS);
        }
        self.latch(result)
    }

    pub fn gen_vertex_array(&mut self) -> ObjectId {
        self.state.gen_vertex_array()
    }

    pub fn gen_framebuffer(&mut self) -> ObjectId {
        self.state.gen_framebuffer()
    }

    /// Records the attachment formats of framebuffer `name`.
    pub fn set_framebuffer_formats(
        &mut self,
        name: ObjectId,
        formats: FramebufferFormats,
    ) -> Result<(), GlError> {
        let result = self.state.set_framebuffer_formats(name, formats);
        self.latch(result)
    }

    /// Context-side half of deleting an object: unbinds it from this context and purges cached
    /// native objects that reference it. Vertex arrays and framebuffers are context objects and
    /// are deleted outright. Shared objects are deleted from the share group afterwards (see
    /// [`Self::delete_buffer`] and friends); other contexts observe the destruction through the
    /// share group before their next draw.
    pub fn invalidate(&mut self, kind: ObjectKind, name: ObjectId) {
        match kind {
            ObjectKind::Buffer => {
                let key = self.group.lock().buffer_key(name);
                if let Some(key) = key {
                    self.state.detach_buffer(key);
                }
            }
            ObjectKind::Program => {
                let key = self.group.lock().program_key(name);
                if let Some(key) = key {
                    self.cache.invalidate_associated_with(
                        self.backend.as_mut(),
                        CacheInvalidation::Program(key),
                    );
                    self.staging.forget_program(key);
                }
            }
            ObjectKind::Texture => {
                let key = self.group.lock().texture_key(name);
                if let Some(key) = key {
                    self.state.detach_texture(key);
                }
            }
            ObjectKind::VertexArray => {
                if self.state.delete_vertex_array(name) {
                    self.cache.invalidate_associated_with(
                        self.backend.as_mut(),
                        CacheInvalidation::VertexArray(name),
                    );
                }
            }
            ObjectKind::Framebuffer => self.state.delete_framebuffer(name),
        }
    }

    /// `glDeleteBuffers` for one name.
    pub fn delete_buffer(&mut self, name: ObjectId) {
        self.invalidate(ObjectKind::Buffer, name);
        self.group.delete_buffer(name);
    }

    /// `glDeleteProgram`. A current program stays usable until it is replaced.
    pub fn delete_program(&mut self, name: ObjectId) {
        self.invalidate(ObjectKind::Program, name);
        self.group.delete_program(name);
    }

    pub fn delete_texture(&mut self, name: ObjectId) {
        self.invalidate(ObjectKind::Texture, name);
        self.group.delete_texture(name);
    }

    pub fn delete_vertex_array(&mut self, name: ObjectId) {
        self.invalidate(ObjectKind::VertexArray, name);
    }

    pub fn delete_framebuffer(&mut self, name: ObjectId) {
        self.invalidate(ObjectKind::Framebuffer, name);
    }

    /// Tells the context that every submission up to `completed` has finished on the GPU, so
    /// objects retired before then can be destroyed.
    pub fn on_submissions_completed(&mut self, completed: SubmissionId) {
        let completed = completed.min(self.last_submitted);
        if completed <= self.completed {
            return;
        }
        self.completed = completed;
        self.staging
            .on_submissions_completed(self.backend.as_mut(), completed);
        self.cache
            .on_submissions_completed(self.backend.as_mut(), completed);
    }

    /// Issues one draw. A rejected draw latches its GL error, leaves all state (dirty bits
    /// included) as it was and is reported back as `Err`.
    pub fn draw(&mut self, call: DrawCall) -> Result<(), DrawError> {
        match self.try_draw(call) {
            Ok(DrawOutcome::Submitted) => {
                self.stats.draws_submitted += 1;
                Ok(())
            }
            Ok(DrawOutcome::Skipped) => {
                self.stats.draws_skipped += 1;
                Ok(())
            }
            Err(err) => {
                self.stats.draws_failed += 1;
                let code = err.gl_error();
                if code == GlError::OutOfMemory {
                    warn!(%err, "draw failed");
                } else {
                    debug!(%err, "draw rejected");
                }
                self.errors.record(code);
                Err(err)
            }
        }
    }

    fn try_draw(&mut self, call: DrawCall) -> Result<DrawOutcome, DrawError> {
        let mode = PrimitiveMode::from_gl(call.mode).ok_or(DrawError::InvalidMode(call.mode))?;
        let instance_count = u32::try_from(call.instance_count)
            .map_err(|_| DrawError::InvalidValue("negative instance count"))?;
        let kind = self.draw_kind(call.source)?;
        let index_type = match kind {
            DrawKind::Elements { index_type, .. } => Some(index_type),
            DrawKind::Arrays { .. } => None,
        };

        self.collect_garbage();

        let program = self
            .state
            .program()
            .map(|program| program.key())
            .ok_or(DrawError::MissingProgram)?;
        if !self.state.draw_framebuffer_formats().is_complete() {
            return Err(DrawError::IncompleteFramebuffer);
        }
        if self.state.rasterizer().rasterizer_discard || culls_everything(&self.state, mode) {
            trace!(?mode, "draw produces no fragments");
            return Ok(DrawOutcome::Skipped);
        }

        let linked = {
            let objects = self.group.lock();
            let object = objects.program(program).ok_or(DrawError::MissingProgram)?;
            Arc::clone(object.linked())
        };

        let serial = self.last_submitted.next();
        let shape = DrawShape {
            mode,
            index_type,
            instanced: instance_count > 1,
        };
        let selection = self.select_pipeline(program, &linked, shape, serial)?;
        let depth_stencil = match self.select_depth_stencil(serial) {
            Ok(handle) => handle,
            Err(err) => {
                self.pipeline = Some(selection);
                return Err(err);
            }
        };

        let plan = DrawPlan {
            mode,
            kind,
            instance_count,
            program,
            reflection: &linked.reflection,
            depth_stencil,
            serial,
        };
        let result = self.stage_and_submit(&selection, &plan);
        self.pipeline = Some(selection);
        result
    }

    fn draw_kind(&self, source: DrawSource) -> Result<DrawKind, DrawError> {
        match source {
            DrawSource::Arrays { first, count } => {
                let first = u32::try_from(first)
                    .map_err(|_| DrawError::InvalidValue("negative first vertex"))?;
                let count = u32::try_from(count)
                    .map_err(|_| DrawError::InvalidValue("negative vertex count"))?;
                Ok(DrawKind::Arrays { first, count })
            }
            DrawSource::Elements {
                count,
                index_type,
                offset,
            } => {
                let index_type = IndexType::from_gl(index_type)
                    .ok_or(DrawError::InvalidIndexType(index_type))?;
                let count = u32::try_from(count)
                    .map_err(|_| DrawError::InvalidValue("negative index count"))?;
                let buffer = self
                    .state
                    .active_vertex_array()
                    .element_buffer()
                    .map(BufferRef::key)
                    .ok_or(DrawError::InvalidOperation(
                        "no element array buffer bound",
                    ))?;
                Ok(DrawKind::Elements {
                    buffer,
                    count,
                    index_type,
                    offset,
                })
            }
        }
    }

    /// Frees native objects whose submissions finished and purges everything derived from
    /// shared objects destroyed since the last draw.
    fn collect_garbage(&mut self) {
        let completed = self.backend.completed_submission();
        self.on_submissions_completed(completed);

        for object in self.group.drain_destroyed(&self.tag) {
            match object {
                DestroyedObject::Program(key) => {
                    self.cache.invalidate_associated_with(
                        self.backend.as_mut(),
                        CacheInvalidation::Program(key),
                    );
                    self.staging.forget_program(key);
                }
                DestroyedObject::Buffer(key) => self.staging.forget_buffer(key),
                DestroyedObject::Texture(key) => {
                    self.bound.textures.retain(|_, bound| *bound != Some(key));
                }
            }
        }
    }

    fn select_pipeline(
        &mut self,
        program: ProgramKey,
        linked: &LinkedProgram,
        shape: DrawShape,
        serial: SubmissionId,
    ) -> Result<PipelineSelection, DrawError> {
        if !self.state.is_dirty(DirtyFlags::PIPELINE) {
            if let Some(current) = self.pipeline.take() {
                if current.shape == shape && self.cache.touch_render_pipeline(&current.key, serial)
                {
                    return Ok(current);
                }
            }
        }

        let (desc, streams) = DescriptorBuilder::new(&self.state, &self.caps).render_pipeline(
            program,
            &linked.reflection,
            &shape,
        )?;
        let key = CacheKey::new(desc);
        let (handle, hit) = self
            .cache
            .get_or_create_render_pipeline(self.backend.as_mut(), &key, linked, serial)
            .map_err(compile_error)?;
        trace!(hit, fingerprint = key.fingerprint(), "resolved render pipeline");
        Ok(PipelineSelection {
            shape,
            key,
            streams,
            handle,
        })
    }

    fn select_depth_stencil(
        &mut self,
        serial: SubmissionId,
    ) -> Result<NativeDepthStencilHandle, DrawError> {
        if !self.state.is_dirty(DirtyFlags::DEPTH_STENCIL_OBJECT) {
            if let Some((key, handle)) = &self.depth_stencil {
                if self.cache.touch_depth_stencil(key, serial) {
                    return Ok(*handle);
                }
            }
        }

        let key = CacheKey::new(DescriptorBuilder::new(&self.state, &self.caps).depth_stencil());
        let (handle, _) = self
            .cache
            .get_or_create_depth_stencil(self.backend.as_mut(), &key, serial)
            .map_err(compile_error)?;
        self.depth_stencil = Some((key, handle));
        Ok(handle)
    }

    fn uniform_block_ranges(
        &self,
        reflection: &ProgramReflection,
    ) -> Result<Vec<UniformBufferRange>, DrawError> {
        reflection
            .uniform_blocks
            .iter()
            .map(|block| {
                let binding = self
                    .state
                    .uniform_buffers()
                    .get(block.binding as usize)
                    .ok_or(DrawError::InvalidOperation(
                        "uniform block binding out of range",
                    ))?;
                let buffer = binding
                    .buffer
                    .as_ref()
                    .ok_or(DrawError::InvalidOperation("uniform block has no buffer bound"))?;
                Ok(UniformBufferRange {
                    binding: block.binding,
                    buffer: buffer.key(),
                    offset: binding.offset,
                    size: binding.size,
                    min_size: u64::from(block.size),
                })
            })
            .collect()
    }

    fn stage_and_submit(
        &mut self,
        selection: &PipelineSelection,
        plan: &DrawPlan<'_>,
    ) -> Result<DrawOutcome, DrawError> {
        let uniform_ranges = self.uniform_block_ranges(plan.reflection)?;

        let (prepared, uniforms) = {
            let objects = self.group.lock();
            let backend = self.backend.as_mut();
            self.staging.begin_draw();

            let request = StagingRequest {
                mode: plan.mode,
                kind: plan.kind,
                instance_count: plan.instance_count,
                primitive_restart: self.state.rasterizer().primitive_restart,
                streams: &selection.streams,
            };
            let Some(prepared) =
                self.staging
                    .prepare_draw(backend, &objects, &request, plan.serial)?
            else {
                return Ok(DrawOutcome::Skipped);
            };

            let mut uniforms = self.staging.prepare_uniform_buffers(
                backend,
                &objects,
                &uniform_ranges,
                plan.serial,
            )?;
            if let Some(block) = plan.reflection.default_block {
                let program = objects
                    .program(plan.program)
                    .ok_or(DrawError::MissingProgram)?;
                uniforms.push(self.staging.stage_default_uniforms(
                    backend,
                    plan.program,
                    program.uniform_version(),
                    program.uniform_data(),
                    block.binding,
                    plan.serial,
                )?);
            }
            (prepared, uniforms)
        };

        let mut bound = self.bound.clone();
        let commands = self.diff_commands(&mut bound, selection.handle, plan, &prepared, &uniforms);
        self.backend.submit_draw(plan.serial, &commands)?;

        trace!(
            serial = plan.serial.0,
            commands = commands.len(),
            "submitted draw"
        );
        self.last_submitted = plan.serial;
        self.bound = bound;
        self.stats.native_commands += commands.len() as u64;
        self.state.clear_dirty();
        Ok(DrawOutcome::Submitted)
    }

    /// Native commands that bring `bound` up to date for this draw, followed by the draw.
    fn diff_commands(
        &self,
        bound: &mut BoundState,
        pipeline: NativePipelineHandle,
        plan: &DrawPlan<'_>,
        prepared: &PreparedDraw,
        uniforms: &[UniformBinding],
    ) -> Vec<RenderCommand> {
        let mut commands = Vec::new();

        if bound.pipeline != Some(pipeline) {
            bound.pipeline = Some(pipeline);
            commands.push(RenderCommand::SetPipeline(pipeline));
        }
        if bound.depth_stencil != Some(plan.depth_stencil) {
            bound.depth_stencil = Some(plan.depth_stencil);
            commands.push(RenderCommand::SetDepthStencil(plan.depth_stencil));
        }

        let viewport = *self.state.viewport();
        if bound.viewport != Some(viewport) {
            bound.viewport = Some(viewport);
            commands.push(RenderCommand::SetViewport(viewport));
        }
        let scissor = self.state.scissor();
        if bound.scissor != Some(scissor) {
            bound.scissor = Some(scissor);
            commands.push(RenderCommand::SetScissor(scissor));
        }
        let blend_constant = self.state.blend_color();
        if bound.blend_constant != Some(blend_constant) {
            bound.blend_constant = Some(blend_constant);
            commands.push(RenderCommand::SetBlendConstant(blend_constant));
        }
        // Stencil values are clamped to the eight bits every supported format has.
        let reference = self.state.depth_stencil().front.reference.clamp(0, 0xFF) as u32;
        if bound.stencil_reference != Some(reference) {
            bound.stencil_reference = Some(reference);
            commands.push(RenderCommand::SetStencilReference(reference));
        }

        for (slot, binding) in prepared.vertex_buffers.iter().enumerate() {
            if bound.vertex_buffers.len() <= slot {
                bound.vertex_buffers.resize(slot + 1, None);
            }
            if bound.vertex_buffers[slot] != Some(*binding) {
                bound.vertex_buffers[slot] = Some(*binding);
                commands.push(RenderCommand::SetVertexBuffer {
                    slot: slot as u32,
                    buffer: binding.buffer,
                    offset: binding.offset,
                });
            }
        }
        if let Some(index) = prepared.index_buffer {
            if bound.index_buffer != Some(index) {
                bound.index_buffer = Some(index);
                commands.push(RenderCommand::SetIndexBuffer {
                    buffer: index.buffer,
                    offset: index.offset,
                    format: index.format,
                });
            }
        }

        for uniform in uniforms {
            if bound.uniform_buffers.get(&uniform.binding) != Some(uniform) {
                bound.uniform_buffers.insert(uniform.binding, *uniform);
                commands.push(RenderCommand::SetUniformBuffer {
                    binding: uniform.binding,
                    buffer: uniform.buffer,
                    offset: uniform.offset,
                    size: uniform.size,
                });
            }
        }

        // Sampler bindings name texture units.
        for sampler in &plan.reflection.samplers {
            let unit = sampler.binding;
            let texture = self
                .state
                .texture_units()
                .get(unit as usize)
                .and_then(TextureUnit::primary)
                .map(TextureRef::key);
            if bound.textures.get(&unit) != Some(&texture) {
                bound.textures.insert(unit, texture);
                commands.push(RenderCommand::SetTexture { unit, texture });
            }
        }

        commands.push(prepared.draw_command());
        commands
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug!(context = self.tag.id(), "destroying GLES context");
        self.cache.destroy_all(self.backend.as_mut());
        self.staging.destroy_all(self.backend.as_mut());
    }
}

fn compile_error(err: BackendError) -> DrawError {
    match err {
        BackendError::CompileFailed(message) => DrawError::PipelineCompile(message),
        other => DrawError::Backend(other),
    }
}
