//! Draw-affecting GL state with per-category dirty tracking.
//!
//! Setters validate their raw `GLenum` arguments before mutating anything, compare against the
//! stored value, and mark only the categories that actually changed.

pub mod blend;
pub mod depth_stencil;
pub mod dirty;
pub mod vertex;

use hashbrown::HashMap;
use tracing::debug;

use crate::error::GlError;
use crate::gl::{
    AttribType, BufferTarget, Capability, ColorFormat, DepthStencilFormat, FramebufferTarget,
    FrontFace, IndexedBufferTarget, TextureTarget, TEXTURE0,
};
use crate::share_group::{BufferKey, BufferRef, ObjectId, ProgramRef, TextureKey, TextureRef};

pub use blend::{BlendComponent, BlendState, ColorMask};
pub use depth_stencil::{DepthStencilState, RasterizerState, StencilFaceState};
pub use dirty::DirtyFlags;
pub use vertex::{AttributeSlot, VertexArrayObject, MAX_VERTEX_ATTRIBS};

pub const MAX_DRAW_BUFFERS: usize = 4;

/// Attachment formats of a framebuffer, as far as pipeline creation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferFormats {
    pub color: [Option<ColorFormat>; MAX_DRAW_BUFFERS],
    pub depth_stencil: Option<DepthStencilFormat>,
    pub sample_count: u32,
}

impl Default for FramebufferFormats {
    fn default() -> Self {
        Self {
            color: [Some(ColorFormat::Rgba8Unorm), None, None, None],
            depth_stencil: Some(DepthStencilFormat::Depth24PlusStencil8),
            sample_count: 1,
        }
    }
}

impl FramebufferFormats {
    /// No attachments at all.
    pub const EMPTY: Self = Self {
        color: [None; MAX_DRAW_BUFFERS],
        depth_stencil: None,
        sample_count: 1,
    };

    pub fn is_complete(&self) -> bool {
        self.color.iter().any(Option::is_some) || self.depth_stencil.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// One slot of an indexed binding table (`glBindBufferRange` / `glBindBufferBase`).
#[derive(Debug, Default, PartialEq)]
pub struct IndexedBufferBinding {
    pub buffer: Option<BufferRef>,
    pub offset: u64,
    /// `None` binds the whole buffer.
    pub size: Option<u64>,
}

#[derive(Debug, Default)]
pub struct TextureUnit {
    texture_2d: Option<TextureRef>,
    texture_3d: Option<TextureRef>,
    texture_2d_array: Option<TextureRef>,
    texture_cube_map: Option<TextureRef>,
}

impl TextureUnit {
    pub fn get(&self, target: TextureTarget) -> Option<&TextureRef> {
        match target {
            TextureTarget::Texture2d => self.texture_2d.as_ref(),
            TextureTarget::Texture3d => self.texture_3d.as_ref(),
            TextureTarget::Texture2dArray => self.texture_2d_array.as_ref(),
            TextureTarget::TextureCubeMap => self.texture_cube_map.as_ref(),
        }
    }

    fn slot_mut(&mut self, target: TextureTarget) -> &mut Option<TextureRef> {
        match target {
            TextureTarget::Texture2d => &mut self.texture_2d,
            TextureTarget::Texture3d => &mut self.texture_3d,
            TextureTarget::Texture2dArray => &mut self.texture_2d_array,
            TextureTarget::TextureCubeMap => &mut self.texture_cube_map,
        }
    }

    /// The texture a sampler of this unit reads, preferring the 2D binding.
    pub fn primary(&self) -> Option<&TextureRef> {
        self.texture_2d
            .as_ref()
            .or(self.texture_cube_map.as_ref())
            .or(self.texture_2d_array.as_ref())
            .or(self.texture_3d.as_ref())
    }
}

/// Sizes of the fixed binding tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLimits {
    pub max_vertex_attribs: usize,
    pub max_uniform_buffer_bindings: usize,
    pub max_transform_feedback_buffers: usize,
    pub max_texture_units: usize,
    pub uniform_buffer_offset_alignment: u64,
}

impl Default for StateLimits {
    fn default() -> Self {
        Self {
            max_vertex_attribs: MAX_VERTEX_ATTRIBS,
            max_uniform_buffer_bindings: 24,
            max_transform_feedback_buffers: 4,
            max_texture_units: 16,
            uniform_buffer_offset_alignment: 256,
        }
    }
}

/// A raw GL state-setting call. Enum-typed arguments carry the application's `GLenum`
/// unvalidated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateChange {
    Enable(u32),
    Disable(u32),
    Viewport {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    DepthRange {
        near: f32,
        far: f32,
    },
    Scissor {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    BlendFunc {
        src: u32,
        dst: u32,
    },
    BlendFuncSeparate {
        src_rgb: u32,
        dst_rgb: u32,
        src_alpha: u32,
        dst_alpha: u32,
    },
    BlendEquation(u32),
    BlendEquationSeparate {
        rgb: u32,
        alpha: u32,
    },
    BlendColor([f32; 4]),
    ColorMask([bool; 4]),
    DepthFunc(u32),
    DepthMask(bool),
    StencilFunc {
        func: u32,
        reference: i32,
        mask: u32,
    },
    StencilFuncSeparate {
        face: u32,
        func: u32,
        reference: i32,
        mask: u32,
    },
    StencilOp {
        fail: u32,
        depth_fail: u32,
        pass: u32,
    },
    StencilOpSeparate {
        face: u32,
        fail: u32,
        depth_fail: u32,
        pass: u32,
    },
    StencilMask(u32),
    StencilMaskSeparate {
        face: u32,
        mask: u32,
    },
    CullFace(u32),
    FrontFace(u32),
    PolygonOffset {
        factor: f32,
        units: f32,
    },
    ActiveTexture(u32),
}

fn update<T: PartialEq>(dirty: &mut DirtyFlags, slot: &mut T, value: T, flag: DirtyFlags) {
    if *slot != value {
        *slot = value;
        *dirty |= flag;
    }
}

#[derive(Debug)]
pub struct StateStore {
    dirty: DirtyFlags,
    limits: StateLimits,

    viewport: Viewport,
    scissor_enabled: bool,
    scissor: ScissorRect,
    blend: BlendState,
    blend_color: [f32; 4],
    color_mask: ColorMask,
    depth_stencil: DepthStencilState,
    rasterizer: RasterizerState,

    program: Option<ProgramRef>,

    default_vertex_array: VertexArrayObject,
    vertex_arrays: HashMap<ObjectId, VertexArrayObject>,
    bound_vertex_array: ObjectId,
    next_vertex_array: ObjectId,

    array_buffer: Option<BufferRef>,
    generic_buffers: HashMap<BufferTarget, BufferRef>,
    uniform_buffers: Vec<IndexedBufferBinding>,
    transform_feedback_buffers: Vec<IndexedBufferBinding>,

    texture_units: Vec<TextureUnit>,
    active_texture: usize,

    default_framebuffer: FramebufferFormats,
    framebuffers: HashMap<ObjectId, FramebufferFormats>,
    next_framebuffer: ObjectId,
    draw_framebuffer: ObjectId,
    read_framebuffer: ObjectId,
}

impl StateStore {
    pub fn new(
        limits: StateLimits,
        default_framebuffer: FramebufferFormats,
        surface_size: (u32, u32),
    ) -> Self {
        let (width, height) = (surface_size.0 as i32, surface_size.1 as i32);
        Self {
            dirty: DirtyFlags::all(),
            limits,
            viewport: Viewport {
                x: 0,
                y: 0,
                width,
                height,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            scissor_enabled: false,
            scissor: ScissorRect {
                x: 0,
                y: 0,
                width,
                height,
            },
            blend: BlendState::default(),
            blend_color: [0.0; 4],
            color_mask: ColorMask::ALL,
            depth_stencil: DepthStencilState::default(),
            rasterizer: RasterizerState::default(),
            program: None,
            default_vertex_array: VertexArrayObject::new(limits.max_vertex_attribs),
            vertex_arrays: HashMap::new(),
            bound_vertex_array: 0,
            next_vertex_array: 1,
            array_buffer: None,
            generic_buffers: HashMap::new(),
            uniform_buffers: (0..limits.max_uniform_buffer_bindings)
                .map(|_| IndexedBufferBinding::default())
                .collect(),
            transform_feedback_buffers: (0..limits.max_transform_feedback_buffers)
                .map(|_| IndexedBufferBinding::default())
                .collect(),
            texture_units: (0..limits.max_texture_units)
                .map(|_| TextureUnit::default())
                .collect(),
            active_texture: 0,
            default_framebuffer,
            framebuffers: HashMap::new(),
            next_framebuffer: 1,
            draw_framebuffer: 0,
            read_framebuffer: 0,
        }
    }

    pub fn limits(&self) -> &StateLimits {
        &self.limits
    }

    pub fn dirty(&self) -> DirtyFlags {
        self.dirty
    }

    pub fn is_dirty(&self, flags: DirtyFlags) -> bool {
        self.dirty.intersects(flags)
    }

    /// Called after a draw has been submitted successfully.
    pub fn clear_dirty(&mut self) {
        self.dirty = DirtyFlags::empty();
    }

    /// Flags state that lives outside the store, such as uniform values held by a program.
    pub fn mark_dirty(&mut self, flags: DirtyFlags) {
        self.dirty |= flags;
    }

    pub fn mark_all_dirty(&mut self) {
        self.dirty = DirtyFlags::all();
    }

    pub fn apply(&mut self, change: StateChange) -> Result<(), GlError> {
        use crate::gl::FRONT_AND_BACK;

        match change {
            StateChange::Enable(cap) => self.set_capability(cap, true),
            StateChange::Disable(cap) => self.set_capability(cap, false),
            StateChange::Viewport {
                x,
                y,
                width,
                height,
            } => self.set_viewport(x, y, width, height),
            StateChange::DepthRange { near, far } => {
                self.set_depth_range(near, far);
                Ok(())
            }
            StateChange::Scissor {
                x,
                y,
                width,
                height,
            } => self.set_scissor(x, y, width, height),
            StateChange::BlendFunc { src, dst } => self.set_blend_func_separate(src, dst, src, dst),
            StateChange::BlendFuncSeparate {
                src_rgb,
                dst_rgb,
                src_alpha,
                dst_alpha,
            } => self.set_blend_func_separate(src_rgb, dst_rgb, src_alpha, dst_alpha),
            StateChange::BlendEquation(mode) => self.set_blend_equation_separate(mode, mode),
            StateChange::BlendEquationSeparate { rgb, alpha } => {
                self.set_blend_equation_separate(rgb, alpha)
            }
            StateChange::BlendColor(color) => {
                self.set_blend_color(color);
                Ok(())
            }
            StateChange::ColorMask(mask) => {
                self.set_color_mask(ColorMask::from_array(mask));
                Ok(())
            }
            StateChange::DepthFunc(func) => self.set_depth_func(func),
            StateChange::DepthMask(enabled) => {
                self.set_depth_mask(enabled);
                Ok(())
            }
            StateChange::StencilFunc {
                func,
                reference,
                mask,
            } => self.set_stencil_func_separate(FRONT_AND_BACK, func, reference, mask),
            StateChange::StencilFuncSeparate {
                face,
                func,
                reference,
                mask,
            } => self.set_stencil_func_separate(face, func, reference, mask),
            StateChange::StencilOp {
                fail,
                depth_fail,
                pass,
            } => self.set_stencil_op_separate(FRONT_AND_BACK, fail, depth_fail, pass),
            StateChange::StencilOpSeparate {
                face,
                fail,
                depth_fail,
                pass,
            } => self.set_stencil_op_separate(face, fail, depth_fail, pass),
            StateChange::StencilMask(mask) => self.set_stencil_mask_separate(FRONT_AND_BACK, mask),
            StateChange::StencilMaskSeparate { face, mask } => {
                self.set_stencil_mask_separate(face, mask)
            }
            StateChange::CullFace(mode) => self.set_cull_face(mode),
            StateChange::FrontFace(mode) => self.set_front_face(mode),
            StateChange::PolygonOffset { factor, units } => {
                self.set_polygon_offset(factor, units);
                Ok(())
            }
            StateChange::ActiveTexture(unit) => self.set_active_texture(unit),
        }
    }

    pub fn set_capability(&mut self, cap: u32, enabled: bool) -> Result<(), GlError> {
        let Some(cap) = Capability::from_gl(cap) else {
            debug!(cap, enabled, "unknown capability");
            return Err(GlError::InvalidEnum);
        };
        let dirty = &mut self.dirty;
        match cap {
            Capability::Blend => update(dirty, &mut self.blend.enabled, enabled, DirtyFlags::BLEND),
            Capability::CullFace => update(
                dirty,
                &mut self.rasterizer.cull_enabled,
                enabled,
                DirtyFlags::RASTERIZER,
            ),
            Capability::DepthTest => update(
                dirty,
                &mut self.depth_stencil.depth_test,
                enabled,
                DirtyFlags::DEPTH_STENCIL,
            ),
            Capability::StencilTest => update(
                dirty,
                &mut self.depth_stencil.stencil_test,
                enabled,
                DirtyFlags::DEPTH_STENCIL,
            ),
            Capability::ScissorTest => {
                update(dirty, &mut self.scissor_enabled, enabled, DirtyFlags::SCISSOR)
            }
            Capability::PolygonOffsetFill => update(
                dirty,
                &mut self.rasterizer.polygon_offset_fill,
                enabled,
                DirtyFlags::RASTERIZER,
            ),
            Capability::SampleAlphaToCoverage => update(
                dirty,
                &mut self.rasterizer.alpha_to_coverage,
                enabled,
                DirtyFlags::RASTERIZER,
            ),
            Capability::RasterizerDiscard => update(
                dirty,
                &mut self.rasterizer.rasterizer_discard,
                enabled,
                DirtyFlags::RASTERIZER,
            ),
            Capability::PrimitiveRestartFixedIndex => update(
                dirty,
                &mut self.rasterizer.primitive_restart,
                enabled,
                DirtyFlags::RASTERIZER,
            ),
            // No native counterpart.
            Capability::Dither => self.rasterizer.dither = enabled,
        }
        Ok(())
    }

    pub fn set_viewport(&mut self, x: i32, y: i32, width: i32, height: i32) -> Result<(), GlError> {
        if width < 0 || height < 0 {
            debug!(width, height, "negative viewport size");
            return Err(GlError::InvalidValue);
        }
        let viewport = Viewport {
            x,
            y,
            width,
            height,
            ..self.viewport
        };
        update(&mut self.dirty, &mut self.viewport, viewport, DirtyFlags::VIEWPORT);
        Ok(())
    }

    pub fn set_depth_range(&mut self, near: f32, far: f32) {
        let viewport = Viewport {
            min_depth: near.clamp(0.0, 1.0),
            max_depth: far.clamp(0.0, 1.0),
            ..self.viewport
        };
        update(&mut self.dirty, &mut self.viewport, viewport, DirtyFlags::VIEWPORT);
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, width: i32, height: i32) -> Result<(), GlError> {
        if width < 0 || height < 0 {
            debug!(width, height, "negative scissor size");
            return Err(GlError::InvalidValue);
        }
        let rect = ScissorRect {
            x,
            y,
            width,
            height,
        };
        update(&mut self.dirty, &mut self.scissor, rect, DirtyFlags::SCISSOR);
        Ok(())
    }

    pub fn set_blend_func_separate(
        &mut self,
        src_rgb: u32,
        dst_rgb: u32,
        src_alpha: u32,
        dst_alpha: u32,
    ) -> Result<(), GlError> {
        let src_rgb = blend::parse_src_factor(src_rgb)?;
        let dst_rgb = blend::parse_dst_factor(dst_rgb)?;
        let src_alpha = blend::parse_src_factor(src_alpha)?;
        let dst_alpha = blend::parse_dst_factor(dst_alpha)?;

        let mut next = self.blend;
        next.color.src = src_rgb;
        next.color.dst = dst_rgb;
        next.alpha.src = src_alpha;
        next.alpha.dst = dst_alpha;
        update(&mut self.dirty, &mut self.blend, next, DirtyFlags::BLEND);
        Ok(())
    }

    pub fn set_blend_equation_separate(&mut self, rgb: u32, alpha: u32) -> Result<(), GlError> {
        let rgb = blend::parse_equation(rgb)?;
        let alpha = blend::parse_equation(alpha)?;

        let mut next = self.blend;
        next.color.equation = rgb;
        next.alpha.equation = alpha;
        update(&mut self.dirty, &mut self.blend, next, DirtyFlags::BLEND);
        Ok(())
    }

    pub fn set_blend_color(&mut self, color: [f32; 4]) {
        let color = color.map(|c| c.clamp(0.0, 1.0));
        update(&mut self.dirty, &mut self.blend_color, color, DirtyFlags::BLEND_COLOR);
    }

    pub fn set_color_mask(&mut self, mask: ColorMask) {
        update(&mut self.dirty, &mut self.color_mask, mask, DirtyFlags::COLOR_MASK);
    }

    pub fn set_depth_func(&mut self, func: u32) -> Result<(), GlError> {
        let func = depth_stencil::parse_compare_func(func)?;
        update(
            &mut self.dirty,
            &mut self.depth_stencil.depth_func,
            func,
            DirtyFlags::DEPTH_STENCIL,
        );
        Ok(())
    }

    pub fn set_depth_mask(&mut self, enabled: bool) {
        update(
            &mut self.dirty,
            &mut self.depth_stencil.depth_write,
            enabled,
            DirtyFlags::DEPTH_STENCIL,
        );
    }

    pub fn set_stencil_func_separate(
        &mut self,
        face: u32,
        func: u32,
        reference: i32,
        mask: u32,
    ) -> Result<(), GlError> {
        let face = depth_stencil::parse_face(face)?;
        let func = depth_stencil::parse_compare_func(func)?;

        let mut next = self.depth_stencil;
        next.update_faces(face, |f| {
            f.func = func;
            f.read_mask = mask;
        });
        update(&mut self.dirty, &mut self.depth_stencil, next, DirtyFlags::DEPTH_STENCIL);

        let mut next = self.depth_stencil;
        next.update_faces(face, |f| f.reference = reference);
        update(&mut self.dirty, &mut self.depth_stencil, next, DirtyFlags::STENCIL_REF);
        Ok(())
    }

    pub fn set_stencil_op_separate(
        &mut self,
        face: u32,
        fail: u32,
        depth_fail: u32,
        pass: u32,
    ) -> Result<(), GlError> {
        let face = depth_stencil::parse_face(face)?;
        let fail = depth_stencil::parse_stencil_op(fail)?;
        let depth_fail = depth_stencil::parse_stencil_op(depth_fail)?;
        let pass = depth_stencil::parse_stencil_op(pass)?;

        let mut next = self.depth_stencil;
        next.update_faces(face, |f| {
            f.fail = fail;
            f.depth_fail = depth_fail;
            f.pass = pass;
        });
        update(&mut self.dirty, &mut self.depth_stencil, next, DirtyFlags::DEPTH_STENCIL);
        Ok(())
    }

    pub fn set_stencil_mask_separate(&mut self, face: u32, mask: u32) -> Result<(), GlError> {
        let face = depth_stencil::parse_face(face)?;
        let mut next = self.depth_stencil;
        next.update_faces(face, |f| f.write_mask = mask);
        update(&mut self.dirty, &mut self.depth_stencil, next, DirtyFlags::DEPTH_STENCIL);
        Ok(())
    }

    pub fn set_cull_face(&mut self, mode: u32) -> Result<(), GlError> {
        let face = depth_stencil::parse_face(mode)?;
        update(
            &mut self.dirty,
            &mut self.rasterizer.cull_face,
            face,
            DirtyFlags::RASTERIZER,
        );
        Ok(())
    }

    pub fn set_front_face(&mut self, mode: u32) -> Result<(), GlError> {
        let Some(front_face) = FrontFace::from_gl(mode) else {
            debug!(mode, "unknown front face");
            return Err(GlError::InvalidEnum);
        };
        update(
            &mut self.dirty,
            &mut self.rasterizer.front_face,
            front_face,
            DirtyFlags::RASTERIZER,
        );
        Ok(())
    }

    pub fn set_polygon_offset(&mut self, factor: f32, units: f32) {
        let mut next = self.rasterizer;
        next.polygon_offset_factor = factor;
        next.polygon_offset_units = units;
        update(&mut self.dirty, &mut self.rasterizer, next, DirtyFlags::RASTERIZER);
    }

    /// `glActiveTexture`. Selects the unit later texture binds apply to; marks nothing.
    pub fn set_active_texture(&mut self, unit: u32) -> Result<(), GlError> {
        let index = unit.wrapping_sub(TEXTURE0) as usize;
        if index >= self.texture_units.len() {
            debug!(unit, "texture unit out of range");
            return Err(GlError::InvalidEnum);
        }
        self.active_texture = index;
        Ok(())
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    /// Active scissor rectangle, `None` while the scissor test is disabled.
    pub fn scissor(&self) -> Option<ScissorRect> {
        self.scissor_enabled.then_some(self.scissor)
    }

    pub fn blend(&self) -> &BlendState {
        &self.blend
    }

    pub fn blend_color(&self) -> [f32; 4] {
        self.blend_color
    }

    pub fn color_mask(&self) -> ColorMask {
        self.color_mask
    }

    pub fn depth_stencil(&self) -> &DepthStencilState {
        &self.depth_stencil
    }

    pub fn rasterizer(&self) -> &RasterizerState {
        &self.rasterizer
    }

    pub fn program(&self) -> Option<&ProgramRef> {
        self.program.as_ref()
    }

    pub fn use_program(&mut self, program: Option<ProgramRef>) {
        update(&mut self.dirty, &mut self.program, program, DirtyFlags::PROGRAM);
    }

    /// Replaces the buffer bound at `target`. The caller already holds the new reference, so
    /// the previous occupant is released only after the new one is counted.
    pub fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<BufferRef>) {
        match target {
            BufferTarget::Array => self.array_buffer = buffer,
            BufferTarget::ElementArray => {
                if self.active_vertex_array_mut().set_element_buffer(buffer) {
                    self.dirty |= DirtyFlags::INDEX_BUFFER;
                }
            }
            _ => match buffer {
                Some(buffer) => {
                    self.generic_buffers.insert(target, buffer);
                }
                None => {
                    self.generic_buffers.remove(&target);
                }
            },
        }
    }

    pub fn buffer_binding(&self, target: BufferTarget) -> Option<&BufferRef> {
        match target {
            BufferTarget::Array => self.array_buffer.as_ref(),
            BufferTarget::ElementArray => self.active_vertex_array().element_buffer(),
            _ => self.generic_buffers.get(&target),
        }
    }

    /// `glBindBufferRange` (`size: Some`) / `glBindBufferBase` (`size: None`).
    pub fn bind_buffer_range(
        &mut self,
        target: IndexedBufferTarget,
        index: u32,
        buffer: Option<BufferRef>,
        offset: u64,
        size: Option<u64>,
    ) -> Result<(), GlError> {
        let (len, alignment) = match target {
            IndexedBufferTarget::Uniform => (
                self.uniform_buffers.len(),
                self.limits.uniform_buffer_offset_alignment,
            ),
            IndexedBufferTarget::TransformFeedback => (self.transform_feedback_buffers.len(), 4),
        };
        if index as usize >= len {
            debug!(?target, index, "indexed binding out of range");
            return Err(GlError::InvalidValue);
        }
        if buffer.is_some() && (size == Some(0) || offset % alignment != 0) {
            debug!(?target, offset, ?size, "invalid buffer range");
            return Err(GlError::InvalidValue);
        }

        let generic = match target {
            IndexedBufferTarget::Uniform => BufferTarget::Uniform,
            IndexedBufferTarget::TransformFeedback => BufferTarget::TransformFeedback,
        };
        self.bind_buffer(generic, buffer.clone());

        let (table, flag) = match target {
            IndexedBufferTarget::Uniform => {
                (&mut self.uniform_buffers, DirtyFlags::UNIFORM_BUFFERS)
            }
            IndexedBufferTarget::TransformFeedback => {
                (&mut self.transform_feedback_buffers, DirtyFlags::empty())
            }
        };
        let next = IndexedBufferBinding {
            buffer,
            offset: if size.is_some() { offset } else { 0 },
            size,
        };
        update(&mut self.dirty, &mut table[index as usize], next, flag);
        Ok(())
    }

    pub fn uniform_buffers(&self) -> &[IndexedBufferBinding] {
        &self.uniform_buffers
    }

    pub fn transform_feedback_buffers(&self) -> &[IndexedBufferBinding] {
        &self.transform_feedback_buffers
    }

    /// Binds `texture` to `target` of the active unit. Target compatibility is checked when
    /// the reference is acquired.
    pub fn bind_texture(&mut self, target: TextureTarget, texture: Option<TextureRef>) {
        let unit = &mut self.texture_units[self.active_texture];
        update(
            &mut self.dirty,
            unit.slot_mut(target),
            texture,
            DirtyFlags::TEXTURES,
        );
    }

    /// Unbinds `key` from every texture unit, as `glDeleteTextures` does for the current context.
    pub fn detach_texture(&mut self, key: TextureKey) {
        for unit in &mut self.texture_units {
            for target in [
                TextureTarget::Texture2d,
                TextureTarget::Texture3d,
                TextureTarget::Texture2dArray,
                TextureTarget::TextureCubeMap,
            ] {
                let slot = unit.slot_mut(target);
                if slot.as_ref().map(TextureRef::key) == Some(key) {
                    *slot = None;
                    self.dirty |= DirtyFlags::TEXTURES;
                }
            }
        }
    }

    pub fn texture_units(&self) -> &[TextureUnit] {
        &self.texture_units
    }

    pub fn active_texture(&self) -> usize {
        self.active_texture
    }

    pub fn gen_vertex_array(&mut self) -> ObjectId {
        let name = self.next_vertex_array;
        self.next_vertex_array += 1;
        self.vertex_arrays
            .insert(name, VertexArrayObject::new(self.limits.max_vertex_attribs));
        name
    }

    pub fn is_vertex_array(&self, name: ObjectId) -> bool {
        self.vertex_arrays.contains_key(&name)
    }

    pub fn bind_vertex_array(&mut self, name: ObjectId) -> Result<(), GlError> {
        if name != 0 && !self.vertex_arrays.contains_key(&name) {
            debug!(name, "binding unknown vertex array");
            return Err(GlError::InvalidOperation);
        }
        if self.bound_vertex_array != name {
            self.bound_vertex_array = name;
            self.dirty |= DirtyFlags::VERTEX_INPUT | DirtyFlags::INDEX_BUFFER;
        }
        Ok(())
    }

    /// Deletes a vertex-array object; the default set is bound if it was current. Returns
    /// `false` for unknown names.
    pub fn delete_vertex_array(&mut self, name: ObjectId) -> bool {
        if name == 0 {
            return false;
        }
        let Some(removed) = self.vertex_arrays.remove(&name) else {
            return false;
        };
        if self.bound_vertex_array == name {
            self.bound_vertex_array = 0;
            self.dirty |= DirtyFlags::VERTEX_INPUT | DirtyFlags::INDEX_BUFFER;
        }
        drop(removed);
        true
    }

    /// Name of the bound vertex-array object, `None` while the default set is active.
    pub fn bound_vertex_array(&self) -> Option<ObjectId> {
        (self.bound_vertex_array != 0).then_some(self.bound_vertex_array)
    }

    /// The attribute set every other component reads, wherever it is stored.
    pub fn active_vertex_array(&self) -> &VertexArrayObject {
        self.vertex_arrays
            .get(&self.bound_vertex_array)
            .unwrap_or(&self.default_vertex_array)
    }

    fn active_vertex_array_mut(&mut self) -> &mut VertexArrayObject {
        match self.vertex_arrays.get_mut(&self.bound_vertex_array) {
            Some(vao) => vao,
            None => &mut self.default_vertex_array,
        }
    }

    /// `glVertexAttribPointer` (`integer == false`) / `glVertexAttribIPointer`.
    #[allow(clippy::too_many_arguments)]
    pub fn vertex_attrib_pointer(
        &mut self,
        index: u32,
        size: i32,
        ty: u32,
        normalized: bool,
        integer: bool,
        stride: i32,
        offset: u64,
    ) -> Result<(), GlError> {
        if index as usize >= self.limits.max_vertex_attribs {
            debug!(index, "attribute index out of range");
            return Err(GlError::InvalidValue);
        }
        let Some(component_type) = AttribType::from_gl(ty) else {
            debug!(index, ty, "unknown attribute type");
            return Err(GlError::InvalidEnum);
        };
        if integer && !component_type.is_integer() {
            debug!(index, ty, "non-integer type passed to glVertexAttribIPointer");
            return Err(GlError::InvalidEnum);
        }
        if !(1..=4).contains(&size) || stride < 0 {
            debug!(index, size, stride, "invalid attribute size or stride");
            return Err(GlError::InvalidValue);
        }
        if component_type.is_packed() && size != 4 {
            return Err(GlError::InvalidOperation);
        }
        if self.bound_vertex_array != 0 && self.array_buffer.is_none() && offset != 0 {
            debug!(index, offset, "client-side attribute pointer with a vertex array bound");
            return Err(GlError::InvalidOperation);
        }

        let buffer = self.array_buffer.clone();
        let next = AttributeSlot {
            enabled: false,
            components: size as u8,
            component_type,
            normalized: normalized && !integer,
            integer,
            stride: stride as u32,
            offset,
            buffer: None,
            divisor: 0,
        };

        let mut changed = false;
        if let Some(slot) = self.active_vertex_array_mut().attribute_mut(index as usize) {
            if !slot.format_eq(&next) {
                slot.components = next.components;
                slot.component_type = next.component_type;
                slot.normalized = next.normalized;
                slot.integer = next.integer;
                slot.stride = next.stride;
                slot.offset = next.offset;
                changed = true;
            }
            if slot.buffer != buffer {
                slot.buffer = buffer;
                changed = true;
            }
        }
        if changed {
            self.dirty |= DirtyFlags::VERTEX_INPUT;
        }
        Ok(())
    }

    pub fn enable_vertex_attrib(&mut self, index: u32, enabled: bool) -> Result<(), GlError> {
        let mut dirty = self.dirty;
        let slot = self
            .active_vertex_array_mut()
            .attribute_mut(index as usize)
            .ok_or(GlError::InvalidValue)?;
        update(&mut dirty, &mut slot.enabled, enabled, DirtyFlags::VERTEX_INPUT);
        self.dirty = dirty;
        Ok(())
    }

    pub fn vertex_attrib_divisor(&mut self, index: u32, divisor: u32) -> Result<(), GlError> {
        let mut dirty = self.dirty;
        let slot = self
            .active_vertex_array_mut()
            .attribute_mut(index as usize)
            .ok_or(GlError::InvalidValue)?;
        update(&mut dirty, &mut slot.divisor, divisor, DirtyFlags::VERTEX_INPUT);
        self.dirty = dirty;
        Ok(())
    }

    /// Unbinds `key` from every binding point of this context and from the current vertex
    /// array, as `glDeleteBuffers` does. Other vertex arrays keep their references.
    pub fn detach_buffer(&mut self, key: BufferKey) {
        if self.array_buffer.as_ref().map(BufferRef::key) == Some(key) {
            self.array_buffer = None;
        }
        self.generic_buffers.retain(|_, buffer| buffer.key() != key);
        for binding in &mut self.uniform_buffers {
            if binding.buffer.as_ref().map(BufferRef::key) == Some(key) {
                *binding = IndexedBufferBinding::default();
                self.dirty |= DirtyFlags::UNIFORM_BUFFERS;
            }
        }
        for binding in &mut self.transform_feedback_buffers {
            if binding.buffer.as_ref().map(BufferRef::key) == Some(key) {
                *binding = IndexedBufferBinding::default();
            }
        }
        let (attribs, element) = self.active_vertex_array_mut().detach_buffer(key);
        if attribs {
            self.dirty |= DirtyFlags::VERTEX_INPUT;
        }
        if element {
            self.dirty |= DirtyFlags::INDEX_BUFFER;
        }
    }

    pub fn gen_framebuffer(&mut self) -> ObjectId {
        let name = self.next_framebuffer;
        self.next_framebuffer += 1;
        self.framebuffers.insert(name, FramebufferFormats::EMPTY);
        name
    }

    /// Records the attachment formats of a framebuffer object.
    pub fn set_framebuffer_formats(
        &mut self,
        name: ObjectId,
        formats: FramebufferFormats,
    ) -> Result<(), GlError> {
        let Some(slot) = self.framebuffers.get_mut(&name) else {
            return Err(GlError::InvalidOperation);
        };
        if *slot != formats {
            *slot = formats;
            if self.draw_framebuffer == name {
                self.dirty |= DirtyFlags::FRAMEBUFFER;
            }
        }
        Ok(())
    }

    pub fn bind_framebuffer(&mut self, target: FramebufferTarget, name: ObjectId) -> Result<(), GlError> {
        if name != 0 && !self.framebuffers.contains_key(&name) {
            debug!(name, "binding unknown framebuffer");
            return Err(GlError::InvalidOperation);
        }
        if matches!(target, FramebufferTarget::Draw | FramebufferTarget::Both) {
            update(
                &mut self.dirty,
                &mut self.draw_framebuffer,
                name,
                DirtyFlags::FRAMEBUFFER,
            );
        }
        if matches!(target, FramebufferTarget::Read | FramebufferTarget::Both) {
            self.read_framebuffer = name;
        }
        Ok(())
    }

    pub fn delete_framebuffer(&mut self, name: ObjectId) {
        if name == 0 || self.framebuffers.remove(&name).is_none() {
            return;
        }
        if self.draw_framebuffer == name {
            self.draw_framebuffer = 0;
            self.dirty |= DirtyFlags::FRAMEBUFFER;
        }
        if self.read_framebuffer == name {
            self.read_framebuffer = 0;
        }
    }

    pub fn draw_framebuffer(&self) -> ObjectId {
        self.draw_framebuffer
    }

    pub fn read_framebuffer(&self) -> ObjectId {
        self.read_framebuffer
    }

    /// Attachment formats of the current draw framebuffer.
    pub fn draw_framebuffer_formats(&self) -> &FramebufferFormats {
        self.framebuffers
            .get(&self.draw_framebuffer)
            .unwrap_or(&self.default_framebuffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl;
    use crate::share_group::{BufferObject, ShareGroup};
    use crate::shader::testing::DeclCompiler;
    use std::sync::Arc;

    fn store() -> StateStore {
        StateStore::new(StateLimits::default(), FramebufferFormats::default(), (64, 64))
    }

    #[test]
    fn each_setter_marks_only_its_category() {
        let cases = [
            (StateChange::Enable(gl::BLEND), DirtyFlags::BLEND),
            (StateChange::Enable(gl::DEPTH_TEST), DirtyFlags::DEPTH_STENCIL),
            (StateChange::Enable(gl::SCISSOR_TEST), DirtyFlags::SCISSOR),
            (StateChange::Enable(gl::CULL_FACE), DirtyFlags::RASTERIZER),
            (
                StateChange::Viewport {
                    x: 1,
                    y: 2,
                    width: 3,
                    height: 4,
                },
                DirtyFlags::VIEWPORT,
            ),
            (
                StateChange::BlendFunc {
                    src: gl::SRC_ALPHA,
                    dst: gl::ONE_MINUS_SRC_ALPHA,
                },
                DirtyFlags::BLEND,
            ),
            (StateChange::BlendColor([0.5; 4]), DirtyFlags::BLEND_COLOR),
            (
                StateChange::ColorMask([true, false, true, true]),
                DirtyFlags::COLOR_MASK,
            ),
            (StateChange::DepthFunc(gl::LEQUAL), DirtyFlags::DEPTH_STENCIL),
            (StateChange::DepthMask(false), DirtyFlags::DEPTH_STENCIL),
            (
                StateChange::StencilFunc {
                    func: gl::ALWAYS,
                    reference: 3,
                    mask: !0,
                },
                DirtyFlags::STENCIL_REF,
            ),
            (StateChange::CullFace(gl::FRONT), DirtyFlags::RASTERIZER),
            (
                StateChange::PolygonOffset {
                    factor: 1.0,
                    units: 2.0,
                },
                DirtyFlags::RASTERIZER,
            ),
            (StateChange::ActiveTexture(gl::TEXTURE0 + 3), DirtyFlags::empty()),
        ];

        for (change, expected) in cases {
            let mut state = store();
            state.clear_dirty();
            state.apply(change).unwrap();
            assert_eq!(state.dirty(), expected, "{change:?}");

            // Re-applying an identical value marks nothing.
            state.clear_dirty();
            state.apply(change).unwrap();
            assert_eq!(state.dirty(), DirtyFlags::empty(), "{change:?}");
        }
    }

    #[test]
    fn invalid_values_are_rejected_without_mutation() {
        let mut state = store();
        state.clear_dirty();
        let before = *state.blend();

        assert_eq!(
            state.apply(StateChange::BlendFuncSeparate {
                src_rgb: gl::SRC_ALPHA,
                dst_rgb: gl::ONE,
                src_alpha: gl::ONE,
                dst_alpha: 0xDEAD,
            }),
            Err(GlError::InvalidEnum)
        );
        assert_eq!(*state.blend(), before);
        assert_eq!(state.apply(StateChange::Enable(0x1234)), Err(GlError::InvalidEnum));
        assert_eq!(
            state.apply(StateChange::Viewport {
                x: 0,
                y: 0,
                width: -1,
                height: 1,
            }),
            Err(GlError::InvalidValue)
        );
        assert_eq!(
            state.apply(StateChange::ActiveTexture(gl::TEXTURE0 + 16)),
            Err(GlError::InvalidEnum)
        );
        assert_eq!(state.dirty(), DirtyFlags::empty());
    }

    #[test]
    fn stencil_func_splits_reference_from_object_state() {
        let mut state = store();
        state.clear_dirty();
        state
            .set_stencil_func_separate(gl::FRONT_AND_BACK, gl::EQUAL, 0, !0)
            .unwrap();
        assert_eq!(state.dirty(), DirtyFlags::DEPTH_STENCIL);

        state.clear_dirty();
        state
            .set_stencil_func_separate(gl::FRONT_AND_BACK, gl::EQUAL, 7, !0)
            .unwrap();
        assert_eq!(state.dirty(), DirtyFlags::STENCIL_REF);
        assert_eq!(state.depth_stencil().back.reference, 7);
    }

    #[test]
    fn attribute_writes_follow_the_bound_vertex_array() {
        let group = ShareGroup::new(Box::new(DeclCompiler));
        let name = group.gen_buffer();
        let mut state = store();

        let vao = state.gen_vertex_array();
        state.bind_vertex_array(vao).unwrap();
        state.bind_buffer(BufferTarget::Array, Some(group.acquire(name).unwrap()));
        state
            .vertex_attrib_pointer(2, 3, gl::FLOAT, false, false, 12, 0)
            .unwrap();
        state.enable_vertex_attrib(2, true).unwrap();
        assert!(state.active_vertex_array().attributes()[2].enabled);

        state.bind_vertex_array(0).unwrap();
        assert!(!state.active_vertex_array().attributes()[2].enabled);
        assert_eq!(state.bound_vertex_array(), None);

        state.bind_vertex_array(vao).unwrap();
        assert_eq!(state.bound_vertex_array(), Some(vao));
        assert_eq!(state.active_vertex_array().attributes()[2].components, 3);

        assert_eq!(state.bind_vertex_array(99), Err(GlError::InvalidOperation));
        assert!(state.delete_vertex_array(vao));
        assert_eq!(state.bound_vertex_array(), None);
    }

    #[test]
    fn rebinding_moves_exactly_one_reference() {
        let group: Arc<ShareGroup> = ShareGroup::new(Box::new(DeclCompiler));
        let a = group.gen_buffer();
        let b = group.gen_buffer();
        let mut state = store();

        state.bind_buffer(BufferTarget::ElementArray, Some(group.acquire(a).unwrap()));
        assert_eq!(group.ref_count::<BufferObject>(a), Some(2));

        state.bind_buffer(BufferTarget::ElementArray, Some(group.acquire(b).unwrap()));
        assert_eq!(group.ref_count::<BufferObject>(a), Some(1));
        assert_eq!(group.ref_count::<BufferObject>(b), Some(2));

        group.delete_buffer(a);
        assert_eq!(group.object_counts().buffers, 1);
        drop(state);
        assert_eq!(group.ref_count::<BufferObject>(b), Some(1));
    }

    #[test]
    fn indexed_bindings_validate_range() {
        let group = ShareGroup::new(Box::new(DeclCompiler));
        let name = group.gen_buffer();
        let mut state = store();
        state.clear_dirty();

        let buf = || Some(group.acquire(name).unwrap());
        assert_eq!(
            state.bind_buffer_range(IndexedBufferTarget::Uniform, 24, buf(), 0, None),
            Err(GlError::InvalidValue)
        );
        assert_eq!(
            state.bind_buffer_range(IndexedBufferTarget::Uniform, 0, buf(), 4, Some(16)),
            Err(GlError::InvalidValue)
        );
        assert_eq!(state.dirty(), DirtyFlags::empty());

        state
            .bind_buffer_range(IndexedBufferTarget::Uniform, 1, buf(), 256, Some(64))
            .unwrap();
        assert_eq!(state.dirty(), DirtyFlags::UNIFORM_BUFFERS);
        assert_eq!(state.uniform_buffers()[1].offset, 256);
        assert!(state.buffer_binding(BufferTarget::Uniform).is_some());
    }

    #[test]
    fn framebuffer_binding_switches_formats() {
        let mut state = store();
        let fbo = state.gen_framebuffer();

        let formats = FramebufferFormats {
            color: [Some(ColorFormat::Rgba16Float), None, None, None],
            depth_stencil: None,
            sample_count: 1,
        };
        state.set_framebuffer_formats(fbo, formats).unwrap();
        state.clear_dirty();
        state.bind_framebuffer(FramebufferTarget::Draw, fbo).unwrap();
        assert_eq!(state.dirty(), DirtyFlags::FRAMEBUFFER);
        assert_eq!(*state.draw_framebuffer_formats(), formats);

        state.delete_framebuffer(fbo);
        assert_eq!(state.draw_framebuffer(), 0);
        assert_eq!(*state.draw_framebuffer_formats(), FramebufferFormats::default());
    }
}
