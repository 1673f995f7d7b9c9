//! Canonical, hashable projections of [`StateStore`] used as pipeline cache keys.
//!
//! Anything that does not influence the native object is collapsed to a fixed value before it
//! enters a descriptor (disabled attributes, blend factors of a disabled blend, depth state
//! without a depth attachment...), so equivalent GL states share one cache entry.

use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

use crate::backend::BackendCaps;
use crate::error::DrawError;
use crate::gl::{
    AttribType, CompareFunc, ColorFormat, DepthStencilFormat, Face, FrontFace, IndexType,
    PrimitiveMode, StencilOp,
};
use crate::shader::ProgramReflection;
use crate::share_group::{ObjectId, ProgramKey};
use crate::state::{
    AttributeSlot, BlendComponent, ColorMask, StateStore, StencilFaceState, MAX_DRAW_BUFFERS,
    MAX_VERTEX_ATTRIBS,
};
use crate::vertex_layout::{plan_vertex_streams, VertexBufferLayout, VertexStreamPlan};

/// Stable 64-bit content hash (XXH3) of a descriptor.
pub fn fingerprint<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = Xxh3::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
    /// Only produced for backends that advertise native fans.
    TriangleFan,
    /// Only produced for backends that advertise native line loops.
    LineLoop,
}

impl PrimitiveTopology {
    /// Topology a GL mode is drawn with. Fans and loops become lists unless the backend takes
    /// them directly.
    pub fn for_mode(mode: PrimitiveMode, caps: &BackendCaps) -> Self {
        match mode {
            PrimitiveMode::Points => Self::PointList,
            PrimitiveMode::Lines => Self::LineList,
            PrimitiveMode::LineStrip => Self::LineStrip,
            PrimitiveMode::LineLoop if caps.supports_line_loop => Self::LineLoop,
            PrimitiveMode::LineLoop => Self::LineList,
            PrimitiveMode::Triangles => Self::TriangleList,
            PrimitiveMode::TriangleStrip => Self::TriangleStrip,
            PrimitiveMode::TriangleFan if caps.supports_triangle_fan => Self::TriangleFan,
            PrimitiveMode::TriangleFan => Self::TriangleList,
        }
    }

    pub fn is_strip(self) -> bool {
        matches!(self, Self::LineStrip | Self::TriangleStrip | Self::TriangleFan | Self::LineLoop)
    }

    pub fn is_triangles(self) -> bool {
        matches!(self, Self::TriangleList | Self::TriangleStrip | Self::TriangleFan)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U8,
    U16,
    U32,
}

impl IndexFormat {
    /// Native format for GL indices of type `ty`; `u8` is widened where unsupported.
    pub fn native(ty: IndexType, caps: &BackendCaps) -> Self {
        match ty {
            IndexType::U8 if caps.supports_u8_indices => Self::U8,
            IndexType::U8 | IndexType::U16 => Self::U16,
            IndexType::U32 => Self::U32,
        }
    }

    pub const fn size(self) -> u64 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Per-slot attribute format as the pipeline sees it. Slots that are disabled or not read by
/// the program are [`AttributeDescriptor::UNUSED`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributeDescriptor {
    pub components: u8,
    pub component_type: Option<AttribType>,
    pub normalized: bool,
    pub integer: bool,
    pub stride: u32,
    pub divisor: u32,
}

impl AttributeDescriptor {
    pub const UNUSED: Self = Self {
        components: 0,
        component_type: None,
        normalized: false,
        integer: false,
        stride: 0,
        divisor: 0,
    };

    fn of(slot: &AttributeSlot) -> Self {
        Self {
            components: slot.components,
            component_type: Some(slot.component_type),
            normalized: slot.normalized,
            integer: slot.integer,
            stride: slot.effective_stride(),
            divisor: slot.divisor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendDescriptor {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    Front,
    Back,
}

/// Polygon offset. Floats are stored as bits so the descriptor stays `Eq + Hash`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DepthBias {
    pub constant: i32,
    slope_scale_bits: u32,
}

impl DepthBias {
    pub const NONE: Self = Self {
        constant: 0,
        slope_scale_bits: 0,
    };

    pub fn new(slope_scale: f32, constant: f32) -> Self {
        // -0.0 and NaN must not produce distinct keys.
        let slope_scale = if slope_scale == 0.0 || slope_scale.is_nan() {
            0.0
        } else {
            slope_scale
        };
        Self {
            constant: constant.round() as i32,
            slope_scale_bits: slope_scale.to_bits(),
        }
    }

    pub fn slope_scale(&self) -> f32 {
        f32::from_bits(self.slope_scale_bits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterizerDescriptor {
    pub cull_mode: Option<CullMode>,
    pub front_face: FrontFace,
    pub depth_bias: DepthBias,
    pub alpha_to_coverage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPipelineDescriptor {
    pub program: ProgramKey,
    /// Bound vertex-array object, `None` for the default attribute set.
    pub vertex_array: Option<ObjectId>,
    pub attributes: [AttributeDescriptor; MAX_VERTEX_ATTRIBS],
    pub vertex_buffers: Vec<VertexBufferLayout>,
    pub topology: PrimitiveTopology,
    /// Set for indexed strip draws with primitive restart enabled.
    pub strip_index_format: Option<IndexFormat>,
    pub instanced: bool,
    pub color_formats: [Option<ColorFormat>; MAX_DRAW_BUFFERS],
    pub depth_stencil_format: Option<DepthStencilFormat>,
    pub sample_count: u32,
    pub blend: Option<BlendDescriptor>,
    pub color_write_mask: ColorMask,
    pub rasterizer: RasterizerDescriptor,
}

impl RenderPipelineDescriptor {
    pub fn fingerprint(&self) -> u64 {
        fingerprint(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceDescriptor {
    pub compare: CompareFunc,
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub read_mask: u32,
    pub write_mask: u32,
}

impl StencilFaceDescriptor {
    fn of(face: &StencilFaceState) -> Self {
        // Only eight stencil bits exist in any supported format.
        Self {
            compare: face.func,
            fail: face.fail,
            depth_fail: face.depth_fail,
            pass: face.pass,
            read_mask: face.read_mask & 0xFF,
            write_mask: face.write_mask & 0xFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilDescriptor {
    pub front: StencilFaceDescriptor,
    pub back: StencilFaceDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilDescriptor {
    pub depth_test: bool,
    pub depth_compare: CompareFunc,
    pub depth_write: bool,
    pub stencil: Option<StencilDescriptor>,
}

impl DepthStencilDescriptor {
    pub const DISABLED: Self = Self {
        depth_test: false,
        depth_compare: CompareFunc::Always,
        depth_write: false,
        stencil: None,
    };

    pub fn fingerprint(&self) -> u64 {
        fingerprint(self)
    }
}

/// Shape of the draw being prepared; the parts of a draw call that reach the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawShape {
    pub mode: PrimitiveMode,
    pub index_type: Option<IndexType>,
    pub instanced: bool,
}

/// Projects a [`StateStore`] snapshot into descriptors. Pure: the same snapshot always yields
/// the same descriptors.
pub struct DescriptorBuilder<'a> {
    state: &'a StateStore,
    caps: &'a BackendCaps,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn new(state: &'a StateStore, caps: &'a BackendCaps) -> Self {
        Self { state, caps }
    }

    /// Builds the render pipeline descriptor along with the vertex stream plan its layouts were
    /// derived from.
    pub fn render_pipeline(
        &self,
        program: ProgramKey,
        reflection: &ProgramReflection,
        shape: &DrawShape,
    ) -> Result<(RenderPipelineDescriptor, VertexStreamPlan), DrawError> {
        let state = self.state;
        let vao = state.active_vertex_array();
        let slots = vao.attributes();

        let mut attributes = [AttributeDescriptor::UNUSED; MAX_VERTEX_ATTRIBS];
        for (location, slot) in slots.iter().enumerate().take(MAX_VERTEX_ATTRIBS) {
            if slot.enabled && reflection.consumes_attribute(location) {
                attributes[location] = AttributeDescriptor::of(slot);
            }
        }
        let plan = plan_vertex_streams(slots, reflection, self.caps)?;

        let topology = PrimitiveTopology::for_mode(shape.mode, self.caps);
        let strip_index_format = match shape.index_type {
            Some(ty) if topology.is_strip() && state.rasterizer().primitive_restart => {
                Some(IndexFormat::native(ty, self.caps))
            }
            _ => None,
        };

        let framebuffer = state.draw_framebuffer_formats();
        let has_color = framebuffer.color.iter().any(Option::is_some);
        let blend = state.blend();
        let blend = (blend.enabled && has_color).then(|| BlendDescriptor {
            color: blend.color.canonical(),
            alpha: blend.alpha.canonical(),
        });
        let color_write_mask = if has_color {
            state.color_mask()
        } else {
            ColorMask::ALL
        };

        let desc = RenderPipelineDescriptor {
            program,
            vertex_array: state.bound_vertex_array(),
            attributes,
            vertex_buffers: plan.layouts(),
            topology,
            strip_index_format,
            instanced: shape.instanced,
            color_formats: framebuffer.color,
            depth_stencil_format: framebuffer.depth_stencil,
            sample_count: framebuffer.sample_count,
            blend,
            color_write_mask,
            rasterizer: self.rasterizer(topology),
        };
        Ok((desc, plan))
    }

    fn rasterizer(&self, topology: PrimitiveTopology) -> RasterizerDescriptor {
        let raster = self.state.rasterizer();
        let framebuffer = self.state.draw_framebuffer_formats();
        let triangles = topology.is_triangles();

        let cull_mode = match raster.cull_face {
            _ if !(triangles && raster.cull_enabled) => None,
            Face::Front => Some(CullMode::Front),
            Face::Back => Some(CullMode::Back),
            // Handled by skipping the draw.
            Face::FrontAndBack => None,
        };
        let depth_bias = if triangles
            && raster.polygon_offset_fill
            && framebuffer.depth_stencil.is_some()
        {
            DepthBias::new(raster.polygon_offset_factor, raster.polygon_offset_units)
        } else {
            DepthBias::NONE
        };

        RasterizerDescriptor {
            cull_mode,
            front_face: if triangles {
                raster.front_face
            } else {
                FrontFace::Ccw
            },
            depth_bias,
            alpha_to_coverage: raster.alpha_to_coverage && framebuffer.sample_count > 1,
        }
    }

    pub fn depth_stencil(&self) -> DepthStencilDescriptor {
        let Some(format) = self.state.draw_framebuffer_formats().depth_stencil else {
            return DepthStencilDescriptor::DISABLED;
        };
        let ds = self.state.depth_stencil();

        let mut desc = DepthStencilDescriptor::DISABLED;
        if ds.depth_test {
            desc.depth_test = true;
            desc.depth_compare = ds.depth_func;
            desc.depth_write = ds.depth_write;
        }
        if ds.stencil_test && format.has_stencil() {
            desc.stencil = Some(StencilDescriptor {
                front: StencilFaceDescriptor::of(&ds.front),
                back: StencilFaceDescriptor::of(&ds.back),
            });
        }
        desc
    }
}

/// `glCullFace(GL_FRONT_AND_BACK)` with culling on discards every triangle of `mode`.
pub fn culls_everything(state: &StateStore, mode: PrimitiveMode) -> bool {
    let raster = state.rasterizer();
    raster.cull_enabled
        && raster.cull_face == Face::FrontAndBack
        && matches!(
            mode,
            PrimitiveMode::Triangles | PrimitiveMode::TriangleStrip | PrimitiveMode::TriangleFan
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gl::{self, BufferTarget};
    use crate::share_group::{ProgramRef, ShareGroup};
    use crate::shader::testing::DeclCompiler;
    use crate::state::{FramebufferFormats, StateChange, StateLimits};
    use std::sync::Arc;

    struct Fixture {
        group: Arc<ShareGroup>,
        program: ProgramRef,
        reflection: ProgramReflection,
    }

    fn fixture() -> Fixture {
        let group = ShareGroup::new(Box::new(DeclCompiler));
        let name = group.create_program("in 0 position\nin 1 uv", "").unwrap();
        let program: ProgramRef = group.acquire(name).unwrap();
        let reflection = group
            .lock()
            .program(program.key())
            .unwrap()
            .linked()
            .reflection
            .clone();
        Fixture {
            group,
            program,
            reflection,
        }
    }

    fn store() -> StateStore {
        StateStore::new(StateLimits::default(), FramebufferFormats::default(), (64, 64))
    }

    const TRIANGLES: DrawShape = DrawShape {
        mode: PrimitiveMode::Triangles,
        index_type: None,
        instanced: false,
    };

    fn bind_position(fx: &Fixture, state: &mut StateStore) {
        let buffer = fx.group.gen_buffer();
        fx.group
            .buffer_data(buffer, &[0; 64], gl::STATIC_DRAW)
            .unwrap();
        state.bind_buffer(BufferTarget::Array, Some(fx.group.acquire(buffer).unwrap()));
        state
            .vertex_attrib_pointer(0, 3, gl::FLOAT, false, false, 12, 0)
            .unwrap();
        state.enable_vertex_attrib(0, true).unwrap();
    }

    fn build(fx: &Fixture, state: &StateStore, shape: &DrawShape) -> RenderPipelineDescriptor {
        let caps = BackendCaps::default();
        DescriptorBuilder::new(state, &caps)
            .render_pipeline(fx.program.key(), &fx.reflection, shape)
            .unwrap()
            .0
    }

    #[test]
    fn disabled_attribute_contents_do_not_reach_the_descriptor() {
        let fx = fixture();
        let mut a = store();
        let mut b = store();
        bind_position(&fx, &mut a);
        bind_position(&fx, &mut b);

        // Slot 1 is read by the program but disabled; slot 7 is not read at all.
        b.vertex_attrib_pointer(1, 2, gl::SHORT, true, false, 32, 8)
            .unwrap();
        b.vertex_attrib_pointer(7, 4, gl::FLOAT, false, false, 0, 0)
            .unwrap();
        b.enable_vertex_attrib(7, true).unwrap();

        let da = build(&fx, &a, &TRIANGLES);
        let db = build(&fx, &b, &TRIANGLES);
        assert_eq!(da, db);
        assert_eq!(da.fingerprint(), db.fingerprint());
        assert_eq!(da.attributes[1], AttributeDescriptor::UNUSED);
    }

    #[test]
    fn dynamic_state_does_not_change_the_descriptor() {
        let fx = fixture();
        let mut state = store();
        bind_position(&fx, &mut state);
        let before = build(&fx, &state, &TRIANGLES);

        state
            .apply(StateChange::Viewport {
                x: 4,
                y: 4,
                width: 8,
                height: 8,
            })
            .unwrap();
        state.apply(StateChange::BlendColor([0.25; 4])).unwrap();
        state
            .apply(StateChange::StencilFunc {
                func: gl::ALWAYS,
                reference: 9,
                mask: !0,
            })
            .unwrap();
        assert_eq!(build(&fx, &state, &TRIANGLES), before);
    }

    #[test]
    fn blend_factors_are_canonicalized() {
        let fx = fixture();
        let mut state = store();
        bind_position(&fx, &mut state);

        // Factors of a disabled blend are irrelevant.
        let base = build(&fx, &state, &TRIANGLES);
        state
            .apply(StateChange::BlendFunc {
                src: gl::SRC_ALPHA,
                dst: gl::ONE_MINUS_SRC_ALPHA,
            })
            .unwrap();
        assert_eq!(build(&fx, &state, &TRIANGLES), base);

        // MIN/MAX ignore the factors.
        state.apply(StateChange::Enable(gl::BLEND)).unwrap();
        state.apply(StateChange::BlendEquation(gl::MAX)).unwrap();
        let with_alpha = build(&fx, &state, &TRIANGLES);
        state
            .apply(StateChange::BlendFunc {
                src: gl::ONE,
                dst: gl::ZERO,
            })
            .unwrap();
        assert_eq!(build(&fx, &state, &TRIANGLES), with_alpha);
        assert_ne!(with_alpha, base);
    }

    #[test]
    fn depth_state_collapses_without_a_test_or_attachment() {
        let mut state = store();
        let caps = BackendCaps::default();

        state.apply(StateChange::DepthFunc(gl::GREATER)).unwrap();
        state.apply(StateChange::DepthMask(false)).unwrap();
        assert_eq!(
            DescriptorBuilder::new(&state, &caps).depth_stencil(),
            DepthStencilDescriptor::DISABLED
        );

        state.apply(StateChange::Enable(gl::DEPTH_TEST)).unwrap();
        let desc = DescriptorBuilder::new(&state, &caps).depth_stencil();
        assert!(desc.depth_test);
        assert_eq!(desc.depth_compare, CompareFunc::Greater);
        assert!(!desc.depth_write);

        let fbo = state.gen_framebuffer();
        state
            .set_framebuffer_formats(
                fbo,
                FramebufferFormats {
                    color: [Some(ColorFormat::Rgba8Unorm), None, None, None],
                    depth_stencil: None,
                    sample_count: 1,
                },
            )
            .unwrap();
        state
            .bind_framebuffer(gl::FramebufferTarget::Both, fbo)
            .unwrap();
        assert_eq!(
            DescriptorBuilder::new(&state, &caps).depth_stencil(),
            DepthStencilDescriptor::DISABLED
        );
    }

    #[test]
    fn fans_become_lists_and_restart_sets_strip_format() {
        let fx = fixture();
        let mut state = store();
        bind_position(&fx, &mut state);

        let fan = build(
            &fx,
            &state,
            &DrawShape {
                mode: PrimitiveMode::TriangleFan,
                index_type: None,
                instanced: false,
            },
        );
        assert_eq!(fan.topology, PrimitiveTopology::TriangleList);

        let strip = DrawShape {
            mode: PrimitiveMode::TriangleStrip,
            index_type: Some(IndexType::U8),
            instanced: false,
        };
        assert_eq!(build(&fx, &state, &strip).strip_index_format, None);
        state
            .apply(StateChange::Enable(gl::PRIMITIVE_RESTART_FIXED_INDEX))
            .unwrap();
        assert_eq!(
            build(&fx, &state, &strip).strip_index_format,
            Some(IndexFormat::U16)
        );
    }

    #[test]
    fn cull_state_only_matters_for_triangles() {
        let fx = fixture();
        let mut state = store();
        bind_position(&fx, &mut state);
        let lines = DrawShape {
            mode: PrimitiveMode::Lines,
            index_type: None,
            instanced: false,
        };
        let before = build(&fx, &state, &lines);

        state.apply(StateChange::Enable(gl::CULL_FACE)).unwrap();
        state.apply(StateChange::FrontFace(gl::CW)).unwrap();
        assert_eq!(build(&fx, &state, &lines), before);
        assert_eq!(
            build(&fx, &state, &TRIANGLES).rasterizer.cull_mode,
            Some(CullMode::Back)
        );

        state.apply(StateChange::CullFace(gl::FRONT_AND_BACK)).unwrap();
        assert!(culls_everything(&state, PrimitiveMode::Triangles));
        assert!(!culls_everything(&state, PrimitiveMode::Points));
    }

    #[test]
    fn negative_zero_slope_hashes_like_zero() {
        assert_eq!(DepthBias::new(-0.0, 0.0), DepthBias::new(0.0, 0.0));
        assert_eq!(DepthBias::new(f32::NAN, 1.4).constant, 1);
    }
}
