use tracing::debug;

use crate::error::GlError;
use crate::gl::{CompareFunc, Face, FrontFace, StencilOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceState {
    pub func: CompareFunc,
    /// Reference value; dynamic state, not part of the depth/stencil object.
    pub reference: i32,
    pub read_mask: u32,
    pub write_mask: u32,
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            func: CompareFunc::Always,
            reference: 0,
            read_mask: !0,
            write_mask: !0,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_func: CompareFunc,
    pub depth_write: bool,
    pub stencil_test: bool,
    pub front: StencilFaceState,
    pub back: StencilFaceState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_func: CompareFunc::Less,
            depth_write: true,
            stencil_test: false,
            front: StencilFaceState::default(),
            back: StencilFaceState::default(),
        }
    }
}

impl DepthStencilState {
    /// Applies `f` to the stencil face(s) selected by `face`.
    pub(crate) fn update_faces(&mut self, face: Face, mut f: impl FnMut(&mut StencilFaceState)) {
        if matches!(face, Face::Front | Face::FrontAndBack) {
            f(&mut self.front);
        }
        if matches!(face, Face::Back | Face::FrontAndBack) {
            f(&mut self.back);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub cull_enabled: bool,
    pub cull_face: Face,
    pub front_face: FrontFace,
    pub polygon_offset_fill: bool,
    pub polygon_offset_factor: f32,
    pub polygon_offset_units: f32,
    pub rasterizer_discard: bool,
    pub primitive_restart: bool,
    pub alpha_to_coverage: bool,
    pub dither: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            cull_enabled: false,
            cull_face: Face::Back,
            front_face: FrontFace::Ccw,
            polygon_offset_fill: false,
            polygon_offset_factor: 0.0,
            polygon_offset_units: 0.0,
            rasterizer_discard: false,
            primitive_restart: false,
            alpha_to_coverage: false,
            dither: true,
        }
    }
}

pub(crate) fn parse_compare_func(value: u32) -> Result<CompareFunc, GlError> {
    CompareFunc::from_gl(value).ok_or_else(|| {
        debug!(value, "unknown compare func");
        GlError::InvalidEnum
    })
}

pub(crate) fn parse_stencil_op(value: u32) -> Result<StencilOp, GlError> {
    StencilOp::from_gl(value).ok_or_else(|| {
        debug!(value, "unknown stencil op");
        GlError::InvalidEnum
    })
}

pub(crate) fn parse_face(value: u32) -> Result<Face, GlError> {
    Face::from_gl(value).ok_or_else(|| {
        debug!(value, "unknown face");
        GlError::InvalidEnum
    })
}
