//! Descriptor and GL enum translation to `wgpu` types.

use tracing::debug;

use crate::backend::BufferUsageHint;
use crate::descriptor::{
    BlendDescriptor, CullMode, DepthBias, IndexFormat, PrimitiveTopology, StencilDescriptor,
    StencilFaceDescriptor,
};
use crate::error::BackendError;
use crate::gl::{
    BlendEquation, BlendFactor, ColorFormat, CompareFunc, DepthStencilFormat, FrontFace, StencilOp,
};
use crate::state::{BlendComponent, ColorMask};
use crate::vertex_layout::{VertexFormat, VertexStepMode};

pub fn map_primitive_topology(
    topology: PrimitiveTopology,
) -> Result<wgpu::PrimitiveTopology, BackendError> {
    Ok(match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
        PrimitiveTopology::TriangleFan => return Err(BackendError::Unsupported("triangle fans")),
        PrimitiveTopology::LineLoop => return Err(BackendError::Unsupported("line loops")),
    })
}

pub fn map_index_format(format: IndexFormat) -> Result<wgpu::IndexFormat, BackendError> {
    match format {
        IndexFormat::U8 => Err(BackendError::Unsupported("8-bit indices")),
        IndexFormat::U16 => Ok(wgpu::IndexFormat::Uint16),
        IndexFormat::U32 => Ok(wgpu::IndexFormat::Uint32),
    }
}

pub fn map_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Uint8x2 => wgpu::VertexFormat::Uint8x2,
        VertexFormat::Uint8x4 => wgpu::VertexFormat::Uint8x4,
        VertexFormat::Sint8x2 => wgpu::VertexFormat::Sint8x2,
        VertexFormat::Sint8x4 => wgpu::VertexFormat::Sint8x4,
        VertexFormat::Unorm8x2 => wgpu::VertexFormat::Unorm8x2,
        VertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
        VertexFormat::Snorm8x2 => wgpu::VertexFormat::Snorm8x2,
        VertexFormat::Snorm8x4 => wgpu::VertexFormat::Snorm8x4,
        VertexFormat::Uint16x2 => wgpu::VertexFormat::Uint16x2,
        VertexFormat::Uint16x4 => wgpu::VertexFormat::Uint16x4,
        VertexFormat::Sint16x2 => wgpu::VertexFormat::Sint16x2,
        VertexFormat::Sint16x4 => wgpu::VertexFormat::Sint16x4,
        VertexFormat::Unorm16x2 => wgpu::VertexFormat::Unorm16x2,
        VertexFormat::Unorm16x4 => wgpu::VertexFormat::Unorm16x4,
        VertexFormat::Snorm16x2 => wgpu::VertexFormat::Snorm16x2,
        VertexFormat::Snorm16x4 => wgpu::VertexFormat::Snorm16x4,
        VertexFormat::Float16x2 => wgpu::VertexFormat::Float16x2,
        VertexFormat::Float16x4 => wgpu::VertexFormat::Float16x4,
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        VertexFormat::Uint32x2 => wgpu::VertexFormat::Uint32x2,
        VertexFormat::Uint32x3 => wgpu::VertexFormat::Uint32x3,
        VertexFormat::Uint32x4 => wgpu::VertexFormat::Uint32x4,
        VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
        VertexFormat::Sint32x2 => wgpu::VertexFormat::Sint32x2,
        VertexFormat::Sint32x3 => wgpu::VertexFormat::Sint32x3,
        VertexFormat::Sint32x4 => wgpu::VertexFormat::Sint32x4,
        VertexFormat::Unorm10_10_10_2 => wgpu::VertexFormat::Unorm10_10_10_2,
    }
}

pub fn map_step_mode(mode: VertexStepMode) -> wgpu::VertexStepMode {
    match mode {
        VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
        VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
    }
}

pub fn map_compare_func(func: CompareFunc) -> wgpu::CompareFunction {
    match func {
        CompareFunc::Never => wgpu::CompareFunction::Never,
        CompareFunc::Less => wgpu::CompareFunction::Less,
        CompareFunc::Equal => wgpu::CompareFunction::Equal,
        CompareFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunc::Greater => wgpu::CompareFunction::Greater,
        CompareFunc::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunc::Always => wgpu::CompareFunction::Always,
    }
}

pub fn map_stencil_op(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOp::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
        StencilOp::Invert => wgpu::StencilOperation::Invert,
        StencilOp::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
        StencilOp::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
    }
}

fn map_stencil_face(face: &StencilFaceDescriptor) -> wgpu::StencilFaceState {
    wgpu::StencilFaceState {
        compare: map_compare_func(face.compare),
        fail_op: map_stencil_op(face.fail),
        depth_fail_op: map_stencil_op(face.depth_fail),
        pass_op: map_stencil_op(face.pass),
    }
}

/// WebGPU has one read/write mask for both faces; the front-face masks win.
pub fn map_stencil_state(stencil: &StencilDescriptor) -> wgpu::StencilState {
    if stencil.front.read_mask != stencil.back.read_mask
        || stencil.front.write_mask != stencil.back.write_mask
    {
        debug!(
            front_read = stencil.front.read_mask,
            back_read = stencil.back.read_mask,
            front_write = stencil.front.write_mask,
            back_write = stencil.back.write_mask,
            "separate back-face stencil masks collapsed to front-face masks"
        );
    }
    wgpu::StencilState {
        front: map_stencil_face(&stencil.front),
        back: map_stencil_face(&stencil.back),
        read_mask: stencil.front.read_mask,
        write_mask: stencil.front.write_mask,
    }
}

pub fn map_depth_bias(bias: DepthBias) -> wgpu::DepthBiasState {
    wgpu::DepthBiasState {
        constant: bias.constant,
        slope_scale: bias.slope_scale(),
        clamp: 0.0,
    }
}

/// `alpha` selects the alpha-channel reading of color factors, where `GL_SRC_COLOR` and
/// `GL_SRC_ALPHA` coincide.
pub fn map_blend_factor(
    factor: BlendFactor,
    alpha: bool,
) -> Result<wgpu::BlendFactor, BackendError> {
    Ok(match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        BlendFactor::SrcAlphaSaturate => wgpu::BlendFactor::SrcAlphaSaturated,
        BlendFactor::ConstantColor => wgpu::BlendFactor::Constant,
        BlendFactor::OneMinusConstantColor => wgpu::BlendFactor::OneMinusConstant,
        BlendFactor::ConstantAlpha if alpha => wgpu::BlendFactor::Constant,
        BlendFactor::OneMinusConstantAlpha if alpha => wgpu::BlendFactor::OneMinusConstant,
        BlendFactor::ConstantAlpha | BlendFactor::OneMinusConstantAlpha => {
            return Err(BackendError::Unsupported(
                "constant-alpha blend factor on color channels",
            ))
        }
    })
}

pub fn map_blend_equation(equation: BlendEquation) -> wgpu::BlendOperation {
    match equation {
        BlendEquation::Add => wgpu::BlendOperation::Add,
        BlendEquation::Subtract => wgpu::BlendOperation::Subtract,
        BlendEquation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendEquation::Min => wgpu::BlendOperation::Min,
        BlendEquation::Max => wgpu::BlendOperation::Max,
    }
}

fn map_blend_component(
    component: &BlendComponent,
    alpha: bool,
) -> Result<wgpu::BlendComponent, BackendError> {
    Ok(wgpu::BlendComponent {
        src_factor: map_blend_factor(component.src, alpha)?,
        dst_factor: map_blend_factor(component.dst, alpha)?,
        operation: map_blend_equation(component.equation),
    })
}

pub fn map_blend(blend: &BlendDescriptor) -> Result<wgpu::BlendState, BackendError> {
    Ok(wgpu::BlendState {
        color: map_blend_component(&blend.color, false)?,
        alpha: map_blend_component(&blend.alpha, true)?,
    })
}

pub fn map_color_writes(mask: ColorMask) -> wgpu::ColorWrites {
    let mut writes = wgpu::ColorWrites::empty();
    if mask.red {
        writes |= wgpu::ColorWrites::RED;
    }
    if mask.green {
        writes |= wgpu::ColorWrites::GREEN;
    }
    if mask.blue {
        writes |= wgpu::ColorWrites::BLUE;
    }
    if mask.alpha {
        writes |= wgpu::ColorWrites::ALPHA;
    }
    writes
}

pub fn map_cull_mode(mode: Option<CullMode>) -> Option<wgpu::Face> {
    mode.map(|mode| match mode {
        CullMode::Front => wgpu::Face::Front,
        CullMode::Back => wgpu::Face::Back,
    })
}

pub fn map_front_face(face: FrontFace) -> wgpu::FrontFace {
    match face {
        FrontFace::Ccw => wgpu::FrontFace::Ccw,
        FrontFace::Cw => wgpu::FrontFace::Cw,
    }
}

pub fn map_color_format(format: ColorFormat) -> wgpu::TextureFormat {
    match format {
        ColorFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        ColorFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        ColorFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        ColorFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        ColorFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        ColorFormat::Rgb10a2Unorm => wgpu::TextureFormat::Rgb10a2Unorm,
        ColorFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        ColorFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

pub fn map_depth_stencil_format(format: DepthStencilFormat) -> wgpu::TextureFormat {
    match format {
        DepthStencilFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
        DepthStencilFormat::Depth24Plus => wgpu::TextureFormat::Depth24Plus,
        DepthStencilFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        DepthStencilFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        DepthStencilFormat::Depth32FloatStencil8 => wgpu::TextureFormat::Depth32FloatStencil8,
    }
}

pub fn map_buffer_usages(usage: BufferUsageHint) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::empty();
    if usage.contains(BufferUsageHint::VERTEX) {
        out |= wgpu::BufferUsages::VERTEX;
    }
    if usage.contains(BufferUsageHint::INDEX) {
        out |= wgpu::BufferUsages::INDEX;
    }
    if usage.contains(BufferUsageHint::UNIFORM) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsageHint::COPY_DST) {
        out |= wgpu::BufferUsages::COPY_DST;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_and_loops_are_not_native_topologies() {
        assert_eq!(
            map_primitive_topology(PrimitiveTopology::TriangleStrip).unwrap(),
            wgpu::PrimitiveTopology::TriangleStrip
        );
        assert!(matches!(
            map_primitive_topology(PrimitiveTopology::TriangleFan),
            Err(BackendError::Unsupported(_))
        ));
        assert!(map_primitive_topology(PrimitiveTopology::LineLoop).is_err());
        assert!(map_index_format(IndexFormat::U8).is_err());
        assert_eq!(
            map_index_format(IndexFormat::U16).unwrap(),
            wgpu::IndexFormat::Uint16
        );
    }

    #[test]
    fn constant_alpha_only_maps_on_the_alpha_channel() {
        assert_eq!(
            map_blend_factor(BlendFactor::ConstantAlpha, true).unwrap(),
            wgpu::BlendFactor::Constant
        );
        assert!(map_blend_factor(BlendFactor::ConstantAlpha, false).is_err());

        let blend = BlendDescriptor {
            color: BlendComponent {
                src: BlendFactor::SrcAlpha,
                dst: BlendFactor::OneMinusSrcAlpha,
                equation: BlendEquation::Add,
            },
            alpha: BlendComponent::REPLACE,
        };
        assert_eq!(
            map_blend(&blend).unwrap(),
            wgpu::BlendState {
                color: wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::SrcAlpha,
                    dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
                    operation: wgpu::BlendOperation::Add,
                },
                alpha: wgpu::BlendComponent::REPLACE,
            }
        );
    }

    #[test]
    fn color_mask_maps_per_channel() {
        let mask = ColorMask::from_array([true, false, true, false]);
        assert_eq!(
            map_color_writes(mask),
            wgpu::ColorWrites::RED | wgpu::ColorWrites::BLUE
        );
        assert_eq!(map_color_writes(ColorMask::ALL), wgpu::ColorWrites::ALL);
    }

    #[test]
    fn stencil_masks_follow_the_front_face() {
        let face = |read_mask, write_mask| StencilFaceDescriptor {
            compare: CompareFunc::Equal,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::IncrementWrap,
            pass: StencilOp::Replace,
            read_mask,
            write_mask,
        };
        let state = map_stencil_state(&StencilDescriptor {
            front: face(0x0F, 0xFF),
            back: face(0xF0, 0x00),
        });
        assert_eq!(state.read_mask, 0x0F);
        assert_eq!(state.write_mask, 0xFF);
        assert_eq!(state.back.depth_fail_op, wgpu::StencilOperation::IncrementWrap);
        assert_eq!(state.front.compare, wgpu::CompareFunction::Equal);
    }

    #[test]
    fn any_draw_usage_covers_every_binding_point() {
        assert_eq!(
            map_buffer_usages(BufferUsageHint::ANY_DRAW),
            wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::INDEX
                | wgpu::BufferUsages::UNIFORM
                | wgpu::BufferUsages::COPY_DST
        );
    }
}
