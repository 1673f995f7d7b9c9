//! Capability traits the core drives a native GPU API through.
//!
//! The core never touches a native API directly: pipelines, buffers and command submission go
//! through [`PipelineBackend`], [`BufferBackend`] and [`CommandBackend`]. [`wgpu_backend`]
//! implements them on top of `wgpu`.

pub mod translate;
pub mod wgpu_backend;

use std::ops::Range;

use bitflags::bitflags;

use crate::descriptor::{DepthStencilDescriptor, IndexFormat, RenderPipelineDescriptor};
use crate::error::BackendError;
use crate::shader::LinkedProgram;
use crate::share_group::TextureKey;
use crate::state::{ScissorRect, Viewport};

pub use wgpu_backend::{WgpuBackend, WgpuRenderTarget};

/// Monotonic id of one submitted draw. `SubmissionId(0)` is "nothing submitted yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubmissionId(pub u64);

impl SubmissionId {
    pub const NONE: Self = Self(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativePipelineHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeDepthStencilHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufferUsageHint: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const COPY_DST = 1 << 3;
    }
}

impl BufferUsageHint {
    /// Resident copies of GL buffers may end up bound at any draw-time target.
    pub const ANY_DRAW: Self = Self::VERTEX
        .union(Self::INDEX)
        .union(Self::UNIFORM)
        .union(Self::COPY_DST);
}

/// What the native API can consume directly. Anything outside these limits is converted by
/// [`crate::staging::BufferStaging`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCaps {
    /// Required alignment of vertex strides, attribute offsets and vertex-buffer offsets.
    pub vertex_buffer_alignment: u32,
    pub max_vertex_buffers: u32,
    pub max_vertex_stride: u32,
    pub uniform_offset_alignment: u32,
    pub supports_u8_indices: bool,
    pub supports_triangle_fan: bool,
    pub supports_line_loop: bool,
    /// Instance divisors above one.
    pub supports_instance_divisor: bool,
}

impl Default for BackendCaps {
    fn default() -> Self {
        Self {
            vertex_buffer_alignment: 4,
            max_vertex_buffers: 8,
            max_vertex_stride: 2048,
            uniform_offset_alignment: 256,
            supports_u8_indices: false,
            supports_triangle_fan: false,
            supports_line_loop: false,
            supports_instance_divisor: false,
        }
    }
}

/// One native command of a draw submission.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCommand {
    SetPipeline(NativePipelineHandle),
    SetDepthStencil(NativeDepthStencilHandle),
    SetViewport(Viewport),
    /// `None` disables scissoring (the whole target is writable).
    SetScissor(Option<ScissorRect>),
    SetBlendConstant([f32; 4]),
    SetStencilReference(u32),
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    },
    SetUniformBuffer {
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    SetTexture {
        unit: u32,
        texture: Option<TextureKey>,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
}

impl RenderCommand {
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }
}

pub trait PipelineBackend {
    fn compile_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
        program: &LinkedProgram,
    ) -> Result<NativePipelineHandle, BackendError>;

    fn compile_depth_stencil(
        &mut self,
        desc: &DepthStencilDescriptor,
    ) -> Result<NativeDepthStencilHandle, BackendError>;

    fn destroy_pipeline(&mut self, handle: NativePipelineHandle);

    fn destroy_depth_stencil(&mut self, handle: NativeDepthStencilHandle);
}

pub trait BufferBackend {
    fn allocate_buffer(
        &mut self,
        size: u64,
        usage: BufferUsageHint,
    ) -> Result<BufferHandle, BackendError>;

    /// `offset` and `data.len()` are multiples of four.
    fn write_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn free_buffer(&mut self, handle: BufferHandle);
}

pub trait CommandBackend {
    /// Records and submits one draw. Commands only carry state that changed since the
    /// previous submission; the backend keeps everything else bound.
    fn submit_draw(
        &mut self,
        submission: SubmissionId,
        commands: &[RenderCommand],
    ) -> Result<(), BackendError>;

    /// Highest submission whose GPU work is known to be finished.
    fn completed_submission(&mut self) -> SubmissionId;
}

pub trait Backend: PipelineBackend + BufferBackend + CommandBackend {
    fn caps(&self) -> BackendCaps;
}
