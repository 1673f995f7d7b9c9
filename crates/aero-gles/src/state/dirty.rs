use bitflags::bitflags;

bitflags! {
    /// State categories changed since the last successful draw.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DirtyFlags: u32 {
        const PROGRAM = 1 << 0;
        /// Attribute formats, enables, divisors, source buffers or the bound vertex array.
        const VERTEX_INPUT = 1 << 1;
        const INDEX_BUFFER = 1 << 2;
        const BLEND = 1 << 3;
        const COLOR_MASK = 1 << 4;
        const DEPTH_STENCIL = 1 << 5;
        const RASTERIZER = 1 << 6;
        const FRAMEBUFFER = 1 << 7;
        const VIEWPORT = 1 << 8;
        const SCISSOR = 1 << 9;
        const BLEND_COLOR = 1 << 10;
        const STENCIL_REF = 1 << 11;
        const UNIFORM_BUFFERS = 1 << 12;
        const UNIFORMS = 1 << 13;
        const TEXTURES = 1 << 14;

        /// Categories baked into the render pipeline object.
        const PIPELINE = Self::PROGRAM.bits()
            | Self::VERTEX_INPUT.bits()
            | Self::BLEND.bits()
            | Self::COLOR_MASK.bits()
            | Self::RASTERIZER.bits()
            | Self::FRAMEBUFFER.bits();
        /// Categories baked into the depth/stencil object.
        const DEPTH_STENCIL_OBJECT = Self::DEPTH_STENCIL.bits() | Self::FRAMEBUFFER.bits();
    }
}
