//! Raw GLES 3.0 enum values and the typed enums the state layer stores.
//!
//! The thin API layer hands us raw `GLenum` values; everything past [`crate::state::StateStore`]
//! only sees the typed forms below.

pub const NO_ERROR: u32 = 0;
pub const INVALID_ENUM: u32 = 0x0500;
pub const INVALID_VALUE: u32 = 0x0501;
pub const INVALID_OPERATION: u32 = 0x0502;
pub const OUT_OF_MEMORY: u32 = 0x0505;
pub const INVALID_FRAMEBUFFER_OPERATION: u32 = 0x0506;

pub const POINTS: u32 = 0x0000;
pub const LINES: u32 = 0x0001;
pub const LINE_LOOP: u32 = 0x0002;
pub const LINE_STRIP: u32 = 0x0003;
pub const TRIANGLES: u32 = 0x0004;
pub const TRIANGLE_STRIP: u32 = 0x0005;
pub const TRIANGLE_FAN: u32 = 0x0006;

pub const BYTE: u32 = 0x1400;
pub const UNSIGNED_BYTE: u32 = 0x1401;
pub const SHORT: u32 = 0x1402;
pub const UNSIGNED_SHORT: u32 = 0x1403;
pub const INT: u32 = 0x1404;
pub const UNSIGNED_INT: u32 = 0x1405;
pub const FLOAT: u32 = 0x1406;
pub const HALF_FLOAT: u32 = 0x140B;
pub const FIXED: u32 = 0x140C;
pub const INT_2_10_10_10_REV: u32 = 0x8D9F;
pub const UNSIGNED_INT_2_10_10_10_REV: u32 = 0x8368;

pub const NEVER: u32 = 0x0200;
pub const LESS: u32 = 0x0201;
pub const EQUAL: u32 = 0x0202;
pub const LEQUAL: u32 = 0x0203;
pub const GREATER: u32 = 0x0204;
pub const NOTEQUAL: u32 = 0x0205;
pub const GEQUAL: u32 = 0x0206;
pub const ALWAYS: u32 = 0x0207;

pub const ZERO: u32 = 0;
pub const ONE: u32 = 1;
pub const KEEP: u32 = 0x1E00;
pub const REPLACE: u32 = 0x1E01;
pub const INCR: u32 = 0x1E02;
pub const DECR: u32 = 0x1E03;
pub const INVERT: u32 = 0x150A;
pub const INCR_WRAP: u32 = 0x8507;
pub const DECR_WRAP: u32 = 0x8508;

pub const SRC_COLOR: u32 = 0x0300;
pub const ONE_MINUS_SRC_COLOR: u32 = 0x0301;
pub const SRC_ALPHA: u32 = 0x0302;
pub const ONE_MINUS_SRC_ALPHA: u32 = 0x0303;
pub const DST_ALPHA: u32 = 0x0304;
pub const ONE_MINUS_DST_ALPHA: u32 = 0x0305;
pub const DST_COLOR: u32 = 0x0306;
pub const ONE_MINUS_DST_COLOR: u32 = 0x0307;
pub const SRC_ALPHA_SATURATE: u32 = 0x0308;
pub const CONSTANT_COLOR: u32 = 0x8001;
pub const ONE_MINUS_CONSTANT_COLOR: u32 = 0x8002;
pub const CONSTANT_ALPHA: u32 = 0x8003;
pub const ONE_MINUS_CONSTANT_ALPHA: u32 = 0x8004;

pub const FUNC_ADD: u32 = 0x8006;
pub const MIN: u32 = 0x8007;
pub const MAX: u32 = 0x8008;
pub const FUNC_SUBTRACT: u32 = 0x800A;
pub const FUNC_REVERSE_SUBTRACT: u32 = 0x800B;

pub const FRONT: u32 = 0x0404;
pub const BACK: u32 = 0x0405;
pub const FRONT_AND_BACK: u32 = 0x0408;
pub const CW: u32 = 0x0900;
pub const CCW: u32 = 0x0901;

pub const BLEND: u32 = 0x0BE2;
pub const CULL_FACE: u32 = 0x0B44;
pub const DEPTH_TEST: u32 = 0x0B71;
pub const STENCIL_TEST: u32 = 0x0B90;
pub const SCISSOR_TEST: u32 = 0x0C11;
pub const POLYGON_OFFSET_FILL: u32 = 0x8037;
pub const SAMPLE_ALPHA_TO_COVERAGE: u32 = 0x809E;
pub const RASTERIZER_DISCARD: u32 = 0x8C89;
pub const PRIMITIVE_RESTART_FIXED_INDEX: u32 = 0x8D69;
pub const DITHER: u32 = 0x0BD0;

pub const ARRAY_BUFFER: u32 = 0x8892;
pub const ELEMENT_ARRAY_BUFFER: u32 = 0x8893;
pub const PIXEL_PACK_BUFFER: u32 = 0x88EB;
pub const PIXEL_UNPACK_BUFFER: u32 = 0x88EC;
pub const UNIFORM_BUFFER: u32 = 0x8A11;
pub const TRANSFORM_FEEDBACK_BUFFER: u32 = 0x8C8E;
pub const COPY_READ_BUFFER: u32 = 0x8F36;
pub const COPY_WRITE_BUFFER: u32 = 0x8F37;

pub const TEXTURE_2D: u32 = 0x0DE1;
pub const TEXTURE_3D: u32 = 0x806F;
pub const TEXTURE_CUBE_MAP: u32 = 0x8513;
pub const TEXTURE_2D_ARRAY: u32 = 0x8C1A;
pub const TEXTURE0: u32 = 0x84C0;

pub const FRAMEBUFFER: u32 = 0x8D40;
pub const READ_FRAMEBUFFER: u32 = 0x8CA8;
pub const DRAW_FRAMEBUFFER: u32 = 0x8CA9;

pub const STREAM_DRAW: u32 = 0x88E0;
pub const STREAM_READ: u32 = 0x88E1;
pub const STREAM_COPY: u32 = 0x88E2;
pub const STATIC_DRAW: u32 = 0x88E4;
pub const STATIC_READ: u32 = 0x88E5;
pub const STATIC_COPY: u32 = 0x88E6;
pub const DYNAMIC_DRAW: u32 = 0x88E8;
pub const DYNAMIC_READ: u32 = 0x88E9;
pub const DYNAMIC_COPY: u32 = 0x88EA;

pub const R8: u32 = 0x8229;
pub const RG8: u32 = 0x822B;
pub const RGBA8: u32 = 0x8058;
pub const RGB10_A2: u32 = 0x8059;
pub const SRGB8_ALPHA8: u32 = 0x8C43;
pub const RGBA16F: u32 = 0x881A;
pub const RGBA32F: u32 = 0x8814;
pub const BGRA8_EXT: u32 = 0x93A1;
pub const DEPTH_COMPONENT16: u32 = 0x81A5;
pub const DEPTH_COMPONENT24: u32 = 0x81A6;
pub const DEPTH_COMPONENT32F: u32 = 0x8CAC;
pub const DEPTH24_STENCIL8: u32 = 0x88F0;
pub const DEPTH32F_STENCIL8: u32 = 0x8CAD;

/// Declares a typed enum with a fallible `from_gl` and an infallible `to_gl`.
macro_rules! gl_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = $value:path,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn from_gl(value: u32) -> Option<Self> {
                match value {
                    $(v if v == $value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn to_gl(self) -> u32 {
                match self {
                    $(Self::$variant => $value,)+
                }
            }
        }
    };
}

gl_enum! {
    pub enum PrimitiveMode {
        Points = POINTS,
        Lines = LINES,
        LineLoop = LINE_LOOP,
        LineStrip = LINE_STRIP,
        Triangles = TRIANGLES,
        TriangleStrip = TRIANGLE_STRIP,
        TriangleFan = TRIANGLE_FAN,
    }
}

impl PrimitiveMode {
    pub fn is_strip(self) -> bool {
        matches!(self, Self::LineStrip | Self::TriangleStrip)
    }
}

gl_enum! {
    pub enum IndexType {
        U8 = UNSIGNED_BYTE,
        U16 = UNSIGNED_SHORT,
        U32 = UNSIGNED_INT,
    }
}

impl IndexType {
    pub const fn size(self) -> u64 {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// The fixed restart index used by `GL_PRIMITIVE_RESTART_FIXED_INDEX`.
    pub const fn restart_index(self) -> u32 {
        match self {
            Self::U8 => 0xFF,
            Self::U16 => 0xFFFF,
            Self::U32 => 0xFFFF_FFFF,
        }
    }
}

gl_enum! {
    /// Component type passed to `glVertexAttribPointer` / `glVertexAttribIPointer`.
    pub enum AttribType {
        Byte = BYTE,
        UnsignedByte = UNSIGNED_BYTE,
        Short = SHORT,
        UnsignedShort = UNSIGNED_SHORT,
        Int = INT,
        UnsignedInt = UNSIGNED_INT,
        Float = FLOAT,
        HalfFloat = HALF_FLOAT,
        Fixed = FIXED,
        Int2101010Rev = INT_2_10_10_10_REV,
        UnsignedInt2101010Rev = UNSIGNED_INT_2_10_10_10_REV,
    }
}

impl AttribType {
    /// Size of one component in bytes. Packed types report the size of the whole element.
    pub const fn component_size(self) -> u32 {
        match self {
            Self::Byte | Self::UnsignedByte => 1,
            Self::Short | Self::UnsignedShort | Self::HalfFloat => 2,
            Self::Int | Self::UnsignedInt | Self::Float | Self::Fixed => 4,
            Self::Int2101010Rev | Self::UnsignedInt2101010Rev => 4,
        }
    }

    pub const fn is_packed(self) -> bool {
        matches!(self, Self::Int2101010Rev | Self::UnsignedInt2101010Rev)
    }

    /// Types accepted by `glVertexAttribIPointer`.
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Byte
                | Self::UnsignedByte
                | Self::Short
                | Self::UnsignedShort
                | Self::Int
                | Self::UnsignedInt
        )
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Byte | Self::Short | Self::Int | Self::Fixed | Self::Int2101010Rev
        )
    }
}

gl_enum! {
    pub enum CompareFunc {
        Never = NEVER,
        Less = LESS,
        Equal = EQUAL,
        LessEqual = LEQUAL,
        Greater = GREATER,
        NotEqual = NOTEQUAL,
        GreaterEqual = GEQUAL,
        Always = ALWAYS,
    }
}

gl_enum! {
    pub enum StencilOp {
        Keep = KEEP,
        Zero = ZERO,
        Replace = REPLACE,
        IncrementClamp = INCR,
        DecrementClamp = DECR,
        Invert = INVERT,
        IncrementWrap = INCR_WRAP,
        DecrementWrap = DECR_WRAP,
    }
}

gl_enum! {
    pub enum BlendFactor {
        Zero = ZERO,
        One = ONE,
        SrcColor = SRC_COLOR,
        OneMinusSrcColor = ONE_MINUS_SRC_COLOR,
        SrcAlpha = SRC_ALPHA,
        OneMinusSrcAlpha = ONE_MINUS_SRC_ALPHA,
        DstAlpha = DST_ALPHA,
        OneMinusDstAlpha = ONE_MINUS_DST_ALPHA,
        DstColor = DST_COLOR,
        OneMinusDstColor = ONE_MINUS_DST_COLOR,
        SrcAlphaSaturate = SRC_ALPHA_SATURATE,
        ConstantColor = CONSTANT_COLOR,
        OneMinusConstantColor = ONE_MINUS_CONSTANT_COLOR,
        ConstantAlpha = CONSTANT_ALPHA,
        OneMinusConstantAlpha = ONE_MINUS_CONSTANT_ALPHA,
    }
}

gl_enum! {
    pub enum BlendEquation {
        Add = FUNC_ADD,
        Subtract = FUNC_SUBTRACT,
        ReverseSubtract = FUNC_REVERSE_SUBTRACT,
        Min = MIN,
        Max = MAX,
    }
}

gl_enum! {
    /// Face selector for `glCullFace` and the `*Separate` stencil setters.
    pub enum Face {
        Front = FRONT,
        Back = BACK,
        FrontAndBack = FRONT_AND_BACK,
    }
}

gl_enum! {
    pub enum FrontFace {
        Cw = CW,
        Ccw = CCW,
    }
}

gl_enum! {
    pub enum Capability {
        Blend = BLEND,
        CullFace = CULL_FACE,
        DepthTest = DEPTH_TEST,
        StencilTest = STENCIL_TEST,
        ScissorTest = SCISSOR_TEST,
        PolygonOffsetFill = POLYGON_OFFSET_FILL,
        SampleAlphaToCoverage = SAMPLE_ALPHA_TO_COVERAGE,
        RasterizerDiscard = RASTERIZER_DISCARD,
        PrimitiveRestartFixedIndex = PRIMITIVE_RESTART_FIXED_INDEX,
        Dither = DITHER,
    }
}

gl_enum! {
    pub enum BufferTarget {
        Array = ARRAY_BUFFER,
        ElementArray = ELEMENT_ARRAY_BUFFER,
        PixelPack = PIXEL_PACK_BUFFER,
        PixelUnpack = PIXEL_UNPACK_BUFFER,
        Uniform = UNIFORM_BUFFER,
        TransformFeedback = TRANSFORM_FEEDBACK_BUFFER,
        CopyRead = COPY_READ_BUFFER,
        CopyWrite = COPY_WRITE_BUFFER,
    }
}

gl_enum! {
    /// Targets with an indexed binding table (`glBindBufferRange` / `glBindBufferBase`).
    pub enum IndexedBufferTarget {
        Uniform = UNIFORM_BUFFER,
        TransformFeedback = TRANSFORM_FEEDBACK_BUFFER,
    }
}

gl_enum! {
    pub enum TextureTarget {
        Texture2d = TEXTURE_2D,
        Texture3d = TEXTURE_3D,
        Texture2dArray = TEXTURE_2D_ARRAY,
        TextureCubeMap = TEXTURE_CUBE_MAP,
    }
}

gl_enum! {
    pub enum FramebufferTarget {
        Both = FRAMEBUFFER,
        Draw = DRAW_FRAMEBUFFER,
        Read = READ_FRAMEBUFFER,
    }
}

gl_enum! {
    pub enum BufferUsage {
        StreamDraw = STREAM_DRAW,
        StreamRead = STREAM_READ,
        StreamCopy = STREAM_COPY,
        StaticDraw = STATIC_DRAW,
        StaticRead = STATIC_READ,
        StaticCopy = STATIC_COPY,
        DynamicDraw = DYNAMIC_DRAW,
        DynamicRead = DYNAMIC_READ,
        DynamicCopy = DYNAMIC_COPY,
    }
}

impl BufferUsage {
    /// Usage hints that announce frequent respecification.
    pub fn is_dynamic(self) -> bool {
        !matches!(
            self,
            Self::StaticDraw | Self::StaticRead | Self::StaticCopy
        )
    }
}

gl_enum! {
    /// Color attachment formats the pipeline layer understands.
    pub enum ColorFormat {
        R8Unorm = R8,
        Rg8Unorm = RG8,
        Rgba8Unorm = RGBA8,
        Rgba8UnormSrgb = SRGB8_ALPHA8,
        Bgra8Unorm = BGRA8_EXT,
        Rgb10a2Unorm = RGB10_A2,
        Rgba16Float = RGBA16F,
        Rgba32Float = RGBA32F,
    }
}

impl ColorFormat {
    /// Float32 targets cannot blend without an optional feature on most backends.
    pub fn is_blendable(self) -> bool {
        !matches!(self, Self::Rgba32Float)
    }
}

gl_enum! {
    pub enum DepthStencilFormat {
        Depth16Unorm = DEPTH_COMPONENT16,
        Depth24Plus = DEPTH_COMPONENT24,
        Depth24PlusStencil8 = DEPTH24_STENCIL8,
        Depth32Float = DEPTH_COMPONENT32F,
        Depth32FloatStencil8 = DEPTH32F_STENCIL8,
    }
}

impl DepthStencilFormat {
    pub fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Depth32FloatStencil8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_gl_values() {
        assert_eq!(PrimitiveMode::from_gl(TRIANGLE_FAN), Some(PrimitiveMode::TriangleFan));
        assert_eq!(PrimitiveMode::from_gl(0x0007), None);
        assert_eq!(CompareFunc::from_gl(LEQUAL), Some(CompareFunc::LessEqual));
        assert_eq!(CompareFunc::LessEqual.to_gl(), LEQUAL);
        // `GL_ZERO` is valid both as a stencil op and as a blend factor.
        assert_eq!(StencilOp::from_gl(ZERO), Some(StencilOp::Zero));
        assert_eq!(BlendFactor::from_gl(ZERO), Some(BlendFactor::Zero));
        assert_eq!(IndexType::from_gl(UNSIGNED_BYTE), Some(IndexType::U8));
        assert_eq!(IndexType::from_gl(BYTE), None);
    }

    #[test]
    fn restart_index_matches_width() {
        assert_eq!(IndexType::U8.restart_index(), 0xFF);
        assert_eq!(IndexType::U16.restart_index(), 0xFFFF);
        assert_eq!(IndexType::U32.restart_index(), u32::MAX);
    }
}
