use thiserror::Error;

use crate::gl;

/// GL-visible error codes reported through `glGetError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum GlError {
    #[error("GL_INVALID_ENUM")]
    InvalidEnum,
    #[error("GL_INVALID_VALUE")]
    InvalidValue,
    #[error("GL_INVALID_OPERATION")]
    InvalidOperation,
    #[error("GL_OUT_OF_MEMORY")]
    OutOfMemory,
    #[error("GL_INVALID_FRAMEBUFFER_OPERATION")]
    InvalidFramebufferOperation,
}

impl GlError {
    pub const fn to_gl(self) -> u32 {
        match self {
            Self::InvalidEnum => gl::INVALID_ENUM,
            Self::InvalidValue => gl::INVALID_VALUE,
            Self::InvalidOperation => gl::INVALID_OPERATION,
            Self::OutOfMemory => gl::OUT_OF_MEMORY,
            Self::InvalidFramebufferOperation => gl::INVALID_FRAMEBUFFER_OPERATION,
        }
    }
}

/// Sticky error latch. The first recorded error is kept until it is read; everything recorded
/// while an error is pending is dropped.
#[derive(Debug, Default, Clone)]
pub struct ErrorState {
    latched: Option<GlError>,
}

impl ErrorState {
    /// Returns `true` if `err` was latched.
    pub fn record(&mut self, err: GlError) -> bool {
        if self.latched.is_some() {
            return false;
        }
        self.latched = Some(err);
        true
    }

    pub fn peek(&self) -> Option<GlError> {
        self.latched
    }

    /// Returns the latched code (or `GL_NO_ERROR`) and clears the latch.
    pub fn take(&mut self) -> u32 {
        self.latched.take().map_or(gl::NO_ERROR, GlError::to_gl)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("pipeline compilation failed: {0}")]
    CompileFailed(String),
    #[error("backend allocation of {requested} bytes failed")]
    OutOfMemory { requested: u64 },
    #[error("unknown {0} handle {1}")]
    UnknownHandle(&'static str, u64),
    #[error("unsupported by backend: {0}")]
    Unsupported(&'static str),
    #[error("device error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StagingError {
    #[error("staging allocation of {requested} bytes failed")]
    OutOfMemory { requested: u64 },
    #[error("ring scratch region exhausted (requested {requested} bytes, {remaining} remaining)")]
    RingOutOfSpace { requested: u64, remaining: u64 },
    #[error("index range {offset}+{len} exceeds buffer size {buffer_len}")]
    IndexRangeOutOfBounds {
        offset: u64,
        len: u64,
        buffer_len: u64,
    },
    #[error("vertex range {offset}+{len} exceeds buffer size {buffer_len}")]
    VertexRangeOutOfBounds {
        offset: u64,
        len: u64,
        buffer_len: u64,
    },
    #[error("uniform range {offset}+{len} exceeds buffer size {buffer_len}")]
    UniformRangeOutOfBounds {
        offset: u64,
        len: u64,
        buffer_len: u64,
    },
    #[error("draw references a buffer with no data store")]
    MissingBuffer,
    #[error("index offset {offset} is not a multiple of the index size {size}")]
    MisalignedIndexOffset { offset: u64, size: u64 },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Reasons a draw call was rejected. Every variant maps onto a latched GL error code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DrawError {
    #[error("no program is current")]
    MissingProgram,
    #[error("invalid draw mode 0x{0:04x}")]
    InvalidMode(u32),
    #[error("invalid index type 0x{0:04x}")]
    InvalidIndexType(u32),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("draw framebuffer has no attachments")]
    IncompleteFramebuffer,
    #[error("pipeline compilation failed: {0}")]
    PipelineCompile(String),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl DrawError {
    pub fn gl_error(&self) -> GlError {
        match self {
            Self::InvalidMode(_) | Self::InvalidIndexType(_) => GlError::InvalidEnum,
            Self::InvalidValue(_) => GlError::InvalidValue,
            Self::IncompleteFramebuffer => GlError::InvalidFramebufferOperation,
            Self::MissingProgram | Self::InvalidOperation(_) | Self::PipelineCompile(_) => {
                GlError::InvalidOperation
            }
            Self::Staging(StagingError::IndexRangeOutOfBounds { .. })
            | Self::Staging(StagingError::VertexRangeOutOfBounds { .. })
            | Self::Staging(StagingError::UniformRangeOutOfBounds { .. })
            | Self::Staging(StagingError::MissingBuffer)
            | Self::Staging(StagingError::MisalignedIndexOffset { .. }) => {
                GlError::InvalidOperation
            }
            Self::Staging(_) => GlError::OutOfMemory,
            Self::Backend(BackendError::CompileFailed(_)) => GlError::InvalidOperation,
            Self::Backend(BackendError::Unsupported(_)) => GlError::InvalidOperation,
            Self::Backend(_) => GlError::OutOfMemory,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("{stage:?} shader failed to compile: {message}")]
    Compile {
        stage: crate::shader::ShaderStage,
        message: String,
    },
    #[error("program failed to link: {0}")]
    Link(String),
}

impl ProgramError {
    pub fn gl_error(&self) -> GlError {
        GlError::InvalidOperation
    }
}

/// Fatal context-construction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("invalid context config: {0}")]
    InvalidConfig(String),
    #[error("backend cannot satisfy context requirements: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins_until_read() {
        let mut errors = ErrorState::default();
        assert_eq!(errors.take(), gl::NO_ERROR);

        assert!(errors.record(GlError::InvalidEnum));
        assert!(!errors.record(GlError::InvalidValue));
        assert_eq!(errors.peek(), Some(GlError::InvalidEnum));

        assert_eq!(errors.take(), gl::INVALID_ENUM);
        assert_eq!(errors.take(), gl::NO_ERROR);

        assert!(errors.record(GlError::OutOfMemory));
        assert_eq!(errors.take(), gl::OUT_OF_MEMORY);
    }

    #[test]
    fn draw_errors_map_to_gl_codes() {
        assert_eq!(DrawError::MissingProgram.gl_error(), GlError::InvalidOperation);
        assert_eq!(DrawError::InvalidMode(0x1234).gl_error(), GlError::InvalidEnum);
        assert_eq!(
            DrawError::Staging(StagingError::OutOfMemory { requested: 16 }).gl_error(),
            GlError::OutOfMemory
        );
        assert_eq!(
            DrawError::Backend(BackendError::Device("lost".into())).gl_error(),
            GlError::OutOfMemory
        );
        assert_eq!(
            DrawError::Backend(BackendError::CompileFailed("bad".into())).gl_error(),
            GlError::InvalidOperation
        );
    }
}
