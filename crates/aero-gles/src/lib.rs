//! `aero-gles` is the rendering core of Aero's OpenGL ES 3.0 implementation.
//!
//! GL state lives in a per-context [`StateStore`]. At draw time it is projected into hashable
//! descriptors ([`descriptor::DescriptorBuilder`]) that key a bounded [`PipelineCache`] of native
//! pipeline objects. Vertex and index data the native API cannot consume directly (fans, line
//! loops, 8-bit indices, unaligned strides, instance divisors) is converted by
//! [`BufferStaging`]. [`Context`] then emits only the native commands whose bound value
//! changed since the last submission.
//!
//! Native APIs sit behind the traits in [`backend`]; [`backend::WgpuBackend`] implements them
//! on top of `wgpu`. GLSL ES compilation is delegated to a [`shader::ShaderCompiler`].

pub mod backend;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod gl;
pub mod pipeline_cache;
pub mod shader;
pub mod share_group;
pub mod staging;
pub mod state;
pub mod stats;
pub mod vertex_layout;

pub use backend::{Backend, BackendCaps, SubmissionId};
pub use config::{ContextConfig, PipelineCacheConfig, StagingConfig};
pub use context::{BindTarget, Context, DrawCall, DrawSource, ObjectKind};
pub use error::{BackendError, ContextError, DrawError, GlError, StagingError};
pub use pipeline_cache::PipelineCache;
pub use share_group::{ObjectId, ShareGroup};
pub use staging::BufferStaging;
pub use state::{StateChange, StateStore};
pub use stats::ContextStats;
