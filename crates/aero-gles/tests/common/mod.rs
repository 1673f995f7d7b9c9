//! Shared helpers for `aero-gles` integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use aero_gles::backend::{
    Backend, BackendCaps, BufferBackend, BufferHandle, BufferUsageHint, CommandBackend,
    NativeDepthStencilHandle, NativePipelineHandle, PipelineBackend, RenderCommand, SubmissionId,
};
use aero_gles::descriptor::{DepthStencilDescriptor, RenderPipelineDescriptor};
use aero_gles::error::BackendError;
use aero_gles::shader::{
    CompiledShader, DefaultBlockLayout, LinkedProgram, ReflectedAttribute, ReflectedSampler,
    ReflectedUniform, ReflectedUniformBlock, ShaderCompiler, ShaderReflection, ShaderStage,
};
use aero_gles::{Context, ContextConfig, ShareGroup};

/// Installs a fmt subscriber when `AERO_GLES_TEST_LOG` is set.
pub fn init_tracing() {
    if std::env::var_os("AERO_GLES_TEST_LOG").is_none() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// `AERO_REQUIRE_WEBGPU=1` turns a missing adapter into a test failure.
pub fn require_webgpu() -> bool {
    let Ok(raw) = std::env::var("AERO_REQUIRE_WEBGPU") else {
        return false;
    };
    let v = raw.trim();
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes")
}

pub fn skip_or_panic(test_name: &str, reason: &str) {
    if require_webgpu() {
        panic!("AERO_REQUIRE_WEBGPU is enabled but {test_name} cannot run: {reason}");
    }
    eprintln!("skipping {test_name}: {reason}");
}

/// Everything the recording backend observed. Shared between the backend (owned by the
/// context) and the test.
#[derive(Debug, Default)]
pub struct Recording {
    pub compiled_pipelines: Vec<RenderPipelineDescriptor>,
    pub compiled_depth_stencils: Vec<DepthStencilDescriptor>,
    pub destroyed_pipelines: Vec<NativePipelineHandle>,
    pub destroyed_depth_stencils: Vec<NativeDepthStencilHandle>,
    pub buffers: HashMap<u64, Vec<u8>>,
    pub allocations: usize,
    pub frees: usize,
    pub submissions: Vec<(SubmissionId, Vec<RenderCommand>)>,
    /// Reported by `completed_submission`.
    pub completed: SubmissionId,

    pub fail_compiles: bool,
    pub fail_allocations: bool,
    pub fail_submits: bool,
}

impl Recording {
    pub fn last_commands(&self) -> &[RenderCommand] {
        self.submissions
            .last()
            .map(|(_, commands)| commands.as_slice())
            .unwrap_or(&[])
    }

    /// Bytes of a live native buffer.
    pub fn buffer(&self, handle: BufferHandle) -> &[u8] {
        self.buffers
            .get(&handle.0)
            .map(Vec::as_slice)
            .unwrap_or_else(|| panic!("buffer {handle:?} is not live"))
    }
}

#[derive(Clone, Default)]
pub struct Probe(Arc<Mutex<Recording>>);

impl Probe {
    pub fn get(&self) -> MutexGuard<'_, Recording> {
        self.0.lock().unwrap()
    }
}

pub struct RecordingBackend {
    recording: Probe,
    caps: BackendCaps,
    next_handle: u64,
}

impl RecordingBackend {
    pub fn new(caps: BackendCaps) -> (Self, Probe) {
        let probe = Probe::default();
        let backend = Self {
            recording: probe.clone(),
            caps,
            next_handle: 1,
        };
        (backend, probe)
    }

    fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl PipelineBackend for RecordingBackend {
    fn compile_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
        _program: &LinkedProgram,
    ) -> Result<NativePipelineHandle, BackendError> {
        if self.recording.get().fail_compiles {
            return Err(BackendError::CompileFailed("injected failure".into()));
        }
        self.recording.get().compiled_pipelines.push(desc.clone());
        Ok(NativePipelineHandle(self.alloc_handle()))
    }

    fn compile_depth_stencil(
        &mut self,
        desc: &DepthStencilDescriptor,
    ) -> Result<NativeDepthStencilHandle, BackendError> {
        self.recording.get().compiled_depth_stencils.push(*desc);
        Ok(NativeDepthStencilHandle(self.alloc_handle()))
    }

    fn destroy_pipeline(&mut self, handle: NativePipelineHandle) {
        self.recording.get().destroyed_pipelines.push(handle);
    }

    fn destroy_depth_stencil(&mut self, handle: NativeDepthStencilHandle) {
        self.recording.get().destroyed_depth_stencils.push(handle);
    }
}

impl BufferBackend for RecordingBackend {
    fn allocate_buffer(
        &mut self,
        size: u64,
        _usage: BufferUsageHint,
    ) -> Result<BufferHandle, BackendError> {
        if self.recording.get().fail_allocations {
            return Err(BackendError::OutOfMemory { requested: size });
        }
        let handle = self.alloc_handle();
        let mut recording = self.recording.get();
        recording.allocations += 1;
        recording.buffers.insert(handle, vec![0; size as usize]);
        Ok(BufferHandle(handle))
    }

    fn write_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        assert_eq!(offset % 4, 0, "unaligned write offset");
        assert_eq!(data.len() % 4, 0, "unaligned write size");
        let mut recording = self.recording.get();
        let buffer = recording
            .buffers
            .get_mut(&handle.0)
            .ok_or(BackendError::UnknownHandle("buffer", handle.0))?;
        let end = offset as usize + data.len();
        assert!(end <= buffer.len(), "write past the end of buffer {handle:?}");
        buffer[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn free_buffer(&mut self, handle: BufferHandle) {
        let mut recording = self.recording.get();
        assert!(
            recording.buffers.remove(&handle.0).is_some(),
            "double free of {handle:?}"
        );
        recording.frees += 1;
    }
}

impl CommandBackend for RecordingBackend {
    fn submit_draw(
        &mut self,
        submission: SubmissionId,
        commands: &[RenderCommand],
    ) -> Result<(), BackendError> {
        let mut recording = self.recording.get();
        if recording.fail_submits {
            return Err(BackendError::Device("injected submit failure".into()));
        }
        recording.submissions.push((submission, commands.to_vec()));
        Ok(())
    }

    fn completed_submission(&mut self) -> SubmissionId {
        self.recording.get().completed
    }
}

impl Backend for RecordingBackend {
    fn caps(&self) -> BackendCaps {
        self.caps
    }
}

/// Test compiler. Sources are line-oriented declarations instead of GLSL:
/// `in <location> <name>`, `uniform <location> <name> <offset> <size>`,
/// `block <name> <binding> <size>`, `sampler <name> <unit>`, `default <binding> <size>` and
/// `fail <message>`.
#[derive(Debug, Default)]
pub struct DeclCompiler;

impl ShaderCompiler for DeclCompiler {
    fn compile(&mut self, source: &str, stage: ShaderStage) -> Result<CompiledShader, String> {
        if let Some(msg) = source.lines().find_map(|l| l.trim().strip_prefix("fail ")) {
            return Err(msg.to_string());
        }
        Ok(CompiledShader {
            stage,
            code: source.to_string(),
            entry_point: "main".into(),
        })
    }

    fn reflect(&self, shader: &CompiledShader) -> Result<ShaderReflection, String> {
        let mut out = ShaderReflection::default();
        for line in shader.code.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let num = |i: usize| -> Result<u32, String> {
                parts
                    .get(i)
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| format!("bad declaration `{line}`"))
            };
            let name = |i: usize| parts.get(i).copied().unwrap_or_default().to_string();
            match parts.first().copied() {
                Some("in") if shader.stage == ShaderStage::Vertex => {
                    out.attributes.push(ReflectedAttribute {
                        name: name(2),
                        location: num(1)?,
                    })
                }
                Some("uniform") => out.uniforms.push(ReflectedUniform {
                    name: name(2),
                    location: num(1)?,
                    offset: num(3)?,
                    size: num(4)?,
                }),
                Some("block") => out.uniform_blocks.push(ReflectedUniformBlock {
                    name: name(1),
                    binding: num(2)?,
                    size: num(3)?,
                }),
                Some("sampler") => out.samplers.push(ReflectedSampler {
                    name: name(1),
                    binding: num(2)?,
                }),
                Some("default") => {
                    out.default_block = Some(DefaultBlockLayout {
                        binding: num(1)?,
                        size: num(2)?,
                    })
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

pub struct Harness {
    pub group: Arc<ShareGroup>,
    pub ctx: Context,
    pub probe: Probe,
}

pub fn harness() -> Harness {
    harness_with(BackendCaps::default(), ContextConfig {
        surface_size: (64, 64),
        ..ContextConfig::default()
    })
}

pub fn harness_with(caps: BackendCaps, config: ContextConfig) -> Harness {
    init_tracing();
    let group = ShareGroup::new(Box::new(DeclCompiler));
    let (backend, probe) = RecordingBackend::new(caps);
    let ctx = Context::new(Arc::clone(&group), Box::new(backend), config)
        .expect("context creation");
    Harness { group, ctx, probe }
}

/// A second context on the same share group.
pub fn attach(group: &Arc<ShareGroup>) -> (Context, Probe) {
    let (backend, probe) = RecordingBackend::new(BackendCaps::default());
    let ctx = Context::new(
        Arc::clone(group),
        Box::new(backend),
        ContextConfig {
            surface_size: (64, 64),
            ..ContextConfig::default()
        },
    )
    .expect("context creation");
    (ctx, probe)
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn u16s(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub const VS_POSITION: &str = "in 0 a_position";
pub const FS_PLAIN: &str = "";

/// Links a position-only program, uploads `positions` (vec2 floats) to a fresh array buffer and
/// wires attribute 0 to it. Returns `(program, buffer)`.
pub fn bind_positions(h: &mut Harness, positions: &[f32]) -> (u32, u32) {
    use aero_gles::{gl, BindTarget};

    let program = h
        .group
        .create_program(VS_POSITION, FS_PLAIN)
        .expect("program links");
    let vbo = h.group.gen_buffer();
    h.group
        .buffer_data(vbo, &f32_bytes(positions), gl::STATIC_DRAW)
        .expect("buffer data");
    h.ctx
        .bind_object(BindTarget::Buffer(gl::ARRAY_BUFFER), vbo)
        .expect("bind array buffer");
    h.ctx
        .vertex_attrib_pointer(0, 2, gl::FLOAT, false, 0, 0)
        .expect("attribute pointer");
    h.ctx.enable_vertex_attrib(0, true).expect("enable attribute");
    h.ctx.use_program(program).expect("use program");
    (program, vbo)
}

pub const TRIANGLE: [f32; 6] = [-1.0, -1.0, 1.0, -1.0, 0.0, 1.0];
