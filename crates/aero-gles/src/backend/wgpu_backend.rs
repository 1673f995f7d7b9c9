use std::borrow::Cow;
use std::num::{NonZeroU64, NonZeroUsize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use lru::LruCache;
use tracing::{debug, trace, warn};

use super::translate::*;
use super::{
    Backend, BackendCaps, BufferBackend, BufferHandle, BufferUsageHint, CommandBackend,
    NativeDepthStencilHandle, NativePipelineHandle, PipelineBackend, RenderCommand, SubmissionId,
};
use crate::descriptor::{DepthStencilDescriptor, IndexFormat, RenderPipelineDescriptor};
use crate::error::BackendError;
use crate::share_group::TextureKey;
use crate::shader::LinkedProgram;
use crate::state::{ScissorRect, Viewport};

/// Final pipelines are specialised per (program pipeline, depth-stencil) pair.
const RENDER_PIPELINE_CACHE_CAPACITY: usize = 256;

/// Attachments the backend renders into. Color views are indexed by draw buffer and must match
/// the formats of the framebuffer the context draws with.
pub struct WgpuRenderTarget {
    pub color: Vec<Option<wgpu::TextureView>>,
    pub depth_stencil: Option<(wgpu::TextureView, wgpu::TextureFormat)>,
    pub width: u32,
    pub height: u32,
}

struct StoredBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

/// Everything of a pipeline that does not depend on depth-stencil state.
struct PipelineTemplate {
    desc: RenderPipelineDescriptor,
    vertex_module: wgpu::ShaderModule,
    vertex_entry: String,
    fragment_module: wgpu::ShaderModule,
    fragment_entry: String,
    bind_group_layout: wgpu::BindGroupLayout,
    layout: wgpu::PipelineLayout,
    /// Bindings of group 0 with their minimum sizes.
    uniform_bindings: Vec<(u32, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct UniformRange {
    buffer: BufferHandle,
    offset: u64,
    size: u64,
}

/// Native state accumulated from the command stream. Render passes do not inherit state, so
/// every draw replays the whole set.
#[derive(Debug, Clone, Default)]
struct BoundState {
    pipeline: Option<NativePipelineHandle>,
    depth_stencil: Option<NativeDepthStencilHandle>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    blend_constant: [f32; 4],
    stencil_reference: u32,
    vertex_buffers: Vec<Option<(BufferHandle, u64)>>,
    index_buffer: Option<(BufferHandle, u64, IndexFormat)>,
    uniform_buffers: HashMap<u32, UniformRange>,
    textures: HashMap<u32, TextureKey>,
}

impl BoundState {
    fn apply(&mut self, command: &RenderCommand) {
        match command {
            RenderCommand::SetPipeline(handle) => self.pipeline = Some(*handle),
            RenderCommand::SetDepthStencil(handle) => self.depth_stencil = Some(*handle),
            RenderCommand::SetViewport(viewport) => self.viewport = Some(*viewport),
            RenderCommand::SetScissor(scissor) => self.scissor = *scissor,
            RenderCommand::SetBlendConstant(color) => self.blend_constant = *color,
            RenderCommand::SetStencilReference(reference) => self.stencil_reference = *reference,
            RenderCommand::SetVertexBuffer {
                slot,
                buffer,
                offset,
            } => {
                let slot = *slot as usize;
                if self.vertex_buffers.len() <= slot {
                    self.vertex_buffers.resize(slot + 1, None);
                }
                self.vertex_buffers[slot] = Some((*buffer, *offset));
            }
            RenderCommand::SetIndexBuffer {
                buffer,
                offset,
                format,
            } => self.index_buffer = Some((*buffer, *offset, *format)),
            RenderCommand::SetUniformBuffer {
                binding,
                buffer,
                offset,
                size,
            } => {
                self.uniform_buffers.insert(
                    *binding,
                    UniformRange {
                        buffer: *buffer,
                        offset: *offset,
                        size: *size,
                    },
                );
            }
            RenderCommand::SetTexture { unit, texture } => match texture {
                Some(texture) => {
                    self.textures.insert(*unit, *texture);
                }
                None => {
                    self.textures.remove(unit);
                }
            },
            RenderCommand::Draw { .. } | RenderCommand::DrawIndexed { .. } => {}
        }
    }

    fn forget_buffer(&mut self, handle: BufferHandle) {
        for slot in &mut self.vertex_buffers {
            if matches!(slot, Some((buffer, _)) if *buffer == handle) {
                *slot = None;
            }
        }
        if matches!(self.index_buffer, Some((buffer, _, _)) if buffer == handle) {
            self.index_buffer = None;
        }
        self.uniform_buffers.retain(|_, range| range.buffer != handle);
    }
}

/// Pixel rectangle in wgpu's top-left-origin space, clamped to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TargetRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl TargetRect {
    /// Converts a GL rectangle (bottom-left origin) into target space.
    fn from_gl(x: i32, y: i32, width: i32, height: i32, target: (u32, u32)) -> Self {
        let (target_width, target_height) = (i64::from(target.0), i64::from(target.1));
        let left = i64::from(x).clamp(0, target_width);
        let right = (i64::from(x) + i64::from(width.max(0))).clamp(0, target_width);
        let bottom = i64::from(y).clamp(0, target_height);
        let top = (i64::from(y) + i64::from(height.max(0))).clamp(0, target_height);
        Self {
            x: left as u32,
            y: (target_height - top) as u32,
            width: (right - left) as u32,
            height: (top - bottom) as u32,
        }
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// `wgpu` implementation of the backend traits.
///
/// Draws render into the attached [`WgpuRenderTarget`] with load/store ops, one render pass
/// and one queue submission per draw.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: BackendCaps,
    target: Option<WgpuRenderTarget>,

    next_handle: u64,
    buffers: HashMap<u64, StoredBuffer>,
    templates: HashMap<u64, PipelineTemplate>,
    depth_stencils: HashMap<u64, DepthStencilDescriptor>,
    pipelines: LruCache<(u64, Option<u64>), wgpu::RenderPipeline>,

    bound: BoundState,
    completed: Arc<AtomicU64>,
}

impl WgpuBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let limits = device.limits();
        let caps = BackendCaps {
            vertex_buffer_alignment: wgpu::VERTEX_STRIDE_ALIGNMENT as u32,
            max_vertex_buffers: limits.max_vertex_buffers,
            max_vertex_stride: limits.max_vertex_buffer_array_stride,
            uniform_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            ..BackendCaps::default()
        };
        let capacity = NonZeroUsize::new(RENDER_PIPELINE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            device,
            queue,
            caps,
            target: None,
            next_handle: 1,
            buffers: HashMap::new(),
            templates: HashMap::new(),
            depth_stencils: HashMap::new(),
            pipelines: LruCache::new(capacity),
            bound: BoundState::default(),
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a backend on the first available adapter, without a presentation surface.
    pub async fn new_headless() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::Device("no suitable wgpu adapter found".into()))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("aero-gles wgpu backend"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::Device(e.to_string()))?;
        Ok(Self::new(device, queue))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn set_render_target(&mut self, target: WgpuRenderTarget) {
        self.target = Some(target);
    }

    pub fn take_render_target(&mut self) -> Option<WgpuRenderTarget> {
        self.target.take()
    }

    fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Runs `f` inside a validation error scope.
    fn validated<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> Result<T, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(BackendError::CompileFailed(err.to_string())),
            None => Ok(value),
        }
    }

    fn create_module(&self, label: &str, code: &str) -> Result<wgpu::ShaderModule, BackendError> {
        self.validated(|device| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(code.to_owned())),
            })
        })
    }

    fn build_pipeline(
        &self,
        template: &PipelineTemplate,
        depth_stencil: Option<&DepthStencilDescriptor>,
    ) -> Result<wgpu::RenderPipeline, BackendError> {
        let desc = &template.desc;

        let attributes: Vec<Vec<wgpu::VertexAttribute>> = desc
            .vertex_buffers
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: map_vertex_format(a.format),
                        offset: u64::from(a.offset),
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout<'_>> = desc
            .vertex_buffers
            .iter()
            .zip(&attributes)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: u64::from(layout.array_stride),
                step_mode: map_step_mode(layout.step_mode),
                attributes,
            })
            .collect();

        let blend = desc.blend.as_ref().map(map_blend).transpose()?;
        let write_mask = map_color_writes(desc.color_write_mask);
        let color_count = color_attachment_count(desc);
        let targets: Vec<Option<wgpu::ColorTargetState>> = desc.color_formats[..color_count]
            .iter()
            .map(|format| {
                format.map(|format| wgpu::ColorTargetState {
                    format: map_color_format(format),
                    blend: blend.filter(|_| format.is_blendable()),
                    write_mask,
                })
            })
            .collect();

        let depth_stencil = desc.depth_stencil_format.map(|format| {
            let ds = depth_stencil.unwrap_or(&DepthStencilDescriptor::DISABLED);
            wgpu::DepthStencilState {
                format: map_depth_stencil_format(format),
                depth_write_enabled: ds.depth_test && ds.depth_write,
                depth_compare: if ds.depth_test {
                    map_compare_func(ds.depth_compare)
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil: match &ds.stencil {
                    Some(stencil) if format.has_stencil() => map_stencil_state(stencil),
                    _ => wgpu::StencilState::default(),
                },
                bias: map_depth_bias(desc.rasterizer.depth_bias),
            }
        });

        let primitive = wgpu::PrimitiveState {
            topology: map_primitive_topology(desc.topology)?,
            strip_index_format: desc.strip_index_format.map(map_index_format).transpose()?,
            front_face: map_front_face(desc.rasterizer.front_face),
            cull_mode: map_cull_mode(desc.rasterizer.cull_mode),
            ..Default::default()
        };

        self.validated(|device| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("aero-gles render pipeline"),
                layout: Some(&template.layout),
                vertex: wgpu::VertexState {
                    module: &template.vertex_module,
                    entry_point: template.vertex_entry.as_str(),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &buffers,
                },
                fragment: Some(wgpu::FragmentState {
                    module: &template.fragment_module,
                    entry_point: template.fragment_entry.as_str(),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &targets,
                }),
                primitive,
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: desc.sample_count.max(1),
                    mask: !0,
                    alpha_to_coverage_enabled: desc.rasterizer.alpha_to_coverage,
                },
                multiview: None,
            })
        })
    }

    /// Returns the cache key of the final pipeline for the bound state, building it on a miss.
    fn resolve_pipeline(&mut self) -> Result<(u64, Option<u64>), BackendError> {
        let pipeline = self
            .bound
            .pipeline
            .ok_or_else(|| BackendError::Device("draw without a bound pipeline".into()))?;
        let template = self
            .templates
            .get(&pipeline.0)
            .ok_or(BackendError::UnknownHandle("pipeline", pipeline.0))?;

        let depth_stencil = match self.bound.depth_stencil {
            Some(handle) if template.desc.depth_stencil_format.is_some() => Some(handle.0),
            _ => None,
        };
        let key = (pipeline.0, depth_stencil);
        if self.pipelines.get(&key).is_some() {
            return Ok(key);
        }

        let ds = match depth_stencil {
            Some(handle) => Some(
                self.depth_stencils
                    .get(&handle)
                    .ok_or(BackendError::UnknownHandle("depth-stencil", handle))?,
            ),
            None => None,
        };
        let built = self.build_pipeline(template, ds).inspect_err(|err| {
            warn!(pipeline = pipeline.0, ?depth_stencil, %err, "wgpu pipeline creation failed");
        })?;
        debug!(pipeline = pipeline.0, ?depth_stencil, "created wgpu render pipeline");
        self.pipelines.put(key, built);
        Ok(key)
    }

    fn create_bind_group(
        &self,
        template: &PipelineTemplate,
    ) -> Result<Option<wgpu::BindGroup>, BackendError> {
        if template.uniform_bindings.is_empty() {
            return Ok(None);
        }
        let mut entries = Vec::with_capacity(template.uniform_bindings.len());
        for &(binding, _) in &template.uniform_bindings {
            let range = self
                .bound
                .uniform_buffers
                .get(&binding)
                .ok_or_else(|| BackendError::Device(format!("uniform binding {binding} is unbound")))?;
            let stored = self
                .buffers
                .get(&range.buffer.0)
                .ok_or(BackendError::UnknownHandle("buffer", range.buffer.0))?;
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &stored.buffer,
                    offset: range.offset,
                    size: NonZeroU64::new(range.size),
                }),
            });
        }
        Ok(Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("aero-gles uniforms"),
            layout: &template.bind_group_layout,
            entries: &entries,
        })))
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&wgpu::Buffer, BackendError> {
        self.buffers
            .get(&handle.0)
            .map(|stored| &stored.buffer)
            .ok_or(BackendError::UnknownHandle("buffer", handle.0))
    }

    fn encode_draw(
        &mut self,
        draw: &RenderCommand,
    ) -> Result<wgpu::CommandBuffer, BackendError> {
        let key = self.resolve_pipeline()?;
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| BackendError::Device("no render target attached".into()))?;
        let template = self
            .templates
            .get(&key.0)
            .ok_or(BackendError::UnknownHandle("pipeline", key.0))?;
        let pipeline = self
            .pipelines
            .peek(&key)
            .ok_or(BackendError::UnknownHandle("pipeline", key.0))?;
        let bind_group = self.create_bind_group(template)?;

        let color_count = color_attachment_count(&template.desc);
        let mut color_attachments = Vec::with_capacity(color_count);
        for (index, format) in template.desc.color_formats[..color_count].iter().enumerate() {
            if format.is_none() {
                color_attachments.push(None);
                continue;
            }
            let view = target
                .color
                .get(index)
                .and_then(Option::as_ref)
                .ok_or_else(|| BackendError::Device(format!("draw buffer {index} has no view")))?;
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            }));
        }

        let depth_stencil_attachment = match template.desc.depth_stencil_format {
            Some(_) => {
                let (view, format) = target
                    .depth_stencil
                    .as_ref()
                    .ok_or_else(|| BackendError::Device("target has no depth-stencil view".into()))?;
                let ops = wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                };
                Some(wgpu::RenderPassDepthStencilAttachment {
                    view,
                    depth_ops: format.has_depth_aspect().then_some(ops),
                    stencil_ops: format.has_stencil_aspect().then_some(wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    }),
                })
            }
            None => None,
        };

        let size = (target.width, target.height);
        let viewport = self.bound.viewport.unwrap_or(Viewport {
            x: 0,
            y: 0,
            width: target.width as i32,
            height: target.height as i32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        let viewport_rect =
            TargetRect::from_gl(viewport.x, viewport.y, viewport.width, viewport.height, size);
        let scissor_rect = match self.bound.scissor {
            Some(s) => TargetRect::from_gl(s.x, s.y, s.width, s.height, size),
            None => TargetRect::from_gl(0, 0, target.width as i32, target.height as i32, size),
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("aero-gles draw encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("aero-gles draw"),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                occlusion_query_set: None,
                timestamp_writes: None,
            });

            // Nothing can be rasterized; the pass still runs so the submission completes.
            if viewport_rect.is_empty() || scissor_rect.is_empty() {
                trace!(?viewport_rect, ?scissor_rect, "draw clipped away entirely");
            } else {
                pass.set_pipeline(pipeline);
                if let Some(bind_group) = &bind_group {
                    pass.set_bind_group(0, bind_group, &[]);
                }
                let [r, g, b, a] = self.bound.blend_constant;
                pass.set_blend_constant(wgpu::Color {
                    r: f64::from(r),
                    g: f64::from(g),
                    b: f64::from(b),
                    a: f64::from(a),
                });
                pass.set_stencil_reference(self.bound.stencil_reference);
                pass.set_viewport(
                    viewport_rect.x as f32,
                    viewport_rect.y as f32,
                    viewport_rect.width as f32,
                    viewport_rect.height as f32,
                    viewport.min_depth.clamp(0.0, 1.0),
                    viewport.max_depth.clamp(0.0, 1.0),
                );
                pass.set_scissor_rect(
                    scissor_rect.x,
                    scissor_rect.y,
                    scissor_rect.width,
                    scissor_rect.height,
                );

                for (slot, binding) in self.bound.vertex_buffers.iter().enumerate() {
                    if let Some((handle, offset)) = binding {
                        let buffer = self.buffer(*handle)?;
                        pass.set_vertex_buffer(slot as u32, buffer.slice(*offset..));
                    }
                }

                match draw {
                    RenderCommand::Draw {
                        vertices,
                        instances,
                    } => pass.draw(vertices.clone(), instances.clone()),
                    RenderCommand::DrawIndexed {
                        indices,
                        base_vertex,
                        instances,
                    } => {
                        let (handle, offset, format) = self
                            .bound
                            .index_buffer
                            .ok_or_else(|| BackendError::Device("indexed draw without index buffer".into()))?;
                        pass.set_index_buffer(
                            self.buffer(handle)?.slice(offset..),
                            map_index_format(format)?,
                        );
                        pass.draw_indexed(indices.clone(), *base_vertex, instances.clone());
                    }
                    _ => {}
                }
            }
        }
        Ok(encoder.finish())
    }
}

fn color_attachment_count(desc: &RenderPipelineDescriptor) -> usize {
    desc.color_formats
        .iter()
        .rposition(Option::is_some)
        .map_or(0, |last| last + 1)
}

impl PipelineBackend for WgpuBackend {
    fn compile_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
        program: &LinkedProgram,
    ) -> Result<NativePipelineHandle, BackendError> {
        let reflection = &program.reflection;
        if !reflection.samplers.is_empty() {
            return Err(BackendError::Unsupported("sampled textures"));
        }
        map_primitive_topology(desc.topology)?;

        let mut uniform_bindings: Vec<(u32, u64)> = reflection
            .uniform_blocks
            .iter()
            .map(|block| (block.binding, u64::from(block.size)))
            .collect();
        if let Some(block) = reflection.default_block {
            uniform_bindings.push((block.binding, u64::from(block.size)));
        }
        uniform_bindings.sort_unstable();
        if uniform_bindings.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(BackendError::CompileFailed(
                "two uniform blocks share one binding".into(),
            ));
        }

        let vertex_module = self.create_module("aero-gles vertex shader", &program.vertex.code)?;
        let fragment_module =
            self.create_module("aero-gles fragment shader", &program.fragment.code)?;

        let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = uniform_bindings
            .iter()
            .map(|&(binding, size)| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(size),
                },
                count: None,
            })
            .collect();
        let (bind_group_layout, layout) = self.validated(|device| {
            let bind_group_layout =
                device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("aero-gles uniforms layout"),
                    entries: &layout_entries,
                });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("aero-gles pipeline layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
            (bind_group_layout, layout)
        })?;

        let handle = self.alloc_handle();
        self.templates.insert(
            handle,
            PipelineTemplate {
                desc: desc.clone(),
                vertex_module,
                vertex_entry: program.vertex.entry_point.clone(),
                fragment_module,
                fragment_entry: program.fragment.entry_point.clone(),
                bind_group_layout,
                layout,
                uniform_bindings,
            },
        );
        Ok(NativePipelineHandle(handle))
    }

    fn compile_depth_stencil(
        &mut self,
        desc: &DepthStencilDescriptor,
    ) -> Result<NativeDepthStencilHandle, BackendError> {
        let handle = self.alloc_handle();
        self.depth_stencils.insert(handle, *desc);
        Ok(NativeDepthStencilHandle(handle))
    }

    fn destroy_pipeline(&mut self, handle: NativePipelineHandle) {
        self.templates.remove(&handle.0);
        let stale: Vec<_> = self
            .pipelines
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| key.0 == handle.0)
            .collect();
        for key in stale {
            self.pipelines.pop(&key);
        }
        if self.bound.pipeline == Some(handle) {
            self.bound.pipeline = None;
        }
    }

    fn destroy_depth_stencil(&mut self, handle: NativeDepthStencilHandle) {
        self.depth_stencils.remove(&handle.0);
        let stale: Vec<_> = self
            .pipelines
            .iter()
            .map(|(key, _)| *key)
            .filter(|key| key.1 == Some(handle.0))
            .collect();
        for key in stale {
            self.pipelines.pop(&key);
        }
        if self.bound.depth_stencil == Some(handle) {
            self.bound.depth_stencil = None;
        }
    }
}

impl BufferBackend for WgpuBackend {
    fn allocate_buffer(
        &mut self,
        size: u64,
        usage: BufferUsageHint,
    ) -> Result<BufferHandle, BackendError> {
        let padded = size.max(1).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("aero-gles buffer"),
            size: padded,
            usage: map_buffer_usages(usage),
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            warn!(size, %err, "wgpu buffer allocation failed");
            return Err(BackendError::OutOfMemory { requested: size });
        }

        let handle = self.alloc_handle();
        self.buffers.insert(
            handle,
            StoredBuffer {
                buffer,
                size: padded,
            },
        );
        Ok(BufferHandle(handle))
    }

    fn write_buffer(
        &mut self,
        handle: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let stored = self
            .buffers
            .get(&handle.0)
            .ok_or(BackendError::UnknownHandle("buffer", handle.0))?;
        let len = data.len() as u64;
        let alignment = wgpu::COPY_BUFFER_ALIGNMENT;
        if offset % alignment != 0 || len % alignment != 0 {
            return Err(BackendError::Device(format!(
                "write_buffer offset/size must be {alignment}-byte aligned (offset={offset}, size={len})"
            )));
        }
        if offset + len > stored.size {
            return Err(BackendError::Device(format!(
                "write of {len} bytes at {offset} overruns buffer of {} bytes",
                stored.size
            )));
        }
        self.queue.write_buffer(&stored.buffer, offset, data);
        Ok(())
    }

    fn free_buffer(&mut self, handle: BufferHandle) {
        if let Some(stored) = self.buffers.remove(&handle.0) {
            stored.buffer.destroy();
        }
        self.bound.forget_buffer(handle);
    }
}

impl CommandBackend for WgpuBackend {
    fn submit_draw(
        &mut self,
        submission: SubmissionId,
        commands: &[RenderCommand],
    ) -> Result<(), BackendError> {
        // A rejected submission leaves the previously submitted state bound.
        let rollback = self.bound.clone();
        let mut command_buffers = Vec::new();
        for command in commands {
            if command.is_draw() {
                match self.encode_draw(command) {
                    Ok(buffer) => command_buffers.push(buffer),
                    Err(err) => {
                        self.bound = rollback;
                        return Err(err);
                    }
                }
            } else {
                self.bound.apply(command);
            }
        }
        trace!(
            submission = submission.0,
            commands = commands.len(),
            passes = command_buffers.len(),
            "submitting draw"
        );

        self.queue.submit(command_buffers);
        let completed = Arc::clone(&self.completed);
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(submission.0, Ordering::AcqRel);
        });
        Ok(())
    }

    fn completed_submission(&mut self) -> SubmissionId {
        self.device.poll(wgpu::Maintain::Poll);
        SubmissionId(self.completed.load(Ordering::Acquire))
    }
}

impl Backend for WgpuBackend {
    fn caps(&self) -> BackendCaps {
        self.caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gl_rects_flip_to_top_left_origin() {
        let rect = TargetRect::from_gl(10, 20, 30, 40, (100, 100));
        assert_eq!(
            rect,
            TargetRect {
                x: 10,
                y: 40,
                width: 30,
                height: 40,
            }
        );
    }

    #[test]
    fn rects_are_clamped_to_the_target() {
        let rect = TargetRect::from_gl(-10, 90, 50, 50, (64, 100));
        assert_eq!(
            rect,
            TargetRect {
                x: 0,
                y: 0,
                width: 40,
                height: 10,
            }
        );
        assert!(TargetRect::from_gl(200, 0, 10, 10, (64, 64)).is_empty());
    }
}
