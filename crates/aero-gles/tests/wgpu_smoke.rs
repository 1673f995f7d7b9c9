mod common;

use std::sync::Arc;

use aero_gles::backend::{WgpuBackend, WgpuRenderTarget};
use aero_gles::shader::{
    CompiledShader, ReflectedAttribute, ShaderCompiler, ShaderReflection, ShaderStage,
};
use aero_gles::{gl, BindTarget, Context, ContextConfig, DrawCall, ShareGroup, StateChange};
use common::{f32_bytes, init_tracing, skip_or_panic};
use pretty_assertions::assert_eq;

const VERTEX_WGSL: &str = r#"
@vertex
fn main(@location(0) position: vec2<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position, 0.0, 1.0);
}
"#;

const FRAGMENT_WGSL: &str = r#"
@fragment
fn main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0, 0.0, 0.0, 1.0);
}
"#;

/// Passes WGSL through untouched; the only input is attribute 0.
struct PassthroughCompiler;

impl ShaderCompiler for PassthroughCompiler {
    fn compile(&mut self, source: &str, stage: ShaderStage) -> Result<CompiledShader, String> {
        Ok(CompiledShader {
            stage,
            code: source.to_string(),
            entry_point: "main".into(),
        })
    }

    fn reflect(&self, shader: &CompiledShader) -> Result<ShaderReflection, String> {
        let mut reflection = ShaderReflection::default();
        if shader.stage == ShaderStage::Vertex {
            reflection.attributes.push(ReflectedAttribute {
                name: "position".into(),
                location: 0,
            });
        }
        Ok(reflection)
    }
}

fn attachment(
    device: &wgpu::Device,
    format: wgpu::TextureFormat,
    size: u32,
) -> wgpu::TextureView {
    device
        .create_texture(&wgpu::TextureDescriptor {
            label: Some("aero-gles smoke attachment"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        })
        .create_view(&wgpu::TextureViewDescriptor::default())
}

#[test]
fn wgpu_backend_draws_a_triangle() {
    init_tracing();
    let mut backend = match pollster::block_on(WgpuBackend::new_headless()) {
        Ok(backend) => backend,
        Err(err) => {
            skip_or_panic("wgpu_backend_draws_a_triangle", &err.to_string());
            return;
        }
    };

    const SIZE: u32 = 4;
    let color = attachment(backend.device(), wgpu::TextureFormat::Rgba8Unorm, SIZE);
    let depth = attachment(
        backend.device(),
        wgpu::TextureFormat::Depth24PlusStencil8,
        SIZE,
    );
    backend.set_render_target(WgpuRenderTarget {
        color: vec![Some(color)],
        depth_stencil: Some((depth, wgpu::TextureFormat::Depth24PlusStencil8)),
        width: SIZE,
        height: SIZE,
    });

    let group = ShareGroup::new(Box::new(PassthroughCompiler));
    let mut ctx = Context::new(
        Arc::clone(&group),
        Box::new(backend),
        ContextConfig {
            surface_size: (SIZE, SIZE),
            ..ContextConfig::default()
        },
    )
    .expect("context creation");

    let program = group
        .create_program(VERTEX_WGSL, FRAGMENT_WGSL)
        .expect("program links");
    let vbo = group.gen_buffer();
    group
        .buffer_data(
            vbo,
            &f32_bytes(&[-1.0, -1.0, 3.0, -1.0, -1.0, 3.0]),
            gl::STATIC_DRAW,
        )
        .unwrap();
    ctx.bind_object(BindTarget::Buffer(gl::ARRAY_BUFFER), vbo)
        .unwrap();
    ctx.vertex_attrib_pointer(0, 2, gl::FLOAT, false, 0, 0)
        .unwrap();
    ctx.enable_vertex_attrib(0, true).unwrap();
    ctx.use_program(program).unwrap();

    ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3))
        .expect("plain draw");
    ctx.set_state(StateChange::Enable(gl::BLEND)).unwrap();
    ctx.set_state(StateChange::BlendFunc {
        src: gl::SRC_ALPHA,
        dst: gl::ONE_MINUS_SRC_ALPHA,
    })
    .unwrap();
    ctx.set_state(StateChange::Enable(gl::SCISSOR_TEST)).unwrap();
    ctx.set_state(StateChange::Scissor {
        x: 1,
        y: 1,
        width: 2,
        height: 2,
    })
    .unwrap();
    ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3))
        .expect("blended draw");

    assert_eq!(ctx.get_error(), gl::NO_ERROR);
    let stats = ctx.stats();
    assert_eq!(stats.draws.draws_submitted, 2);
    assert_eq!(stats.pipelines.render_pipeline_misses, 2);
}
