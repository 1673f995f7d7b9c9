mod common;

use aero_gles::backend::{
    BufferHandle, NativeDepthStencilHandle, NativePipelineHandle, RenderCommand,
};
use aero_gles::error::BackendError;
use aero_gles::state::FramebufferFormats;
use aero_gles::{gl, BindTarget, DrawCall, DrawError, StateChange};
use common::{bind_positions, harness, TRIANGLE};
use pretty_assertions::assert_eq;

#[test]
fn first_draw_binds_everything_and_repeats_only_draw() {
    let mut h = harness();
    bind_positions(&mut h, &TRIANGLE);

    h.ctx
        .draw(DrawCall::arrays(gl::TRIANGLES, 0, 3))
        .expect("first draw");
    let viewport = *h.ctx.state().viewport();
    assert_eq!(
        h.probe.get().last_commands(),
        &[
            RenderCommand::SetPipeline(NativePipelineHandle(1)),
            RenderCommand::SetDepthStencil(NativeDepthStencilHandle(2)),
            RenderCommand::SetViewport(viewport),
            RenderCommand::SetScissor(None),
            RenderCommand::SetBlendConstant([0.0; 4]),
            RenderCommand::SetStencilReference(0),
            RenderCommand::SetVertexBuffer {
                slot: 0,
                buffer: BufferHandle(3),
                offset: 0,
            },
            RenderCommand::Draw {
                vertices: 0..3,
                instances: 0..1,
            },
        ][..]
    );

    h.ctx
        .draw(DrawCall::arrays(gl::TRIANGLES, 0, 3))
        .expect("second draw");
    assert_eq!(
        h.probe.get().last_commands(),
        &[RenderCommand::Draw {
            vertices: 0..3,
            instances: 0..1,
        }][..]
    );

    let stats = h.ctx.stats();
    assert_eq!(stats.pipelines.render_pipeline_misses, 1);
    assert_eq!(stats.pipelines.depth_stencil_misses, 1);
    assert_eq!(stats.staging.resident_uploads, 1);
    assert_eq!(stats.draws.draws_submitted, 2);
    assert_eq!(stats.draws.native_commands, 9);
    assert_eq!(h.probe.get().compiled_pipelines.len(), 1);
}

#[test]
fn dynamic_state_changes_emit_only_the_changed_command() {
    let mut h = harness();
    bind_positions(&mut h, &TRIANGLE);
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();

    h.ctx
        .set_state(StateChange::BlendColor([0.25, 0.5, 0.75, 1.0]))
        .unwrap();
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();
    assert_eq!(
        h.probe.get().last_commands(),
        &[
            RenderCommand::SetBlendConstant([0.25, 0.5, 0.75, 1.0]),
            RenderCommand::Draw {
                vertices: 0..3,
                instances: 0..1,
            },
        ][..]
    );

    h.ctx
        .set_state(StateChange::StencilFunc {
            func: gl::ALWAYS,
            reference: 300,
            mask: 0xFF,
        })
        .unwrap();
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();
    let commands = h.probe.get().last_commands().to_vec();
    assert!(
        commands.contains(&RenderCommand::SetStencilReference(0xFF)),
        "reference clamps to eight bits: {commands:?}"
    );
    assert_eq!(h.probe.get().compiled_pipelines.len(), 1);
}

#[test]
fn failed_submission_keeps_dirty_state_for_the_retry() {
    let mut h = harness();
    bind_positions(&mut h, &TRIANGLE);
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();
    let submitted = h.ctx.last_submission();

    h.ctx
        .set_state(StateChange::Viewport {
            x: 8,
            y: 8,
            width: 16,
            height: 16,
        })
        .unwrap();
    h.probe.get().fail_submits = true;
    let err = h
        .ctx
        .draw(DrawCall::arrays(gl::TRIANGLES, 0, 3))
        .unwrap_err();
    assert!(matches!(err, DrawError::Backend(BackendError::Device(_))));
    assert_eq!(h.ctx.get_error(), gl::OUT_OF_MEMORY);
    assert_eq!(h.ctx.last_submission(), submitted);
    assert_eq!(h.ctx.stats().draws.draws_failed, 1);

    h.probe.get().fail_submits = false;
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();
    let viewport = *h.ctx.state().viewport();
    assert_eq!((viewport.x, viewport.width), (8, 16));
    assert_eq!(
        h.probe.get().last_commands(),
        &[
            RenderCommand::SetViewport(viewport),
            RenderCommand::Draw {
                vertices: 0..3,
                instances: 0..1,
            },
        ][..]
    );
    assert_eq!(h.ctx.last_submission(), submitted.next());
}

#[test]
fn first_error_is_latched_until_read() {
    let mut h = harness();
    bind_positions(&mut h, &TRIANGLE);

    assert_eq!(
        h.ctx.draw(DrawCall::arrays(0xBEEF, 0, 3)),
        Err(DrawError::InvalidMode(0xBEEF))
    );
    assert!(h
        .ctx
        .set_state(StateChange::Viewport {
            x: 0,
            y: 0,
            width: -1,
            height: 4,
        })
        .is_err());
    assert_eq!(h.ctx.get_error(), gl::INVALID_ENUM);
    assert_eq!(h.ctx.get_error(), gl::NO_ERROR);

    assert_eq!(
        h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, -3)),
        Err(DrawError::InvalidValue("negative vertex count"))
    );
    assert_eq!(h.ctx.get_error(), gl::INVALID_VALUE);
    assert!(h.probe.get().submissions.is_empty());
}

#[test]
fn draw_without_program_is_invalid_operation() {
    let mut h = harness();
    assert_eq!(
        h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)),
        Err(DrawError::MissingProgram)
    );
    assert_eq!(h.ctx.get_error(), gl::INVALID_OPERATION);
}

#[test]
fn enabled_attribute_without_buffer_is_rejected() {
    let mut h = harness();
    bind_positions(&mut h, &TRIANGLE);
    h.ctx
        .bind_object(BindTarget::Buffer(gl::ARRAY_BUFFER), 0)
        .unwrap();
    h.ctx
        .vertex_attrib_pointer(0, 2, gl::FLOAT, false, 0, 0)
        .unwrap();

    let err = h
        .ctx
        .draw(DrawCall::arrays(gl::TRIANGLES, 0, 3))
        .unwrap_err();
    assert!(matches!(err, DrawError::InvalidOperation(_)), "{err:?}");
    assert_eq!(h.ctx.get_error(), gl::INVALID_OPERATION);
}

#[test]
fn incomplete_framebuffer_rejects_draws() {
    let mut h = harness();
    bind_positions(&mut h, &TRIANGLE);
    let fbo = h.ctx.gen_framebuffer();
    h.ctx
        .bind_object(BindTarget::Framebuffer(gl::FRAMEBUFFER), fbo)
        .unwrap();
    h.ctx
        .set_framebuffer_formats(fbo, FramebufferFormats::EMPTY)
        .unwrap();

    assert_eq!(
        h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)),
        Err(DrawError::IncompleteFramebuffer)
    );
    assert_eq!(h.ctx.get_error(), gl::INVALID_FRAMEBUFFER_OPERATION);

    h.ctx
        .bind_object(BindTarget::Framebuffer(gl::FRAMEBUFFER), 0)
        .unwrap();
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();
}

#[test]
fn discarded_and_empty_draws_submit_nothing() {
    let mut h = harness();
    bind_positions(&mut h, &TRIANGLE);

    h.ctx
        .set_state(StateChange::Enable(gl::RASTERIZER_DISCARD))
        .unwrap();
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();
    h.ctx
        .set_state(StateChange::Disable(gl::RASTERIZER_DISCARD))
        .unwrap();

    h.ctx
        .set_state(StateChange::Enable(gl::CULL_FACE))
        .unwrap();
    h.ctx
        .set_state(StateChange::CullFace(gl::FRONT_AND_BACK))
        .unwrap();
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();
    h.ctx
        .set_state(StateChange::Disable(gl::CULL_FACE))
        .unwrap();

    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 0)).unwrap();
    h.ctx
        .draw(DrawCall::arrays(gl::TRIANGLES, 0, 3).instanced(0))
        .unwrap();

    assert!(h.probe.get().submissions.is_empty());
    assert_eq!(h.ctx.stats().draws.draws_skipped, 4);
    assert_eq!(h.ctx.get_error(), gl::NO_ERROR);
}

#[test]
fn instanced_draws_use_a_separate_pipeline() {
    let mut h = harness();
    bind_positions(&mut h, &TRIANGLE);
    h.ctx.draw(DrawCall::arrays(gl::TRIANGLES, 0, 3)).unwrap();
    h.ctx
        .draw(DrawCall::arrays(gl::TRIANGLES, 0, 3).instanced(4))
        .unwrap();

    let recording = h.probe.get();
    assert_eq!(recording.compiled_pipelines.len(), 2);
    assert!(recording.compiled_pipelines[1].instanced);
    assert_eq!(
        recording.last_commands().last(),
        Some(&RenderCommand::Draw {
            vertices: 0..3,
            instances: 0..4,
        })
    );
}
