// derecho - the executable
//
// Owns the window, the event pump and the per-frame game state, and
// feeds the engine a job list every frame. The only flag is
// --validation, which turns the Khronos validation layer on.
use anyhow::{anyhow, Context};
use cgmath::{perspective, Deg, InnerSpace, Matrix4, Point3, Vector3};

use sdl2::event::{Event, WindowEvent};
use sdl2::keyboard::Keycode;

use derecho::frame::FrameInputs;
use derecho::instance::CreateInfo;
use derecho::jobs::{Job, PassTarget};
use derecho::lights::LightSource;
use derecho::pipelines::{RenderEffect, SkyboxPush, Vec4Push};
use derecho::{Engine, SUPPORTED_RESOLUTIONS};

use ash::vk;

/// Record the one skybox draw: the unit cube, environment cubemap and
/// the camera basis pushed as constants.
fn skybox_job() -> Job {
    Job {
        j_target: PassTarget::Skybox,
        j_order: 0,
        j_record: Box::new(|ctx, rec| {
            let cbuf = rec.begin(ctx, PassTarget::Skybox);
            let pair = ctx.pipeline(RenderEffect::Skybox);
            let dev = &rec.dev().dev;

            unsafe {
                dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pair.p_pipeline);
                dev.cmd_bind_descriptor_sets(
                    cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    pair.p_layout,
                    0,
                    &[ctx.fc_skybox_texture_set],
                    &[],
                );

                let push = SkyboxPush {
                    projection: ctx.fc_projection,
                    view: ctx.fc_view,
                };
                dev.cmd_push_constants(
                    cbuf,
                    pair.p_layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    std::slice::from_raw_parts(
                        &push as *const _ as *const u8,
                        std::mem::size_of::<SkyboxPush>(),
                    ),
                );

                dev.cmd_bind_vertex_buffers(
                    cbuf,
                    0,
                    &[ctx.fc_device_local_buffer],
                    &[ctx.fc_skybox_vertices.offset],
                );
                dev.cmd_draw(cbuf, ctx.fc_skybox_vertex_count, 1, 0, 0);
            }

            rec.end(cbuf);
            Ok(cbuf)
        }),
    }
}

/// Record the GUI crosshair lines out of this frame slot's line slice.
fn gui_lines_job() -> Job {
    Job {
        j_target: PassTarget::Gui,
        j_order: 0,
        j_record: Box::new(|ctx, rec| {
            let cbuf = rec.begin(ctx, PassTarget::Gui);
            let pair = ctx.pipeline(RenderEffect::GreenGuiLines);
            let dev = &rec.dev().dev;

            unsafe {
                dev.cmd_bind_pipeline(cbuf, vk::PipelineBindPoint::GRAPHICS, pair.p_pipeline);
                // the layout carries the standard gui texture set even
                // though the flat color shader never samples it
                dev.cmd_bind_descriptor_sets(
                    cbuf,
                    vk::PipelineBindPoint::GRAPHICS,
                    pair.p_layout,
                    0,
                    &[ctx.fc_shadowmap_texture_set],
                    &[],
                );

                let push = Vec4Push {
                    value: [0.1, 1.0, 0.3, 1.0],
                };
                dev.cmd_push_constants(
                    cbuf,
                    pair.p_layout,
                    vk::ShaderStageFlags::FRAGMENT,
                    0,
                    std::slice::from_raw_parts(
                        &push as *const _ as *const u8,
                        std::mem::size_of::<Vec4Push>(),
                    ),
                );

                if ctx.fc_gui_line_count > 0 {
                    dev.cmd_bind_vertex_buffers(
                        cbuf,
                        0,
                        &[ctx.fc_host_coherent_buffer],
                        &[ctx.fc_gui_lines.offset],
                    );
                    dev.cmd_draw(cbuf, ctx.fc_gui_line_count, 1, 0, 0);
                }
            }

            rec.end(cbuf);
            Ok(cbuf)
        }),
    }
}

fn run() -> anyhow::Result<()> {
    let validation = std::env::args().any(|arg| arg == "--validation");
    let info = CreateInfo {
        validation,
        ..Default::default()
    };

    let sdl = sdl2::init().map_err(|e| anyhow!("sdl init: {}", e))?;
    let video = sdl.video().map_err(|e| anyhow!("sdl video: {}", e))?;
    let mut window = video
        .window("derecho", info.width, info.height)
        .vulkan()
        .position_centered()
        .resizable()
        .build()
        .context("creating the window")?;

    let mut engine = Engine::new(&window, &info).context("engine startup")?;
    let mut pump = sdl
        .event_pump()
        .map_err(|e| anyhow!("sdl event pump: {}", e))?;

    let start = std::time::Instant::now();

    'running: loop {
        for event in pump.poll_iter() {
            match event {
                Event::Quit { .. }
                | Event::KeyDown {
                    keycode: Some(Keycode::Escape),
                    ..
                } => break 'running,

                Event::KeyDown {
                    keycode: Some(key), ..
                } => {
                    let pick = match key {
                        Keycode::Num1 => Some(0),
                        Keycode::Num2 => Some(1),
                        Keycode::Num3 => Some(2),
                        Keycode::Num4 => Some(3),
                        Keycode::Num5 => Some(4),
                        _ => None,
                    };
                    if let Some(i) = pick {
                        let (w, h) = SUPPORTED_RESOLUTIONS[i];
                        window.set_size(w, h).context("resizing the window")?;
                        engine.change_resolution(w, h).context("changing resolution")?;
                    }
                }

                Event::Window {
                    win_event: WindowEvent::SizeChanged(w, h),
                    ..
                } => {
                    // the window system can hand us sizes outside the
                    // supported list; those are ignored
                    if engine.change_resolution(w as u32, h as u32).is_err() {
                        log::info!("Ignoring unsupported window size {}x{}", w, h);
                    }
                }

                _ => {}
            }
        }

        let time = start.elapsed().as_secs_f32();
        let (width, height) = engine.resolution();
        let aspect = width as f32 / height as f32;

        // slow orbit around the origin
        let eye = Point3::new(8.0 * time.cos(), 3.0, 8.0 * time.sin());
        let view = Matrix4::look_at(eye, Point3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0));
        let projection = perspective(Deg(60.0), aspect, 0.1, 500.0);

        // crosshair in the middle of the screen
        let gui_lines = vec![
            [-0.03, 0.0],
            [0.03, 0.0],
            [0.0, -0.04],
            [0.0, 0.04],
        ];

        let inputs = FrameInputs {
            fi_projection: projection,
            fi_view: view,
            fi_camera_position: [eye.x, eye.y, eye.z],
            fi_light_direction: Vector3::new(0.4, -0.8, 0.2).normalize(),
            fi_lights: vec![LightSource {
                position: [0.0, 5.0, 0.0],
                color: [1.0, 0.9, 0.7],
            }],
            fi_skinning: Vec::new(),
            fi_gui_lines: gui_lines,
            fi_time: time,
        };

        engine
            .render_frame(&inputs, vec![skybox_job(), gui_lines_job()])
            .context("rendering a frame")?;
    }

    engine.teardown();
    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        log::error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}
