// =============================================================================
// EMBER - windowed demo driving the renderer core
// =============================================================================
//
// FRAME FLOW:
// 1. Queue this frame's draws (instanced grid + one lit mesh)
// 2. FrameLoop::tick: resize if pending, acquire, record, submit, present
// 3. Wait for the device to go idle before the next frame
//
// Keys: F11 toggles borderless fullscreen, Escape quits.

use anyhow::{Context, Result};
use clap::Parser;
use ember_render::assets::GlslcConverter;
use ember_render::backend::{mesh, GraphicsContext};
use ember_render::config::{Cli, Config};
use ember_render::renderer::{FrameLoop, FrameOutcome, MeshId, Renderer};
use glam::{Mat4, Quat, Vec3, Vec4};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const GRID_SIZE: i32 = 8;
const GRID_SPACING: f32 = 1.5;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config);
    config.apply_cli(&cli);

    init_logging(&config);
    log::info!("Starting Ember");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    if let Some(error) = app.fatal.take() {
        log::error!("Exiting after fatal error: {:#}", error);
        std::process::exit(1);
    }
    Ok(())
}

/// Console logging by default, or a truncated log file when configured.
/// `RUST_LOG` overrides the Info default either way.
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Ember Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

/// Meshes created once the renderer exists.
struct Scene {
    cube: MeshId,
    start: Instant,
}

/// Field order matters: the renderer must drop before the window its
/// surface was created from.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    scene: Option<Scene>,
    frame_loop: FrameLoop,
    fatal: Option<anyhow::Error>,

    is_fullscreen: bool,
    fps: FpsCounter,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            renderer: None,
            window: None,
            scene: None,
            frame_loop: FrameLoop::new(),
            fatal: None,
            is_fullscreen,
            fps: FpsCounter::new(Instant::now()),
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let ctx = GraphicsContext::new_windowed(&self.config.context_desc(), window)?;
        log::info!("Using GPU: {}", ctx.device_name());

        let converter = GlslcConverter::new(self.config.assets.ignore_cache);
        let size = window.inner_size();
        let mut renderer = Renderer::new(
            ctx,
            &converter,
            self.config.renderer_settings(size.width, size.height),
        )
        .context("Failed to create renderer")?;

        let (vertices, indices) = mesh::cube();
        let cube = renderer.create_mesh(&vertices, &indices)?;
        renderer.set_indirect_mesh(cube);
        // The sky shader drops the view translation, so any cube works
        renderer.set_sky_mesh(cube);

        let camera = renderer.camera_mut();
        camera.position = Vec3::new(0.0, 8.0, 16.0);
        camera.target = Vec3::ZERO;

        self.scene = Some(Scene {
            cube,
            start: Instant::now(),
        });
        self.renderer = Some(renderer);
        Ok(())
    }

    fn queue_scene(&mut self) {
        let (Some(renderer), Some(scene)) = (self.renderer.as_mut(), self.scene.as_ref()) else {
            return;
        };
        let t = scene.start.elapsed().as_secs_f32();
        let half = (GRID_SIZE - 1) as f32 * GRID_SPACING * 0.5;

        for z in 0..GRID_SIZE {
            for x in 0..GRID_SIZE {
                let position = Vec3::new(
                    x as f32 * GRID_SPACING - half,
                    ((x + z) as f32 * 0.4 + t * 2.0).sin() * 0.5,
                    z as f32 * GRID_SPACING - half,
                );
                let color = Vec4::new(
                    x as f32 / GRID_SIZE as f32,
                    0.4,
                    z as f32 / GRID_SIZE as f32,
                    1.0,
                );
                let model = Mat4::from_scale_rotation_translation(
                    Vec3::splat(0.5),
                    Quat::from_rotation_y(t + (x * z) as f32 * 0.1),
                    position,
                );
                renderer.queue_instance(model, color);
            }
        }

        let model = Mat4::from_rotation_translation(
            Quat::from_rotation_y(t * 0.5) * Quat::from_rotation_x(t * 0.3),
            Vec3::new(0.0, 3.0, 0.0),
        );
        renderer.draw_lit(scene.cube, model);
    }

    /// Returns the draw-call count when a frame reached the screen.
    fn render_frame(&mut self) -> Result<Option<u32>> {
        self.queue_scene();
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(None);
        };
        match self.frame_loop.tick(renderer)? {
            FrameOutcome::Rendered { draw_calls, .. } => Ok(Some(draw_calls)),
            FrameOutcome::Skipped(reason) => {
                log::trace!("Frame skipped: {:?}", reason);
                Ok(None)
            }
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal = Some(error);
        self.renderer = None;
        event_loop.exit();
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.frame_loop.request_resize();
        }
    }

    fn update_title(&mut self, draw_calls: u32) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some(sample) = self.fps.frame(draw_calls, Instant::now()) else {
            return;
        };
        if let Some(ref window) = self.window {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!(
                "{} | {:.0} fps | {:.2} ms | {} draws [{}]",
                self.config.window.title, sample.fps, sample.frame_ms, sample.draw_calls, mode
            ));
        }
    }
}

struct FpsSample {
    fps: f32,
    frame_ms: f32,
    draw_calls: u32,
}

/// Averages rendered frames over one-second windows.
struct FpsCounter {
    frames: u32,
    window_start: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            last_frame: now,
        }
    }

    /// Count a frame; yields a sample once per elapsed second.
    fn frame(&mut self, draw_calls: u32, now: Instant) -> Option<FpsSample> {
        let frame_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;
        self.frames += 1;

        let window = now.duration_since(self.window_start).as_secs_f32();
        if window < 1.0 {
            return None;
        }
        let fps = self.frames as f32 / window;
        self.frames = 0;
        self.window_start = now;
        Some(FpsSample {
            fps,
            frame_ms,
            draw_calls,
        })
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            self.fail(event_loop, e.context("Failed to initialize Vulkan"));
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.set_window_extent(size.width, size.height);
                }
                self.frame_loop.request_resize();
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(Some(draw_calls)) => self.update_title(draw_calls),
                Ok(None) => {}
                Err(e) => self.fail(event_loop, e.context("Render error")),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Redraw continuously.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        log::info!(
            "Rendered {} frames, releasing GPU resources",
            self.frame_loop.frames_rendered()
        );
        self.renderer = None;
    }
}
