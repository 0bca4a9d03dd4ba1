// Windowed resize check. Needs a display and a Vulkan device, so it only
// runs with `cargo test -- --ignored`. winit wants its event loop on the
// main thread, which libtest does not give us, hence `harness = false`.

use anyhow::{ensure, Context, Result};
use ember_render::assets::GlslcConverter;
use ember_render::backend::GraphicsContext;
use ember_render::config::Config;
use ember_render::renderer::{FrameTarget, Renderer, ResizeOutcome};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes, WindowId},
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn main() {
    let include_ignored = std::env::args().any(|a| a == "--ignored" || a == "--include-ignored");
    if !include_ignored {
        println!("test repeated_resize_keeps_swapchain ... ignored, requires a display and a Vulkan device");
        return;
    }

    let event_loop = EventLoop::new().expect("event loop");
    let mut check = ResizeCheck::default();
    event_loop.run_app(&mut check).expect("event loop run");

    match check.result {
        Some(Ok(())) => println!("test repeated_resize_keeps_swapchain ... ok"),
        Some(Err(e)) => panic!("repeated_resize_keeps_swapchain failed: {:#}", e),
        None => panic!("event loop exited before a window was created"),
    }
}

#[derive(Default)]
struct ResizeCheck {
    result: Option<Result<()>>,
}

impl ResizeCheck {
    fn run(window: &Window) -> Result<()> {
        let config = Config::default();
        let ctx = GraphicsContext::new_windowed(&config.context_desc(), window)?;
        let converter = GlslcConverter::new(false);
        let size = window.inner_size();
        let mut renderer = Renderer::new(
            ctx,
            &converter,
            config.renderer_settings(size.width, size.height),
        )?;

        let first = renderer.resize()?;
        let extent = renderer.swapchain_extent().context("no swapchain after resize")?;
        let image_count = renderer.swapchain_image_count().context("no swapchain images")?;

        let second = renderer.resize()?;
        ensure!(first == ResizeOutcome::Resized && second == ResizeOutcome::Resized);
        ensure!(
            renderer.swapchain_extent() == Some(extent),
            "extent changed from {:?} to {:?}",
            extent,
            renderer.swapchain_extent()
        );
        ensure!(
            renderer.swapchain_image_count() == Some(image_count),
            "image count changed from {} to {:?}",
            image_count,
            renderer.swapchain_image_count()
        );
        Ok(())
    }
}

impl ApplicationHandler for ResizeCheck {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.result.is_some() {
            return;
        }
        let attributes = WindowAttributes::default()
            .with_title("ember resize test")
            .with_inner_size(winit::dpi::PhysicalSize::new(WIDTH, HEIGHT));
        self.result = Some(
            event_loop
                .create_window(attributes)
                .context("Failed to create window")
                .and_then(|window| Self::run(&window)),
        );
        event_loop.exit();
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, _event: WindowEvent) {}
}
