// Swapchain - Window presentation
//
// Owns the chain of presentable images and their views. Never mutated in
// place: a resize drops the old Swapchain and builds a new one from a
// freshly resolved SwapchainConfig.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::GraphicsContext;

/// Format + colour space the renderer targets.
pub const TARGET_SURFACE_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// What the surface reports for the selected physical device.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(ctx: &GraphicsContext) -> Result<Self> {
        let surface = ctx.surface()?;
        unsafe {
            let capabilities = surface
                .loader
                .get_physical_device_surface_capabilities(ctx.physical_device, surface.handle)
                .context("Failed to query surface capabilities")?;
            let formats = surface
                .loader
                .get_physical_device_surface_formats(ctx.physical_device, surface.handle)
                .context("Failed to query surface formats")?;
            let present_modes = surface
                .loader
                .get_physical_device_surface_present_modes(ctx.physical_device, surface.handle)
                .context("Failed to query present modes")?;

            Ok(Self {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

/// Pick the surface format.
///
/// A lone UNDEFINED entry means the surface takes any format, so the target
/// is used. Otherwise the target pair wins if listed, else the first entry.
pub fn select_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(TARGET_SURFACE_FORMAT);
        }
    }
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == TARGET_SURFACE_FORMAT.format
                && f.color_space == TARGET_SURFACE_FORMAT.color_space
        })
        .or_else(|| formats.first().copied())
}

/// Mailbox (triple buffered) with vsync, immediate without.
pub fn preferred_present_mode(vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::IMMEDIATE
    }
}

/// The requested mode if the surface supports it, else FIFO (always available).
pub fn select_present_mode(
    requested: vk::PresentModeKHR,
    available: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp to [min, max]; a max of 0 means unbounded.
pub fn clamp_image_count(requested: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = requested.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// The surface's current extent, or the window size clamped to the surface
/// limits when the surface leaves it to the swapchain (u32::MAX).
pub fn resolve_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: window
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: window
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// User-facing swapchain preferences.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainRequest {
    pub vsync: bool,
    /// Explicit mode, overrides the vsync preference.
    pub present_mode: Option<vk::PresentModeKHR>,
    pub image_count: u32,
    pub window_extent: vk::Extent2D,
}

/// Everything needed to create a swapchain, derived from a request and the
/// surface's current support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainConfig {
    /// Returns `Ok(None)` when the drawable extent is zero (minimized window).
    pub fn resolve(request: &SwapchainRequest, support: &SurfaceSupport) -> Result<Option<Self>> {
        let caps = &support.capabilities;
        let extent = resolve_extent(caps, request.window_extent);
        if extent.width == 0 || extent.height == 0 {
            return Ok(None);
        }

        let surface_format = select_surface_format(&support.formats)
            .context("Surface reports no formats")?;
        let requested_mode = request
            .present_mode
            .unwrap_or_else(|| preferred_present_mode(request.vsync));
        let present_mode = select_present_mode(requested_mode, &support.present_modes);
        if present_mode != requested_mode {
            log::warn!(
                "Present mode {:?} unsupported (available: {:?}), using {:?}",
                requested_mode,
                support.present_modes,
                present_mode
            );
        }

        Ok(Some(Self {
            image_count: clamp_image_count(request.image_count, caps),
            surface_format,
            present_mode,
            extent,
            pre_transform: caps.current_transform,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub config: SwapchainConfig,
    ctx: Arc<GraphicsContext>,
}

impl Swapchain {
    pub fn new(ctx: &Arc<GraphicsContext>, config: &SwapchainConfig) -> Result<Self> {
        let surface = ctx.surface()?;
        let loader = ctx.swapchain_loader()?;

        let graphics_family = ctx.graphics_queue.family;
        let present_family = ctx.presentation_queue().family;
        let family_indices = [graphics_family, present_family];

        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true);
        create_info = if graphics_family != present_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on Drop cleans up whatever was created
        let mut chain = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            config: *config,
            ctx: ctx.clone(),
        };

        chain.images = unsafe { loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &chain.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(config.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { ctx.device.create_image_view(&view_info, None) }
                .context("Failed to create swapchain image view")?;
            chain.image_views.push(view);
        }

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            config.extent.width,
            config.extent.height,
            chain.images.len(),
            config.surface_format.format,
            config.present_mode
        );

        Ok(chain)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    pub fn format(&self) -> vk::Format {
        self.config.surface_format.format
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    /// Acquire the next image, signalling `semaphore` when it is ready.
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let loader = self.ctx.swapchain_loader()?;
        let result = unsafe {
            loader.acquire_next_image(self.swapchain, timeout, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("vkAcquireNextImageKHR failed"),
        }
    }

    /// Present `image_index` once `wait_semaphores` are signalled.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let loader = self.ctx.swapchain_loader()?;
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("vkQueuePresentKHR failed"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.ctx.device.destroy_image_view(view, None);
            }
            if let Ok(loader) = self.ctx.swapchain_loader() {
                loader.destroy_swapchain(self.swapchain, None);
            }
        }
        log::debug!("Destroyed swapchain");
    }
}
