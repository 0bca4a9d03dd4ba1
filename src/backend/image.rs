// GPU images (textures, depth buffers) backed by gpu-allocator
//
// The current layout is tracked on the image and only changes through
// `transition`, so every barrier's old layout matches the last one applied.

use anyhow::{ensure, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::command::set_image_layout;
use super::GraphicsContext;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub name: &'static str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
}

/// Device-local 2D image with a view over all of its mips.
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    aspect: vk::ImageAspectFlags,
    layout: vk::ImageLayout,
    allocation: Option<Allocation>,
    ctx: Arc<GraphicsContext>,
}

impl GpuImage {
    pub fn new(ctx: &Arc<GraphicsContext>, desc: &ImageDesc) -> Result<Self> {
        ensure!(desc.mip_levels > 0, "Image needs at least one mip level");

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { ctx.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", desc.name))?;

        let requirements = unsafe { ctx.device.get_image_memory_requirements(image) };

        let allocation = match ctx.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { ctx.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        // Owns image + allocation from here on, so early returns clean up
        let mut gpu_image = Self {
            image,
            view: vk::ImageView::null(),
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            aspect: desc.aspect,
            layout: vk::ImageLayout::UNDEFINED,
            allocation: Some(allocation),
            ctx: ctx.clone(),
        };

        let (memory, offset) = gpu_image
            .allocation
            .as_ref()
            .map(|a| unsafe { (a.memory(), a.offset()) })
            .context("Image allocation missing")?;
        unsafe { ctx.device.bind_image_memory(image, memory, offset) }
            .with_context(|| format!("Failed to bind memory for image '{}'", desc.name))?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(gpu_image.full_range());

        gpu_image.view = unsafe { ctx.device.create_image_view(&view_info, None) }
            .with_context(|| format!("Failed to create view for image '{}'", desc.name))?;

        Ok(gpu_image)
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect,
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Record a transition from the tracked layout to `new_layout`.
    pub fn transition(&mut self, cmd: vk::CommandBuffer, new_layout: vk::ImageLayout) {
        if self.layout == new_layout {
            return;
        }
        set_image_layout(
            &self.ctx.device,
            cmd,
            self.image,
            self.layout,
            new_layout,
            self.full_range(),
        );
        self.layout = new_layout;
    }

    /// Mark a layout change made implicitly, e.g. by a render pass's final layout.
    pub fn assume_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.ctx.device.destroy_image_view(self.view, None);
            }
            self.ctx.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.ctx.free(allocation);
        }
    }
}

/// Depth attachment matching the swapchain extent.
pub fn create_depth_buffer(ctx: &Arc<GraphicsContext>, extent: vk::Extent2D) -> Result<GpuImage> {
    let mut depth = GpuImage::new(
        ctx,
        &ImageDesc {
            name: "depth buffer",
            extent,
            format: DEPTH_FORMAT,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
            mip_levels: 1,
        },
    )?;
    // The render pass starts from UNDEFINED and ends in the attachment layout
    depth.assume_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    log::debug!("Created depth buffer {}x{}", extent.width, extent.height);
    Ok(depth)
}
