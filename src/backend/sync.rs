// Synchronization primitives
//
// FrameSync: the acquire-done / render-done semaphore pair shared by the
// frame loop (one frame in flight).
// FrameResources: one command buffer + one fence per swapchain image.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::GraphicsContext;

pub struct FrameSync {
    pub acquire_done: vk::Semaphore,
    pub render_done: vk::Semaphore,
    ctx: Arc<GraphicsContext>,
}

impl FrameSync {
    pub fn new(ctx: &Arc<GraphicsContext>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();

        unsafe {
            let acquire_done = ctx
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create acquire semaphore")?;
            let render_done = match ctx.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    ctx.device.destroy_semaphore(acquire_done, None);
                    return Err(e).context("Failed to create render semaphore");
                }
            };

            Ok(Self {
                acquire_done,
                render_done,
                ctx: ctx.clone(),
            })
        }
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_semaphore(self.acquire_done, None);
            self.ctx.device.destroy_semaphore(self.render_done, None);
        }
    }
}

/// Per-swapchain-image command buffers and fences.
pub struct FrameResources {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub fences: Vec<vk::Fence>,
    _pool: CommandPool,
    ctx: Arc<GraphicsContext>,
}

impl FrameResources {
    pub fn new(ctx: &Arc<GraphicsContext>, image_count: u32) -> Result<Self> {
        let pool = CommandPool::new(
            ctx,
            ctx.graphics_queue.family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let command_buffers = pool.allocate(image_count)?;

        // Start signaled so the first wait on each image returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let mut resources = Self {
            command_buffers,
            fences: Vec::with_capacity(image_count as usize),
            _pool: pool,
            ctx: ctx.clone(),
        };
        for _ in 0..image_count {
            let fence = unsafe { ctx.device.create_fence(&fence_info, None) }
                .context("Failed to create frame fence")?;
            resources.fences.push(fence);
        }

        log::debug!("Created frame resources for {} images", image_count);
        Ok(resources)
    }

    pub fn image_count(&self) -> usize {
        self.command_buffers.len()
    }

    /// Wait until the GPU is done with `image_index`'s command buffer, then re-arm its fence.
    pub fn wait_and_reset(&self, image_index: u32) -> Result<()> {
        let fence = self.fences[image_index as usize];
        unsafe {
            self.ctx
                .device
                .wait_for_fences(&[fence], true, u64::MAX)
                .context("Failed waiting for frame fence")?;
            self.ctx
                .device
                .reset_fences(&[fence])
                .context("Failed to reset frame fence")?;
        }
        Ok(())
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        unsafe {
            for &fence in &self.fences {
                self.ctx.device.destroy_fence(fence, None);
            }
        }
    }
}
