// Command pools, immediate (blocking) submission and image layout barriers

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::device::Queue;
use super::GraphicsContext;

/// Command pool bound to one queue family.
pub struct CommandPool {
    pub pool: vk::CommandPool,
    pub queue_family: u32,
    ctx: Arc<GraphicsContext>,
}

impl CommandPool {
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { ctx.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            queue_family,
            ctx: ctx.clone(),
        })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.ctx.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees every command buffer allocated from the pool
        unsafe { self.ctx.device.destroy_command_pool(self.pool, None) };
    }
}

/// One-shot submissions that block until the queue is idle.
///
/// Only for load-time work (uploads, layout transitions, read-backs); it
/// serializes the CPU with the GPU.
pub struct ImmediateSubmitter {
    command_buffer: vk::CommandBuffer,
    queue: Queue,
    pool: CommandPool,
    ctx: Arc<GraphicsContext>,
}

impl ImmediateSubmitter {
    pub fn new(ctx: &Arc<GraphicsContext>) -> Result<Self> {
        let queue = ctx.graphics_queue;
        let pool = CommandPool::new(
            ctx,
            queue.family,
            vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;
        let command_buffer = pool.allocate(1)?[0];

        Ok(Self {
            command_buffer,
            queue,
            pool,
            ctx: ctx.clone(),
        })
    }

    /// Record with `record`, submit, then wait for the queue to drain.
    pub fn submit(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> Result<()> {
        let device = &self.ctx.device;
        let cmd = self.command_buffer;

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset immediate command buffer")?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;
        }

        record(device, cmd);

        unsafe {
            device.end_command_buffer(cmd)?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            device
                .queue_submit(self.queue.handle, &[submit_info], vk::Fence::null())
                .context("Immediate submit failed")?;
            device
                .queue_wait_idle(self.queue.handle)
                .context("vkQueueWaitIdle failed")?;
        }

        log::trace!("Immediate submit on family {} complete", self.pool.queue_family);
        Ok(())
    }
}

/// Access masks implied by a layout pair.
///
/// An image becoming shader-readable with no declared prior access assumes
/// host or transfer writes came before. Unlisted layouts map to no access.
pub fn access_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags) {
    let mut src = match old_layout {
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    };

    let dst = match new_layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            if src.is_empty() {
                src = vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE;
            }
            vk::AccessFlags::SHADER_READ
        }
        _ => vk::AccessFlags::empty(),
    };

    (src, dst)
}

/// Pipeline stages bracketing a layout transition.
pub fn stage_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
    let src = match old_layout {
        vk::ImageLayout::UNDEFINED => vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::ImageLayout::PREINITIALIZED => vk::PipelineStageFlags::HOST,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            vk::PipelineStageFlags::TRANSFER
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        }
        _ => vk::PipelineStageFlags::ALL_COMMANDS,
    };

    let dst = match new_layout {
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            vk::PipelineStageFlags::TRANSFER
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        }
        vk::ImageLayout::PRESENT_SRC_KHR => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        _ => vk::PipelineStageFlags::ALL_COMMANDS,
    };

    (src, dst)
}

/// Record a barrier moving `image` from `old_layout` to `new_layout`.
pub fn set_image_layout(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    subresource_range: vk::ImageSubresourceRange,
) {
    let (src_access, dst_access) = access_masks(old_layout, new_layout);
    let (src_stage, dst_stage) = stage_masks(old_layout, new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_to_transfer_dst() {
        let (src, dst) = access_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn transfer_dst_to_shader_read() {
        let (src, dst) = access_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn shader_read_without_prior_access_assumes_host_and_transfer_writes() {
        let (src, dst) = access_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(
            src,
            vk::AccessFlags::HOST_WRITE | vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn unhandled_pair_has_no_access() {
        let (src, dst) = access_masks(vk::ImageLayout::GENERAL, vk::ImageLayout::GENERAL);
        assert!(src.is_empty());
        assert!(dst.is_empty());
    }

    #[test]
    fn upload_transition_stages() {
        let (src, dst) = stage_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(src, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst, vk::PipelineStageFlags::TRANSFER);

        let (src, dst) = stage_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }
}
