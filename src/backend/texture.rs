// Sampled textures uploaded from decoded DDS mip chains

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::ImmediateSubmitter;
use super::image::{GpuImage, ImageDesc};
use super::GraphicsContext;
use crate::assets::dds::DdsImage;

pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
    ctx: Arc<GraphicsContext>,
}

impl Texture {
    /// Stage the whole mip chain, copy it into a device-local image and leave
    /// the image shader-readable. Blocks until the transfer completes; the
    /// staging buffer is released before returning.
    pub fn create_immediate_dds(
        ctx: &Arc<GraphicsContext>,
        submitter: &ImmediateSubmitter,
        source: &DdsImage,
    ) -> Result<Self> {
        let staging = GpuBuffer::staging(ctx, &source.data)?;

        let mut image = GpuImage::new(
            ctx,
            &ImageDesc {
                name: "texture",
                extent: vk::Extent2D {
                    width: source.width,
                    height: source.height,
                },
                format: source.format,
                usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
                mip_levels: source.mip_count,
            },
        )?;

        let regions: Vec<vk::BufferImageCopy> = source
            .mip_regions()
            .iter()
            .map(|mip| vk::BufferImageCopy {
                buffer_offset: mip.offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: mip.level,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: mip.width,
                    height: mip.height,
                    depth: 1,
                },
            })
            .collect();

        submitter.submit(|device, cmd| {
            image.transition(cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &regions,
                );
            }
            image.transition(cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        })?;
        drop(staging);

        let sampler = create_sampler(ctx, source.mip_count)?;

        log::info!(
            "Uploaded texture {}x{} {:?}, {} mips",
            source.width,
            source.height,
            source.format,
            source.mip_count
        );

        Ok(Self {
            image,
            sampler,
            ctx: ctx.clone(),
        })
    }

    /// View + sampler + layout for a combined image sampler binding.
    pub fn descriptor(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view,
            image_layout: self.image.layout(),
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_sampler(self.sampler, None) };
    }
}

fn create_sampler(ctx: &GraphicsContext, mip_levels: u32) -> Result<vk::Sampler> {
    let anisotropy = ctx.features.sampler_anisotropy;
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(anisotropy)
        .max_anisotropy(if anisotropy {
            ctx.features.max_sampler_anisotropy.min(16.0)
        } else {
            1.0
        })
        .min_lod(0.0)
        .max_lod(mip_levels as f32)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK);

    unsafe { ctx.device.create_sampler(&sampler_info, None) }.context("Failed to create sampler")
}
