// Tests that need a Vulkan device. Run with `cargo test -- --ignored`.

use ash::vk;
use ember_render::assets::DdsImage;
use ember_render::backend::buffer::{read_back_buffer, upload_device_local, GpuBuffer};
use ember_render::backend::command::ImmediateSubmitter;
use ember_render::backend::mesh::{self, Mesh, Vertex};
use ember_render::backend::texture::Texture;
use ember_render::backend::{ContextDesc, GraphicsContext};
use std::sync::Arc;

fn headless() -> Arc<GraphicsContext> {
    let desc = ContextDesc {
        app_name: "ember-tests".to_string(),
        validation: false,
        ..ContextDesc::default()
    };
    GraphicsContext::new_headless(&desc).unwrap()
}

#[test]
#[ignore = "requires a Vulkan device"]
fn staged_upload_reads_back_identical_bytes() {
    let ctx = headless();
    let submitter = ImmediateSubmitter::new(&ctx).unwrap();

    let data: Vec<u8> = (0..1024u32).flat_map(|i| i.to_le_bytes()).collect();
    let buffer =
        upload_device_local(&ctx, &submitter, vk::BufferUsageFlags::STORAGE_BUFFER, &data).unwrap();
    assert_eq!(buffer.size, data.len() as u64);

    let copy = read_back_buffer(&ctx, &submitter, &buffer).unwrap();
    assert_eq!(copy, data);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn cube_mesh_uploads_with_expected_counts() {
    let ctx = headless();
    let submitter = ImmediateSubmitter::new(&ctx).unwrap();

    let (vertices, indices) = mesh::cube();
    let cube = Mesh::create_immediate(&ctx, &submitter, &vertices, &indices).unwrap();
    assert_eq!(cube.vert_count, 24);
    assert_eq!(cube.index_count, 36);
    assert_ne!(cube.vertex_buffer.buffer, vk::Buffer::null());
    assert_ne!(cube.index_buffer.buffer, vk::Buffer::null());

    let bytes = read_back_buffer(&ctx, &submitter, &cube.vertex_buffer).unwrap();
    let uploaded: Vec<Vertex> = bytes
        .chunks_exact(std::mem::size_of::<Vertex>())
        .map(bytemuck::pod_read_unaligned)
        .collect();
    assert_eq!(uploaded, vertices);

    let bytes = read_back_buffer(&ctx, &submitter, &cube.index_buffer).unwrap();
    let uploaded: Vec<u32> = bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned)
        .collect();
    assert_eq!(uploaded, indices);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn empty_mesh_is_rejected() {
    let ctx = headless();
    let submitter = ImmediateSubmitter::new(&ctx).unwrap();
    assert!(Mesh::create_immediate(&ctx, &submitter, &[], &[]).is_err());
}

#[test]
#[ignore = "requires a Vulkan device"]
fn dds_mip_chain_becomes_shader_readable() {
    let ctx = headless();
    let submitter = ImmediateSubmitter::new(&ctx).unwrap();

    // 4x4 RGBA8 with three mips: 64 + 16 + 4 bytes
    let image = DdsImage {
        width: 4,
        height: 4,
        mip_count: 3,
        format: vk::Format::R8G8B8A8_UNORM,
        mip_sizes: vec![64, 16, 4],
        data: (0..84u8).collect(),
    };
    let texture = Texture::create_immediate_dds(&ctx, &submitter, &image).unwrap();

    assert_eq!(texture.image.mip_levels, 3);
    assert_eq!(texture.image.extent.width, 4);
    let info = texture.descriptor();
    assert_eq!(info.image_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_ne!(info.sampler, vk::Sampler::null());
}

#[test]
#[ignore = "requires a Vulkan device"]
fn mapped_buffer_rejects_overrun() {
    let ctx = headless();
    let buffer = GpuBuffer::new_mapped(&ctx, vk::BufferUsageFlags::UNIFORM_BUFFER, 64).unwrap();
    buffer.write(0, &[7u8; 64]).unwrap();
    assert!(buffer.write(32, &[7u8; 64]).is_err());
    assert_eq!(buffer.read().unwrap(), vec![7u8; 64]);
}

#[test]
#[ignore = "requires a Vulkan device"]
fn device_address_needs_matching_usage() {
    let ctx = headless();
    let plain = GpuBuffer::new_mapped(&ctx, vk::BufferUsageFlags::STORAGE_BUFFER, 256).unwrap();
    assert!(plain.device_address().is_err());

    let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    let addressed = GpuBuffer::new(&ctx, usage, vk::MemoryPropertyFlags::DEVICE_LOCAL, 256, None);
    if ctx.features.buffer_device_address {
        assert_ne!(addressed.unwrap().device_address().unwrap(), 0);
    } else {
        assert!(addressed.is_err());
    }
}

#[test]
#[ignore = "requires a Vulkan device"]
fn headless_context_has_no_presentation() {
    let ctx = headless();
    assert!(ctx.is_headless());
    assert!(!ctx.device_name().is_empty());
    assert_eq!(ctx.queue_families.present, None);
    assert_eq!(ctx.presentation_queue().handle, ctx.graphics_queue.handle);
    assert_eq!(ctx.queue_families.graphics, ctx.graphics_queue.family);
    if let Some(transfer) = ctx.queue_families.transfer {
        assert_ne!(transfer, ctx.graphics_queue.family);
    }
    ctx.wait_idle().unwrap();
}
