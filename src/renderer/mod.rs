// Renderer - ties the backend together behind the frame loop
//
// Field order is teardown order: pipelines, descriptors, buffers and
// textures, meshes, swapchain-derived targets, per-image command buffers and
// sync objects, then the context itself once the last Arc drops.

pub mod camera;
pub mod draw;
pub mod frame;

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::assets::{DdsImage, ShaderConverter};
use crate::backend::buffer::GpuBuffer;
use crate::backend::command::ImmediateSubmitter;
use crate::backend::descriptor::{
    DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWrites,
};
use crate::backend::image::{create_depth_buffer, GpuImage};
use crate::backend::mesh::{InstanceData, Mesh, Vertex};
use crate::backend::pipeline::{build_pipeline, Framebuffers, Pipeline, PipelineDesc, RenderPass};
use crate::backend::swapchain::{
    select_surface_format, AcquireOutcome, PresentOutcome, SurfaceSupport, Swapchain,
    SwapchainConfig, SwapchainRequest,
};
use crate::backend::sync::{FrameResources, FrameSync};
use crate::backend::texture::Texture;
use crate::backend::GraphicsContext;

pub use camera::{Camera, CameraUniforms};
pub use draw::{DrawQueue, IndirectCommand};
pub use frame::{FrameLoop, FrameOutcome, FrameState, FrameTarget, ResizeOutcome, SkipReason};

/// Global set + sky set.
pub const MAX_DESCRIPTOR_SETS: u32 = 2;

const FALLBACK_TEXTURE: [u8; 4] = [200, 200, 200, 255];
const FALLBACK_SKY: [u8; 4] = [90, 140, 220, 255];

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub vsync: bool,
    pub present_mode: Option<vk::PresentModeKHR>,
    pub image_count: u32,
    pub clear_color: [f32; 4],
    pub max_draws: usize,
    pub shader_dir: PathBuf,
    pub texture: Option<PathBuf>,
    pub sky_texture: Option<PathBuf>,
    pub window_extent: vk::Extent2D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshId(usize);

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct LitPushConstants {
    mvp: [[f32; 4]; 4],
    model: [[f32; 4]; 4],
}

/// Everything rebuilt by a resize, dropped in field order.
struct SwapchainTargets {
    framebuffers: Framebuffers,
    render_pass: RenderPass,
    _depth: GpuImage,
    swapchain: Swapchain,
}

impl SwapchainTargets {
    fn new(ctx: &Arc<GraphicsContext>, config: &SwapchainConfig) -> Result<Self> {
        let swapchain = Swapchain::new(ctx, config)?;
        let depth = create_depth_buffer(ctx, config.extent)?;
        let render_pass = RenderPass::new(ctx, swapchain.format())?;
        let framebuffers = Framebuffers::new(
            ctx,
            &render_pass,
            &swapchain.image_views,
            depth.view,
            config.extent,
        )?;

        Ok(Self {
            framebuffers,
            render_pass,
            _depth: depth,
            swapchain,
        })
    }
}

pub struct Renderer {
    indirect_pipeline: Pipeline,
    lit_pipeline: Pipeline,
    sky_pipeline: Pipeline,
    global_set: vk::DescriptorSet,
    sky_set: vk::DescriptorSet,
    descriptor_pool: DescriptorPool<MAX_DESCRIPTOR_SETS>,
    _set_layout: DescriptorSetLayout,
    uniform_buffer: GpuBuffer,
    instance_buffer: GpuBuffer,
    indirect_buffer: GpuBuffer,
    _texture: Texture,
    _sky_texture: Texture,
    meshes: Vec<Mesh>,
    targets: Option<SwapchainTargets>,
    frames: FrameResources,
    sync: FrameSync,
    submitter: ImmediateSubmitter,

    draws: DrawQueue,
    lit_draws: Vec<(MeshId, Mat4)>,
    frame_indirect_draws: u32,
    frame_lit_draws: Vec<(MeshId, Mat4)>,
    indirect_mesh: Option<MeshId>,
    sky_mesh: Option<MeshId>,
    camera: Camera,
    settings: RendererSettings,
    ctx: Arc<GraphicsContext>,
}

impl Renderer {
    pub fn new(
        ctx: Arc<GraphicsContext>,
        converter: &dyn ShaderConverter,
        settings: RendererSettings,
    ) -> Result<Self> {
        let submitter = ImmediateSubmitter::new(&ctx)?;
        let sync = FrameSync::new(&ctx)?;
        let frames = FrameResources::new(&ctx, settings.image_count.max(1))?;

        let texture = load_texture(&ctx, &submitter, settings.texture.as_deref(), FALLBACK_TEXTURE)?;
        let sky_texture =
            load_texture(&ctx, &submitter, settings.sky_texture.as_deref(), FALLBACK_SKY)?;

        let max_draws = settings.max_draws.max(1) as vk::DeviceSize;
        let uniform_buffer = GpuBuffer::new_mapped(
            &ctx,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            std::mem::size_of::<CameraUniforms>() as vk::DeviceSize,
        )?;
        let instance_buffer = GpuBuffer::new_mapped(
            &ctx,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            max_draws * std::mem::size_of::<InstanceData>() as vk::DeviceSize,
        )?;
        // DrawQueue emits at most one instanced command per frame
        let indirect_buffer = GpuBuffer::new_mapped(
            &ctx,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            std::mem::size_of::<IndirectCommand>() as vk::DeviceSize,
        )?;

        let layout_builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT);
        let set_layout = layout_builder.build(&ctx)?;
        let mut descriptor_pool = DescriptorPool::<MAX_DESCRIPTOR_SETS>::new(
            &ctx,
            &layout_builder.pool_sizes(MAX_DESCRIPTOR_SETS),
        )?;

        let global_set = descriptor_pool.allocate(&set_layout)?;
        let sky_set = descriptor_pool.allocate(&set_layout)?;
        for (set, tex) in [(global_set, &texture), (sky_set, &sky_texture)] {
            DescriptorWrites::new(set)
                .uniform_buffer(0, uniform_buffer.buffer, uniform_buffer.size)
                .combined_image_sampler(1, tex.descriptor())
                .apply(&ctx.device);
        }

        // Pipelines only need a compatible pass; resizes rebuild the real one
        let support = SurfaceSupport::query(&ctx)?;
        let surface_format =
            select_surface_format(&support.formats).context("Surface reports no formats")?;
        let template_pass = RenderPass::new(&ctx, surface_format.format)?;

        let layouts = [&set_layout];
        let indirect_pipeline = build_pipeline(
            &ctx,
            converter,
            &template_pass,
            &PipelineDesc::indirect(&settings.shader_dir),
            &layouts,
        )?;
        let lit_pipeline = build_pipeline(
            &ctx,
            converter,
            &template_pass,
            &PipelineDesc::lit(&settings.shader_dir),
            &layouts,
        )?;
        let sky_pipeline = build_pipeline(
            &ctx,
            converter,
            &template_pass,
            &PipelineDesc::sky(&settings.shader_dir),
            &layouts,
        )?;
        drop(template_pass);

        let mut renderer = Self {
            indirect_pipeline,
            lit_pipeline,
            sky_pipeline,
            global_set,
            sky_set,
            descriptor_pool,
            _set_layout: set_layout,
            uniform_buffer,
            instance_buffer,
            indirect_buffer,
            _texture: texture,
            _sky_texture: sky_texture,
            meshes: Vec::new(),
            targets: None,
            frames,
            sync,
            submitter,
            draws: DrawQueue::new(settings.max_draws.max(1)),
            lit_draws: Vec::new(),
            frame_indirect_draws: 0,
            frame_lit_draws: Vec::new(),
            indirect_mesh: None,
            sky_mesh: None,
            camera: Camera::default(),
            settings,
            ctx,
        };

        if renderer.resize()? == ResizeOutcome::Deferred {
            log::info!("Window minimized at startup, swapchain creation deferred");
        }
        log::info!(
            "Renderer ready ({} descriptor sets in use)",
            renderer.descriptor_pool.used()
        );
        Ok(renderer)
    }

    pub fn context(&self) -> &Arc<GraphicsContext> {
        &self.ctx
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Extent reported by the windowing layer; used on the next resize.
    pub fn set_window_extent(&mut self, width: u32, height: u32) {
        self.settings.window_extent = vk::Extent2D { width, height };
    }

    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.targets.as_ref().map(|t| t.swapchain.extent())
    }

    pub fn swapchain_image_count(&self) -> Option<u32> {
        self.targets.as_ref().map(|t| t.swapchain.image_count())
    }

    /// Upload a mesh; it lives as long as the renderer.
    pub fn create_mesh(&mut self, vertices: &[Vertex], indices: &[u32]) -> Result<MeshId> {
        let mesh = Mesh::create_immediate(&self.ctx, &self.submitter, vertices, indices)?;
        self.meshes.push(mesh);
        Ok(MeshId(self.meshes.len() - 1))
    }

    /// Mesh drawn by the indirect pipeline for every queued instance.
    pub fn set_indirect_mesh(&mut self, mesh: MeshId) {
        self.indirect_mesh = Some(mesh);
    }

    pub fn set_sky_mesh(&mut self, mesh: MeshId) {
        self.sky_mesh = Some(mesh);
    }

    /// Queue an instance of the indirect mesh for the next frame.
    pub fn queue_instance(&mut self, model: Mat4, color: Vec4) {
        self.draws.push(model, color);
    }

    /// Queue a single-mesh draw through the lit pipeline for the next frame.
    pub fn draw_lit(&mut self, mesh: MeshId, model: Mat4) {
        self.lit_draws.push((mesh, model));
    }

    fn mesh(&self, id: MeshId) -> &Mesh {
        &self.meshes[id.0]
    }

    fn bind_mesh(&self, cmd: vk::CommandBuffer, mesh: &Mesh) {
        let device = &self.ctx.device;
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[mesh.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, mesh.index_buffer.buffer, 0, vk::IndexType::UINT32);
        }
    }

    fn record_sky(&self, cmd: vk::CommandBuffer) -> u32 {
        let Some(id) = self.sky_mesh else {
            return 0;
        };
        let mesh = self.mesh(id);
        let device = &self.ctx.device;
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.sky_pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.sky_pipeline.layout,
                0,
                &[self.sky_set],
                &[],
            );
            self.bind_mesh(cmd, mesh);
            device.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
        }
        1
    }

    fn record_indirect(&self, cmd: vk::CommandBuffer) -> u32 {
        let count = self.frame_indirect_draws;
        let Some(id) = self.indirect_mesh.filter(|_| count > 0) else {
            return 0;
        };
        let mesh = self.mesh(id);
        let device = &self.ctx.device;
        let stride = std::mem::size_of::<IndirectCommand>() as u32;

        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.indirect_pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.indirect_pipeline.layout,
                0,
                &[self.global_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(
                cmd,
                0,
                &[mesh.vertex_buffer.buffer, self.instance_buffer.buffer],
                &[0, 0],
            );
            device.cmd_bind_index_buffer(cmd, mesh.index_buffer.buffer, 0, vk::IndexType::UINT32);

            if self.ctx.features.multi_draw_indirect {
                device.cmd_draw_indexed_indirect(cmd, self.indirect_buffer.buffer, 0, count, stride);
                1
            } else {
                for i in 0..count {
                    let offset = i as vk::DeviceSize * stride as vk::DeviceSize;
                    device.cmd_draw_indexed_indirect(cmd, self.indirect_buffer.buffer, offset, 1, stride);
                }
                count
            }
        }
    }

    fn record_lit(&self, cmd: vk::CommandBuffer) -> u32 {
        if self.frame_lit_draws.is_empty() {
            return 0;
        }
        let device = &self.ctx.device;
        let view_projection = self.camera.view_projection_matrix();

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.lit_pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.lit_pipeline.layout,
                0,
                &[self.global_set],
                &[],
            );
            for &(id, model) in &self.frame_lit_draws {
                let mesh = self.mesh(id);
                let push = LitPushConstants {
                    mvp: (view_projection * model).to_cols_array_2d(),
                    model: model.to_cols_array_2d(),
                };
                device.cmd_push_constants(
                    cmd,
                    self.lit_pipeline.layout,
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::bytes_of(&push),
                );
                self.bind_mesh(cmd, mesh);
                device.cmd_draw_indexed(cmd, mesh.index_count, 1, 0, 0, 0);
            }
        }
        self.frame_lit_draws.len() as u32
    }
}

impl FrameTarget for Renderer {
    fn update_uniforms(&mut self) -> Result<()> {
        let uniforms = self.camera.uniforms();
        self.uniform_buffer.write(0, bytemuck::bytes_of(&uniforms))?;

        let index_count = self
            .indirect_mesh
            .map(|id| self.mesh(id).index_count)
            .unwrap_or(0);
        let commands = self.draws.commands(index_count);
        self.instance_buffer
            .write(0, bytemuck::cast_slice(self.draws.instances()))?;
        self.indirect_buffer.write(0, bytemuck::cast_slice(&commands))?;
        self.frame_indirect_draws = commands.len() as u32;
        self.draws.clear();

        self.frame_lit_draws = std::mem::take(&mut self.lit_draws);
        Ok(())
    }

    fn acquire(&mut self) -> Result<AcquireOutcome> {
        match &self.targets {
            Some(targets) => targets
                .swapchain
                .acquire_next_image(u64::MAX, self.sync.acquire_done),
            // Nothing to render into until a resize succeeds
            None => Ok(AcquireOutcome::OutOfDate),
        }
    }

    fn record(&mut self, image_index: u32) -> Result<u32> {
        let targets = self.targets.as_ref().context("Recording without a swapchain")?;
        let extent = targets.swapchain.extent();
        let cmd = self.frames.command_buffers[image_index as usize];
        let device = &self.ctx.device;

        self.frames.wait_and_reset(image_index)?;

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset frame command buffer")?;
            device
                .begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::default())
                .context("Failed to begin frame command buffer")?;

            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: self.settings.clear_color,
                    },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ];
            let render_area = vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            };
            let begin_info = vk::RenderPassBeginInfo::default()
                .render_pass(targets.render_pass.render_pass)
                .framebuffer(targets.framebuffers.framebuffers[image_index as usize])
                .render_area(render_area)
                .clear_values(&clear_values);
            device.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
        }

        let draw_calls = self.record_sky(cmd) + self.record_indirect(cmd) + self.record_lit(cmd);

        unsafe {
            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .context("Failed to end frame command buffer")?;
        }

        log::trace!("Recorded image {} with {} draw calls", image_index, draw_calls);
        Ok(draw_calls)
    }

    fn submit(&mut self, image_index: u32) -> Result<()> {
        let wait_semaphores = [self.sync.acquire_done];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.frames.command_buffers[image_index as usize]];
        let signal_semaphores = [self.sync.render_done];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.ctx.device.queue_submit(
                self.ctx.graphics_queue.handle,
                &[submit_info],
                self.frames.fences[image_index as usize],
            )
        }
        .context("Failed to submit frame")
    }

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome> {
        let targets = self.targets.as_ref().context("Presenting without a swapchain")?;
        targets.swapchain.present(
            self.ctx.presentation_queue().handle,
            image_index,
            &[self.sync.render_done],
        )
    }

    fn flush(&mut self) -> Result<()> {
        self.ctx.wait_idle()
    }

    /// Flush, drop framebuffers, render pass, depth buffer and swapchain in
    /// that order, then rebuild them in reverse.
    fn resize(&mut self) -> Result<ResizeOutcome> {
        let support = SurfaceSupport::query(&self.ctx)?;
        let request = SwapchainRequest {
            vsync: self.settings.vsync,
            present_mode: self.settings.present_mode,
            image_count: self.settings.image_count,
            window_extent: self.settings.window_extent,
        };
        let Some(config) = SwapchainConfig::resolve(&request, &support)? else {
            log::debug!("Surface extent is zero, deferring resize");
            return Ok(ResizeOutcome::Deferred);
        };

        self.ctx.wait_idle()?;
        self.targets = None;

        let targets = SwapchainTargets::new(&self.ctx, &config)?;
        let image_count = targets.swapchain.image_count();
        self.targets = Some(targets);
        if self.frames.image_count() != image_count as usize {
            self.frames = FrameResources::new(&self.ctx, image_count)?;
        }

        self.camera.set_aspect(config.extent.width, config.extent.height);
        log::info!(
            "Resized to {}x{} ({} images)",
            config.extent.width,
            config.extent.height,
            image_count
        );
        Ok(ResizeOutcome::Resized)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Destroying renderer...");
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("Failed to idle device before teardown: {:?}", e);
        }
    }
}

fn load_texture(
    ctx: &Arc<GraphicsContext>,
    submitter: &ImmediateSubmitter,
    path: Option<&Path>,
    fallback: [u8; 4],
) -> Result<Texture> {
    let image = match path {
        Some(path) => DdsImage::load(path)?,
        None => DdsImage::solid_rgba(fallback),
    };
    Texture::create_immediate_dds(ctx, submitter, &image)
}
