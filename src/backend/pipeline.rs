// Render pass, framebuffers and graphics pipeline creation
//
// The graphics pipeline defines how vertices are processed and rasterized:
// vertex input, shaders, rasterization, depth/stencil and blending.
// Viewport and scissor are dynamic so pipelines survive a resize.

use anyhow::{Context, Result};
use ash::vk;
use std::mem::{offset_of, size_of};
use std::path::PathBuf;
use std::sync::Arc;

use super::descriptor::DescriptorSetLayout;
use super::image::DEPTH_FORMAT;
use super::mesh::{InstanceData, Vertex};
use super::shader::load_shader;
use super::GraphicsContext;
use crate::assets::ShaderConverter;

/// Push constant block of the lit pipeline: MVP + model matrix.
pub const LIT_PUSH_CONSTANT_SIZE: u32 = 128;

/// Single-subpass pass with a cleared colour attachment and depth buffer.
pub struct RenderPass {
    pub render_pass: vk::RenderPass,
    ctx: Arc<GraphicsContext>,
}

impl RenderPass {
    pub fn new(ctx: &Arc<GraphicsContext>, color_format: vk::Format) -> Result<Self> {
        // Color attachment (the swapchain image)
        let color_attachment = vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let depth_attachment = vk::AttachmentDescription::default()
            .format(DEPTH_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)];

        let stages =
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(stages)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )];

        let attachments = [color_attachment, depth_attachment];
        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe { ctx.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        Ok(Self {
            render_pass,
            ctx: ctx.clone(),
        })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_render_pass(self.render_pass, None) };
    }
}

/// One framebuffer per swapchain image, all sharing the depth buffer.
pub struct Framebuffers {
    pub framebuffers: Vec<vk::Framebuffer>,
    ctx: Arc<GraphicsContext>,
}

impl Framebuffers {
    pub fn new(
        ctx: &Arc<GraphicsContext>,
        render_pass: &RenderPass,
        color_views: &[vk::ImageView],
        depth_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut framebuffers = Self {
            framebuffers: Vec::with_capacity(color_views.len()),
            ctx: ctx.clone(),
        };

        for &view in color_views {
            let attachments = [view, depth_view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = unsafe { ctx.device.create_framebuffer(&info, None) }
                .context("Failed to create framebuffer")?;
            framebuffers.framebuffers.push(framebuffer);
        }

        Ok(framebuffers)
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.ctx.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

pub const VERTEX_BINDING: u32 = 0;
pub const INSTANCE_BINDING: u32 = 1;

/// Vertex input bindings and attributes, offsets taken from the Rust structs.
///
/// Binding 0 carries `Vertex` (locations 0-2). With `instanced`, binding 1
/// steps per instance and carries `InstanceData`: the model matrix as four
/// column vectors (locations 3-6) and the colour (location 7).
pub fn vertex_input_layout(
    instanced: bool,
) -> (
    Vec<vk::VertexInputBindingDescription>,
    Vec<vk::VertexInputAttributeDescription>,
) {
    let attribute = |location, binding, format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding,
        format,
        offset: offset as u32,
    };

    let mut bindings = vec![vk::VertexInputBindingDescription {
        binding: VERTEX_BINDING,
        stride: size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let mut attributes = vec![
        attribute(0, VERTEX_BINDING, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, pos)),
        attribute(1, VERTEX_BINDING, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, normal)),
        attribute(2, VERTEX_BINDING, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, uv)),
    ];

    if instanced {
        bindings.push(vk::VertexInputBindingDescription {
            binding: INSTANCE_BINDING,
            stride: size_of::<InstanceData>() as u32,
            input_rate: vk::VertexInputRate::INSTANCE,
        });
        let model = offset_of!(InstanceData, model);
        let column = size_of::<[f32; 4]>();
        for i in 0..4 {
            attributes.push(attribute(
                3 + i as u32,
                INSTANCE_BINDING,
                vk::Format::R32G32B32A32_SFLOAT,
                model + i * column,
            ));
        }
        attributes.push(attribute(
            7,
            INSTANCE_BINDING,
            vk::Format::R32G32B32A32_SFLOAT,
            offset_of!(InstanceData, color),
        ));
    }

    (bindings, attributes)
}

/// Fixed-function choices and shader sources for one drawing technique.
#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub name: &'static str,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub instanced: bool,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub push_constant_size: u32,
}

impl PipelineDesc {
    fn base(name: &'static str, shader_dir: &std::path::Path, stem: &str) -> Self {
        Self {
            name,
            vertex_shader: shader_dir.join(format!("{}.vert", stem)),
            fragment_shader: shader_dir.join(format!("{}.frag", stem)),
            instanced: false,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            push_constant_size: 0,
        }
    }

    /// Instance-buffer driven, drawn with indexed-indirect commands.
    pub fn indirect(shader_dir: &std::path::Path) -> Self {
        Self {
            instanced: true,
            ..Self::base("indirect", shader_dir, "indirect")
        }
    }

    /// Single mesh with its matrices in push constants.
    pub fn lit(shader_dir: &std::path::Path) -> Self {
        Self {
            push_constant_size: LIT_PUSH_CONSTANT_SIZE,
            ..Self::base("lit", shader_dir, "lit")
        }
    }

    /// Viewed from inside: front faces culled, depth neither tested nor written.
    pub fn sky(shader_dir: &std::path::Path) -> Self {
        Self {
            cull_mode: vk::CullModeFlags::FRONT,
            depth_test: false,
            depth_write: false,
            ..Self::base("sky", shader_dir, "sky")
        }
    }
}

pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub name: &'static str,
    ctx: Arc<GraphicsContext>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_pipeline(self.pipeline, None);
            self.ctx.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Build one pipeline; its shader modules are dropped once it exists.
pub fn build_pipeline(
    ctx: &Arc<GraphicsContext>,
    converter: &dyn ShaderConverter,
    render_pass: &RenderPass,
    desc: &PipelineDesc,
    set_layouts: &[&DescriptorSetLayout],
) -> Result<Pipeline> {
    let vert = load_shader(ctx, converter, &desc.vertex_shader, vk::ShaderStageFlags::VERTEX)?;
    let frag = load_shader(ctx, converter, &desc.fragment_shader, vk::ShaderStageFlags::FRAGMENT)?;
    let shader_stages = [vert.stage_info(), frag.stage_info()];

    let (bindings, attributes) = vertex_input_layout(desc.instanced);
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Counts only; the rectangles are set per frame
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(desc.cull_mode)
        .front_face(desc.front_face)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let push_constant_ranges = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: desc.push_constant_size,
    }];
    let raw_set_layouts: Vec<vk::DescriptorSetLayout> =
        set_layouts.iter().map(|l| l.layout).collect();
    let mut layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_set_layouts);
    if desc.push_constant_size > 0 {
        layout_info = layout_info.push_constant_ranges(&push_constant_ranges);
    }

    let layout = unsafe { ctx.device.create_pipeline_layout(&layout_info, None) }
        .with_context(|| format!("Failed to create '{}' pipeline layout", desc.name))?;

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass.render_pass)
        .subpass(0);

    let pipelines = unsafe {
        ctx.device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    let pipeline = match pipelines {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            unsafe { ctx.device.destroy_pipeline_layout(layout, None) };
            return Err(e).with_context(|| format!("Failed to create '{}' pipeline", desc.name));
        }
    };

    log::info!("Built '{}' pipeline", desc.name);
    Ok(Pipeline {
        pipeline,
        layout,
        name: desc.name,
        ctx: ctx.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn vertex_attributes_follow_struct_layout() {
        let (bindings, attributes) = vertex_input_layout(false);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].stride, 32);
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
    }

    #[test]
    fn instance_binding_steps_per_instance() {
        let (bindings, attributes) = vertex_input_layout(true);
        assert_eq!(bindings[1].binding, INSTANCE_BINDING);
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(bindings[1].stride, 80);

        let instance: Vec<(u32, u32)> = attributes
            .iter()
            .filter(|a| a.binding == INSTANCE_BINDING)
            .map(|a| (a.location, a.offset))
            .collect();
        assert_eq!(instance, vec![(3, 0), (4, 16), (5, 32), (6, 48), (7, 64)]);
    }

    #[test]
    fn variants_differ_only_where_expected() {
        let dir = Path::new("shaders");
        let indirect = PipelineDesc::indirect(dir);
        let lit = PipelineDesc::lit(dir);
        let sky = PipelineDesc::sky(dir);

        assert!(indirect.instanced && !lit.instanced && !sky.instanced);
        assert_eq!(lit.push_constant_size, LIT_PUSH_CONSTANT_SIZE);
        assert_eq!(sky.cull_mode, vk::CullModeFlags::FRONT);
        assert!(!sky.depth_test && !sky.depth_write);
        assert!(lit.depth_test && lit.depth_write);
        assert_eq!(sky.vertex_shader, dir.join("sky.vert"));
    }
}
