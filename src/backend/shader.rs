// Shader module loading
//
// Vulkan consumes SPIR-V words. Binaries are produced on demand by a
// ShaderConverter and only live until the pipeline using them is built.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use super::GraphicsContext;
use crate::assets::ShaderConverter;

pub const ENTRY_POINT: &CStr = c"main";

/// Transient shader module, destroyed on drop.
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    ctx: Arc<GraphicsContext>,
}

impl ShaderModule {
    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .module(self.module)
            .name(ENTRY_POINT)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_shader_module(self.module, None) };
    }
}

/// Create a module from SPIR-V bytes; rejects data that is not whole words.
pub fn create_shader_module(
    ctx: &Arc<GraphicsContext>,
    code: &[u8],
    stage: vk::ShaderStageFlags,
) -> Result<ShaderModule> {
    let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
        .context("Invalid SPIR-V binary")?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
    let module = unsafe { ctx.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")?;

    Ok(ShaderModule {
        module,
        stage,
        ctx: ctx.clone(),
    })
}

/// Convert `source` if its binary is missing or stale, then load it.
pub fn load_shader(
    ctx: &Arc<GraphicsContext>,
    converter: &dyn ShaderConverter,
    source: &Path,
    stage: vk::ShaderStageFlags,
) -> Result<ShaderModule> {
    let binary = converter.ensure_binary(source)?;
    let code =
        std::fs::read(&binary).with_context(|| format!("Failed to read shader {:?}", binary))?;
    create_shader_module(ctx, &code, stage).with_context(|| format!("Shader {:?}", binary))
}

#[cfg(test)]
mod tests {
    #[test]
    fn spirv_reader_checks_word_size() {
        let odd = [0x03u8, 0x02, 0x23];
        assert!(ash::util::read_spv(&mut std::io::Cursor::new(&odd[..])).is_err());

        let magic = 0x0723_0203u32.to_le_bytes();
        let words = ash::util::read_spv(&mut std::io::Cursor::new(&magic[..])).unwrap();
        assert_eq!(words, vec![0x0723_0203]);
    }
}
