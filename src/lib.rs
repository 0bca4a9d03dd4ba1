// Explicit-API GPU renderer core
//
// `backend` wraps the Vulkan objects (context, swapchain, memory, commands,
// pipelines), `renderer` drives them frame by frame, and `assets` loads the
// shaders and textures they consume.

pub mod assets;
pub mod backend;
pub mod config;
pub mod renderer;
