// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper keeps an Arc<GraphicsContext>
// so the device outlives everything created from it.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod mesh;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::{ContextDesc, GraphicsContext};
pub use swapchain::Swapchain;
