// External collaborators: shader conversion and texture decoding

pub mod converter;
pub mod dds;

pub use converter::{GlslcConverter, ShaderConverter};
pub use dds::DdsImage;
