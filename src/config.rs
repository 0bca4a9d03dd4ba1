// =============================================================================
// CONFIGURATION - Load settings from config.toml and the command line
// =============================================================================
//
// Every field has a default, so a missing file or a partial file both work.
// Command-line flags override the file once, at startup.

use anyhow::{Context, Result};
use ash::vk;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::ContextDesc;
use crate::renderer::RendererSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub assets: AssetsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Ember".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentModeChoice {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

impl From<PresentModeChoice> for vk::PresentModeKHR {
    fn from(choice: PresentModeChoice) -> Self {
        match choice {
            PresentModeChoice::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentModeChoice::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentModeChoice::Fifo => vk::PresentModeKHR::FIFO,
            PresentModeChoice::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub vsync: bool,
    /// Explicit present mode; overrides `vsync` when set.
    pub present_mode: Option<PresentModeChoice>,
    pub clear_color: [f32; 4],
    pub image_count: u32,
    pub device_index: Option<usize>,
    pub max_draws: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            present_mode: None,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            image_count: 3,
            device_index: None,
            max_draws: 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Wins over `graphics.device_index`.
    pub force_device_index: Option<usize>,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            force_device_index: None,
            log_to_file: false,
            log_file: "ember.log".to_string(),
            show_fps: true,
        }
    }
}

/// Asset locations
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub shader_dir: PathBuf,
    pub texture: Option<PathBuf>,
    pub sky_texture: Option<PathBuf>,
    /// Recompile shaders even when the cached binaries are fresh.
    pub ignore_cache: bool,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("shaders"),
            texture: None,
            sky_texture: None,
            ignore_cache: false,
        }
    }
}

/// Command-line overrides
#[derive(Debug, Parser)]
#[command(name = "ember-render", version, about = "Explicit-API GPU renderer")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Physical device index
    #[arg(long)]
    pub device: Option<usize>,

    /// Prefer a vsynced present mode
    #[arg(long, conflicts_with = "no_vsync")]
    pub vsync: bool,

    /// Prefer a tearing, lowest-latency present mode
    #[arg(long)]
    pub no_vsync: bool,

    /// Enable the Khronos validation layer
    #[arg(long)]
    pub validation: bool,

    /// Recompile shaders regardless of the cache
    #[arg(long)]
    pub ignore_cache: bool,
}

impl Config {
    /// Like `load_from_path`, but a broken file only costs a warning.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load_from_path(path).unwrap_or_else(|e| {
            log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(device) = cli.device {
            self.graphics.device_index = Some(device);
        }
        if cli.vsync {
            self.graphics.vsync = true;
        }
        if cli.no_vsync {
            self.graphics.vsync = false;
        }
        if cli.validation {
            self.debug.validation_layers = true;
        }
        if cli.ignore_cache {
            self.assets.ignore_cache = true;
        }
    }

    pub fn context_desc(&self) -> ContextDesc {
        ContextDesc {
            app_name: self.window.title.clone(),
            validation: self.debug.validation_layers,
            device_index: self.graphics.device_index,
            forced_device_index: self.debug.force_device_index,
        }
    }

    pub fn renderer_settings(&self, width: u32, height: u32) -> RendererSettings {
        RendererSettings {
            vsync: self.graphics.vsync,
            present_mode: self.graphics.present_mode.map(Into::into),
            image_count: self.graphics.image_count,
            clear_color: self.graphics.clear_color,
            max_draws: self.graphics.max_draws,
            shader_dir: self.assets.shader_dir.clone(),
            texture: self.assets.texture.clone(),
            sky_texture: self.assets.sky_texture.clone(),
            window_extent: vk::Extent2D { width, height },
        }
    }
}
