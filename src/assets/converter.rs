// Shader source → SPIR-V conversion with a modification-time cache

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

/// Produces (or confirms the freshness of) a binary artifact for a source file.
pub trait ShaderConverter {
    /// Returns the path of an up-to-date binary for `source`.
    fn ensure_binary(&self, source: &Path) -> Result<PathBuf>;
}

/// Deterministic output path: the source path with `.spv` appended.
pub fn output_path(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(".spv");
    PathBuf::from(name)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// True when `output` exists and is at least as new as `source`.
pub fn is_fresh(source: &Path, output: &Path) -> bool {
    match (modified(source), modified(output)) {
        (Some(src), Some(out)) => out >= src,
        // Without a source only the shipped binary can be used
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Runs `glslc` (from the Vulkan SDK) when the cached binary is missing or stale.
#[derive(Debug, Clone)]
pub struct GlslcConverter {
    pub compiler: PathBuf,
    pub ignore_cache: bool,
}

impl GlslcConverter {
    pub fn new(ignore_cache: bool) -> Self {
        Self {
            compiler: PathBuf::from("glslc"),
            ignore_cache,
        }
    }
}

impl ShaderConverter for GlslcConverter {
    fn ensure_binary(&self, source: &Path) -> Result<PathBuf> {
        let output = output_path(source);
        if !self.ignore_cache && is_fresh(source, &output) {
            log::debug!("Shader cache hit: {:?}", output);
            return Ok(output);
        }
        if !source.exists() {
            bail!("Shader source {:?} not found", source);
        }

        log::info!("Compiling {:?} -> {:?}", source, output);
        let status = Command::new(&self.compiler)
            .arg(source)
            .arg("-o")
            .arg(&output)
            .status()
            .with_context(|| {
                format!(
                    "Failed to run {:?}. Install the Vulkan SDK or compile manually: glslc {} -o {}",
                    self.compiler,
                    source.display(),
                    output.display()
                )
            })?;

        if !status.success() {
            bail!("Failed to compile {:?}: exit code {:?}", source, status.code());
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn fixture_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ember-converter-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(path: &Path, time: SystemTime) {
        let file = File::create(path).unwrap();
        file.set_modified(time).unwrap();
    }

    #[test]
    fn output_path_appends_spv() {
        assert_eq!(
            output_path(Path::new("shaders/lit.vert")),
            PathBuf::from("shaders/lit.vert.spv")
        );
    }

    #[test]
    fn newer_binary_is_fresh() {
        let dir = fixture_dir("fresh");
        let source = dir.join("a.vert");
        let now = SystemTime::now();
        touch(&source, now - Duration::from_secs(60));
        touch(&output_path(&source), now);
        assert!(is_fresh(&source, &output_path(&source)));
    }

    #[test]
    fn older_binary_is_stale() {
        let dir = fixture_dir("stale");
        let source = dir.join("a.frag");
        let now = SystemTime::now();
        touch(&source, now);
        touch(&output_path(&source), now - Duration::from_secs(60));
        assert!(!is_fresh(&source, &output_path(&source)));
    }

    #[test]
    fn missing_binary_is_stale() {
        let dir = fixture_dir("missing");
        let source = dir.join("a.vert");
        touch(&source, SystemTime::now());
        assert!(!is_fresh(&source, &output_path(&source)));
    }

    #[test]
    fn cached_binary_skips_compiler() {
        let dir = fixture_dir("cached");
        let source = dir.join("sky.vert");
        let now = SystemTime::now();
        touch(&source, now - Duration::from_secs(60));
        touch(&output_path(&source), now);

        let converter = GlslcConverter {
            compiler: dir.join("no-such-compiler"),
            ignore_cache: false,
        };
        assert_eq!(converter.ensure_binary(&source).unwrap(), output_path(&source));
    }

    #[test]
    fn ignore_cache_forces_conversion() {
        let dir = fixture_dir("forced");
        let source = dir.join("sky.frag");
        let now = SystemTime::now();
        touch(&source, now - Duration::from_secs(60));
        touch(&output_path(&source), now);

        let converter = GlslcConverter {
            compiler: dir.join("no-such-compiler"),
            ignore_cache: true,
        };
        assert!(converter.ensure_binary(&source).is_err());
    }
}
