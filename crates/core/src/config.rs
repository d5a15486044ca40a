use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::InferenceBackend;
use crate::dispatcher::DispatchStrategy;
use crate::image_io::OutputFormat;
use crate::pipeline::UpscaleOptions;
use crate::slicer::ChunkLevel;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "UPCHUNK_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub chunk_level: ChunkLevel,
    /// Run inference on a dedicated worker instead of the calling task.
    pub delegate: bool,
    pub preserve_alpha: bool,
    pub backend: InferenceBackend,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    /// 0-100, only used by lossy formats.
    pub quality: u8,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            chunk_level: ChunkLevel::Level2,
            delegate: true,
            preserve_alpha: true,
            backend: InferenceBackend::default(),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            quality: 100,
        }
    }
}

impl InferenceConfig {
    pub fn dispatch_strategy(&self) -> DispatchStrategy {
        if self.delegate {
            DispatchStrategy::Delegated
        } else {
            DispatchStrategy::InProcess
        }
    }

    pub fn upscale_options(&self) -> UpscaleOptions {
        UpscaleOptions {
            chunk_level: self.chunk_level,
            chunk_size: None,
            strategy: self.dispatch_strategy(),
            preserve_alpha: self.preserve_alpha,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `UPCHUNK_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` unchanged when absolute, otherwise joined onto `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.inference.chunk_level, ChunkLevel::Level2);
        assert!(cfg.inference.delegate);
        assert!(cfg.inference.preserve_alpha);
        assert_eq!(cfg.inference.backend, InferenceBackend::Cuda);
        assert_eq!(cfg.inference.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.output.format, OutputFormat::Png);
        assert_eq!(cfg.output.quality, 100);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.inference.chunk_level = ChunkLevel::Level4;
        original.inference.backend = InferenceBackend::Cpu;
        original.output.format = OutputFormat::Webp;

        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults_and_maps_bad_level_to_one() {
        let raw = "[inference]\nchunk_level = 9\ndelegate = false\n\n[output]\nformat = \"jpeg\"\n";
        let cfg: AppConfig = toml::from_str(raw).expect("parse partial config");

        assert_eq!(cfg.inference.chunk_level, ChunkLevel::Level1);
        assert_eq!(cfg.inference.dispatch_strategy(), DispatchStrategy::InProcess);
        assert!(cfg.inference.preserve_alpha);
        assert_eq!(cfg.output.format, OutputFormat::Jpeg);
        assert_eq!(cfg.output.quality, 100);
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn upscale_options_follow_inference_section() {
        let inference = InferenceConfig {
            chunk_level: ChunkLevel::Level3,
            delegate: false,
            preserve_alpha: false,
            ..Default::default()
        };
        let options = inference.upscale_options();
        assert_eq!(options.chunk_level, ChunkLevel::Level3);
        assert_eq!(options.strategy, DispatchStrategy::InProcess);
        assert!(!options.preserve_alpha);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_from_invalid_toml_fails_with_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[inference\n").expect("write config");

        let err = AppConfig::load_from_path(&path).expect_err("invalid toml");
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let root = tempfile::tempdir().expect("tempdir");
        let temp = root.path().join("data");
        initialize_data_dir(&temp).expect("initialize data dir");

        assert!(temp.exists());
        let loaded = AppConfig::load_from_path(&temp.join("config.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[output]\nquality = 80\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_relative_to_handles_absolute_and_relative() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
