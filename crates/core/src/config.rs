use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "FRAMEDOUBLE_DATA_DIR";
pub const DEFAULT_ENGINE_PROGRAM: &str = "rife-ncnn-vulkan";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSettings,
    pub encoder: EncoderSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Interpolation engine binary, a path or a bare name looked up on PATH.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Number of engine instances run in parallel.
    pub workers: usize,
    /// Per-request deadline in seconds; 0 disables it.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncoderSettings {
    pub codec: String,
    pub crf: u32,
    pub pixel_format: String,
    pub color_primaries: String,
    pub color_trc: String,
    pub colorspace: String,
    pub copy_audio: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Depth of the bounded queues between stages.
    pub buffer_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_ENGINE_PROGRAM),
            args: Vec::new(),
            workers: 3,
            request_timeout_secs: 120,
        }
    }
}

impl EngineSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: "hevc".to_string(),
            crf: 18,
            pixel_format: "yuv420p10le".to_string(),
            color_primaries: "bt2020".to_string(),
            color_trc: "arib-std-b67".to_string(),
            colorspace: "bt2020nc".to_string(),
            copy_audio: true,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { buffer_size: 4 }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw).map_err(|e| {
            PipelineError::Configuration(format!(
                "failed to parse config TOML {}: {e}",
                path.display()
            ))
            .into()
        })
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

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. FRAMEDOUBLE_DATA_DIR environment variable
/// 3. Default: ./data
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

/// Create the data directory and a default config.toml on first run.
/// An existing config file is never overwritten.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.engine.program, PathBuf::from("rife-ncnn-vulkan"));
        assert!(cfg.engine.args.is_empty());
        assert_eq!(cfg.engine.workers, 3);
        assert_eq!(cfg.engine.request_timeout(), Some(Duration::from_secs(120)));

        assert_eq!(cfg.encoder.codec, "hevc");
        assert_eq!(cfg.encoder.crf, 18);
        assert_eq!(cfg.encoder.pixel_format, "yuv420p10le");
        assert_eq!(cfg.encoder.color_primaries, "bt2020");
        assert_eq!(cfg.encoder.color_trc, "arib-std-b67");
        assert_eq!(cfg.encoder.colorspace, "bt2020nc");
        assert!(cfg.encoder.copy_audio);

        assert_eq!(cfg.pipeline.buffer_size, 4);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.engine.args = vec!["-g".to_string(), "0".to_string()];
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine]\nworkers = 8\nrequest_timeout_secs = 0\n").unwrap();

        let cfg = AppConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.engine.workers, 8);
        assert_eq!(cfg.engine.request_timeout(), None);
        assert_eq!(cfg.engine.program, PathBuf::from(DEFAULT_ENGINE_PROGRAM));
        assert_eq!(cfg.encoder, EncoderSettings::default());
    }

    #[test]
    fn malformed_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine\nworkers = ").unwrap();

        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_var_then_default() {
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
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("nested").join("data");
        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&data)).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().unwrap();
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[engine]\nworkers = 9\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }
}
