use std::fs;
use std::path::Path;
use anyhow::Context;
use serde::Deserialize;
use crate::core::UploadConfig;

/// Contents of `config.toml`. Every key is optional.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// 上传地址
    pub destination: Option<String>,
    /// 要上传的文件
    pub files: Vec<String>,
    pub upload: UploadConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::parse(&config_str).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(config_str: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(config_str)?;
        config.upload.retry.strategy
            .validate()
            .map_err(|message| anyhow::anyhow!("Invalid [upload.retry.strategy]: {}", message))?;

        Ok(config)
    }

    /// Loads `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Config> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }
}
