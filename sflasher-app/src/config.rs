use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use sflasher_core::FlashConfig;

use crate::cli::FlashArgs;

/// Contents of the `--config` file
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Device used when `--device` is not given
    pub device: Option<String>,
    pub flash: FlashConfig,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    /// File settings (if any) overridden by command line flags
    pub fn load(args: &FlashArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(device) = &args.device {
            config.device = Some(device.clone());
        }
        if let Some(chunk_size) = args.chunk_size {
            config.flash.chunk_size = chunk_size;
        }
        Ok(config)
    }
}
