//! HAL 的启动配置
//!
//! 由外部的 bootstrap / CLI 提供，可以从 TOML 文件读取：
//! ```toml
//! app_name = "sandbox"
//! adapter_index = 0
//! validation = true
//! frames_in_flight = 3
//! pipeline_cache_path = "target/pipeline_cache.bin"
//!
//! [swapchain]
//! width = 1920
//! height = 1280
//! vsync = true
//! srgb = true
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HalError, HalResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapchainConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    pub srgb: bool,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1280,
            vsync: true,
            srgb: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalConfig {
    pub app_name: String,
    /// None 表示优先选择独立显卡
    pub adapter_index: Option<usize>,
    pub validation: bool,
    pub debug_utils: bool,
    pub frames_in_flight: u32,
    /// None 表示不持久化 pipeline cache
    pub pipeline_cache_path: Option<PathBuf>,
    pub log_level: String,
    pub swapchain: SwapchainConfig,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            app_name: "truvis-hal".to_string(),
            adapter_index: None,
            validation: cfg!(debug_assertions),
            debug_utils: cfg!(debug_assertions),
            frames_in_flight: Self::DEFAULT_FRAMES_IN_FLIGHT,
            pipeline_cache_path: None,
            log_level: "info".to_string(),
            swapchain: SwapchainConfig::default(),
        }
    }
}

impl HalConfig {
    pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 3;
    pub const MAX_FRAMES_IN_FLIGHT: u32 = 8;

    pub fn from_toml_str(s: &str) -> HalResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> HalResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| HalError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        log::info!("hal config loaded from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> HalResult<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > Self::MAX_FRAMES_IN_FLIGHT {
            return Err(HalError::InvalidConfig(format!(
                "frames_in_flight must be in 1..={}, got {}",
                Self::MAX_FRAMES_IN_FLIGHT,
                self.frames_in_flight
            )));
        }
        if self.swapchain.width == 0 || self.swapchain.height == 0 {
            return Err(HalError::InvalidConfig(format!(
                "swapchain extent must be non-zero, got {}x{}",
                self.swapchain.width, self.swapchain.height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let config = HalConfig::from_toml_str("").unwrap();
        assert_eq!(config, HalConfig::default());
        assert_eq!(config.frames_in_flight, 3);
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = HalConfig::from_toml_str(
            r#"
            app_name = "sandbox"
            adapter_index = 1
            pipeline_cache_path = "cache/pipelines.bin"

            [swapchain]
            vsync = false
            "#,
        )
        .unwrap();
        assert_eq!(config.app_name, "sandbox");
        assert_eq!(config.adapter_index, Some(1));
        assert_eq!(config.pipeline_cache_path, Some(PathBuf::from("cache/pipelines.bin")));
        assert!(!config.swapchain.vsync);
        assert!(config.swapchain.srgb);
        assert_eq!(config.swapchain.width, 1920);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let err = HalConfig::from_toml_str("frames_in_flight = 0").unwrap_err();
        assert!(matches!(err, HalError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = HalConfig::from_toml_str("frames_in_flight = \"three\"").unwrap_err();
        assert!(matches!(err, HalError::ConfigParse(_)));
    }
}
