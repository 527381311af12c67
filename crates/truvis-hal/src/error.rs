//! HAL 层的错误类型
//!
//! 所有底层 Vulkan 调用的失败都在出错的调用点被转换为 [`HalError`]，
//! 并带上足够的上下文（对象类型、请求的 key），不会被吞掉。

use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

use crate::commands::capability::QueueCapability;

#[derive(Error, Debug)]
pub enum HalError {
    // ========================================================================
    // 初始化与能力
    // ========================================================================
    #[error("failed to load vulkan entry: {0}")]
    LoaderUnavailable(String),

    #[error("no vulkan adapter found")]
    NoAdapter,

    #[error("adapter index {index} out of range ({available} adapters available)")]
    AdapterNotFound { index: usize, available: usize },

    /// 必需的 feature 缺失，属于致命的配置错误
    #[error("required device feature missing: {0}")]
    MissingFeature(&'static str),

    #[error("required extension missing: {0}")]
    MissingExtension(String),

    #[error("no queue family provides {0:?} capability")]
    QueueUnavailable(QueueCapability),

    #[error("operation requires {required:?} capability, but `{name}` only has {actual:?}")]
    CapabilityMismatch {
        name: String,
        required: QueueCapability,
        actual: QueueCapability,
    },

    #[error("command list `{name}` belongs to queue family {list_family}, queue is family {queue_family}")]
    QueueFamilyMismatch {
        name: String,
        list_family: u32,
        queue_family: u32,
    },

    // ========================================================================
    // 同步
    // ========================================================================
    #[error("device lost while {0}")]
    DeviceLost(String),

    /// 超过平台最大超时的等待，视为设备已挂起，不会重试
    #[error("wait timed out while {0}; device is assumed hung")]
    WaitTimeout(String),

    #[error("fence `{name}` signal to {requested} is not above completed value {completed}")]
    NonMonotonicSignal {
        name: String,
        completed: u64,
        requested: u64,
    },

    #[error("fence `{name}` value {requested} was never reserved, expected value is {expected}")]
    UnreservedFenceValue {
        name: String,
        requested: u64,
        expected: u64,
    },

    /// 某次提交失败，预留的值永远不会被 signal，fence 需要重新创建
    #[error("fence `{name}` value {requested} can never complete, the submission signaling {abandoned} failed")]
    FenceAbandoned {
        name: String,
        requested: u64,
        abandoned: u64,
    },

    #[error("frame {got} advanced out of order, expected frame {expected}")]
    FrameOrder { expected: u64, got: u64 },

    // ========================================================================
    // 命令录制
    // ========================================================================
    #[error("command list `{name}` cannot {op} while {state}")]
    InvalidCommandListState {
        name: String,
        op: &'static str,
        state: &'static str,
    },

    // ========================================================================
    // 交换链
    // ========================================================================
    #[error("swapchain slot {slot} cannot {op} while {state}")]
    SwapchainSlot {
        slot: usize,
        op: &'static str,
        state: &'static str,
    },

    #[error("swapchain resize requested with {outstanding} acquired image(s) outstanding")]
    SwapchainBusy { outstanding: usize },

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("surface is not supported: {0}")]
    UnsupportedSurface(String),

    // ========================================================================
    // 缓存与描述符
    // ========================================================================
    #[error(
        "descriptor binding (set {set}, binding {binding}) declared as {first_type:?}x{first_count} \
         and {second_type:?}x{second_count} by different stages"
    )]
    DescriptorConflict {
        set: u32,
        binding: u32,
        first_type: vk::DescriptorType,
        first_count: u32,
        second_type: vk::DescriptorType,
        second_count: u32,
    },

    #[error("shader `{name}` is not valid SPIR-V: {source}")]
    InvalidShaderCode {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("render pass `{pass}` attachment mismatch: {detail}")]
    AttachmentMismatch { pass: String, detail: String },

    #[error("pipeline cache file {path:?}: {source}")]
    PipelineCacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ========================================================================
    // 配置
    // ========================================================================
    #[error("config file {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // 其他 vulkan 错误
    // ========================================================================
    #[error("vulkan error while {context}: {result}")]
    Vulkan { context: String, result: vk::Result },
}

pub type HalResult<T> = Result<T, HalError>;

impl HalError {
    /// 设备丢失、等待超时以及被废弃的 fence 都是不可恢复的
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, HalError::DeviceLost(_) | HalError::WaitTimeout(_) | HalError::FenceAbandoned { .. })
    }

    pub fn from_vk(result: vk::Result, context: impl Into<String>) -> Self {
        let context = context.into();
        match result {
            vk::Result::ERROR_DEVICE_LOST => HalError::DeviceLost(context),
            vk::Result::TIMEOUT => HalError::WaitTimeout(context),
            vk::Result::ERROR_OUT_OF_DATE_KHR => HalError::SwapchainOutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => HalError::UnsupportedSurface(context),
            _ => HalError::Vulkan { context, result },
        }
    }
}

/// 给 `VkResult` 附加出错时的上下文
pub trait VkResultExt<T> {
    fn vk_context(self, context: impl Into<String>) -> HalResult<T>;

    fn with_vk_context<F, S>(self, f: F) -> HalResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    #[inline]
    fn vk_context(self, context: impl Into<String>) -> HalResult<T> {
        self.map_err(|result| HalError::from_vk(result, context))
    }

    #[inline]
    fn with_vk_context<F, S>(self, f: F) -> HalResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|result| HalError::from_vk(result, f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_fatal() {
        let err: HalResult<()> = Err(vk::Result::ERROR_DEVICE_LOST).vk_context("waiting fence `frame`");
        let err = err.unwrap_err();
        assert!(matches!(err, HalError::DeviceLost(ref ctx) if ctx == "waiting fence `frame`"));
        assert!(err.is_fatal());
    }

    #[test]
    fn timeout_maps_to_wait_timeout() {
        let err = HalError::from_vk(vk::Result::TIMEOUT, "acquire");
        assert!(matches!(err, HalError::WaitTimeout(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn other_results_keep_context() {
        let err = HalError::from_vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, "create framebuffer");
        assert!(!err.is_fatal());
        let expected = format!("vulkan error while create framebuffer: {}", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(err.to_string(), expected);
    }
}
