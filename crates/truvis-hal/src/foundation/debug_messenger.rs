use std::ffi::CStr;

use ash::vk;

use crate::error::{HalResult, VkResultExt};

pub struct DebugMsger {
    pub(crate) vk_debug_utils_instance: ash::ext::debug_utils::Instance,
    pub(crate) vk_debug_utils_messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMsger {
    pub fn new(vk_entry: &ash::Entry, instance: &ash::Instance) -> HalResult<Self> {
        let loader = ash::ext::debug_utils::Instance::new(vk_entry, instance);

        let create_info = Self::debug_utils_messenger_ci();
        let debug_messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .vk_context("creating debug utils messenger")?;

        Ok(Self {
            vk_debug_utils_instance: loader,
            vk_debug_utils_messenger: debug_messenger,
        })
    }
}

impl Drop for DebugMsger {
    fn drop(&mut self) {
        log::info!("Destroying DebugMsger");
        unsafe {
            self.vk_debug_utils_instance.destroy_debug_utils_messenger(self.vk_debug_utils_messenger, None);
        }
    }
}

/// debug messenger 的回调函数，将 validation layer 的消息转到 log 中
///
/// # Safety
/// 由 vulkan loader 调用
unsafe extern "system" fn vk_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = unsafe { *p_callback_data };

    let msg = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() }
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[{:?}]\n{}", message_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[{:?}]\n{}", message_type, msg),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[{:?}]\n{}", message_type, msg),
        _ => log::debug!("[{:?}]\n{}", message_type, msg),
    };

    // 只有 layer developer 才需要返回 True
    vk::FALSE
}

// 构造过程辅助函数
impl DebugMsger {
    const MSG_TYPE: vk::DebugUtilsMessageTypeFlagsEXT = vk::DebugUtilsMessageTypeFlagsEXT::from_raw(
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL.as_raw()
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION.as_raw()
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE.as_raw(),
    );

    const MSG_SEVERITY: vk::DebugUtilsMessageSeverityFlagsEXT = vk::DebugUtilsMessageSeverityFlagsEXT::from_raw(
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING.as_raw() | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR.as_raw(),
    );

    /// 用于创建 debug messenger 的结构体，也会挂到 instance create info 上
    pub fn debug_utils_messenger_ci() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
        vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(Self::MSG_SEVERITY)
            .message_type(Self::MSG_TYPE)
            .pfn_user_callback(Some(vk_debug_callback))
    }
}

/// 可以被设置 debug name 的 vulkan 对象
pub trait DebugType {
    fn debug_type_name() -> &'static str;
    fn vk_handle(&self) -> impl vk::Handle;
}
