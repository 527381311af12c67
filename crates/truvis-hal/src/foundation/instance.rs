use std::{
    collections::HashSet,
    ffi::{CStr, CString, c_char},
};

use ash::vk;
use itertools::Itertools;
use raw_window_handle::RawDisplayHandle;

use crate::{
    error::{HalError, HalResult, VkResultExt},
    foundation::debug_messenger::DebugMsger,
};

/// instance 级别的函数表
///
/// 初始化顺序：entry -> instance 函数 -> (device 创建之后) device 函数
pub struct GfxInstance {
    pub(crate) debug_msger: Option<DebugMsger>,

    /// 仅当传入 display handle 时才会加载
    pub(crate) surface_pf: Option<ash::khr::surface::Instance>,

    pub(crate) ash_instance: ash::Instance,

    pub(crate) debug_utils_enabled: bool,

    /// vk 基础函数的接口
    ///
    /// 在 drop 之后，会卸载 dll，因此需要确保该字段最后 drop
    pub(crate) vk_entry: ash::Entry,
}

impl GfxInstance {
    const ENGINE_NAME: &'static str = "Truvis-HAL";
    const VALIDATION_LAYER: &'static CStr = c"VK_LAYER_KHRONOS_validation";

    /// 设置所需的 layers 和 extensions，创建 vk instance
    ///
    /// # param
    /// * display_handle - 需要 present 时传入，用于启用 surface 相关的 extension
    pub fn new(
        app_name: &str,
        validation: bool,
        debug_utils: bool,
        display_handle: Option<RawDisplayHandle>,
    ) -> HalResult<Self> {
        let vk_entry = unsafe { ash::Entry::load() }.map_err(|e| HalError::LoaderUnavailable(e.to_string()))?;

        let app_name = CString::new(app_name).map_err(|e| HalError::InvalidConfig(e.to_string()))?;
        let engine_name = CString::new(Self::ENGINE_NAME).map_err(|e| HalError::InvalidConfig(e.to_string()))?;
        let app_info = vk::ApplicationInfo::default()
            .api_version(vk::API_VERSION_1_3) // 版本过低时，有些函数无法正确加载
            .application_name(app_name.as_c_str())
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name.as_c_str())
            .engine_version(vk::make_api_version(0, 1, 0, 0));

        let supported_exts = unsafe { vk_entry.enumerate_instance_extension_properties(None) }
            .vk_context("enumerating instance extensions")?
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect::<HashSet<_>>();

        let mut required_exts: Vec<&CStr> = Vec::new();
        if let Some(display_handle) = display_handle {
            let surface_exts = ash_window::enumerate_required_extensions(display_handle)
                .vk_context("querying surface extensions")?;
            required_exts.extend(surface_exts.iter().map(|ext| unsafe { CStr::from_ptr(*ext) }));
        }
        if let Some(missing) = required_exts.iter().find(|ext| !supported_exts.contains(**ext)) {
            return Err(HalError::MissingExtension(missing.to_string_lossy().into_owned()));
        }

        let debug_utils_enabled = debug_utils && supported_exts.contains(vk::EXT_DEBUG_UTILS_NAME);
        if debug_utils && !debug_utils_enabled {
            log::warn!("{:?} is not supported, debug names and messenger are disabled", vk::EXT_DEBUG_UTILS_NAME);
        }
        if debug_utils_enabled {
            required_exts.push(vk::EXT_DEBUG_UTILS_NAME);
        }

        let enabled_exts: Vec<*const c_char> = required_exts.iter().map(|ext| ext.as_ptr()).collect_vec();
        log::info!("instance extensions: {}", required_exts.iter().map(|ext| format!("\n\t{:?}", ext)).join(""));

        let enabled_layers = Self::get_layers(&vk_entry, validation)?;
        log::info!("instance layers: {}", enabled_layers.iter().map(|layer| format!("\n\t{:?}", layer)).join(""));
        let enabled_layers = enabled_layers.iter().map(|layer| layer.as_ptr()).collect_vec();

        let mut instance_ci = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_exts)
            .enabled_layer_names(&enabled_layers);

        // 为 instance info 添加 debug messenger，覆盖 instance 创建与销毁的过程
        let mut debug_utils_messenger_ci = DebugMsger::debug_utils_messenger_ci();
        if debug_utils_enabled {
            instance_ci = instance_ci.push_next(&mut debug_utils_messenger_ci);
        }

        let ash_instance =
            unsafe { vk_entry.create_instance(&instance_ci, None) }.vk_context("creating vulkan instance")?;

        let debug_msger = if debug_utils_enabled {
            match DebugMsger::new(&vk_entry, &ash_instance) {
                Ok(msger) => Some(msger),
                Err(e) => {
                    unsafe { ash_instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface_pf = display_handle.map(|_| ash::khr::surface::Instance::new(&vk_entry, &ash_instance));

        Ok(Self {
            debug_msger,
            surface_pf,
            ash_instance,
            debug_utils_enabled,
            vk_entry,
        })
    }

    /// validation layer 不可用时只会给出警告
    fn get_layers(vk_entry: &ash::Entry, validation: bool) -> HalResult<Vec<&'static CStr>> {
        if !validation {
            return Ok(Vec::new());
        }

        let all_layer_props =
            unsafe { vk_entry.enumerate_instance_layer_properties() }.vk_context("enumerating instance layers")?;
        let supported = all_layer_props
            .iter()
            .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == Self::VALIDATION_LAYER));

        if supported {
            Ok(vec![Self::VALIDATION_LAYER])
        } else {
            log::warn!("{:?} requested but not available, continuing without it", Self::VALIDATION_LAYER);
            Ok(Vec::new())
        }
    }
}

impl Drop for GfxInstance {
    fn drop(&mut self) {
        log::info!("Destroying GfxInstance");
        // messenger 需要在 instance 之前销毁
        self.debug_msger.take();
        unsafe {
            self.ash_instance.destroy_instance(None);
        }
    }
}

// getter
impl GfxInstance {
    #[inline]
    pub fn ash_instance(&self) -> &ash::Instance {
        &self.ash_instance
    }

    #[inline]
    pub fn vk_instance(&self) -> vk::Instance {
        self.ash_instance.handle()
    }

    #[inline]
    pub fn vk_entry(&self) -> &ash::Entry {
        &self.vk_entry
    }

    #[inline]
    pub fn surface_pf(&self) -> Option<&ash::khr::surface::Instance> {
        self.surface_pf.as_ref()
    }

    #[inline]
    pub fn debug_utils_enabled(&self) -> bool {
        self.debug_utils_enabled
    }
}
