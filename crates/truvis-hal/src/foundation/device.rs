use std::{ffi::CStr, ops::Deref, rc::Rc};

use ash::vk;
use itertools::Itertools;

use crate::{
    error::{HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, instance::GfxInstance, physical_device::GfxPhysicalDevice},
};

/// Vulkan 逻辑设备封装，持有 device 级别的函数表
///
/// 在 instance 函数表之后创建；通过 `Rc` 在各个对象之间共享，
/// 最后一个引用释放时销毁 device，之后才会销毁 instance。
///
/// # 扩展支持
/// - Swapchain (KHR)
/// - Debug Utils (EXT)，仅在 instance 开启时加载
pub struct GfxDevice {
    /// 核心 Vulkan 设备 API
    pub(crate) device: ash::Device,
    /// 交换链扩展 API
    pub(crate) swapchain: ash::khr::swapchain::Device,
    /// 调试工具扩展 API
    pub(crate) debug_utils: Option<ash::ext::debug_utils::Device>,

    pub(crate) swapchain_enabled: bool,
    pub(crate) descriptor_indexing_enabled: bool,

    pub(crate) pdevice: vk::PhysicalDevice,
    pub(crate) instance: Rc<GfxInstance>,
}

// 构造与销毁
impl GfxDevice {
    pub fn new(
        instance: Rc<GfxInstance>,
        pdevice: &GfxPhysicalDevice,
        queue_create_infos: &[vk::DeviceQueueCreateInfo],
    ) -> HalResult<Self> {
        let feature_support = pdevice.feature_support();
        feature_support.check_required()?;

        // device 所需的所有 extension
        let swapchain_enabled = pdevice.supports_extension(ash::khr::swapchain::NAME);
        if !swapchain_enabled {
            log::warn!("{:?} is not supported, presentation is disabled", ash::khr::swapchain::NAME);
        }
        let device_exts: Vec<&CStr> = if swapchain_enabled { vec![ash::khr::swapchain::NAME] } else { vec![] };
        log::info!("device exts: {}", device_exts.iter().map(|ext| format!("\n\t{:?}", ext)).join(""));
        let device_ext_ptrs = device_exts.iter().map(|ext| ext.as_ptr()).collect_vec();

        let descriptor_indexing_enabled = feature_support.descriptor_indexing;
        if !descriptor_indexing_enabled {
            log::warn!("descriptor indexing is not supported, variable-count descriptor bindings are disabled");
        }

        // device 所需的所有 features
        let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(true)
            .imageless_framebuffer(true)
            .descriptor_binding_partially_bound(descriptor_indexing_enabled) // 即使一些 descriptor 是 invalid
            .descriptor_binding_variable_descriptor_count(descriptor_indexing_enabled)
            .runtime_descriptor_array(descriptor_indexing_enabled);
        let mut vk13_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
        let mut all_features = vk::PhysicalDeviceFeatures2::default()
            .features(vk::PhysicalDeviceFeatures::default())
            .push_next(&mut vk12_features)
            .push_next(&mut vk13_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(queue_create_infos)
            .enabled_extension_names(&device_ext_ptrs)
            .push_next(&mut all_features);

        let device = unsafe { instance.ash_instance.create_device(pdevice.vk_handle(), &device_create_info, None) }
            .vk_context("creating logical device")?;

        let vk_swapchain = ash::khr::swapchain::Device::new(&instance.ash_instance, &device);
        let vk_debug_utils_device = instance
            .debug_utils_enabled()
            .then(|| ash::ext::debug_utils::Device::new(&instance.ash_instance, &device));

        Ok(Self {
            device,
            swapchain: vk_swapchain,
            debug_utils: vk_debug_utils_device,
            swapchain_enabled,
            descriptor_indexing_enabled,
            pdevice: pdevice.vk_handle(),
            instance,
        })
    }
}

impl Drop for GfxDevice {
    fn drop(&mut self) {
        log::info!("destroying device");
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device wait idle failed before destroy: {}", e);
            }
            self.device.destroy_device(None);
        }
    }
}

// getters
impl GfxDevice {
    #[inline]
    pub fn ash_handle(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn vk_handle(&self) -> vk::Device {
        self.device.handle()
    }

    #[inline]
    pub fn instance(&self) -> &GfxInstance {
        &self.instance
    }

    #[inline]
    pub fn swapchain_pf(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain
    }

    #[inline]
    pub fn swapchain_enabled(&self) -> bool {
        self.swapchain_enabled
    }

    #[inline]
    pub fn descriptor_indexing_enabled(&self) -> bool {
        self.descriptor_indexing_enabled
    }

    #[inline]
    pub fn pdevice(&self) -> vk::PhysicalDevice {
        self.pdevice
    }
}

// debug name
impl GfxDevice {
    /// release 下不会生效，也不影响正确性
    #[inline]
    pub fn set_object_debug_name<T: vk::Handle>(&self, handle: T, name: impl AsRef<str>) {
        #[cfg(debug_assertions)]
        {
            let Some(debug_utils) = self.debug_utils.as_ref() else {
                return;
            };
            let Ok(name) = std::ffi::CString::new(name.as_ref()) else {
                return;
            };
            let result = unsafe {
                debug_utils.set_debug_utils_object_name(
                    &vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle),
                )
            };
            if let Err(e) = result {
                log::debug!("failed to set debug name {:?}: {}", name, e);
            }
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (handle, name);
        }
    }

    #[inline]
    pub fn set_debug_name<T: DebugType>(&self, handle: &T, name: impl AsRef<str>) {
        #[cfg(debug_assertions)]
        self.set_object_debug_name(handle.vk_handle(), format!("{}::{}", T::debug_type_name(), name.as_ref()));
        #[cfg(not(debug_assertions))]
        {
            let _ = (handle, name);
        }
    }
}

impl Deref for GfxDevice {
    type Target = ash::Device;
    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl DebugType for GfxDevice {
    fn debug_type_name() -> &'static str {
        "GfxDevice"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.device.handle()
    }
}
