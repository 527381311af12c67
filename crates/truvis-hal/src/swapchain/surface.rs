use std::rc::Rc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::{
    error::{HalError, HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
};

/// 外部窗口对应的 vk surface
///
/// instance 需要在创建时传入 display handle，才能加载 surface 扩展
pub struct Surface {
    handle: vk::SurfaceKHR,
    device: Rc<GfxDevice>,
}

impl Surface {
    pub fn new(
        device: Rc<GfxDevice>,
        raw_display_handle: RawDisplayHandle,
        raw_window_handle: RawWindowHandle,
    ) -> HalResult<Self> {
        let instance = device.instance();
        if instance.surface_pf().is_none() {
            return Err(HalError::UnsupportedSurface(
                "instance was created without a display handle".to_string(),
            ));
        }

        let handle = unsafe {
            ash_window::create_surface(
                instance.vk_entry(),
                instance.ash_instance(),
                raw_display_handle,
                raw_window_handle,
                None,
            )
        }
        .vk_context("creating window surface")?;

        let surface = Self { handle, device };
        surface.device.set_debug_name(&surface, "main");
        Ok(surface)
    }

    fn surface_pf(&self) -> HalResult<&ash::khr::surface::Instance> {
        self.device
            .instance()
            .surface_pf()
            .ok_or_else(|| HalError::UnsupportedSurface("surface extension is not loaded".to_string()))
    }
}

// getters
impl Surface {
    #[inline]
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// 实时获取 surface capabilities，窗口大小改变后会变化
    pub fn capabilities(&self) -> HalResult<vk::SurfaceCapabilitiesKHR> {
        unsafe { self.surface_pf()?.get_physical_device_surface_capabilities(self.device.pdevice(), self.handle) }
            .vk_context("querying surface capabilities")
    }

    pub fn formats(&self) -> HalResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe { self.surface_pf()?.get_physical_device_surface_formats(self.device.pdevice(), self.handle) }
            .vk_context("querying surface formats")
    }

    pub fn present_modes(&self) -> HalResult<Vec<vk::PresentModeKHR>> {
        unsafe { self.surface_pf()?.get_physical_device_surface_present_modes(self.device.pdevice(), self.handle) }
            .vk_context("querying surface present modes")
    }

    /// queue family 是否可以 present 到该 surface
    pub fn supports_present(&self, queue_family_index: u32) -> HalResult<bool> {
        unsafe {
            self.surface_pf()?.get_physical_device_surface_support(
                self.device.pdevice(),
                queue_family_index,
                self.handle,
            )
        }
        .vk_context("querying surface present support")
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if let Some(surface_pf) = self.device.instance().surface_pf() {
            unsafe { surface_pf.destroy_surface(self.handle, None) }
        }
    }
}

impl DebugType for Surface {
    fn debug_type_name() -> &'static str {
        "GfxSurface"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
