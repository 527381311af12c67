use std::rc::Rc;

use ash::vk;

use crate::{
    error::{HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
};

/// binary semaphore，只在 swapchain 的 acquire / present 中使用
pub struct Semaphore {
    handle: vk::Semaphore,
    device: Rc<GfxDevice>,
}

// 创建与销毁
impl Semaphore {
    pub fn new(device: Rc<GfxDevice>, debug_name: &str) -> HalResult<Self> {
        let handle = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .with_vk_context(|| format!("creating semaphore `{}`", debug_name))?;

        let semaphore = Self { handle, device };
        semaphore.device.set_debug_name(&semaphore, debug_name);
        Ok(semaphore)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}

// getters
impl Semaphore {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl DebugType for Semaphore {
    fn debug_type_name() -> &'static str {
        "GfxSemaphore"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
