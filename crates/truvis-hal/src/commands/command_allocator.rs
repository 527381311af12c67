use std::{cell::Cell, rc::Rc};

use ash::vk;

use crate::{
    commands::{capability::QueueCapability, command_list::CommandList, command_queue::QueueFamily},
    error::{HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
};

/// command pool 本体，由 allocator 和从中分配的 command list 共同持有
///
/// 所有 command list 释放之后才会销毁 pool
pub(crate) struct CommandPool {
    handle: vk::CommandPool,
    /// 每次 reset 加一，用来判断 list 中录制的内容是否已经失效
    generation: Cell<u64>,
    name: String,
    device: Rc<GfxDevice>,
}

impl CommandPool {
    #[inline]
    pub(crate) fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.get()
    }

    #[inline]
    pub(crate) fn device(&self) -> &Rc<GfxDevice> {
        &self.device
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        log::debug!("destroying command pool `{}`", self.name);
        unsafe {
            self.device.destroy_command_pool(self.handle, None);
        }
    }
}

impl DebugType for CommandPool {
    fn debug_type_name() -> &'static str {
        "GfxCommandPool"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

/// command pool 是和 queue family 绑定的，而不是和 queue 绑定的
///
/// allocator 的能力等级就是 queue family 的能力等级，分配出的 list 继承该等级
pub struct CommandAllocator {
    pool: Rc<CommandPool>,
    queue_family: QueueFamily,
}

impl CommandAllocator {
    pub fn new(device: Rc<GfxDevice>, queue_family: &QueueFamily, debug_name: &str) -> HalResult<Self> {
        let pool_ci = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family.queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let handle = unsafe { device.create_command_pool(&pool_ci, None) }
            .with_vk_context(|| format!("creating command pool `{}`", debug_name))?;

        let pool = CommandPool {
            handle,
            generation: Cell::new(0),
            name: debug_name.to_string(),
            device,
        };
        pool.device.set_debug_name(&pool, debug_name);

        Ok(Self {
            pool: Rc::new(pool),
            queue_family: queue_family.clone(),
        })
    }

    /// 从 pool 中分配一个 primary command list，初始状态为 Initial
    pub fn allocate_list(&self, debug_name: &str) -> HalResult<CommandList> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool.handle())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let handles = unsafe { self.pool.device().allocate_command_buffers(&info) }
            .with_vk_context(|| format!("allocating command list `{}`", debug_name))?;
        let handle = handles[0];

        Ok(CommandList::new(
            handle,
            self.queue_family.capability,
            self.queue_family.queue_family_index,
            self.pool.clone(),
            debug_name,
        ))
    }

    /// 这个调用并不会释放 command list，而是将 pool 内的所有 list 设置到初始状态
    ///
    /// 调用者需要保证 pool 内的 list 都已经执行完毕
    pub fn reset(&self) -> HalResult<()> {
        unsafe {
            self.pool.device().reset_command_pool(self.pool.handle(), vk::CommandPoolResetFlags::RELEASE_RESOURCES)
        }
        .with_vk_context(|| format!("resetting command pool `{}`", self.pool.name))?;
        self.pool.generation.set(self.pool.generation() + 1);
        Ok(())
    }
}

// getters
impl CommandAllocator {
    #[inline]
    pub fn capability(&self) -> QueueCapability {
        self.queue_family.capability
    }

    #[inline]
    pub fn queue_family(&self) -> &QueueFamily {
        &self.queue_family
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool.handle()
    }
}
