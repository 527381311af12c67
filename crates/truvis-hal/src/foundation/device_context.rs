use std::{path::Path, rc::Rc};

use ash::vk;
use itertools::Itertools;
use raw_window_handle::RawDisplayHandle;

use crate::{
    commands::{
        capability::QueueCapability,
        command_allocator::CommandAllocator,
        command_queue::{CommandQueue, QueueFamily},
        fence::Fence,
    },
    config::HalConfig,
    error::{HalError, HalResult},
    foundation::{
        device::GfxDevice,
        instance::GfxInstance,
        mem_allocator::MemoryAllocator,
        physical_device::{AdapterInfo, GfxPhysicalDevice, select_adapter},
    },
    pipelines::pipeline_cache::PipelineCache,
};

/// instance + adapter + device，以及每一类能力各一个 queue
///
/// 创建顺序：instance 函数表 -> 选择 adapter -> device 函数表 -> queue。
/// 不存在的 queue 类别在创建时给出警告，之后依赖它的操作直接返回错误。
pub struct DeviceContext {
    graphics_queue: Option<CommandQueue>,
    compute_queue: Option<CommandQueue>,
    transfer_queue: Option<CommandQueue>,

    frames_in_flight: u32,
    adapters: Vec<AdapterInfo>,
    physical_device: GfxPhysicalDevice,

    device: Rc<GfxDevice>,
}

// 创建与销毁
impl DeviceContext {
    /// # param
    /// * display_handle - 需要 present 时传入，用来开启 surface 相关的 instance extension
    pub fn new(config: &HalConfig, display_handle: Option<RawDisplayHandle>) -> HalResult<Self> {
        config.validate()?;

        let instance = Rc::new(GfxInstance::new(
            &config.app_name,
            config.validation,
            config.debug_utils,
            display_handle,
        )?);

        let mut physical_devices = GfxPhysicalDevice::enumerate(instance.ash_instance())?;
        let adapters = physical_devices.iter().map(|pdevice| pdevice.info().clone()).collect_vec();
        let selected = select_adapter(&adapters, config.adapter_index)?;
        let physical_device = physical_devices.swap_remove(selected);
        log::info!("selected gpu[{}]: {}", physical_device.info().index, physical_device.info().name);

        let queue_families = physical_device.queue_families().clone();
        for capability in QueueCapability::ALL {
            match queue_families.get(capability) {
                Some(family) => log::info!("{} queue family:\n{:#?}", capability, family),
                None => log::warn!("no dedicated {} queue family, {} queue is absent", capability, capability),
            }
        }

        let priorities = [1.0_f32];
        let queue_create_infos = queue_families
            .iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.queue_family_index)
                    .queue_priorities(&priorities)
            })
            .collect_vec();

        let device = Rc::new(GfxDevice::new(instance, &physical_device, &queue_create_infos)?);
        device.set_object_debug_name(device.instance().vk_instance(), "GfxInstance");
        device.set_object_debug_name(physical_device.vk_handle(), "GfxPhysicalDevice");
        device.set_object_debug_name(device.vk_handle(), "GfxDevice");

        let make_queue = |family: &Option<QueueFamily>| {
            family.as_ref().map(|family| CommandQueue::new(device.clone(), family.clone(), 0))
        };
        let graphics_queue = make_queue(&queue_families.graphics);
        let compute_queue = make_queue(&queue_families.compute);
        let transfer_queue = make_queue(&queue_families.transfer);

        Ok(Self {
            graphics_queue,
            compute_queue,
            transfer_queue,
            frames_in_flight: config.frames_in_flight,
            adapters,
            physical_device,
            device,
        })
    }

    /// 仅创建 instance，列出所有的 adapter，供外部选择 adapter index
    pub fn enumerate_adapters(config: &HalConfig) -> HalResult<Vec<AdapterInfo>> {
        let instance = GfxInstance::new(&config.app_name, false, false, None)?;
        let adapters = GfxPhysicalDevice::enumerate(instance.ash_instance())?
            .into_iter()
            .map(|pdevice| pdevice.info().clone())
            .collect_vec();
        if adapters.is_empty() {
            return Err(HalError::NoAdapter);
        }
        Ok(adapters)
    }

    /// 阻塞直到所有 queue 上的工作完成
    pub fn wait_idle(&self) -> HalResult<()> {
        for queue in self.queues() {
            queue.wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            log::error!("failed to idle queues before destroying device context: {}", e);
        }
    }
}

// getters
impl DeviceContext {
    /// 对应能力的 queue；该类 queue 不存在时直接返回错误
    pub fn queue(&self, capability: QueueCapability) -> HalResult<&CommandQueue> {
        let queue = match capability {
            QueueCapability::Graphics => self.graphics_queue.as_ref(),
            QueueCapability::Compute => self.compute_queue.as_ref(),
            QueueCapability::Transfer => self.transfer_queue.as_ref(),
        };
        queue.ok_or(HalError::QueueUnavailable(capability))
    }

    #[inline]
    pub fn has_queue(&self, capability: QueueCapability) -> bool {
        self.queue(capability).is_ok()
    }

    pub fn queue_family(&self, capability: QueueCapability) -> HalResult<&QueueFamily> {
        self.queue(capability).map(|queue| queue.queue_family())
    }

    /// 所有存在的 queue，按 graphics、compute、transfer 的顺序
    pub fn queues(&self) -> impl Iterator<Item = &CommandQueue> {
        [self.graphics_queue.as_ref(), self.compute_queue.as_ref(), self.transfer_queue.as_ref()]
            .into_iter()
            .flatten()
    }

    #[inline]
    pub fn device(&self) -> &Rc<GfxDevice> {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> &GfxPhysicalDevice {
        &self.physical_device
    }

    #[inline]
    pub fn adapters(&self) -> &[AdapterInfo] {
        &self.adapters
    }

    #[inline]
    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }
}

// 派生对象
impl DeviceContext {
    pub fn create_fence(&self, initial_value: u64, debug_name: &str) -> HalResult<Fence> {
        Fence::new(self.device.clone(), initial_value, debug_name)
    }

    pub fn create_command_allocator(
        &self,
        capability: QueueCapability,
        debug_name: &str,
    ) -> HalResult<CommandAllocator> {
        let queue_family = self.queue_family(capability)?;
        CommandAllocator::new(self.device.clone(), queue_family, debug_name)
    }

    pub fn create_memory_allocator(&self) -> HalResult<MemoryAllocator> {
        MemoryAllocator::new(self.device.clone(), self.frames_in_flight)
    }

    /// # param
    /// * path - 持久化的文件，None 表示只在内存中缓存
    pub fn create_pipeline_cache(&self, path: Option<&Path>) -> HalResult<PipelineCache> {
        PipelineCache::new(self.device.clone(), &self.physical_device, path)
    }
}
