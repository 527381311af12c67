use ash::vk;
use itertools::Itertools;

use crate::{
    commands::{capability::QueueCapability, command_queue::QueueFamily},
    error::{HalError, HalResult, VkResultExt},
    foundation::debug_messenger::DebugType,
};

/// 提供给 bootstrap 的显卡信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub index: usize,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub vendor_id: u32,
    pub device_id: u32,
}

impl AdapterInfo {
    #[inline]
    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

/// 根据外部传入的 index 选择显卡
///
/// 没有指定 index 时，优先使用独立显卡，否则使用第一个
pub fn select_adapter(adapters: &[AdapterInfo], requested: Option<usize>) -> HalResult<usize> {
    if adapters.is_empty() {
        return Err(HalError::NoAdapter);
    }
    match requested {
        Some(index) if index < adapters.len() => Ok(index),
        Some(index) => Err(HalError::AdapterNotFound {
            index,
            available: adapters.len(),
        }),
        None => Ok(adapters.iter().find_or_first(|adapter| adapter.is_discrete()).map_or(0, |adapter| adapter.index)),
    }
}

/// 三类 queue family，每一类都是可选的
#[derive(Clone, Debug, Default)]
pub struct QueueFamilies {
    pub graphics: Option<QueueFamily>,
    pub compute: Option<QueueFamily>,
    pub transfer: Option<QueueFamily>,
}

impl QueueFamilies {
    /// 在 device 创建时解析一次，之后不会再查询
    ///
    /// - graphics: 全能的 queue，graphics + compute + transfer
    /// - compute: 不带 graphics 的 compute queue（async compute）
    /// - transfer: 专用的 DMA queue
    pub fn resolve(queue_family_props: &[vk::QueueFamilyProperties]) -> Self {
        let find_queue_family =
            |capability: QueueCapability, include_flags: vk::QueueFlags, exclude_flags: vk::QueueFlags| {
                queue_family_props
                    .iter()
                    .enumerate()
                    .find(|(_, props)| {
                        props.queue_count > 0
                            && props.queue_flags.contains(include_flags)
                            && (props.queue_flags & exclude_flags).is_empty()
                    })
                    .map(|(family_idx, props)| QueueFamily {
                        capability,
                        queue_family_index: family_idx as u32,
                        queue_flags: props.queue_flags,
                        queue_count: props.queue_count,
                    })
            };

        Self {
            graphics: find_queue_family(
                QueueCapability::Graphics,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                vk::QueueFlags::empty(),
            ),
            compute: find_queue_family(QueueCapability::Compute, vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS),
            transfer: find_queue_family(
                QueueCapability::Transfer,
                vk::QueueFlags::TRANSFER,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            ),
        }
    }

    #[inline]
    pub fn get(&self, capability: QueueCapability) -> Option<&QueueFamily> {
        match capability {
            QueueCapability::Graphics => self.graphics.as_ref(),
            QueueCapability::Compute => self.compute.as_ref(),
            QueueCapability::Transfer => self.transfer.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueFamily> {
        [self.graphics.as_ref(), self.compute.as_ref(), self.transfer.as_ref()].into_iter().flatten()
    }
}

/// 会被 device 使用到的 feature 的支持情况
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatureSupport {
    pub timeline_semaphore: bool,
    pub synchronization2: bool,
    pub imageless_framebuffer: bool,
    /// partially bound + variable descriptor count + runtime array
    pub descriptor_indexing: bool,
}

impl DeviceFeatureSupport {
    /// 缺失任何一个必需的 feature 都是致命的
    pub fn check_required(&self) -> HalResult<()> {
        if !self.timeline_semaphore {
            return Err(HalError::MissingFeature("timelineSemaphore"));
        }
        if !self.synchronization2 {
            return Err(HalError::MissingFeature("synchronization2"));
        }
        if !self.imageless_framebuffer {
            return Err(HalError::MissingFeature("imagelessFramebuffer"));
        }
        Ok(())
    }
}

/// 表示一张物理显卡，各种属性在创建时缓存，之后不再查询
pub struct GfxPhysicalDevice {
    pub(crate) vk_handle: vk::PhysicalDevice,
    pub(crate) info: AdapterInfo,

    /// 当前 gpu 的基础属性
    pub(crate) basic_props: vk::PhysicalDeviceProperties,
    pub(crate) features: vk::PhysicalDeviceFeatures,
    pub(crate) feature_support: DeviceFeatureSupport,
    pub(crate) mem_props: vk::PhysicalDeviceMemoryProperties,

    /// 当前 gpu 支持的 device extensions
    pub(crate) device_extensions: Vec<String>,

    pub(crate) queue_family_props: Vec<vk::QueueFamilyProperties>,
    pub(crate) queue_families: QueueFamilies,
}

impl GfxPhysicalDevice {
    /// 枚举所有的显卡
    pub fn enumerate(instance: &ash::Instance) -> HalResult<Vec<Self>> {
        let pdevices =
            unsafe { instance.enumerate_physical_devices() }.vk_context("enumerating physical devices")?;
        pdevices.into_iter().enumerate().map(|(index, pdevice)| Self::new(instance, pdevice, index)).collect()
    }

    fn new(instance: &ash::Instance, pdevice: vk::PhysicalDevice, index: usize) -> HalResult<Self> {
        unsafe {
            let basic_props = instance.get_physical_device_properties(pdevice);
            let name = basic_props
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            log::info!("found gpu[{}]: {} ({:?})", index, name, basic_props.device_type);

            let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default();
            let mut vk13_features = vk::PhysicalDeviceVulkan13Features::default();
            let mut features2 =
                vk::PhysicalDeviceFeatures2::default().push_next(&mut vk12_features).push_next(&mut vk13_features);
            instance.get_physical_device_features2(pdevice, &mut features2);
            let features = features2.features;

            let feature_support = DeviceFeatureSupport {
                timeline_semaphore: vk12_features.timeline_semaphore == vk::TRUE,
                synchronization2: vk13_features.synchronization2 == vk::TRUE,
                imageless_framebuffer: vk12_features.imageless_framebuffer == vk::TRUE,
                descriptor_indexing: vk12_features.descriptor_binding_partially_bound == vk::TRUE
                    && vk12_features.descriptor_binding_variable_descriptor_count == vk::TRUE
                    && vk12_features.runtime_descriptor_array == vk::TRUE,
            };
            log::debug!("gpu[{}] feature support: {:?}", index, feature_support);

            // 找到当前 gpu 支持的 extensions，并打印出来
            let device_extensions = instance
                .enumerate_device_extension_properties(pdevice)
                .vk_context("enumerating device extensions")?
                .iter()
                .filter_map(|ext| ext.extension_name_as_c_str().ok().map(|name| name.to_string_lossy().into_owned()))
                .collect_vec();
            log::debug!("physical device supports extensions: {}", device_extensions.join("\n"));

            let queue_family_props = instance.get_physical_device_queue_family_properties(pdevice);
            log::debug!("physical device: queue family props:\n{:#?}", queue_family_props);
            let queue_families = QueueFamilies::resolve(&queue_family_props);

            Ok(Self {
                vk_handle: pdevice,
                info: AdapterInfo {
                    index,
                    name,
                    device_type: basic_props.device_type,
                    api_version: basic_props.api_version,
                    vendor_id: basic_props.vendor_id,
                    device_id: basic_props.device_id,
                },
                basic_props,
                features,
                feature_support,
                mem_props: instance.get_physical_device_memory_properties(pdevice),
                device_extensions,
                queue_family_props,
                queue_families,
            })
        }
    }
}

// getters
impl GfxPhysicalDevice {
    #[inline]
    pub fn vk_handle(&self) -> vk::PhysicalDevice {
        self.vk_handle
    }

    #[inline]
    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }

    #[inline]
    pub fn basic_props(&self) -> &vk::PhysicalDeviceProperties {
        &self.basic_props
    }

    #[inline]
    pub fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.features
    }

    #[inline]
    pub fn feature_support(&self) -> DeviceFeatureSupport {
        self.feature_support
    }

    #[inline]
    pub fn mem_props(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.mem_props
    }

    #[inline]
    pub fn queue_family_props(&self) -> &[vk::QueueFamilyProperties] {
        &self.queue_family_props
    }

    #[inline]
    pub fn queue_families(&self) -> &QueueFamilies {
        &self.queue_families
    }

    #[inline]
    pub fn supports_extension(&self, name: &std::ffi::CStr) -> bool {
        let name = name.to_string_lossy();
        self.device_extensions.iter().any(|ext| *ext == name)
    }
}

impl DebugType for GfxPhysicalDevice {
    fn debug_type_name() -> &'static str {
        "GfxPhysicalDevice"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.vk_handle
    }
}
