use std::rc::Rc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::{
    commands::{
        capability::QueueCapability,
        command_queue::{CommandQueue, QueueSubmitter},
        fence::{Fence, TimelineCounter},
        semaphore::Semaphore,
        submit_info::SubmitInfo,
    },
    config::SwapchainConfig,
    error::{HalError, HalResult, VkResultExt},
    foundation::{device::GfxDevice, device_context::DeviceContext},
    swapchain::{image_ring::ImageRing, surface::Surface},
};

/// acquire 的结果
///
/// 渲染这张 image 的提交需要等待 fence 达到 `ready_value`
#[derive(Clone, Copy, Debug)]
pub struct AcquiredImage {
    pub slot: usize,
    pub image_index: u32,
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub extent: vk::Extent2D,
    pub ready_value: u64,
}

/// 优先选择 8bit 的 sRGB 或 UNORM 格式，都不支持时使用 surface 给出的第一个
pub fn select_surface_format(formats: &[vk::SurfaceFormatKHR], srgb: bool) -> HalResult<vk::SurfaceFormatKHR> {
    let preferred: &[vk::Format] = if srgb {
        &[vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB]
    } else {
        &[vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM]
    };

    preferred
        .iter()
        .find_map(|format| {
            formats.iter().find(|surface_format| {
                surface_format.format == *format && surface_format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
        })
        .or_else(|| formats.first())
        .copied()
        .ok_or_else(|| HalError::UnsupportedSurface("surface reports no formats".to_string()))
}

/// vsync: relaxed fifo > fifo；否则 immediate > mailbox > fifo
///
/// FIFO 总是被支持的，作为最后的选择
pub fn select_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    let preferred: &[vk::PresentModeKHR] = if vsync {
        &[vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::FIFO]
    } else {
        &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO]
    };
    preferred.iter().copied().find(|mode| modes.contains(mode)).unwrap_or(vk::PresentModeKHR::FIFO)
}

/// 确定 swapchain 的 extent 尺寸
///
/// 如果 current_extent 包含特殊值 0xFFFFFFFF，则表示可以自己设置交换链的 extent
pub fn calculate_swapchain_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    let surface_extent = caps.current_extent;
    if surface_extent.width == u32::MAX || surface_extent.height == u32::MAX {
        vk::Extent2D {
            width: requested.width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested.height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    } else {
        surface_extent
    }
}

/// acquire 之后在 queue 上提交：等待 image-available，signal fence 的一个新值
///
/// # return
/// 渲染提交需要等待的值；提交失败时这个值被废弃
pub fn submit_acquire_sync<Q: QueueSubmitter, C: TimelineCounter>(
    queue: &CommandQueue<Q>,
    fence: &Fence<C>,
    image_available: vk::Semaphore,
) -> HalResult<u64> {
    let ready_value = fence.increment();
    queue
        .submit(
            SubmitInfo::default()
                .wait(image_available, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, None)
                .signal(fence.handle(), vk::PipelineStageFlags2::ALL_COMMANDS, Some(ready_value)),
        )
        .inspect_err(|_| fence.abandon(ready_value))?;
    Ok(ready_value)
}

/// present 之前在 queue 上提交：等待 fence 最近的值（渲染完成），
/// signal render-finished 以及 fence 的一个新值
///
/// fence 已经废弃时不会提交，避免 queue 等待一个永远不会到达的值
pub fn submit_present_sync<Q: QueueSubmitter, C: TimelineCounter>(
    queue: &CommandQueue<Q>,
    fence: &Fence<C>,
    render_finished: vk::Semaphore,
) -> HalResult<u64> {
    let rendered_value = fence.expected_value();
    fence.check_reachable(rendered_value)?;
    let presented_value = fence.increment();
    queue
        .submit(
            SubmitInfo::default()
                .wait(fence.handle(), vk::PipelineStageFlags2::ALL_COMMANDS, Some(rendered_value))
                .signal(render_finished, vk::PipelineStageFlags2::ALL_COMMANDS, None)
                .signal(fence.handle(), vk::PipelineStageFlags2::ALL_COMMANDS, Some(presented_value)),
        )
        .inspect_err(|_| fence.abandon(presented_value))?;
    Ok(presented_value)
}

/// max_image_count == 0，表示不限制 image 数量
pub fn calculate_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        u32::min(caps.max_image_count, caps.min_image_count + 1)
    }
}

/// 随 extent 重建的那部分对象
struct SwapchainImages {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    image_available: Vec<Semaphore>,
    render_finished: Vec<Semaphore>,
    extent: vk::Extent2D,
}

pub struct SwapChain {
    images: SwapchainImages,
    ring: ImageRing,

    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    /// 创建时确定，resize 时保持不变
    min_image_count: u32,

    surface: Surface,
    device: Rc<GfxDevice>,
}

// new & init
impl SwapChain {
    /// TRANSFER_DST 用于 Nsight 分析
    pub const IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
        vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw() | vk::ImageUsageFlags::TRANSFER_DST.as_raw(),
    );

    pub fn new(
        device_context: &DeviceContext,
        raw_display_handle: RawDisplayHandle,
        raw_window_handle: RawWindowHandle,
        config: &SwapchainConfig,
    ) -> HalResult<Self> {
        let device = device_context.device().clone();
        if !device.swapchain_enabled() {
            return Err(HalError::MissingExtension(ash::khr::swapchain::NAME.to_string_lossy().into_owned()));
        }

        let surface = Surface::new(device.clone(), raw_display_handle, raw_window_handle)?;

        let present_family = device_context.queue_family(QueueCapability::Graphics)?;
        if !surface.supports_present(present_family.queue_family_index)? {
            return Err(HalError::UnsupportedSurface(format!(
                "queue family {} cannot present to the surface",
                present_family.queue_family_index
            )));
        }

        let surface_format = select_surface_format(&surface.formats()?, config.srgb)?;
        let present_mode = select_present_mode(&surface.present_modes()?, config.vsync);
        let caps = surface.capabilities()?;
        let min_image_count = calculate_image_count(&caps);
        log::info!(
            "swapchain format: {:?}, color space: {:?}, present mode: {:?}, image count: {}",
            surface_format.format,
            surface_format.color_space,
            present_mode,
            min_image_count
        );

        let requested = vk::Extent2D {
            width: config.width,
            height: config.height,
        };
        let images = Self::create_images(
            &device,
            &surface,
            surface_format,
            present_mode,
            min_image_count,
            requested,
            vk::SwapchainKHR::null(),
        )?;
        let ring = ImageRing::new(images.images.len());

        Ok(Self {
            images,
            ring,
            surface_format,
            present_mode,
            min_image_count,
            surface,
            device,
        })
    }

    fn create_images(
        device: &Rc<GfxDevice>,
        surface: &Surface,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        min_image_count: u32,
        requested: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> HalResult<SwapchainImages> {
        let caps = surface.capabilities()?;
        let extent = calculate_swapchain_extent(&caps, requested);
        log::info!(
            "create swapchain:
            surface current extent: {}x{}, min extent: {}x{}, max extent: {}x{}
            requested extent: {}x{}
            final swapchain extent: {}x{}",
            caps.current_extent.width,
            caps.current_extent.height,
            caps.min_image_extent.width,
            caps.min_image_extent.height,
            caps.max_image_extent.width,
            caps.max_image_extent.height,
            requested.width,
            requested.height,
            extent.width,
            extent.height
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(min_image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(Self::IMAGE_USAGE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain_pf = device.swapchain_pf();
        let handle = unsafe { swapchain_pf.create_swapchain(&create_info, None) }.vk_context("creating swapchain")?;
        device.set_object_debug_name(handle, "main");

        // 之后的任何失败都需要销毁已经创建的 swapchain
        let mut result = SwapchainImages {
            handle,
            images: vec![],
            image_views: vec![],
            image_available: vec![],
            render_finished: vec![],
            extent,
        };
        match Self::fill_images(device, surface_format.format, &mut result) {
            Ok(()) => Ok(result),
            Err(e) => {
                Self::destroy_images(device, &mut result);
                Err(e)
            }
        }
    }

    fn fill_images(device: &Rc<GfxDevice>, format: vk::Format, images: &mut SwapchainImages) -> HalResult<()> {
        images.images = unsafe { device.swapchain_pf().get_swapchain_images(images.handle) }
            .vk_context("getting swapchain images")?;

        for (idx, image) in images.images.iter().enumerate() {
            device.set_object_debug_name(*image, format!("swapchain-image-{}", idx));

            let view_ci = vk::ImageViewCreateInfo::default()
                .image(*image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            let view = unsafe { device.create_image_view(&view_ci, None) }
                .with_vk_context(|| format!("creating swapchain image view {}", idx))?;
            device.set_object_debug_name(view, format!("swapchain-image-view-{}", idx));
            images.image_views.push(view);
        }

        for slot in 0..images.images.len() {
            images.image_available.push(Semaphore::new(device.clone(), &format!("image-available-{}", slot))?);
            images.render_finished.push(Semaphore::new(device.clone(), &format!("render-finished-{}", slot))?);
        }
        Ok(())
    }

    fn destroy_images(device: &GfxDevice, images: &mut SwapchainImages) {
        unsafe {
            for view in images.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            images.image_available.clear();
            images.render_finished.clear();
            if images.handle != vk::SwapchainKHR::null() {
                device.swapchain_pf().destroy_swapchain(images.handle, None);
                images.handle = vk::SwapchainKHR::null();
            }
        }
    }
}

// getters
impl SwapChain {
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.images.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    #[inline]
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.images.images.len()
    }

    #[inline]
    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.images.image_views
    }

    #[inline]
    pub fn ring(&self) -> &ImageRing {
        &self.ring
    }

    #[inline]
    pub fn surface(&self) -> &Surface {
        &self.surface
    }
}

// update
impl SwapChain {
    /// 阻塞直到有可用的 image
    ///
    /// 在 queue 上提交一个空的 batch：等待该 slot 的 image-available semaphore，
    /// 然后 signal fence 的一个新值，这个值作为 `ready_value` 返回
    pub fn acquire_next_image(&mut self, queue: &CommandQueue, fence: &Fence) -> HalResult<AcquiredImage> {
        let slot = self.ring.begin_acquire()?;
        let image_available = self.images.image_available[slot].handle();

        let result = unsafe {
            self.device.swapchain_pf().acquire_next_image(
                self.images.handle,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };
        let image_index = match result {
            Ok((image_index, is_suboptimal)) => {
                if is_suboptimal {
                    log::warn!("swapchain acquire image index {} is not optimal", image_index);
                }
                image_index
            }
            Err(e) => {
                self.ring.cancel_acquire();
                if e == vk::Result::ERROR_OUT_OF_DATE_KHR {
                    log::warn!("swapchain is out of date when acquire next image");
                }
                return Err(HalError::from_vk(e, "acquiring swapchain image"));
            }
        };
        self.ring.complete_acquire(image_index)?;

        let ready_value = submit_acquire_sync(queue, fence, image_available)?;

        Ok(AcquiredImage {
            slot,
            image_index,
            image: self.images.images[image_index as usize],
            image_view: self.images.image_views[image_index as usize],
            format: self.surface_format.format,
            usage: Self::IMAGE_USAGE,
            extent: self.images.extent,
            ready_value,
        })
    }

    /// 等待 fence 最近的值（渲染完成），signal render-finished 以及 fence 的新值，然后 present
    ///
    /// # return
    /// swapchain 是否 suboptimal
    pub fn present(&mut self, queue: &CommandQueue, fence: &Fence) -> HalResult<bool> {
        let (slot, image_index) = self.ring.begin_present()?;
        let result = self.present_slot(queue, fence, slot, image_index);
        // 无论成功与否，这个 slot 都已经交还
        self.ring.complete_present()?;

        match result {
            Ok(is_suboptimal) => {
                if is_suboptimal {
                    log::warn!("swapchain present image index {} is not optimal", image_index);
                }
                Ok(is_suboptimal)
            }
            Err(HalError::SwapchainOutOfDate) => {
                log::warn!("swapchain is out of date when present image");
                Err(HalError::SwapchainOutOfDate)
            }
            Err(e) => Err(e),
        }
    }

    fn present_slot(&self, queue: &CommandQueue, fence: &Fence, slot: usize, image_index: u32) -> HalResult<bool> {
        let render_finished = self.images.render_finished[slot].handle();
        submit_present_sync(queue, fence, render_finished)?;

        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(std::slice::from_ref(&render_finished))
            .image_indices(&image_indices)
            .swapchains(std::slice::from_ref(&self.images.handle));
        queue.present(&present_info)
    }

    /// 以新的尺寸重建 image、image view 以及 semaphore
    ///
    /// 调用前不能有已经 acquire 但还没有 present 的 image；会先等待 queue idle
    pub fn resize(&mut self, queue: &CommandQueue, width: u32, height: u32) -> HalResult<()> {
        let outstanding = self.ring.outstanding();
        if outstanding > 0 {
            return Err(HalError::SwapchainBusy { outstanding });
        }
        queue.wait_idle()?;

        let requested = vk::Extent2D { width, height };
        let new_images = Self::create_images(
            &self.device,
            &self.surface,
            self.surface_format,
            self.present_mode,
            self.min_image_count,
            requested,
            self.images.handle,
        )?;
        let mut old_images = std::mem::replace(&mut self.images, new_images);
        Self::destroy_images(&self.device, &mut old_images);
        self.ring = ImageRing::new(self.images.images.len());

        log::info!(
            "swapchain resized to {}x{} with {} images",
            self.images.extent.width,
            self.images.extent.height,
            self.images.images.len()
        );
        Ok(())
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device wait idle failed before destroying swapchain: {}", e);
            }
        }
        Self::destroy_images(&self.device, &mut self.images);
    }
}
