use std::{
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

use ash::vk;
use vk_mem::Alloc;

use crate::{
    error::{HalError, HalResult, VkResultExt},
    foundation::device::GfxDevice,
};

/// 帧序号与 frame in flight 下标
///
/// frame id 从 0 开始，每一帧必须恰好推进一次，且按顺序推进；
/// 下标为 `frame_id % frames_in_flight`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameIndex {
    frames_in_flight: u32,
    frame_id: u64,
}

impl FrameIndex {
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            frame_id: 0,
        }
    }

    /// 推进到 `frame_id`，只接受上一帧 + 1
    ///
    /// # return
    /// 新的 frame in flight 下标
    pub fn advance(&mut self, frame_id: u64) -> HalResult<u32> {
        let expected = self.frame_id + 1;
        if frame_id != expected {
            return Err(HalError::FrameOrder { expected, got: frame_id });
        }
        self.frame_id = frame_id;
        Ok(self.index())
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn index(&self) -> u32 {
        (self.frame_id % self.frames_in_flight as u64) as u32
    }

    #[inline]
    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }
}

static LEAKED_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

/// 没有经过 `destroy_*` 就被 drop 的分配数量
#[inline]
pub fn leaked_allocation_count() -> usize {
    LEAKED_ALLOCATIONS.load(Ordering::Relaxed)
}

/// 跟踪一次分配是否被 allocator 释放；drop 时仍未释放则记录泄漏
struct AllocationTracker {
    kind: &'static str,
    name: String,
    released: bool,
}

impl AllocationTracker {
    fn new(kind: &'static str, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            released: false,
        }
    }

    #[inline]
    fn release(&mut self) {
        self.released = true;
    }
}

impl Drop for AllocationTracker {
    fn drop(&mut self) {
        if !self.released {
            LEAKED_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
            log::error!("{} `{}` dropped without going through the allocator, memory leaked", self.kind, self.name);
        }
    }
}

/// 通过 allocator 创建的 buffer，需要通过同一个 allocator 的 `destroy_buffer` 销毁
///
/// 直接 drop 不会释放显存，只会记录一次泄漏
pub struct AllocatedBuffer {
    buffer: vk::Buffer,
    allocation: vk_mem::Allocation,
    size: vk::DeviceSize,
    mapped_ptr: Option<*mut u8>,
    tracker: AllocationTracker,
}

impl AllocatedBuffer {
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// host visible 的 buffer 才有映射地址
    #[inline]
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped_ptr
    }
}

/// 同 [`AllocatedBuffer`]，需要通过 `destroy_image` 销毁
pub struct AllocatedImage {
    image: vk::Image,
    allocation: vk_mem::Allocation,
    extent: vk::Extent3D,
    format: vk::Format,
    tracker: AllocationTracker,
}

impl AllocatedImage {
    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

/// vma 的封装，所有的显存分配都通过它进行
///
/// vma 需要 Instance 以及 Device 在其生命周期内有效，
/// 因此持有 device 的引用，并在 device 完全初始化之后再创建
pub struct MemoryAllocator {
    inner: vk_mem::Allocator,
    frame_index: FrameIndex,

    device: Rc<GfxDevice>,
}

impl MemoryAllocator {
    pub fn new(device: Rc<GfxDevice>, frames_in_flight: u32) -> HalResult<Self> {
        let mut vma_ci =
            vk_mem::AllocatorCreateInfo::new(device.instance().ash_instance(), device.ash_handle(), device.pdevice());
        vma_ci.vulkan_api_version = vk::API_VERSION_1_3;

        let inner = unsafe { vk_mem::Allocator::new(vma_ci) }.vk_context("creating memory allocator")?;
        unsafe { inner.set_current_frame_index(0) };
        log::info!("memory allocator created with {} frames in flight", frames_in_flight);

        Ok(Self {
            inner,
            frame_index: FrameIndex::new(frames_in_flight),
            device,
        })
    }

    /// 每一帧开始时调用一次，`frame_id` 必须是上一帧 + 1
    pub fn next_frame(&mut self, frame_id: u64) -> HalResult<u32> {
        let index = self.frame_index.advance(frame_id).inspect_err(|e| {
            log::error!("memory allocator frame index desync: {}", e);
        })?;
        unsafe { self.inner.set_current_frame_index(index) };
        Ok(index)
    }

    #[inline]
    pub fn frame_index(&self) -> &FrameIndex {
        &self.frame_index
    }
}

// buffer
impl MemoryAllocator {
    /// # param
    /// * host_visible - 是否映射到主机内存
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
        debug_name: &str,
    ) -> HalResult<AllocatedBuffer> {
        let buffer_ci = vk::BufferCreateInfo::default().size(size).usage(usage);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: if host_visible {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (buffer, mut allocation) = unsafe { self.inner.create_buffer(&buffer_ci, &alloc_ci) }
            .with_vk_context(|| format!("creating buffer `{}` of {} bytes", debug_name, size))?;

        let mapped_ptr = if host_visible {
            match unsafe { self.inner.map_memory(&mut allocation) } {
                Ok(ptr) => Some(ptr),
                Err(e) => {
                    unsafe { self.inner.destroy_buffer(buffer, &mut allocation) };
                    return Err(HalError::from_vk(e, format!("mapping buffer `{}`", debug_name)));
                }
            }
        } else {
            None
        };

        self.device.set_object_debug_name(buffer, format!("Buffer::{}", debug_name));
        Ok(AllocatedBuffer {
            buffer,
            allocation,
            size,
            mapped_ptr,
            tracker: AllocationTracker::new("buffer", debug_name),
        })
    }

    pub fn destroy_buffer(&self, mut buffer: AllocatedBuffer) {
        unsafe {
            if buffer.mapped_ptr.take().is_some() {
                self.inner.unmap_memory(&mut buffer.allocation);
            }
            self.inner.destroy_buffer(buffer.buffer, &mut buffer.allocation);
        }
        buffer.tracker.release();
    }
}

// image
impl MemoryAllocator {
    pub fn create_image(&self, image_ci: &vk::ImageCreateInfo, debug_name: &str) -> HalResult<AllocatedImage> {
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, allocation) = unsafe { self.inner.create_image(image_ci, &alloc_ci) }
            .with_vk_context(|| format!("creating image `{}` {:?}", debug_name, image_ci.extent))?;

        self.device.set_object_debug_name(image, format!("Image::{}", debug_name));
        Ok(AllocatedImage {
            image,
            allocation,
            extent: image_ci.extent,
            format: image_ci.format,
            tracker: AllocationTracker::new("image", debug_name),
        })
    }

    pub fn destroy_image(&self, mut image: AllocatedImage) {
        unsafe {
            self.inner.destroy_image(image.image, &mut image.allocation);
        }
        image.tracker.release();
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        // vk_mem 是 RAII 的，inner 先于 device 释放
        log::info!("destroying memory allocator");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_cycles_through_ring() {
        let mut frame_index = FrameIndex::new(3);
        assert_eq!(frame_index.index(), 0);

        let indices: Vec<u32> = (1..=6).map(|id| frame_index.advance(id).unwrap()).collect();
        assert_eq!(indices, vec![1, 2, 0, 1, 2, 0]);
        assert_eq!(frame_index.frame_id(), 6);
    }

    #[test]
    fn skipped_frame_is_rejected() {
        let mut frame_index = FrameIndex::new(3);
        frame_index.advance(1).unwrap();

        let err = frame_index.advance(3).unwrap_err();
        assert!(matches!(err, HalError::FrameOrder { expected: 2, got: 3 }));
        // 失败的推进不会改变状态
        assert_eq!(frame_index.frame_id(), 1);
    }

    #[test]
    fn unreleased_allocation_is_counted_as_leak() {
        let before = leaked_allocation_count();

        let mut released = AllocationTracker::new("buffer", "released");
        released.release();
        drop(released);

        drop(AllocationTracker::new("image", "forgotten"));
        assert!(leaked_allocation_count() > before);
    }

    #[test]
    fn repeated_frame_is_rejected() {
        let mut frame_index = FrameIndex::new(2);
        frame_index.advance(1).unwrap();
        assert!(frame_index.advance(1).is_err());
    }
}
