//! 基于 timeline semaphore 的 Fence
//!
//! 一个 Fence 对应一个单调递增的 GPU 计数器，以及 CPU 端的 `expected_value`。
//! 生产者在每次 signal 之前调用 [`Fence::increment`] 取得下一个同步点，
//! 因此多个生产者不会拿到同一个值。

use std::{
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use ash::vk;

use crate::{
    error::{HalError, HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
};

/// device 可见的单调计数器
pub trait TimelineCounter {
    /// 提交时使用的 semaphore
    fn semaphore(&self) -> vk::Semaphore;

    /// 当前已经完成的值
    fn completed_value(&self) -> HalResult<u64>;

    /// 在 host 端将计数器设置为 `value`
    fn signal(&self, value: u64) -> HalResult<()>;

    /// 阻塞直到计数器达到 `value`，没有超时
    fn wait(&self, value: u64) -> HalResult<()>;
}

/// Vulkan timeline semaphore
pub struct TimelineSemaphore {
    handle: vk::Semaphore,
    device: Rc<GfxDevice>,
}

impl TimelineSemaphore {
    pub fn new(device: Rc<GfxDevice>, initial_value: u64, debug_name: &str) -> HalResult<Self> {
        let mut timeline_type_ci = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let timeline_semaphore_ci = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_type_ci);
        let handle = unsafe { device.create_semaphore(&timeline_semaphore_ci, None) }
            .with_vk_context(|| format!("creating timeline semaphore `{}`", debug_name))?;

        let semaphore = Self { handle, device };
        semaphore.device.set_debug_name(&semaphore, debug_name);
        Ok(semaphore)
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl TimelineCounter for TimelineSemaphore {
    #[inline]
    fn semaphore(&self) -> vk::Semaphore {
        self.handle
    }

    fn completed_value(&self) -> HalResult<u64> {
        unsafe { self.device.get_semaphore_counter_value(self.handle) }.vk_context("reading timeline value")
    }

    fn signal(&self, value: u64) -> HalResult<()> {
        let signal_info = vk::SemaphoreSignalInfo::default().semaphore(self.handle).value(value);
        unsafe { self.device.signal_semaphore(&signal_info) }
            .with_vk_context(|| format!("signaling timeline to {}", value))
    }

    fn wait(&self, value: u64) -> HalResult<()> {
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(std::slice::from_ref(&self.handle))
            .values(std::slice::from_ref(&value));
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) }
            .with_vk_context(|| format!("waiting timeline value {}", value))
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        unsafe {
            // 销毁前需要保证没有任何提交仍在使用该 semaphore
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("wait idle before destroying timeline semaphore failed: {}", e);
            }
            self.device.destroy_semaphore(self.handle, None);
        }
    }
}

impl DebugType for TimelineSemaphore {
    fn debug_type_name() -> &'static str {
        "GfxTimelineSemaphore"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

/// CPU/GPU 以及跨 queue 同步使用的 Fence
///
/// 不变式：任意一次成功的 wait 之后，`completed_value <= expected_value`。
/// 显式指定的 signal 值会先把 `expected_value` 提升到该值，等待一个从未预留的值会被拒绝。
///
/// 预留的值如果因为提交失败永远不会被 signal，fence 会被标记为废弃，
/// 之后对该值及更大值的等待都返回 [`HalError::FenceAbandoned`]，而不是永远阻塞。
pub struct Fence<C = TimelineSemaphore> {
    counter: C,
    expected_value: AtomicU64,
    /// 最小的废弃值，`u64::MAX` 表示没有
    abandoned_value: AtomicU64,
    name: String,
}

// 创建
impl Fence {
    pub fn new(device: Rc<GfxDevice>, initial_value: u64, debug_name: &str) -> HalResult<Self> {
        let counter = TimelineSemaphore::new(device, initial_value, debug_name)?;
        Ok(Self::from_counter(counter, initial_value, debug_name))
    }
}

impl<C: TimelineCounter> Fence<C> {
    pub fn from_counter(counter: C, initial_value: u64, name: impl Into<String>) -> Self {
        Self {
            counter,
            expected_value: AtomicU64::new(initial_value),
            abandoned_value: AtomicU64::new(u64::MAX),
            name: name.into(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn counter(&self) -> &C {
        &self.counter
    }

    /// timeline semaphore 的句柄，用于 queue submit
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.counter.semaphore()
    }

    /// 取得下一个 signal 使用的值，多个生产者之间是原子的
    #[inline]
    pub fn increment(&self) -> u64 {
        self.expected_value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 为显式指定的 signal 值预留：`expected_value` 至少为 `value`
    #[inline]
    pub fn reserve(&self, value: u64) {
        self.expected_value.fetch_max(value, Ordering::AcqRel);
    }

    /// 最近一次预留的值
    #[inline]
    pub fn expected_value(&self) -> u64 {
        self.expected_value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn completed_value(&self) -> HalResult<u64> {
        self.counter.completed_value()
    }

    /// 记录一个永远不会被 signal 的预留值，通常是提交失败之后
    pub fn abandon(&self, value: u64) {
        let previous = self.abandoned_value.fetch_min(value, Ordering::AcqRel);
        if value < previous {
            log::error!("fence `{}` value {} will never be signaled", self.name, value);
        }
    }

    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned_value.load(Ordering::Acquire) != u64::MAX
    }

    /// 检查 `value` 是否可能完成：必须已经预留，且不能落在废弃值之后
    ///
    /// 在 CPU 等待以及在 queue 上提交对该值的等待之前调用
    pub fn check_reachable(&self, value: u64) -> HalResult<()> {
        let expected = self.expected_value();
        if value > expected {
            return Err(HalError::UnreservedFenceValue {
                name: self.name.clone(),
                requested: value,
                expected,
            });
        }
        let abandoned = self.abandoned_value.load(Ordering::Acquire);
        if value >= abandoned {
            return Err(HalError::FenceAbandoned {
                name: self.name.clone(),
                requested: value,
                abandoned,
            });
        }
        Ok(())
    }

    /// 非阻塞地查询是否达到 expected value
    pub fn is_completed(&self) -> HalResult<bool> {
        let expected = self.expected_value();
        if self.completed_value()? >= expected {
            return Ok(true);
        }
        self.check_reachable(expected)?;
        Ok(false)
    }

    /// 在 host 端 signal；timeline 的值必须严格递增
    pub fn signal(&self, value: u64) -> HalResult<()> {
        let completed = self.completed_value()?;
        if value <= completed {
            return Err(HalError::NonMonotonicSignal {
                name: self.name.clone(),
                completed,
                requested: value,
            });
        }
        self.reserve(value);
        self.counter.signal(value).inspect_err(|_| self.abandon(value))
    }

    /// 阻塞直到计数器达到 `value`
    ///
    /// 等待使用无限超时；超时说明设备已经挂起，直接作为致命错误返回
    pub fn wait(&self, value: u64) -> HalResult<()> {
        self.check_reachable(value)?;
        self.counter.wait(value).inspect_err(|e| {
            if e.is_fatal() {
                log::error!("fence `{}` wait for {} failed: {}", self.name, value, e);
            }
        })
    }

    /// 等待最近一次预留的值
    #[inline]
    pub fn wait_expected(&self) -> HalResult<()> {
        self.wait(self.expected_value())
    }
}
