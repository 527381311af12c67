use std::{
    rc::Rc,
    sync::{Mutex, MutexGuard, PoisonError},
};

use ash::vk;
use itertools::Itertools;

use crate::{
    commands::{
        capability::QueueCapability,
        command_list::Submittable,
        fence::{Fence, TimelineCounter},
        submit_info::SubmitInfo,
    },
    error::{HalError, HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueFamily {
    pub capability: QueueCapability,
    pub queue_family_index: u32,
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
}

/// 实际执行提交的后端
pub trait QueueSubmitter {
    fn submit(&self, batch: &SubmitInfo) -> HalResult<()>;

    fn wait_idle(&self) -> HalResult<()>;
}

/// vk queue
///
/// # destroy
/// vk queue 随 device 一起销毁
pub struct VkQueue {
    handle: vk::Queue,
    name: &'static str,
    device: Rc<GfxDevice>,
}

impl VkQueue {
    fn new(device: Rc<GfxDevice>, queue_family: &QueueFamily, queue_index: u32) -> Self {
        let handle = unsafe { device.get_device_queue(queue_family.queue_family_index, queue_index) };
        let queue = Self {
            handle,
            name: queue_family.capability.name(),
            device,
        };
        queue.device.set_debug_name(&queue, queue.name);
        queue
    }

    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }
}

impl QueueSubmitter for VkQueue {
    fn submit(&self, batch: &SubmitInfo) -> HalResult<()> {
        let submit_info = batch.submit_info();
        unsafe { self.device.queue_submit2(self.handle, std::slice::from_ref(&submit_info), vk::Fence::null()) }
            .with_vk_context(|| format!("submitting to {} queue", self.name))
    }

    fn wait_idle(&self) -> HalResult<()> {
        unsafe { self.device.queue_wait_idle(self.handle) }
            .with_vk_context(|| format!("waiting {} queue idle", self.name))
    }
}

impl DebugType for VkQueue {
    fn debug_type_name() -> &'static str {
        "GfxQueue"
    }
    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

/// 提交锁内保护的状态
#[derive(Default)]
struct SubmitState {
    /// 通过 `wait` 记录，附加到下一次成功提交的 batch 上
    pending_waits: Vec<vk::SemaphoreSubmitInfo<'static>>,
}

/// 一个 queue 的封装
///
/// 同一个 queue 上的提交按提交顺序执行；不同 queue 之间的顺序只能通过 Fence 的
/// wait/signal 建立。
pub struct CommandQueue<Q = VkQueue> {
    submitter: Q,
    queue_family: QueueFamily,

    submit_state: Mutex<SubmitState>,
}

impl CommandQueue {
    pub(crate) fn new(device: Rc<GfxDevice>, queue_family: QueueFamily, queue_index: u32) -> Self {
        let vk_queue = VkQueue::new(device, &queue_family, queue_index);
        Self::with_submitter(vk_queue, queue_family)
    }

    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.submitter.handle()
    }

    /// present 同样需要持有提交锁
    pub(crate) fn present(&self, present_info: &vk::PresentInfoKHR) -> HalResult<bool> {
        let _state = self.lock();
        unsafe { self.submitter.device.swapchain_pf().queue_present(self.submitter.handle, present_info) }
            .vk_context("presenting swapchain image")
    }
}

impl<Q: QueueSubmitter> CommandQueue<Q> {
    pub fn with_submitter(submitter: Q, queue_family: QueueFamily) -> Self {
        Self {
            submitter,
            queue_family,
            submit_state: Mutex::new(SubmitState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SubmitState> {
        self.submit_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// getter
impl<Q: QueueSubmitter> CommandQueue<Q> {
    #[inline]
    pub fn queue_family(&self) -> &QueueFamily {
        &self.queue_family
    }

    #[inline]
    pub fn capability(&self) -> QueueCapability {
        self.queue_family.capability
    }

    #[inline]
    pub fn submitter(&self) -> &Q {
        &self.submitter
    }

    /// 还没有附加到任何 batch 上的 wait 数量
    #[inline]
    pub fn pending_wait_count(&self) -> usize {
        self.lock().pending_waits.len()
    }
}

// 同步
impl<Q: QueueSubmitter> CommandQueue<Q> {
    /// 不提交任何命令，仅在 queue 上 signal fence
    ///
    /// # param
    /// * value - None 时通过 `fence.increment()` 取得新的值；显式的值会先在 fence 上预留
    ///
    /// # return
    /// 实际 signal 的值
    ///
    /// 提交失败时该值被废弃，之后等待它会得到 [`HalError::FenceAbandoned`]
    pub fn signal<C: TimelineCounter>(&self, fence: &Fence<C>, value: Option<u64>) -> HalResult<u64> {
        let value = match value {
            Some(value) => {
                fence.reserve(value);
                value
            }
            None => fence.increment(),
        };
        self.submit(SubmitInfo::new(&[]).signal(fence.handle(), vk::PipelineStageFlags2::ALL_COMMANDS, Some(value)))
            .inspect_err(|e| {
                log::error!("queue `{}` signal `{}`={} failed: {}", self.capability(), fence.name(), value, e);
                fence.abandon(value);
            })?;
        Ok(value)
    }

    /// 不提交任何命令，让该 queue 之后提交的 batch 等待 fence 达到 value
    ///
    /// 等待会附加在下一次提交的 batch 上，保证这个 batch 的执行在 fence 之后。
    /// 等待一个尚未预留或者已经废弃的值会被拒绝
    pub fn wait<C: TimelineCounter>(&self, fence: &Fence<C>, value: Option<u64>) -> HalResult<u64> {
        let value = value.unwrap_or_else(|| fence.expected_value());
        fence.check_reachable(value)?;
        self.lock().pending_waits.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(fence.handle())
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .value(value),
        );
        Ok(value)
    }

    /// 阻塞直到 queue 上所有提交的工作完成
    pub fn wait_idle(&self) -> HalResult<()> {
        let has_pending = !self.lock().pending_waits.is_empty();
        if has_pending {
            self.submit(SubmitInfo::new(&[]))?;
        }
        self.submitter.wait_idle()
    }
}

// 提交
impl<Q: QueueSubmitter> CommandQueue<Q> {
    /// 提交录制完毕的 command list
    ///
    /// 之前通过 `wait` 记录的依赖会附加在这个 batch 上
    pub fn execute_command_lists<L: Submittable>(&self, lists: &[&L]) -> HalResult<()> {
        self.execute_command_lists_with(lists, SubmitInfo::default())
    }

    /// 提交 command list，并带上额外的 wait/signal
    ///
    /// 只有全部 list 都处于 Executable 且属于这个 queue family 时才会提交
    pub fn execute_command_lists_with<L: Submittable>(&self, lists: &[&L], sync: SubmitInfo) -> HalResult<()> {
        for list in lists {
            if list.queue_family_index() != self.queue_family.queue_family_index {
                return Err(HalError::QueueFamilyMismatch {
                    name: list.name().to_string(),
                    list_family: list.queue_family_index(),
                    queue_family: self.queue_family.queue_family_index,
                });
            }
            let state = list.state();
            if state.submit().is_none() {
                return Err(HalError::InvalidCommandListState {
                    name: list.name().to_string(),
                    op: "submit",
                    state: state.name(),
                });
            }
        }

        let command_buffers = lists.iter().map(|list| list.handle()).collect_vec();
        self.submit(SubmitInfo::new(&command_buffers).merge(sync))?;

        lists.iter().for_each(|list| list.mark_submitted());
        Ok(())
    }

    /// 所有提交的入口，submit 调用在锁内
    ///
    /// 挂起的 wait 只会被一次成功的提交消耗；提交失败时保留给下一次
    pub fn submit(&self, batch: SubmitInfo) -> HalResult<()> {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending_waits);
        let batch = batch.prepend_waits(pending.clone());
        match self.submitter.submit(&batch) {
            Ok(()) => Ok(()),
            Err(e) => {
                state.pending_waits = pending;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};

    use ash::vk::Handle;

    use super::*;
    use crate::commands::{command_list::RecordingState, fence::tests::host_fence};

    /// 记录每一次提交，可以让下一次提交失败
    #[derive(Default)]
    pub(crate) struct RecordingSubmitter {
        pub(crate) batches: RefCell<Vec<SubmitInfo>>,
        pub(crate) fail: Cell<bool>,
        pub(crate) idle_calls: Cell<u32>,
    }

    impl QueueSubmitter for RecordingSubmitter {
        fn submit(&self, batch: &SubmitInfo) -> HalResult<()> {
            if self.fail.get() {
                return Err(HalError::from_vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, "submitting to host queue"));
            }
            self.batches.borrow_mut().push(batch.clone());
            Ok(())
        }

        fn wait_idle(&self) -> HalResult<()> {
            self.idle_calls.set(self.idle_calls.get() + 1);
            Ok(())
        }
    }

    pub(crate) fn host_queue(capability: QueueCapability, family: u32) -> CommandQueue<RecordingSubmitter> {
        let queue_family = QueueFamily {
            capability,
            queue_family_index: family,
            queue_flags: vk::QueueFlags::empty(),
            queue_count: 1,
        };
        CommandQueue::with_submitter(RecordingSubmitter::default(), queue_family)
    }

    struct HostList {
        handle: vk::CommandBuffer,
        family: u32,
        state: Cell<RecordingState>,
        name: String,
    }

    impl HostList {
        fn executable(raw: u64, family: u32) -> Self {
            Self {
                handle: vk::CommandBuffer::from_raw(raw),
                family,
                state: Cell::new(RecordingState::Executable),
                name: format!("list-{}", raw),
            }
        }
    }

    impl Submittable for HostList {
        fn handle(&self) -> vk::CommandBuffer {
            self.handle
        }

        fn queue_family_index(&self) -> u32 {
            self.family
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> RecordingState {
            self.state.get()
        }

        fn mark_submitted(&self) {
            self.state.set(RecordingState::Submitted);
        }
    }

    #[test]
    fn deferred_wait_is_consumed_by_next_batch_only() {
        let queue = host_queue(QueueCapability::Graphics, 0);
        let fence = host_fence(0);
        let produced = fence.increment();

        assert_eq!(queue.wait(&fence, None).unwrap(), produced);
        assert_eq!(queue.pending_wait_count(), 1);

        let list = HostList::executable(1, 0);
        queue.execute_command_lists(&[&list]).unwrap();
        queue.signal(&fence, None).unwrap();

        let batches = queue.submitter().batches.borrow();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].wait_count(), 1);
        assert_eq!(batches[0].waits()[0].value, produced);
        assert_eq!(batches[0].waits()[0].semaphore, fence.handle());
        assert_eq!(batches[1].wait_count(), 0);
        assert_eq!(queue.pending_wait_count(), 0);
    }

    #[test]
    fn failed_submit_keeps_pending_waits() {
        let queue = host_queue(QueueCapability::Compute, 1);
        let fence = host_fence(0);
        fence.increment();
        queue.wait(&fence, None).unwrap();

        queue.submitter().fail.set(true);
        assert!(queue.submit(SubmitInfo::default()).is_err());
        assert_eq!(queue.pending_wait_count(), 1);

        queue.submitter().fail.set(false);
        queue.submit(SubmitInfo::default()).unwrap();
        assert_eq!(queue.submitter().batches.borrow()[0].wait_count(), 1);
        assert_eq!(queue.pending_wait_count(), 0);
    }

    #[test]
    fn failed_signal_abandons_reserved_value() {
        let queue = host_queue(QueueCapability::Graphics, 0);
        let fence = host_fence(0);

        queue.submitter().fail.set(true);
        assert!(queue.signal(&fence, None).is_err());
        assert_eq!(fence.expected_value(), 1);

        let err = fence.wait_expected().unwrap_err();
        assert!(matches!(err, HalError::FenceAbandoned { requested: 1, abandoned: 1, .. }));

        // 对废弃值的 GPU 等待同样被拒绝，不会进入队列
        queue.submitter().fail.set(false);
        assert!(matches!(queue.wait(&fence, None), Err(HalError::FenceAbandoned { .. })));
        assert_eq!(queue.pending_wait_count(), 0);
    }

    #[test]
    fn explicit_signal_value_is_reserved() {
        let queue = host_queue(QueueCapability::Graphics, 0);
        let fence = host_fence(0);

        assert_eq!(queue.signal(&fence, Some(5)).unwrap(), 5);
        assert_eq!(fence.expected_value(), 5);
        assert_eq!(queue.submitter().batches.borrow()[0].signals()[0].value, 5);

        // 之前的值仍然可以等待，之后的值没有预留
        assert!(queue.wait(&fence, Some(5)).is_ok());
        assert!(matches!(
            queue.wait(&fence, Some(6)),
            Err(HalError::UnreservedFenceValue { requested: 6, expected: 5, .. })
        ));
    }

    #[test]
    fn submitted_list_cannot_be_submitted_again() {
        let queue = host_queue(QueueCapability::Graphics, 0);
        let list = HostList::executable(1, 0);

        queue.execute_command_lists(&[&list]).unwrap();
        assert_eq!(list.state(), RecordingState::Submitted);

        let err = queue.execute_command_lists(&[&list]).unwrap_err();
        assert!(matches!(err, HalError::InvalidCommandListState { op: "submit", state: "submitted", .. }));
        assert_eq!(queue.submitter().batches.borrow().len(), 1);
    }

    #[test]
    fn lists_from_other_family_are_rejected() {
        let queue = host_queue(QueueCapability::Graphics, 0);
        let ours = HostList::executable(1, 0);
        let theirs = HostList::executable(2, 2);

        let err = queue.execute_command_lists(&[&ours, &theirs]).unwrap_err();
        assert!(matches!(err, HalError::QueueFamilyMismatch { list_family: 2, queue_family: 0, .. }));

        // 整个 batch 都没有提交
        assert!(queue.submitter().batches.borrow().is_empty());
        assert_eq!(ours.state(), RecordingState::Executable);
    }

    #[test]
    fn recording_list_is_rejected() {
        let queue = host_queue(QueueCapability::Transfer, 0);
        let list = HostList::executable(1, 0);
        list.state.set(RecordingState::Recording);

        let err = queue.execute_command_lists(&[&list]).unwrap_err();
        assert!(matches!(err, HalError::InvalidCommandListState { state: "recording", .. }));
    }

    #[test]
    fn failed_execution_leaves_list_executable() {
        let queue = host_queue(QueueCapability::Graphics, 0);
        let list = HostList::executable(1, 0);

        queue.submitter().fail.set(true);
        assert!(queue.execute_command_lists(&[&list]).is_err());
        assert_eq!(list.state(), RecordingState::Executable);
    }

    #[test]
    fn wait_idle_flushes_pending_waits() {
        let queue = host_queue(QueueCapability::Graphics, 0);
        queue.wait_idle().unwrap();
        assert!(queue.submitter().batches.borrow().is_empty());

        let fence = host_fence(3);
        queue.wait(&fence, None).unwrap();
        queue.wait_idle().unwrap();

        let batches = queue.submitter().batches.borrow();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].waits()[0].value, 3);
        assert_eq!(queue.submitter().idle_calls.get(), 2);
    }
}
