//! 在 host 端模拟 9 帧、3 帧 in flight 的渲染循环
//!
//! GPU 用一个延迟执行的 queue 代替：提交中的 timeline signal 先进入队列，
//! 只有 CPU 等待时才会被执行，因此 CPU 最多领先 GPU frames in flight 帧。
//! acquire / render / present 都通过 `CommandQueue` 提交。

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use ash::vk::{self, Handle};
use truvis_hal::{
    commands::{
        capability::QueueCapability,
        command_list::{RecordingState, Submittable},
        command_queue::{CommandQueue, QueueFamily, QueueSubmitter},
        fence::{Fence, TimelineCounter},
        submit_info::SubmitInfo,
    },
    error::{HalError, HalResult},
    foundation::mem_allocator::FrameIndex,
    render_pass::{
        framebuffer_cache::FramebufferCache,
        render_pass::{resolve_framebuffer, RenderPassAttachment},
    },
    swapchain::{
        image_ring::ImageRing,
        render_swapchain::{submit_acquire_sync, submit_present_sync},
    },
};

const FRAMES_IN_FLIGHT: usize = 3;
const FRAME_COUNT: u64 = 9;
const GRAPHICS_FAMILY: u32 = 0;

fn timeline_semaphore() -> vk::Semaphore {
    vk::Semaphore::from_raw(0x1000)
}

/// 模拟的 GPU timeline：signal 按提交顺序排队，wait 时才执行
#[derive(Default)]
struct SimulatedGpu {
    completed: Cell<u64>,
    queued: RefCell<VecDeque<u64>>,
    batches: Cell<usize>,
}

/// fence 与 queue 共享同一个模拟 GPU
#[derive(Clone, Default)]
struct SharedGpu(Rc<SimulatedGpu>);

impl TimelineCounter for SharedGpu {
    fn semaphore(&self) -> vk::Semaphore {
        timeline_semaphore()
    }

    fn completed_value(&self) -> HalResult<u64> {
        Ok(self.0.completed.get())
    }

    fn signal(&self, value: u64) -> HalResult<()> {
        self.0.completed.set(value);
        Ok(())
    }

    fn wait(&self, value: u64) -> HalResult<()> {
        while self.0.completed.get() < value {
            let next = self.0.queued.borrow_mut().pop_front();
            match next {
                Some(signaled) => self.0.completed.set(signaled),
                None => return Err(HalError::WaitTimeout(format!("nothing queued can reach {}", value))),
            }
        }
        Ok(())
    }
}

impl QueueSubmitter for SharedGpu {
    fn submit(&self, batch: &SubmitInfo) -> HalResult<()> {
        self.0.batches.set(self.0.batches.get() + 1);
        let mut queued = self.0.queued.borrow_mut();
        for signal in batch.signals().iter().filter(|signal| signal.semaphore == timeline_semaphore()) {
            queued.push_back(signal.value);
        }
        Ok(())
    }

    fn wait_idle(&self) -> HalResult<()> {
        let last = self.0.queued.borrow().back().copied();
        match last {
            Some(value) => self.wait(value),
            None => Ok(()),
        }
    }
}

/// 每帧重新录制的 command list
struct FrameList {
    handle: vk::CommandBuffer,
    state: Cell<RecordingState>,
}

impl Submittable for FrameList {
    fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    fn queue_family_index(&self) -> u32 {
        GRAPHICS_FAMILY
    }

    fn name(&self) -> &str {
        "frame"
    }

    fn state(&self) -> RecordingState {
        self.state.get()
    }

    fn mark_submitted(&self) {
        self.state.set(RecordingState::Submitted);
    }
}

struct FrameLoop {
    gpu: SharedGpu,
    fence: Fence<SharedGpu>,
    queue: CommandQueue<SharedGpu>,
    ring: ImageRing,
    lists: Vec<FrameList>,
    framebuffers: FramebufferCache,
    frame_index: FrameIndex,
    /// 每一帧 present 之后 fence 的值
    presented_values: Vec<u64>,
    framebuffers_created: u64,
    resolved: Vec<vk::Framebuffer>,
    max_in_flight: usize,
    presented_images: Vec<u32>,
}

impl FrameLoop {
    fn new(image_count: usize) -> Self {
        let gpu = SharedGpu::default();
        let queue_family = QueueFamily {
            capability: QueueCapability::Graphics,
            queue_family_index: GRAPHICS_FAMILY,
            queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            queue_count: 1,
        };
        let lists = (0..FRAMES_IN_FLIGHT)
            .map(|idx| FrameList {
                handle: vk::CommandBuffer::from_raw(idx as u64 + 1),
                state: Cell::new(RecordingState::Initial),
            })
            .collect();

        Self {
            fence: Fence::from_counter(gpu.clone(), 0, "frame"),
            queue: CommandQueue::with_submitter(gpu.clone(), queue_family),
            gpu,
            ring: ImageRing::new(image_count),
            lists,
            framebuffers: FramebufferCache::new(),
            frame_index: FrameIndex::new(FRAMES_IN_FLIGHT as u32),
            presented_values: Vec::new(),
            framebuffers_created: 0,
            resolved: Vec::new(),
            max_in_flight: 0,
            presented_images: Vec::new(),
        }
    }

    fn run_frame(&mut self, frame: u64, extent: (u32, u32)) -> HalResult<()> {
        let frame_in_flight = self.frame_index.advance(frame + 1)? as usize;

        // 等待 FRAMES_IN_FLIGHT 帧之前的那一帧
        let frame = frame as usize;
        if frame >= FRAMES_IN_FLIGHT {
            self.fence.wait(self.presented_values[frame - FRAMES_IN_FLIGHT])?;
        }

        // acquire
        let slot = self.ring.begin_acquire()?;
        self.ring.complete_acquire(slot as u32)?;
        let image_available = vk::Semaphore::from_raw(0x2000 + slot as u64);
        let ready_value = submit_acquire_sync(&self.queue, &self.fence, image_available)?;

        // render pass，每个 image 使用自己的 view
        let attachment = RenderPassAttachment {
            view: vk::ImageView::from_raw(0x3000 + slot as u64),
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            format: vk::Format::B8G8R8A8_SRGB,
            width: extent.0,
            height: extent.1,
            layer_count: 1,
        };
        let created = &mut self.framebuffers_created;
        let framebuffer = resolve_framebuffer(
            "main",
            &[vk::Format::B8G8R8A8_SRGB],
            &mut self.framebuffers,
            &[attachment],
            |_| {
                *created += 1;
                Ok(vk::Framebuffer::from_raw(*created))
            },
        )?;
        self.resolved.push(framebuffer);

        // render
        let list = &self.lists[frame_in_flight];
        list.state.set(RecordingState::Executable);
        let rendered_value = self.fence.increment();
        self.queue.execute_command_lists_with(
            &[list],
            SubmitInfo::default()
                .wait(self.fence.handle(), vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT, Some(ready_value))
                .signal(self.fence.handle(), vk::PipelineStageFlags2::ALL_COMMANDS, Some(rendered_value)),
        )?;

        // present
        let (present_slot, image_index) = self.ring.begin_present()?;
        let render_finished = vk::Semaphore::from_raw(0x4000 + present_slot as u64);
        let presented_value = submit_present_sync(&self.queue, &self.fence, render_finished)?;
        self.ring.complete_present()?;
        self.presented_images.push(image_index);
        self.presented_values.push(presented_value);

        let completed = self.fence.completed_value()?;
        let in_flight = self.presented_values.iter().filter(|value| **value > completed).count();
        self.max_in_flight = self.max_in_flight.max(in_flight);
        Ok(())
    }
}

#[test]
fn nine_frames_three_in_flight() {
    let mut frame_loop = FrameLoop::new(3);
    for frame in 0..FRAME_COUNT {
        frame_loop.run_frame(frame, (1920, 1280)).unwrap();
    }

    assert_eq!(frame_loop.framebuffers.len(), 1);
    assert_eq!(frame_loop.framebuffers_created, 1);
    assert!(frame_loop.resolved.iter().all(|framebuffer| *framebuffer == frame_loop.resolved[0]));
    assert_eq!(frame_loop.max_in_flight, FRAMES_IN_FLIGHT);
    assert_eq!(frame_loop.presented_images, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    assert_eq!(frame_loop.frame_index.frame_id(), FRAME_COUNT);
    assert_eq!(frame_loop.ring.outstanding(), 0);

    // acquire / render / present 各一次提交
    assert_eq!(frame_loop.gpu.0.batches.get(), 3 * FRAME_COUNT as usize);
    assert_eq!(frame_loop.fence.expected_value(), 3 * FRAME_COUNT);

    frame_loop.queue.wait_idle().unwrap();
    assert!(frame_loop.fence.is_completed().unwrap());
    assert_eq!(frame_loop.fence.completed_value().unwrap(), 3 * FRAME_COUNT);
    assert!(frame_loop.lists.iter().all(|list| list.state() == RecordingState::Submitted));
}

#[test]
fn each_extent_gets_one_framebuffer() {
    let mut frame_loop = FrameLoop::new(3);
    let extents = [(1920, 1280), (1920, 1280), (1280, 720), (1280, 720), (1920, 1280), (1280, 720)];
    for (frame, extent) in extents.into_iter().enumerate() {
        frame_loop.run_frame(frame as u64, extent).unwrap();
    }

    assert_eq!(frame_loop.framebuffers.len(), 2);
    assert_eq!(frame_loop.framebuffers_created, 2);
    assert_eq!(frame_loop.resolved[0], frame_loop.resolved[4]);
    assert_eq!(frame_loop.resolved[2], frame_loop.resolved[5]);
    assert_ne!(frame_loop.resolved[0], frame_loop.resolved[2]);
}

#[test]
fn skipped_frame_is_rejected() {
    let mut frame_loop = FrameLoop::new(3);
    frame_loop.run_frame(0, (1920, 1280)).unwrap();

    let err = frame_loop.run_frame(2, (1920, 1280)).unwrap_err();
    assert!(matches!(err, HalError::FrameOrder { expected: 2, got: 3 }));
}

#[test]
fn resubmitting_a_list_in_flight_is_rejected() {
    let mut frame_loop = FrameLoop::new(3);
    frame_loop.run_frame(0, (1920, 1280)).unwrap();

    let list = &frame_loop.lists[1];
    assert_eq!(list.state(), RecordingState::Submitted);
    let err = frame_loop.queue.execute_command_lists(&[list]).unwrap_err();
    assert!(matches!(err, HalError::InvalidCommandListState { op: "submit", .. }));
}
