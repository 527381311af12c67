use ash::vk;
use itertools::Itertools;

/// 对 `vk::SubmitInfo2` 的封装，自己持有各个数组，更易用
#[derive(Default, Clone)]
pub struct SubmitInfo {
    command_buffers: Vec<vk::CommandBufferSubmitInfo<'static>>,
    wait_infos: Vec<vk::SemaphoreSubmitInfo<'static>>,
    signal_infos: Vec<vk::SemaphoreSubmitInfo<'static>>,
}

impl SubmitInfo {
    pub fn new(command_buffers: &[vk::CommandBuffer]) -> Self {
        let command_buffers = command_buffers
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd))
            .collect_vec();

        Self {
            command_buffers,
            wait_infos: vec![],
            signal_infos: vec![],
        }
    }

    /// 引用的数组由 self 持有
    #[inline]
    pub fn submit_info(&self) -> vk::SubmitInfo2<'_> {
        vk::SubmitInfo2::default()
            .command_buffer_infos(&self.command_buffers)
            .wait_semaphore_infos(&self.wait_infos)
            .signal_semaphore_infos(&self.signal_infos)
    }

    /// # param
    /// * value - 仅对 timeline semaphore 有意义，binary semaphore 传入 None
    #[inline]
    pub fn wait(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.wait_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(stage)
                .value(value.unwrap_or_default()),
        );
        self
    }

    #[inline]
    pub fn signal(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2, value: Option<u64>) -> Self {
        self.signal_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(semaphore)
                .stage_mask(stage)
                .value(value.unwrap_or_default()),
        );
        self
    }

    /// 在已有的 wait 之前插入 wait，用于合并 queue 上挂起的依赖
    #[inline]
    pub(crate) fn prepend_waits(mut self, waits: Vec<vk::SemaphoreSubmitInfo<'static>>) -> Self {
        if !waits.is_empty() {
            self.wait_infos.splice(0..0, waits);
        }
        self
    }

    /// 合并另一个 batch 的 wait/signal，command buffer 保持在自己之后
    pub(crate) fn merge(mut self, other: SubmitInfo) -> Self {
        self.command_buffers.extend(other.command_buffers);
        self.wait_infos.extend(other.wait_infos);
        self.signal_infos.extend(other.signal_infos);
        self
    }

    #[inline]
    pub fn command_buffers(&self) -> &[vk::CommandBufferSubmitInfo<'static>] {
        &self.command_buffers
    }

    #[inline]
    pub fn waits(&self) -> &[vk::SemaphoreSubmitInfo<'static>] {
        &self.wait_infos
    }

    #[inline]
    pub fn signals(&self) -> &[vk::SemaphoreSubmitInfo<'static>] {
        &self.signal_infos
    }

    #[inline]
    pub fn command_buffer_count(&self) -> usize {
        self.command_buffers.len()
    }

    #[inline]
    pub fn wait_count(&self) -> usize {
        self.wait_infos.len()
    }

    #[inline]
    pub fn signal_count(&self) -> usize {
        self.signal_infos.len()
    }
}
