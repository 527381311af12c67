use std::{cell::Cell, rc::Rc};

use ash::vk;

use crate::{
    commands::{capability::QueueCapability, command_allocator::CommandPool},
    error::{HalError, HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
    pipelines::pipeline_cache::Pipeline,
};

/// command list 的录制状态
///
/// ```text
/// Initial --begin--> Recording --end--> Executable --submit--> Submitted
///    ^                                      |                      |
///    +--------------------begin (reset)-----+----------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

impl RecordingState {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Recording => "recording",
            Self::Executable => "executable",
            Self::Submitted => "submitted",
        }
    }

    /// 除了正在录制，任何状态都可以重新开始录制
    #[inline]
    pub fn begin(self) -> Option<Self> {
        (self != Self::Recording).then_some(Self::Recording)
    }

    #[inline]
    pub fn end(self) -> Option<Self> {
        (self == Self::Recording).then_some(Self::Executable)
    }

    /// 录制一次只能提交一次
    #[inline]
    pub fn submit(self) -> Option<Self> {
        (self == Self::Executable).then_some(Self::Submitted)
    }
}

/// 可以交给 queue 执行的录制结果
pub trait Submittable {
    fn handle(&self) -> vk::CommandBuffer;

    fn queue_family_index(&self) -> u32;

    fn name(&self) -> &str;

    fn state(&self) -> RecordingState;

    /// 提交成功之后由 queue 调用
    fn mark_submitted(&self);
}

/// 命令缓冲封装
///
/// 只有一种 command list 类型，能力等级作为一个值记录在 list 上，
/// 每条命令在录制前检查所需的等级。
///
/// # 使用示例
/// ```ignore
/// let cmd = allocator.allocate_list("my-pass")?;
/// cmd.begin()?;
/// cmd.bind_pipeline(&pipeline)?;
/// cmd.dispatch(8, 8, 1)?;
/// cmd.end()?;
/// queue.execute_command_lists(&[&cmd])?;
/// ```
pub struct CommandList {
    handle: vk::CommandBuffer,
    capability: QueueCapability,
    queue_family_index: u32,

    state: Cell<RecordingState>,
    /// begin 时 pool 的 generation，pool reset 之后录制内容失效
    recorded_generation: Cell<u64>,

    pool: Rc<CommandPool>,
    name: String,
}

// new & init
impl CommandList {
    pub(crate) fn new(
        handle: vk::CommandBuffer,
        capability: QueueCapability,
        queue_family_index: u32,
        pool: Rc<CommandPool>,
        debug_name: &str,
    ) -> Self {
        let list = Self {
            handle,
            capability,
            queue_family_index,
            state: Cell::new(RecordingState::Initial),
            recorded_generation: Cell::new(pool.generation()),
            pool,
            name: debug_name.to_string(),
        };
        list.device().set_debug_name(&list, debug_name);
        list
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        unsafe {
            self.pool.device().free_command_buffers(self.pool.handle(), std::slice::from_ref(&self.handle));
        }
    }
}

// getters
impl CommandList {
    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn capability(&self) -> QueueCapability {
        self.capability
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// pool reset 过的 list 回到 Initial
    pub fn state(&self) -> RecordingState {
        if self.recorded_generation.get() != self.pool.generation() {
            RecordingState::Initial
        } else {
            self.state.get()
        }
    }

    #[inline]
    fn device(&self) -> &GfxDevice {
        self.pool.device()
    }
}

// 状态
impl CommandList {
    fn invalid_state(&self, op: &'static str) -> HalError {
        HalError::InvalidCommandListState {
            name: self.name.clone(),
            op,
            state: self.state().name(),
        }
    }

    /// 检查 list 的能力等级是否满足 `required`
    pub fn require(&self, required: QueueCapability) -> HalResult<()> {
        if self.capability.supports(required) {
            Ok(())
        } else {
            Err(HalError::CapabilityMismatch {
                name: self.name.clone(),
                required,
                actual: self.capability,
            })
        }
    }

    /// 录制命令前的检查，返回 vk handle
    pub(crate) fn recording_handle(
        &self,
        op: &'static str,
        required: QueueCapability,
    ) -> HalResult<vk::CommandBuffer> {
        if self.state() != RecordingState::Recording {
            return Err(self.invalid_state(op));
        }
        self.require(required)?;
        Ok(self.handle)
    }

    /// 开始录制，之前录制的内容会被清空
    pub fn begin(&self) -> HalResult<()> {
        let next = self.state().begin().ok_or_else(|| self.invalid_state("begin"))?;
        unsafe {
            self.device().begin_command_buffer(
                self.handle,
                &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )
        }
        .with_vk_context(|| format!("beginning command list `{}`", self.name))?;

        self.recorded_generation.set(self.pool.generation());
        self.state.set(next);
        Ok(())
    }

    pub fn end(&self) -> HalResult<()> {
        let next = self.state().end().ok_or_else(|| self.invalid_state("end"))?;
        unsafe { self.device().end_command_buffer(self.handle) }
            .with_vk_context(|| format!("ending command list `{}`", self.name))?;
        self.state.set(next);
        Ok(())
    }
}

// pipeline 状态类型的命令
impl CommandList {
    /// - compute pipeline 需要 Compute 等级，graphics pipeline 需要 Graphics 等级
    pub fn bind_pipeline(&self, pipeline: &Pipeline) -> HalResult<()> {
        let required = QueueCapability::for_bind_point(pipeline.bind_point());
        let cmd = self.recording_handle("bind pipeline", required)?;
        unsafe { self.device().cmd_bind_pipeline(cmd, pipeline.bind_point(), pipeline.handle()) }
        Ok(())
    }

    pub fn bind_descriptor_sets(
        &self,
        pipeline: &Pipeline,
        first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> HalResult<()> {
        let required = QueueCapability::for_bind_point(pipeline.bind_point());
        let cmd = self.recording_handle("bind descriptor sets", required)?;
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                cmd,
                pipeline.bind_point(),
                pipeline.layout(),
                first_set,
                descriptor_sets,
                dynamic_offsets,
            )
        }
        Ok(())
    }

    /// push constant 对 pipeline layout 中声明的所有 stage 可见
    pub fn push_constants(&self, pipeline: &Pipeline, offset: u32, data: &[u8]) -> HalResult<()> {
        let required = QueueCapability::for_bind_point(pipeline.bind_point());
        let cmd = self.recording_handle("push constants", required)?;
        unsafe {
            self.device().cmd_push_constants(cmd, pipeline.layout(), pipeline.push_constant_stages(), offset, data)
        }
        Ok(())
    }
}

// 计算与绘制类型的命令
impl CommandList {
    pub fn dispatch(&self, group_count_x: u32, group_count_y: u32, group_count_z: u32) -> HalResult<()> {
        let cmd = self.recording_handle("dispatch", QueueCapability::Compute)?;
        unsafe { self.device().cmd_dispatch(cmd, group_count_x, group_count_y, group_count_z) }
        Ok(())
    }

    /// 不使用 index buffer 的绘制
    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> HalResult<()> {
        let cmd = self.recording_handle("draw", QueueCapability::Graphics)?;
        unsafe { self.device().cmd_draw(cmd, vertex_count, instance_count, first_vertex, first_instance) }
        Ok(())
    }

    pub fn bind_index_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> HalResult<()> {
        let cmd = self.recording_handle("bind index buffer", QueueCapability::Graphics)?;
        unsafe { self.device().cmd_bind_index_buffer(cmd, buffer, offset, index_type) }
        Ok(())
    }

    pub fn bind_vertex_buffers(
        &self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) -> HalResult<()> {
        let cmd = self.recording_handle("bind vertex buffers", QueueCapability::Graphics)?;
        unsafe { self.device().cmd_bind_vertex_buffers(cmd, first_binding, buffers, offsets) }
        Ok(())
    }

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> HalResult<()> {
        let cmd = self.recording_handle("draw indexed", QueueCapability::Graphics)?;
        unsafe {
            self.device().cmd_draw_indexed(cmd, index_count, instance_count, first_index, vertex_offset, first_instance)
        }
        Ok(())
    }

    pub fn set_viewport(&self, viewport: vk::Viewport) -> HalResult<()> {
        let cmd = self.recording_handle("set viewport", QueueCapability::Graphics)?;
        unsafe { self.device().cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport)) }
        Ok(())
    }

    pub fn set_scissor(&self, scissor: vk::Rect2D) -> HalResult<()> {
        let cmd = self.recording_handle("set scissor", QueueCapability::Graphics)?;
        unsafe { self.device().cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor)) }
        Ok(())
    }
}

// 数据传输与同步类型的命令
impl CommandList {
    /// - 支持的 queue：transfer，graphics，compute
    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) -> HalResult<()> {
        let cmd = self.recording_handle("copy buffer", QueueCapability::Transfer)?;
        unsafe { self.device().cmd_copy_buffer(cmd, src, dst, regions) }
        Ok(())
    }

    /// 改变 image 的 layout，使用 synchronization2 的 barrier
    ///
    /// - 支持的 queue：transfer，graphics，compute
    pub fn image_barrier(&self, barrier: &ImageBarrier) -> HalResult<()> {
        let cmd = self.recording_handle("image barrier", QueueCapability::Transfer)?;
        let vk_barrier = barrier.vk_barrier();
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&vk_barrier));
        unsafe { self.device().cmd_pipeline_barrier2(cmd, &dependency_info) }
        Ok(())
    }
}

impl Submittable for CommandList {
    #[inline]
    fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn state(&self) -> RecordingState {
        CommandList::state(self)
    }

    fn mark_submitted(&self) {
        self.state.set(RecordingState::Submitted);
    }
}

impl DebugType for CommandList {
    fn debug_type_name() -> &'static str {
        "GfxCommandList"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

/// image layout 转换的描述
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl ImageBarrier {
    /// 覆盖整个 image 的 barrier，stage/access 默认为 ALL_COMMANDS 与读写全部
    pub fn layout_transition(image: vk::Image, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        Self {
            image,
            aspect: vk::ImageAspectFlags::COLOR,
            old_layout,
            new_layout,
            src_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            src_access: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        }
    }

    #[inline]
    pub fn aspect(mut self, aspect: vk::ImageAspectFlags) -> Self {
        self.aspect = aspect;
        self
    }

    #[inline]
    pub fn src(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.src_stage = stage;
        self.src_access = access;
        self
    }

    #[inline]
    pub fn dst(mut self, stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        self.dst_stage = stage;
        self.dst_access = access;
        self
    }

    fn vk_barrier(&self) -> vk::ImageMemoryBarrier2<'static> {
        vk::ImageMemoryBarrier2::default()
            .image(self.image)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(self.aspect)
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            )
    }
}
