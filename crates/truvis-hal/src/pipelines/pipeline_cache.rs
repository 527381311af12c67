//! pipeline 对象缓存
//!
//! pipeline 的创建开销很大，相同的 key 只会创建一次，之后都返回同一个对象。
//! vulkan 的 pipeline cache 数据会在 `flush` 时写回文件，下次启动时读取。

use std::{
    collections::HashMap,
    ffi::CString,
    hash::Hash,
    path::{Path, PathBuf},
    rc::Rc,
};

use ash::vk;
use itertools::Itertools;

use crate::{
    error::{HalError, HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice, physical_device::GfxPhysicalDevice},
    pipelines::{
        descriptor_layout::{self, DescriptorTableLayout},
        shader::{ShaderModule, ShaderModuleId, ShaderReflection},
    },
    render_pass::render_pass::{RenderPass, RenderPassId},
};

// ============================================================================
// keys
// ============================================================================

/// 一个 shader stage 的标识：哪个 module 的哪个入口
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderStageKey {
    pub module: ShaderModuleId,
    pub stage: vk::ShaderStageFlags,
    pub entry_point: CString,
}

impl ShaderStageKey {
    pub fn of(shader: &ShaderModule) -> Self {
        Self {
            module: shader.id(),
            stage: shader.stage(),
            entry_point: shader.entry_point().to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ComputePipelineKey {
    pub stage: ShaderStageKey,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// 预乘之前的 alpha 混合
    Alpha,
    Additive,
}

impl BlendMode {
    pub fn vk_state(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
        match self {
            BlendMode::Opaque => state.blend_enable(false),
            BlendMode::Alpha => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD),
            BlendMode::Additive => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD),
        }
    }
}

/// graphics pipeline 的固定管线状态
///
/// viewport 和 scissor 总是 dynamic state，不在这里
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FixedFunctionState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    /// None 表示关闭深度测试
    pub depth_test: Option<vk::CompareOp>,
    pub depth_write: bool,
    pub samples: vk::SampleCountFlags,
    /// 每个 color attachment 一个
    pub blend: Vec<BlendMode>,
}

impl Default for FixedFunctionState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            // 按照 OpenGL 的传统，将 CCW 视为 front face
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: Some(vk::CompareOp::LESS),
            depth_write: true,
            samples: vk::SampleCountFlags::TYPE_1,
            blend: vec![BlendMode::Opaque],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexInputLayout {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputLayout {
    fn vk_descriptions(
        &self,
    ) -> (Vec<vk::VertexInputBindingDescription>, Vec<vk::VertexInputAttributeDescription>) {
        let bindings = self
            .bindings
            .iter()
            .map(|b| {
                vk::VertexInputBindingDescription::default()
                    .binding(b.binding)
                    .stride(b.stride)
                    .input_rate(b.input_rate)
            })
            .collect_vec();
        let attributes = self
            .attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default()
                    .location(a.location)
                    .binding(a.binding)
                    .format(a.format)
                    .offset(a.offset)
            })
            .collect_vec();
        (bindings, attributes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineKey {
    /// 按照 stage 的声明顺序
    pub stages: Vec<ShaderStageKey>,
    pub fixed_function: FixedFunctionState,
    pub vertex_input: VertexInputLayout,
    pub render_pass: RenderPassId,
    pub subpass: u32,
}

pub struct GraphicsPipelineDesc<'a> {
    pub stages: Vec<&'a ShaderModule>,
    pub fixed_function: FixedFunctionState,
    pub vertex_input: VertexInputLayout,
    pub render_pass: &'a RenderPass,
    pub subpass: u32,
}

impl GraphicsPipelineDesc<'_> {
    pub fn key(&self) -> GraphicsPipelineKey {
        GraphicsPipelineKey {
            stages: self.stages.iter().map(|shader| ShaderStageKey::of(shader)).collect(),
            fixed_function: self.fixed_function.clone(),
            vertex_input: self.vertex_input.clone(),
            render_pass: self.render_pass.id(),
            subpass: self.subpass,
        }
    }
}

// ============================================================================
// table
// ============================================================================

/// key -> pipeline，每个 key 最多创建一次
pub struct PipelineTable<K, P> {
    entries: HashMap<K, Rc<P>>,
}

impl<K, P> Default for PipelineTable<K, P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq, P> PipelineTable<K, P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `create` 失败时不会插入任何内容，下次同样的 key 会再次尝试创建
    pub fn get_or_create(&mut self, key: K, create: impl FnOnce(&K) -> HalResult<P>) -> HalResult<Rc<P>> {
        if let Some(pipeline) = self.entries.get(&key) {
            return Ok(pipeline.clone());
        }
        let pipeline = Rc::new(create(&key)?);
        self.entries.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    #[inline]
    pub fn get(&self, key: &K) -> Option<Rc<P>> {
        self.entries.get(key).cloned()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// pipeline objects
// ============================================================================

/// 由各个 stage 合并之后的 descriptor table layout 以及 push constant 构成
pub struct PipelineLayout {
    handle: vk::PipelineLayout,
    /// 需要比 handle 活得久，drop 的时候在 handle 之后销毁
    table_layouts: Vec<DescriptorTableLayout>,
    push_constant_range: Option<vk::PushConstantRange>,
    device: Rc<GfxDevice>,
}

impl PipelineLayout {
    pub fn new(device: Rc<GfxDevice>, reflections: &[&ShaderReflection], debug_name: &str) -> HalResult<Self> {
        let merged = descriptor_layout::merge_reflections(reflections.iter().copied())?;
        let table_layouts = DescriptorTableLayout::build_all(&device, &merged, debug_name)?;
        let push_constant_range = descriptor_layout::merge_push_constants(reflections.iter().copied());

        let set_layouts = table_layouts.iter().map(|layout| layout.handle()).collect_vec();
        let pipeline_layout_ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(push_constant_range.as_slice());
        let handle = unsafe { device.create_pipeline_layout(&pipeline_layout_ci, None) }
            .with_vk_context(|| format!("creating pipeline layout `{}`", debug_name))?;

        let layout = Self {
            handle,
            table_layouts,
            push_constant_range,
            device,
        };
        layout.device.set_debug_name(&layout, debug_name);
        Ok(layout)
    }

    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    #[inline]
    pub fn table_layouts(&self) -> &[DescriptorTableLayout] {
        &self.table_layouts
    }

    #[inline]
    pub fn push_constant_range(&self) -> Option<vk::PushConstantRange> {
        self.push_constant_range
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.handle, None);
        }
    }
}

impl DebugType for PipelineLayout {
    fn debug_type_name() -> &'static str {
        "GfxPipelineLayout"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

pub struct Pipeline {
    handle: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
    layout: PipelineLayout,

    name: String,
    device: Rc<GfxDevice>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.handle, None);
        }
    }
}

// getters
impl Pipeline {
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.handle
    }

    #[inline]
    pub fn pipeline_layout(&self) -> &PipelineLayout {
        &self.layout
    }

    #[inline]
    pub fn push_constant_stages(&self) -> vk::ShaderStageFlags {
        self.layout.push_constant_range.map_or(vk::ShaderStageFlags::empty(), |range| range.stage_flags)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl DebugType for Pipeline {
    fn debug_type_name() -> &'static str {
        "GfxPipeline"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

// ============================================================================
// blob
// ============================================================================

/// vulkan pipeline cache 数据的头部，总共 32 字节：
/// header 长度、header 版本、vendor id、device id、16 字节的 cache uuid
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineCacheHeader {
    pub vendor_id: u32,
    pub device_id: u32,
    pub cache_uuid: [u8; vk::UUID_SIZE],
}

impl PipelineCacheHeader {
    pub const SIZE: usize = 16 + vk::UUID_SIZE;

    pub fn from_props(props: &vk::PhysicalDeviceProperties) -> Self {
        Self {
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            cache_uuid: props.pipeline_cache_uuid,
        }
    }

    /// 返回 blob 不能使用的原因
    pub fn check(&self, blob: &[u8]) -> Result<(), String> {
        if blob.len() < Self::SIZE {
            return Err(format!("truncated blob ({} bytes)", blob.len()));
        }
        let read_u32 = |offset: usize| {
            u32::from_le_bytes([blob[offset], blob[offset + 1], blob[offset + 2], blob[offset + 3]])
        };

        let header_size = read_u32(0);
        if header_size as usize != Self::SIZE {
            return Err(format!("header size {} != {}", header_size, Self::SIZE));
        }
        let version = read_u32(4);
        if version != vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32 {
            return Err(format!("unknown header version {}", version));
        }
        let (vendor_id, device_id) = (read_u32(8), read_u32(12));
        if vendor_id != self.vendor_id || device_id != self.device_id {
            return Err(format!(
                "written by vendor {:#x} device {:#x}, current is vendor {:#x} device {:#x}",
                vendor_id, device_id, self.vendor_id, self.device_id
            ));
        }
        if blob[16..Self::SIZE] != self.cache_uuid {
            return Err("pipeline cache uuid mismatch".to_string());
        }
        Ok(())
    }
}

/// 读取 blob
///
/// 文件不存在不是错误；头部与当前设备不匹配时丢弃并打印警告，两种情况都返回空
pub fn load_blob(path: &Path, header: &PipelineCacheHeader) -> HalResult<Vec<u8>> {
    let blob = match std::fs::read(path) {
        Ok(blob) => blob,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("no pipeline cache at {:?}, starting empty", path);
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(HalError::PipelineCacheIo {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    match header.check(&blob) {
        Ok(()) => {
            log::info!("loaded pipeline cache from {:?} ({} bytes)", path, blob.len());
            Ok(blob)
        }
        Err(reason) => {
            log::warn!("discarding pipeline cache {:?}: {}", path, reason);
            Ok(Vec::new())
        }
    }
}

/// 先写入同目录下的临时文件，再 rename 覆盖目标文件
pub fn store_blob(path: &Path, blob: &[u8]) -> HalResult<()> {
    let io_err = |source| HalError::PipelineCacheIo {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    std::fs::write(&tmp_path, blob).map_err(io_err)?;
    std::fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

// ============================================================================
// cache
// ============================================================================

/// 不是线程安全的：同一个 cache 只能在一个线程中使用
pub struct PipelineCache {
    handle: vk::PipelineCache,
    header: PipelineCacheHeader,
    path: Option<PathBuf>,

    compute_pipelines: PipelineTable<ComputePipelineKey, Pipeline>,
    graphics_pipelines: PipelineTable<GraphicsPipelineKey, Pipeline>,

    device: Rc<GfxDevice>,
}

impl PipelineCache {
    /// # param
    /// * path - None 表示不持久化
    pub fn new(device: Rc<GfxDevice>, pdevice: &GfxPhysicalDevice, path: Option<&Path>) -> HalResult<Self> {
        let header = PipelineCacheHeader::from_props(pdevice.basic_props());
        let initial_data = match path {
            Some(path) => load_blob(path, &header)?,
            None => Vec::new(),
        };

        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(&initial_data);
        let handle = unsafe { device.create_pipeline_cache(&create_info, None) }.vk_context("creating pipeline cache")?;

        let cache = Self {
            handle,
            header,
            path: path.map(Path::to_path_buf),
            compute_pipelines: PipelineTable::new(),
            graphics_pipelines: PipelineTable::new(),
            device,
        };
        cache.device.set_debug_name(&cache, "pipeline-cache");
        Ok(cache)
    }

    pub fn get_compute_pipeline(&mut self, shader: &ShaderModule) -> HalResult<Rc<Pipeline>> {
        let key = ComputePipelineKey {
            stage: ShaderStageKey::of(shader),
        };
        let (device, cache) = (&self.device, self.handle);
        self.compute_pipelines.get_or_create(key, |key| {
            log::debug!("creating compute pipeline for {:?}", key);
            Self::create_compute_pipeline(device, cache, shader)
        })
    }

    pub fn get_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc) -> HalResult<Rc<Pipeline>> {
        let key = desc.key();
        let (device, cache) = (&self.device, self.handle);
        self.graphics_pipelines.get_or_create(key, |key| {
            log::debug!("creating graphics pipeline for {:?}", key);
            Self::create_graphics_pipeline(device, cache, desc)
        })
    }

    /// 将 vulkan pipeline cache 的数据写回文件
    pub fn flush(&self) -> HalResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let blob = unsafe { self.device.get_pipeline_cache_data(self.handle) }
            .vk_context("reading pipeline cache data")?;
        if let Err(reason) = self.header.check(&blob) {
            log::warn!("driver returned an unexpected pipeline cache header: {}", reason);
        }
        store_blob(path, &blob)?;
        log::info!("flushed pipeline cache to {:?} ({} bytes)", path, blob.len());
        Ok(())
    }

    fn create_compute_pipeline(
        device: &Rc<GfxDevice>,
        cache: vk::PipelineCache,
        shader: &ShaderModule,
    ) -> HalResult<Pipeline> {
        if shader.stage() != vk::ShaderStageFlags::COMPUTE {
            return Err(HalError::InvalidConfig(format!(
                "shader `{}` has stage {:?}, a compute pipeline needs COMPUTE",
                shader.name(),
                shader.stage()
            )));
        }

        let layout = PipelineLayout::new(device.clone(), &[shader.reflection()], shader.name())?;
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.handle())
            .name(shader.entry_point());
        let pipeline_ci = vk::ComputePipelineCreateInfo::default().stage(stage_info).layout(layout.handle());

        let handle = unsafe { device.create_compute_pipelines(cache, std::slice::from_ref(&pipeline_ci), None) }
            .map_err(|(_, result)| result)
            .with_vk_context(|| format!("creating compute pipeline `{}`", shader.name()))?[0];

        let pipeline = Pipeline {
            handle,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            layout,
            name: shader.name().to_string(),
            device: device.clone(),
        };
        device.set_debug_name(&pipeline, shader.name());
        Ok(pipeline)
    }

    fn create_graphics_pipeline(
        device: &Rc<GfxDevice>,
        cache: vk::PipelineCache,
        desc: &GraphicsPipelineDesc,
    ) -> HalResult<Pipeline> {
        let name = desc.stages.iter().map(|shader| shader.name()).join("+");
        if desc.subpass >= desc.render_pass.subpass_count() {
            return Err(HalError::AttachmentMismatch {
                pass: desc.render_pass.name().to_string(),
                detail: format!(
                    "pipeline `{}` targets subpass {} of {}",
                    name,
                    desc.subpass,
                    desc.render_pass.subpass_count()
                ),
            });
        }

        let reflections = desc.stages.iter().map(|shader| shader.reflection()).collect_vec();
        let layout = PipelineLayout::new(device.clone(), &reflections, &name)?;

        let stage_infos = desc
            .stages
            .iter()
            .map(|shader| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage())
                    .module(shader.handle())
                    .name(shader.entry_point())
            })
            .collect_vec();

        let fixed = &desc.fixed_function;
        let (vertex_bindings, vertex_attributes) = desc.vertex_input.vk_descriptions();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly_info = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(fixed.topology)
            .primitive_restart_enable(false);

        // viewport 和 scissor 具体值由 dynamic 决定，但是数量由该 create info 决定
        let viewport_info = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);
        let rasterize_info = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(fixed.polygon_mode)
            .line_width(1.0)
            .cull_mode(fixed.cull_mode)
            .front_face(fixed.front_face)
            .depth_bias_enable(false);
        let msaa_info = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(fixed.samples);
        let depth_stencil_info = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(fixed.depth_test.is_some())
            .depth_write_enable(fixed.depth_write)
            .depth_compare_op(fixed.depth_test.unwrap_or(vk::CompareOp::ALWAYS))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        // 混合设置：需要为每个 color attachment 分别指定
        let blend_states = fixed.blend.iter().map(|mode| mode.vk_state()).collect_vec();
        let color_blend_info = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_states)
            .blend_constants([0.0, 0.0, 0.0, 0.0]);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state_info = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_ci = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly_info)
            .viewport_state(&viewport_info)
            .rasterization_state(&rasterize_info)
            .multisample_state(&msaa_info)
            .depth_stencil_state(&depth_stencil_info)
            .color_blend_state(&color_blend_info)
            .dynamic_state(&dynamic_state_info)
            .layout(layout.handle())
            .render_pass(desc.render_pass.handle())
            .subpass(desc.subpass);

        let handle = unsafe { device.create_graphics_pipelines(cache, std::slice::from_ref(&pipeline_ci), None) }
            .map_err(|(_, result)| result)
            .with_vk_context(|| format!("creating graphics pipeline `{}`", name))?[0];

        let pipeline = Pipeline {
            handle,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            layout,
            name,
            device: device.clone(),
        };
        device.set_debug_name(&pipeline, &pipeline.name);
        Ok(pipeline)
    }
}

// getters
impl PipelineCache {
    #[inline]
    pub fn handle(&self) -> vk::PipelineCache {
        self.handle
    }

    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[inline]
    pub fn compute_pipeline_count(&self) -> usize {
        self.compute_pipelines.len()
    }

    #[inline]
    pub fn graphics_pipeline_count(&self) -> usize {
        self.graphics_pipelines.len()
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("failed to flush pipeline cache: {}", e);
        }
        self.compute_pipelines.clear();
        self.graphics_pipelines.clear();
        unsafe {
            self.device.destroy_pipeline_cache(self.handle, None);
        }
    }
}

impl DebugType for PipelineCache {
    fn debug_type_name() -> &'static str {
        "GfxPipelineCache"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn stage(module: ShaderModuleId, stage: vk::ShaderStageFlags) -> ShaderStageKey {
        ShaderStageKey {
            module,
            stage,
            entry_point: c"main".to_owned(),
        }
    }

    fn graphics_key(render_pass: RenderPassId) -> GraphicsPipelineKey {
        let vs = ShaderModuleId::next();
        let fs = ShaderModuleId::next();
        GraphicsPipelineKey {
            stages: vec![stage(vs, vk::ShaderStageFlags::VERTEX), stage(fs, vk::ShaderStageFlags::FRAGMENT)],
            fixed_function: FixedFunctionState::default(),
            vertex_input: VertexInputLayout {
                bindings: vec![VertexBinding {
                    binding: 0,
                    stride: 32,
                    input_rate: vk::VertexInputRate::VERTEX,
                }],
                attributes: vec![VertexAttribute {
                    location: 0,
                    binding: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                }],
            },
            render_pass,
            subpass: 0,
        }
    }

    fn header() -> PipelineCacheHeader {
        PipelineCacheHeader {
            vendor_id: 0x10de,
            device_id: 0x2684,
            cache_uuid: [7; vk::UUID_SIZE],
        }
    }

    fn blob_for(header: &PipelineCacheHeader, payload: &[u8]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&(PipelineCacheHeader::SIZE as u32).to_le_bytes());
        blob.extend_from_slice(&(vk::PipelineCacheHeaderVersion::ONE.as_raw() as u32).to_le_bytes());
        blob.extend_from_slice(&header.vendor_id.to_le_bytes());
        blob.extend_from_slice(&header.device_id.to_le_bytes());
        blob.extend_from_slice(&header.cache_uuid);
        blob.extend_from_slice(payload);
        blob
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("truvis-hal-pipeline-cache-{}.bin", uuid::Uuid::new_v4()))
    }

    #[test]
    fn same_compute_key_creates_once() {
        let mut table: PipelineTable<ComputePipelineKey, u64> = PipelineTable::new();
        let created = Cell::new(0);
        let create = |_: &ComputePipelineKey| {
            created.set(created.get() + 1);
            Ok(created.get())
        };

        let module = ShaderModuleId::next();
        let key = ComputePipelineKey {
            stage: stage(module, vk::ShaderStageFlags::COMPUTE),
        };
        let first = table.get_or_create(key.clone(), create).unwrap();
        let second = table.get_or_create(key, create).unwrap();

        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(created.get(), 1);

        // 另一个 module 是另一个 pipeline
        let other = ComputePipelineKey {
            stage: stage(ShaderModuleId::next(), vk::ShaderStageFlags::COMPUTE),
        };
        table.get_or_create(other, create).unwrap();
        assert_eq!(created.get(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn failed_create_is_retried() {
        let mut table: PipelineTable<ComputePipelineKey, u64> = PipelineTable::new();
        let key = ComputePipelineKey {
            stage: stage(ShaderModuleId::next(), vk::ShaderStageFlags::COMPUTE),
        };

        let result = table.get_or_create(key.clone(), |_| {
            Err(HalError::from_vk(vk::Result::ERROR_OUT_OF_HOST_MEMORY, "creating compute pipeline"))
        });
        assert!(result.is_err());
        assert!(table.is_empty());

        assert_eq!(*table.get_or_create(key.clone(), |_| Ok(9)).unwrap(), 9);
        assert_eq!(table.get(&key).map(|p| *p), Some(9));
    }

    #[test]
    fn graphics_key_covers_all_state() {
        let base = graphics_key(RenderPassId::next());
        assert_eq!(base, base.clone());

        let mut other_pass = base.clone();
        other_pass.render_pass = RenderPassId::next();
        let mut other_subpass = base.clone();
        other_subpass.subpass = 1;
        let mut blended = base.clone();
        blended.fixed_function.blend = vec![BlendMode::Alpha];
        let mut no_depth = base.clone();
        no_depth.fixed_function.depth_test = None;
        let mut wireframe = base.clone();
        wireframe.fixed_function.polygon_mode = vk::PolygonMode::LINE;
        let mut stride = base.clone();
        stride.vertex_input.bindings[0].stride = 16;
        let mut swapped = base.clone();
        swapped.stages.reverse();

        let mut table: PipelineTable<GraphicsPipelineKey, usize> = PipelineTable::new();
        let variants = [base, other_pass, other_subpass, blended, no_depth, wireframe, stride, swapped];
        for (i, key) in variants.iter().enumerate() {
            table.get_or_create(key.clone(), |_| Ok(i)).unwrap();
        }
        assert_eq!(table.len(), variants.len());
    }

    #[test]
    fn blend_modes() {
        assert_eq!(BlendMode::Opaque.vk_state().blend_enable, vk::FALSE);
        let alpha = BlendMode::Alpha.vk_state();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(BlendMode::Additive.vk_state().dst_color_blend_factor, vk::BlendFactor::ONE);
    }

    #[test]
    fn header_check() {
        let header = header();
        assert!(header.check(&blob_for(&header, &[1, 2, 3])).is_ok());
        assert!(header.check(&blob_for(&header, &[])[..20]).is_err());

        let other_device = PipelineCacheHeader {
            device_id: 0x1234,
            ..header
        };
        assert!(header.check(&blob_for(&other_device, &[1])).is_err());

        let other_uuid = PipelineCacheHeader {
            cache_uuid: [0; vk::UUID_SIZE],
            ..header
        };
        assert!(header.check(&blob_for(&other_uuid, &[1])).is_err());

        let mut bad_version = blob_for(&header, &[1]);
        bad_version[4] = 9;
        assert!(header.check(&bad_version).is_err());
    }

    #[test]
    fn missing_file_is_empty_cache() {
        let path = temp_path();
        assert!(load_blob(&path, &header()).unwrap().is_empty());
    }

    #[test]
    fn store_then_load() {
        let path = temp_path();
        let header = header();
        let blob = blob_for(&header, &[0xAB; 64]);

        store_blob(&path, &blob).unwrap();
        assert_eq!(load_blob(&path, &header).unwrap(), blob);

        // 覆盖写入，临时文件不会残留
        let newer = blob_for(&header, &[0xCD; 8]);
        store_blob(&path, &newer).unwrap();
        assert_eq!(load_blob(&path, &header).unwrap(), newer);
        let mut tmp_name = path.file_name().unwrap().to_os_string();
        tmp_name.push(".tmp");
        assert!(!path.with_file_name(tmp_name).exists());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn mismatched_blob_is_discarded() {
        let path = temp_path();
        let other = PipelineCacheHeader {
            vendor_id: 0x1002,
            ..header()
        };
        store_blob(&path, &blob_for(&other, &[1, 2, 3, 4])).unwrap();
        assert!(load_blob(&path, &header()).unwrap().is_empty());
        std::fs::remove_file(&path).unwrap();
    }
}
