use std::{
    cell::RefCell,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use ash::vk;
use itertools::Itertools;

use crate::{
    commands::{capability::QueueCapability, command_list::CommandList},
    error::{HalError, HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
    render_pass::framebuffer_cache::{FramebufferAttachmentKey, FramebufferCache, FramebufferCacheKey},
};

/// render pass 的唯一标识，作为 graphics pipeline key 的一部分
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderPassId(u64);

impl RenderPassId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    /// clear 之后写入，最终用于 present
    pub fn present_color(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    pub fn color(format: vk::Format, final_layout: vk::ImageLayout) -> Self {
        Self {
            final_layout,
            ..Self::present_color(format)
        }
    }

    /// 深度只在 pass 内使用，不需要保存
    pub fn depth(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    fn vk_desc(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::default()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
    }
}

/// subpass 中引用的 attachment 下标
#[derive(Clone, Debug, Default)]
pub struct SubpassDesc {
    pub color_attachments: Vec<u32>,
    pub depth_attachment: Option<u32>,
    pub input_attachments: Vec<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassDesc {
    pub attachments: Vec<AttachmentDesc>,
    pub subpasses: Vec<SubpassDesc>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

impl RenderPassDesc {
    /// 一个 color attachment，一个 subpass
    pub fn single_color(format: vk::Format) -> Self {
        Self {
            attachments: vec![AttachmentDesc::present_color(format)],
            subpasses: vec![SubpassDesc {
                color_attachments: vec![0],
                ..Default::default()
            }],
            dependencies: vec![
                vk::SubpassDependency::default()
                    .src_subpass(vk::SUBPASS_EXTERNAL)
                    .dst_subpass(0)
                    .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                    .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
            ],
        }
    }

    /// subpass 引用的下标必须在 attachment 范围内
    pub fn validate(&self, pass_name: &str) -> HalResult<()> {
        let mismatch = |detail: String| HalError::AttachmentMismatch {
            pass: pass_name.to_string(),
            detail,
        };

        if self.subpasses.is_empty() {
            return Err(mismatch("render pass declares no subpass".to_string()));
        }
        // framebuffer 的尺寸来自 attachment
        if self.attachments.is_empty() {
            return Err(mismatch("render pass declares no attachment".to_string()));
        }
        let attachment_count = self.attachments.len() as u32;
        for (subpass_idx, subpass) in self.subpasses.iter().enumerate() {
            let refs = subpass
                .color_attachments
                .iter()
                .chain(subpass.depth_attachment.iter())
                .chain(subpass.input_attachments.iter());
            if let Some(bad) = refs.into_iter().find(|idx| **idx >= attachment_count) {
                return Err(mismatch(format!(
                    "subpass {} references attachment {} but only {} are declared",
                    subpass_idx, bad, attachment_count
                )));
            }
        }
        Ok(())
    }
}

/// begin render pass 时提供的一个具体 attachment
#[derive(Clone, Copy, Debug)]
pub struct RenderPassAttachment {
    pub view: vk::ImageView,
    pub usage: vk::ImageUsageFlags,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub layer_count: u32,
}

impl RenderPassAttachment {
    #[inline]
    pub fn key(&self) -> FramebufferAttachmentKey {
        FramebufferAttachmentKey {
            usage: self.usage,
            format: self.format,
            width: self.width,
            height: self.height,
            layer_count: self.layer_count,
        }
    }
}

pub struct RenderPassBeginInfo<'a> {
    /// 顺序必须和 render pass 声明的 attachment 一致
    pub attachments: &'a [RenderPassAttachment],
    pub render_area: vk::Rect2D,
    pub clear_values: &'a [vk::ClearValue],
}

/// 检查 begin 时的 attachment 与 render pass 声明的格式一一对应
pub fn check_attachments(
    pass_name: &str,
    declared_formats: &[vk::Format],
    attachments: &[RenderPassAttachment],
) -> HalResult<()> {
    let mismatch = |detail: String| HalError::AttachmentMismatch {
        pass: pass_name.to_string(),
        detail,
    };

    if attachments.is_empty() {
        return Err(mismatch("no attachment provided, framebuffer extent would be empty".to_string()));
    }
    if declared_formats.len() != attachments.len() {
        return Err(mismatch(format!(
            "{} attachments declared, {} provided",
            declared_formats.len(),
            attachments.len()
        )));
    }
    if let Some((idx, (declared, provided))) = declared_formats
        .iter()
        .zip_eq(attachments.iter())
        .enumerate()
        .find(|(_, (declared, provided))| **declared != provided.format)
    {
        return Err(mismatch(format!(
            "attachment {} declared as {:?}, provided {:?}",
            idx, declared, provided.format
        )));
    }
    Ok(())
}

/// begin render pass 中查找 framebuffer 的部分：检查 attachment，计算 key，命中则复用，否则创建
pub fn resolve_framebuffer<F: Copy>(
    pass_name: &str,
    declared_formats: &[vk::Format],
    framebuffers: &mut FramebufferCache<F>,
    attachments: &[RenderPassAttachment],
    create: impl FnOnce(&FramebufferCacheKey) -> HalResult<F>,
) -> HalResult<F> {
    check_attachments(pass_name, declared_formats, attachments)?;
    let key = FramebufferCacheKey::new(attachments.iter().map(RenderPassAttachment::key));
    framebuffers.get_or_create(key, create)
}

/// render pass 固定 attachment 的格式、load/store 以及 subpass 结构，
/// 不固定具体的 image view、尺寸与层数
///
/// 内部持有一个按 attachment 形状索引的 framebuffer cache，随 render pass 一起销毁
pub struct RenderPass {
    handle: vk::RenderPass,
    id: RenderPassId,
    attachment_formats: Vec<vk::Format>,
    subpass_count: u32,

    framebuffers: RefCell<FramebufferCache>,

    name: String,
    device: Rc<GfxDevice>,
}

// 创建与销毁
impl RenderPass {
    pub fn new(device: Rc<GfxDevice>, desc: &RenderPassDesc, debug_name: &str) -> HalResult<Self> {
        desc.validate(debug_name)?;

        let attachments = desc.attachments.iter().map(AttachmentDesc::vk_desc).collect_vec();

        let to_refs = |indices: &[u32], layout: vk::ImageLayout| {
            indices.iter().map(|idx| vk::AttachmentReference::default().attachment(*idx).layout(layout)).collect_vec()
        };
        let color_refs = desc
            .subpasses
            .iter()
            .map(|subpass| to_refs(&subpass.color_attachments, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
            .collect_vec();
        let input_refs = desc
            .subpasses
            .iter()
            .map(|subpass| to_refs(&subpass.input_attachments, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL))
            .collect_vec();
        let depth_refs = desc
            .subpasses
            .iter()
            .map(|subpass| {
                subpass.depth_attachment.map(|idx| {
                    vk::AttachmentReference::default()
                        .attachment(idx)
                        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                })
            })
            .collect_vec();

        let subpasses = (0..desc.subpasses.len())
            .map(|idx| {
                let subpass = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&color_refs[idx])
                    .input_attachments(&input_refs[idx]);
                match &depth_refs[idx] {
                    Some(depth_ref) => subpass.depth_stencil_attachment(depth_ref),
                    None => subpass,
                }
            })
            .collect_vec();

        let render_pass_ci = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&desc.dependencies);
        let handle = unsafe { device.create_render_pass(&render_pass_ci, None) }
            .with_vk_context(|| format!("creating render pass `{}`", debug_name))?;

        let render_pass = Self {
            handle,
            id: RenderPassId::next(),
            attachment_formats: desc.attachments.iter().map(|attachment| attachment.format).collect(),
            subpass_count: desc.subpasses.len() as u32,
            framebuffers: RefCell::new(FramebufferCache::new()),
            name: debug_name.to_string(),
            device,
        };
        render_pass.device.set_debug_name(&render_pass, debug_name);
        Ok(render_pass)
    }

    /// imageless framebuffer：只记录每个 attachment 的用途、格式与尺寸
    fn create_framebuffer(&self, key: &FramebufferCacheKey) -> HalResult<vk::Framebuffer> {
        let view_formats = key.attachments().iter().map(|attachment| [attachment.format]).collect_vec();
        let image_infos = key
            .attachments()
            .iter()
            .zip(view_formats.iter())
            .map(|(attachment, formats)| {
                vk::FramebufferAttachmentImageInfo::default()
                    .usage(attachment.usage)
                    .width(attachment.width)
                    .height(attachment.height)
                    .layer_count(attachment.layer_count)
                    .view_formats(formats)
            })
            .collect_vec();
        let mut attachments_ci = vk::FramebufferAttachmentsCreateInfo::default().attachment_image_infos(&image_infos);

        let (width, height, layers) = key.extent();
        let mut framebuffer_ci = vk::FramebufferCreateInfo::default()
            .flags(vk::FramebufferCreateFlags::IMAGELESS)
            .render_pass(self.handle)
            .width(width)
            .height(height)
            .layers(layers)
            .push_next(&mut attachments_ci);
        // imageless 时只需要数量，不需要 view
        framebuffer_ci.attachment_count = image_infos.len() as u32;

        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_ci, None) }
            .with_vk_context(|| format!("creating framebuffer for `{}` with {:?}", self.name, key))?;
        self.device.set_object_debug_name(
            framebuffer,
            format!("Framebuffer::{}-{}x{}x{}", self.name, width, height, layers),
        );
        log::debug!("render pass `{}` created framebuffer for {:?}", self.name, key);
        Ok(framebuffer)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.get_mut().drain() {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.destroy_render_pass(self.handle, None);
        }
    }
}

// getters
impl RenderPass {
    #[inline]
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    #[inline]
    pub fn id(&self) -> RenderPassId {
        self.id
    }

    #[inline]
    pub fn attachment_formats(&self) -> &[vk::Format] {
        &self.attachment_formats
    }

    #[inline]
    pub fn subpass_count(&self) -> u32 {
        self.subpass_count
    }

    #[inline]
    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.borrow().len()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

// 命令
impl RenderPass {
    /// 根据 attachment 的形状找到（或创建）framebuffer，然后开始 render pass
    ///
    /// # return
    /// 使用的 framebuffer
    pub fn begin_render_pass(&self, cmd: &CommandList, begin_info: &RenderPassBeginInfo) -> HalResult<vk::Framebuffer> {
        let cmd_handle = cmd.recording_handle("begin render pass", QueueCapability::Graphics)?;
        let framebuffer = resolve_framebuffer(
            &self.name,
            &self.attachment_formats,
            &mut self.framebuffers.borrow_mut(),
            begin_info.attachments,
            |key| self.create_framebuffer(key),
        )?;

        let views = begin_info.attachments.iter().map(|attachment| attachment.view).collect_vec();
        let mut attachment_begin_info = vk::RenderPassAttachmentBeginInfo::default().attachments(&views);
        let vk_begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.handle)
            .framebuffer(framebuffer)
            .render_area(begin_info.render_area)
            .clear_values(begin_info.clear_values)
            .push_next(&mut attachment_begin_info);

        unsafe {
            self.device.cmd_begin_render_pass(cmd_handle, &vk_begin_info, vk::SubpassContents::INLINE);
        }
        Ok(framebuffer)
    }

    pub fn next_subpass(&self, cmd: &CommandList) -> HalResult<()> {
        let cmd_handle = cmd.recording_handle("next subpass", QueueCapability::Graphics)?;
        unsafe { self.device.cmd_next_subpass(cmd_handle, vk::SubpassContents::INLINE) }
        Ok(())
    }

    pub fn end_render_pass(&self, cmd: &CommandList) -> HalResult<()> {
        let cmd_handle = cmd.recording_handle("end render pass", QueueCapability::Graphics)?;
        unsafe { self.device.cmd_end_render_pass(cmd_handle) }
        Ok(())
    }
}

impl DebugType for RenderPass {
    fn debug_type_name() -> &'static str {
        "GfxRenderPass"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    fn attachment(format: vk::Format) -> RenderPassAttachment {
        RenderPassAttachment {
            view: vk::ImageView::from_raw(1),
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            format,
            width: 1920,
            height: 1280,
            layer_count: 1,
        }
    }

    #[test]
    fn attachments_must_match_declaration() {
        let declared = [vk::Format::B8G8R8A8_SRGB, vk::Format::D32_SFLOAT];

        let ok = [attachment(vk::Format::B8G8R8A8_SRGB), attachment(vk::Format::D32_SFLOAT)];
        assert!(check_attachments("main", &declared, &ok).is_ok());

        let swapped = [attachment(vk::Format::D32_SFLOAT), attachment(vk::Format::B8G8R8A8_SRGB)];
        assert!(matches!(
            check_attachments("main", &declared, &swapped),
            Err(HalError::AttachmentMismatch { .. })
        ));

        let missing = [attachment(vk::Format::B8G8R8A8_SRGB)];
        assert!(check_attachments("main", &declared, &missing).is_err());
    }

    #[test]
    fn empty_attachment_list_is_rejected() {
        let err = check_attachments("empty", &[], &[]).unwrap_err();
        assert!(matches!(err, HalError::AttachmentMismatch { .. }));

        let desc = RenderPassDesc {
            subpasses: vec![SubpassDesc::default()],
            ..Default::default()
        };
        assert!(desc.validate("empty").is_err());
    }

    #[test]
    fn equal_shapes_resolve_to_the_same_framebuffer() {
        let declared = [vk::Format::B8G8R8A8_SRGB];
        let mut cache = FramebufferCache::new();
        let mut created = 0u64;
        let mut resolve = |attachment: RenderPassAttachment, cache: &mut FramebufferCache| {
            resolve_framebuffer("main", &declared, cache, &[attachment], |_| {
                created += 1;
                Ok(vk::Framebuffer::from_raw(100 + created))
            })
        };

        let first = resolve(attachment(vk::Format::B8G8R8A8_SRGB), &mut cache).unwrap();
        // 另一个 image view，形状相同
        let other_view = RenderPassAttachment {
            view: vk::ImageView::from_raw(9),
            ..attachment(vk::Format::B8G8R8A8_SRGB)
        };
        let second = resolve(other_view, &mut cache).unwrap();
        assert_eq!(first, second);

        let resized = RenderPassAttachment {
            width: 1280,
            height: 720,
            ..attachment(vk::Format::B8G8R8A8_SRGB)
        };
        let third = resolve(resized, &mut cache).unwrap();
        assert_ne!(first, third);

        // 格式不匹配时不会创建
        assert!(resolve(attachment(vk::Format::R8G8B8A8_UNORM), &mut cache).is_err());
        drop(resolve);
        assert_eq!(created, 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn different_views_share_a_key() {
        let a = attachment(vk::Format::B8G8R8A8_SRGB);
        let b = RenderPassAttachment {
            view: vk::ImageView::from_raw(2),
            ..a
        };
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn subpass_references_are_validated() {
        let mut desc = RenderPassDesc::single_color(vk::Format::B8G8R8A8_SRGB);
        assert!(desc.validate("main").is_ok());

        desc.subpasses[0].depth_attachment = Some(1);
        let err = desc.validate("main").unwrap_err();
        assert!(matches!(err, HalError::AttachmentMismatch { .. }));

        desc.attachments.push(AttachmentDesc::depth(vk::Format::D32_SFLOAT));
        assert!(desc.validate("main").is_ok());
    }

    #[test]
    fn render_pass_ids_are_unique() {
        let a = RenderPassId::next();
        let b = RenderPassId::next();
        assert_ne!(a, b);
    }
}
