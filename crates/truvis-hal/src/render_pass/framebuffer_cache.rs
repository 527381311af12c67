//! 按照 attachment 的形状缓存 framebuffer
//!
//! framebuffer 只描述兼容性，不绑定具体的 image view（imageless framebuffer），
//! 因此两组格式、用途、尺寸都相同的 attachment 可以共享同一个 framebuffer。

use std::collections::HashMap;

use ash::vk;

use crate::error::HalResult;

/// 单个 attachment 中决定 framebuffer 的属性
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferAttachmentKey {
    pub usage: vk::ImageUsageFlags,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub layer_count: u32,
}

/// 按 render pass 声明顺序排列的 attachment 属性
///
/// 比较与 hash 都是结构化的，不涉及任何 handle；顺序不同的两个 key 不相等
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferCacheKey {
    attachments: Vec<FramebufferAttachmentKey>,
}

impl FramebufferCacheKey {
    pub fn new(attachments: impl IntoIterator<Item = FramebufferAttachmentKey>) -> Self {
        Self {
            attachments: attachments.into_iter().collect(),
        }
    }

    #[inline]
    pub fn attachments(&self) -> &[FramebufferAttachmentKey] {
        &self.attachments
    }

    /// framebuffer 的尺寸：所有 attachment 的最大宽、高与层数
    pub fn extent(&self) -> (u32, u32, u32) {
        self.attachments.iter().fold((0, 0, 0), |(width, height, layers), attachment| {
            (width.max(attachment.width), height.max(attachment.height), layers.max(attachment.layer_count))
        })
    }
}

/// key -> framebuffer
///
/// 每个 key 最多创建一次；cache 的生命周期与所属的 render pass 相同
pub struct FramebufferCache<F = vk::Framebuffer> {
    entries: HashMap<FramebufferCacheKey, F>,
}

impl<F> Default for FramebufferCache<F> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<F: Copy> FramebufferCache<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 命中时直接返回；未命中时调用 `create` 创建并插入
    ///
    /// `create` 失败时不会插入任何内容
    pub fn get_or_create(
        &mut self,
        key: FramebufferCacheKey,
        create: impl FnOnce(&FramebufferCacheKey) -> HalResult<F>,
    ) -> HalResult<F> {
        if let Some(framebuffer) = self.entries.get(&key) {
            return Ok(*framebuffer);
        }
        let framebuffer = create(&key)?;
        self.entries.insert(key, framebuffer);
        Ok(framebuffer)
    }

    #[inline]
    pub fn get(&self, key: &FramebufferCacheKey) -> Option<F> {
        self.entries.get(key).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 取出所有的 framebuffer，用于销毁
    pub fn drain(&mut self) -> impl Iterator<Item = F> + '_ {
        self.entries.drain().map(|(_, framebuffer)| framebuffer)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::error::HalError;

    fn color(width: u32, height: u32) -> FramebufferAttachmentKey {
        FramebufferAttachmentKey {
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            format: vk::Format::B8G8R8A8_SRGB,
            width,
            height,
            layer_count: 1,
        }
    }

    fn depth(width: u32, height: u32) -> FramebufferAttachmentKey {
        FramebufferAttachmentKey {
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            format: vk::Format::D32_SFLOAT,
            width,
            height,
            layer_count: 1,
        }
    }

    /// 返回递增的假 handle，并统计创建次数
    fn counting_create(counter: &mut u64) -> impl FnOnce(&FramebufferCacheKey) -> HalResult<vk::Framebuffer> + '_ {
        move |_| {
            *counter += 1;
            Ok(vk::Framebuffer::from_raw(*counter))
        }
    }

    #[test]
    fn equal_keys_share_one_framebuffer() {
        let mut cache = FramebufferCache::new();
        let mut created = 0;

        let first = cache.get_or_create(FramebufferCacheKey::new([color(1920, 1280)]), counting_create(&mut created));
        let second = cache.get_or_create(FramebufferCacheKey::new([color(1920, 1280)]), counting_create(&mut created));

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(created, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn any_field_change_misses() {
        let mut cache = FramebufferCache::new();
        let mut created = 0;
        let base = color(1920, 1280);
        let variants = [
            base,
            FramebufferAttachmentKey { width: 1280, ..base },
            FramebufferAttachmentKey { height: 720, ..base },
            FramebufferAttachmentKey { layer_count: 2, ..base },
            FramebufferAttachmentKey {
                format: vk::Format::R16G16B16A16_SFLOAT,
                ..base
            },
            FramebufferAttachmentKey {
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                ..base
            },
        ];

        let handles: Vec<_> = variants
            .iter()
            .map(|variant| {
                cache.get_or_create(FramebufferCacheKey::new([*variant]), counting_create(&mut created)).unwrap()
            })
            .collect();

        assert_eq!(created, variants.len() as u64);
        let unique: std::collections::HashSet<_> = handles.iter().collect();
        assert_eq!(unique.len(), handles.len());
    }

    #[test]
    fn attachment_order_is_part_of_the_key() {
        let mut cache = FramebufferCache::new();
        let mut created = 0;

        let a = cache
            .get_or_create(FramebufferCacheKey::new([color(800, 600), depth(800, 600)]), counting_create(&mut created))
            .unwrap();
        let b = cache
            .get_or_create(FramebufferCacheKey::new([depth(800, 600), color(800, 600)]), counting_create(&mut created))
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(created, 2);
    }

    #[test]
    fn failed_create_inserts_nothing() {
        let mut cache: FramebufferCache = FramebufferCache::new();
        let result = cache.get_or_create(FramebufferCacheKey::new([color(64, 64)]), |_| {
            Err(HalError::from_vk(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, "creating framebuffer"))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn extent_is_max_over_attachments() {
        let key = FramebufferCacheKey::new([
            color(1920, 1080),
            FramebufferAttachmentKey {
                layer_count: 6,
                ..depth(1024, 2048)
            },
        ]);
        assert_eq!(key.extent(), (1920, 2048, 6));
    }
}
