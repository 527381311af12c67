//! 从各个 shader stage 的反射结果构建 descriptor table layout
//!
//! 同一个 (set, binding) 在多个 stage 中出现时，合并 stage 可见性，
//! 类型或数量不一致则直接报错。合并后按 set 分组，每个 set 一个 layout。

use std::{
    collections::{BTreeMap, btree_map::Entry},
    rc::Rc,
};

use ash::vk;

use crate::{
    error::{HalError, HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
    pipelines::shader::{ShaderReflection, ShaderResourceBinding},
};

/// 数量不定的 binding 在 layout 中声明的上限
pub const MAX_VARIABLE_DESCRIPTOR_COUNT: u32 = 1024;

/// 合并多个 stage 的 binding，结果按 (set, binding) 排序
pub fn merge_bindings<'a>(
    bindings: impl IntoIterator<Item = &'a ShaderResourceBinding>,
) -> HalResult<Vec<ShaderResourceBinding>> {
    let mut merged: BTreeMap<(u32, u32), ShaderResourceBinding> = BTreeMap::new();
    for binding in bindings {
        match merged.entry((binding.set, binding.binding)) {
            Entry::Vacant(entry) => {
                entry.insert(*binding);
            }
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if existing.descriptor_type != binding.descriptor_type || existing.count != binding.count {
                    return Err(HalError::DescriptorConflict {
                        set: binding.set,
                        binding: binding.binding,
                        first_type: existing.descriptor_type,
                        first_count: existing.count,
                        second_type: binding.descriptor_type,
                        second_count: binding.count,
                    });
                }
                existing.stages |= binding.stages;
            }
        }
    }
    Ok(merged.into_values().collect())
}

/// 合并所有 stage 的反射结果
pub fn merge_reflections<'a>(
    reflections: impl IntoIterator<Item = &'a ShaderReflection>,
) -> HalResult<Vec<ShaderResourceBinding>> {
    merge_bindings(reflections.into_iter().flat_map(|reflection| reflection.bindings.iter()))
}

/// 所有 stage 共用一个 push constant range，大小取最大值
pub fn merge_push_constants<'a>(
    reflections: impl IntoIterator<Item = &'a ShaderReflection>,
) -> Option<vk::PushConstantRange> {
    reflections
        .into_iter()
        .filter(|reflection| reflection.push_constant_size > 0)
        .fold(None, |range: Option<vk::PushConstantRange>, reflection| {
            let (size, stages) = range.map_or((0, vk::ShaderStageFlags::empty()), |r| (r.size, r.stage_flags));
            Some(
                vk::PushConstantRange::default()
                    .offset(0)
                    .size(size.max(reflection.push_constant_size))
                    .stage_flags(stages | reflection.stage),
            )
        })
}

/// 一个 set 的 layout 描述，binding 按序号升序
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTableLayoutDesc {
    pub set: u32,
    pub bindings: Vec<ShaderResourceBinding>,
}

impl DescriptorTableLayoutDesc {
    /// 将合并后的 binding 按 set 分组，`0..=max_set` 中没有 binding 的 set 得到空的 layout
    pub fn partition(merged: &[ShaderResourceBinding]) -> Vec<Self> {
        let Some(max_set) = merged.iter().map(|binding| binding.set).max() else {
            return Vec::new();
        };
        let mut grouped: BTreeMap<u32, Vec<ShaderResourceBinding>> = BTreeMap::new();
        for binding in merged {
            grouped.entry(binding.set).or_default().push(*binding);
        }
        (0..=max_set)
            .map(|set| {
                let mut bindings = grouped.remove(&set).unwrap_or_default();
                bindings.sort_by_key(|binding| binding.binding);
                Self { set, bindings }
            })
            .collect()
    }

    /// 是否存在数量不定的 binding
    #[inline]
    pub fn needs_descriptor_indexing(&self) -> bool {
        self.bindings.iter().any(|binding| binding.count == 0)
    }

    /// count == 0 的 binding 标记为 PARTIALLY_BOUND；
    /// 如果是 set 中的最后一个 binding，额外标记为 VARIABLE_DESCRIPTOR_COUNT
    pub fn vk_bindings(&self) -> (Vec<vk::DescriptorSetLayoutBinding<'static>>, Vec<vk::DescriptorBindingFlags>) {
        let last_binding = self.bindings.iter().map(|binding| binding.binding).max();
        self.bindings
            .iter()
            .map(|binding| {
                let unbounded = binding.count == 0;
                let mut flags = vk::DescriptorBindingFlags::empty();
                if unbounded {
                    flags |= vk::DescriptorBindingFlags::PARTIALLY_BOUND;
                    if Some(binding.binding) == last_binding {
                        flags |= vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;
                    }
                }
                let vk_binding = vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(if unbounded { MAX_VARIABLE_DESCRIPTOR_COUNT } else { binding.count })
                    .stage_flags(binding.stages);
                (vk_binding, flags)
            })
            .unzip()
    }
}

/// 描述符集布局
///
/// # destroy
/// drop 时销毁
pub struct DescriptorTableLayout {
    handle: vk::DescriptorSetLayout,
    desc: DescriptorTableLayoutDesc,
    device: Rc<GfxDevice>,
}

impl DescriptorTableLayout {
    pub fn new(device: Rc<GfxDevice>, desc: DescriptorTableLayoutDesc, debug_name: &str) -> HalResult<Self> {
        if desc.needs_descriptor_indexing() && !device.descriptor_indexing_enabled() {
            return Err(HalError::MissingFeature("descriptor indexing (variable descriptor count)"));
        }

        let (bindings, binding_flags) = desc.vk_bindings();
        let mut binding_flags_ci =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
        let create_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings).push_next(&mut binding_flags_ci);

        let handle = unsafe { device.create_descriptor_set_layout(&create_info, None) }
            .with_vk_context(|| format!("creating descriptor set layout `{}` (set {})", debug_name, desc.set))?;

        let layout = Self { handle, desc, device };
        layout.device.set_debug_name(&layout, format!("{}-set{}", debug_name, layout.desc.set));
        Ok(layout)
    }

    /// 合并后的 binding 构建 `0..=max_set` 的所有 layout
    pub fn build_all(
        device: &Rc<GfxDevice>,
        merged: &[ShaderResourceBinding],
        debug_name: &str,
    ) -> HalResult<Vec<Self>> {
        DescriptorTableLayoutDesc::partition(merged)
            .into_iter()
            .map(|desc| Self::new(device.clone(), desc, debug_name))
            .collect()
    }

    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    #[inline]
    pub fn desc(&self) -> &DescriptorTableLayoutDesc {
        &self.desc
    }
}

impl Drop for DescriptorTableLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}

impl DebugType for DescriptorTableLayout {
    fn debug_type_name() -> &'static str {
        "GfxDescriptorSetLayout"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn binding(
        set: u32,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> ShaderResourceBinding {
        ShaderResourceBinding {
            set,
            binding,
            descriptor_type,
            count,
            stages,
        }
    }

    #[test]
    fn shared_binding_unions_stages() {
        let vs = binding(0, 1, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX);
        let fs = binding(0, 1, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::FRAGMENT);

        let merged = merge_bindings([&vs, &fs]).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].stages, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);

        // 重复合并结果不变
        let again = merge_bindings(merged.iter().chain([&vs, &fs])).unwrap();
        assert_eq!(again, merged);
    }

    #[test]
    fn conflicting_type_or_count_fails() {
        let ubo = binding(0, 1, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX);
        let ssbo = binding(0, 1, vk::DescriptorType::STORAGE_BUFFER, 1, vk::ShaderStageFlags::FRAGMENT);
        let ubo_array = binding(0, 1, vk::DescriptorType::UNIFORM_BUFFER, 4, vk::ShaderStageFlags::FRAGMENT);

        let err = merge_bindings([&ubo, &ssbo]).unwrap_err();
        assert!(matches!(
            err,
            HalError::DescriptorConflict {
                set: 0,
                binding: 1,
                first_type: vk::DescriptorType::UNIFORM_BUFFER,
                second_type: vk::DescriptorType::STORAGE_BUFFER,
                ..
            }
        ));
        assert!(merge_bindings([&ubo, &ubo_array]).is_err());
    }

    #[test]
    fn partition_fills_missing_sets() {
        let merged = merge_bindings([
            &binding(2, 0, vk::DescriptorType::SAMPLER, 1, vk::ShaderStageFlags::FRAGMENT),
            &binding(0, 3, vk::DescriptorType::STORAGE_IMAGE, 1, vk::ShaderStageFlags::COMPUTE),
            &binding(0, 1, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::COMPUTE),
        ])
        .unwrap();

        let tables = DescriptorTableLayoutDesc::partition(&merged);
        assert_eq!(tables.len(), 3);
        assert_eq!(tables[0].bindings.iter().map(|b| b.binding).collect_vec(), vec![1, 3]);
        assert!(tables[1].bindings.is_empty());
        assert_eq!(tables[2].set, 2);
        assert!(DescriptorTableLayoutDesc::partition(&[]).is_empty());
    }

    #[test]
    fn unbounded_binding_is_flagged() {
        let desc = DescriptorTableLayoutDesc {
            set: 0,
            bindings: vec![
                binding(0, 0, vk::DescriptorType::SAMPLED_IMAGE, 0, vk::ShaderStageFlags::FRAGMENT),
                binding(0, 1, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::FRAGMENT),
                binding(0, 2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 0, vk::ShaderStageFlags::FRAGMENT),
            ],
        };
        assert!(desc.needs_descriptor_indexing());

        let (vk_bindings, flags) = desc.vk_bindings();
        assert_eq!(flags[0], vk::DescriptorBindingFlags::PARTIALLY_BOUND);
        assert_eq!(flags[1], vk::DescriptorBindingFlags::empty());
        assert_eq!(
            flags[2],
            vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
        );
        assert_eq!(vk_bindings[0].descriptor_count, MAX_VARIABLE_DESCRIPTOR_COUNT);
        assert_eq!(vk_bindings[1].descriptor_count, 1);
    }

    #[test]
    fn push_constant_range_covers_all_stages() {
        let vs = ShaderReflection {
            stage: vk::ShaderStageFlags::VERTEX,
            bindings: vec![],
            push_constant_size: 64,
        };
        let fs = ShaderReflection {
            stage: vk::ShaderStageFlags::FRAGMENT,
            bindings: vec![],
            push_constant_size: 16,
        };
        let none = ShaderReflection {
            stage: vk::ShaderStageFlags::GEOMETRY,
            ..Default::default()
        };

        let range = merge_push_constants([&vs, &fs, &none]).unwrap();
        assert_eq!(range.size, 64);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT);
        assert!(merge_push_constants([&none]).is_none());
    }
}
