use std::{
    ffi::{CStr, CString},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use ash::vk;

use crate::{
    error::{HalError, HalResult, VkResultExt},
    foundation::{debug_messenger::DebugType, device::GfxDevice},
};

/// shader module 的唯一标识，pipeline cache 的 key 以此区分 shader
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderModuleId(u64);

impl ShaderModuleId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// shader 反射得到的一个资源绑定
///
/// `count == 0` 表示数量不定的数组（bindless）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderResourceBinding {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// 外部 shader 编译器给出的反射结果
#[derive(Clone, Debug, Default)]
pub struct ShaderReflection {
    pub stage: vk::ShaderStageFlags,
    pub bindings: Vec<ShaderResourceBinding>,
    /// 0 表示没有 push constant
    pub push_constant_size: u32,
}

/// 已经编译好的 SPIR-V，以及它的反射信息
pub struct ShaderModule {
    handle: vk::ShaderModule,
    id: ShaderModuleId,
    entry_point: CString,
    reflection: ShaderReflection,

    name: String,
    device: Rc<GfxDevice>,
}

impl ShaderModule {
    pub fn new(
        device: Rc<GfxDevice>,
        code: &[u32],
        entry_point: &str,
        reflection: ShaderReflection,
        debug_name: &str,
    ) -> HalResult<Self> {
        let entry_point = CString::new(entry_point).map_err(|e| HalError::InvalidShaderCode {
            name: debug_name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let shader_module_ci = vk::ShaderModuleCreateInfo::default().code(code);
        let handle = unsafe { device.create_shader_module(&shader_module_ci, None) }
            .with_vk_context(|| format!("creating shader module `{}`", debug_name))?;

        let shader_module = Self {
            handle,
            id: ShaderModuleId::next(),
            entry_point,
            reflection,
            name: debug_name.to_string(),
            device,
        };
        shader_module.device.set_debug_name(&shader_module, debug_name);
        Ok(shader_module)
    }

    /// # param
    /// * bytes - spv 文件的内容，需要是 4 字节对齐的长度
    pub fn from_spv_bytes(
        device: Rc<GfxDevice>,
        bytes: &[u8],
        entry_point: &str,
        reflection: ShaderReflection,
        debug_name: &str,
    ) -> HalResult<Self> {
        let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes)).map_err(|source| {
            HalError::InvalidShaderCode {
                name: debug_name.to_string(),
                source,
            }
        })?;
        Self::new(device, &code, entry_point, reflection, debug_name)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.handle, None);
        }
    }
}

// getters
impl ShaderModule {
    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    #[inline]
    pub fn id(&self) -> ShaderModuleId {
        self.id
    }

    #[inline]
    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.reflection.stage
    }

    #[inline]
    pub fn entry_point(&self) -> &CStr {
        &self.entry_point
    }

    #[inline]
    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl DebugType for ShaderModule {
    fn debug_type_name() -> &'static str {
        "GfxShaderModule"
    }

    fn vk_handle(&self) -> impl vk::Handle {
        self.handle
    }
}
