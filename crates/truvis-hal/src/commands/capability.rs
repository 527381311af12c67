use ash::vk;

/// queue 的能力等级，严格包含：Transfer ⊂ Compute ⊂ Graphics
///
/// Graphics 的 command list 可以用在任何接受 Compute 的地方，
/// Compute 的可以用在任何接受 Transfer 的地方。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueCapability {
    Transfer,
    Compute,
    Graphics,
}

impl QueueCapability {
    pub const ALL: [QueueCapability; 3] = [Self::Graphics, Self::Compute, Self::Transfer];

    /// 当前等级是否可以执行需要 `required` 等级的操作
    #[inline]
    pub fn supports(self, required: QueueCapability) -> bool {
        required <= self
    }

    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Transfer => "transfer",
            Self::Compute => "compute",
            Self::Graphics => "graphics",
        }
    }

    /// pipeline 绑定点需要的等级
    #[inline]
    pub fn for_bind_point(bind_point: vk::PipelineBindPoint) -> Self {
        match bind_point {
            vk::PipelineBindPoint::COMPUTE => Self::Compute,
            _ => Self::Graphics,
        }
    }
}

impl std::fmt::Display for QueueCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
