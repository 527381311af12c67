//! 检查当前机器上 HAL 能否正常工作
//!
//! 用法：`hal-probe [config.toml]`
//!
//! 列出所有 adapter，创建 device context，在每个 queue 上跑一次 fence 往返，
//! 推进一整圈 allocator 的 frame index，最后打开并 flush pipeline cache。

use anyhow::{Context, Result};
use truvis_crate_tools::init_log::init_log;
use truvis_hal::{
    commands::capability::QueueCapability, config::HalConfig, foundation::device_context::DeviceContext,
};

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => HalConfig::load(&path).with_context(|| format!("loading config {}", path))?,
        None => HalConfig::default(),
    };
    init_log(&config.log_level)?;

    for adapter in DeviceContext::enumerate_adapters(&config)? {
        log::info!(
            "gpu[{}]: {} ({:?}, api {}.{}.{})",
            adapter.index,
            adapter.name,
            adapter.device_type,
            ash::vk::api_version_major(adapter.api_version),
            ash::vk::api_version_minor(adapter.api_version),
            ash::vk::api_version_patch(adapter.api_version),
        );
    }

    let context = DeviceContext::new(&config, None)?;
    let fence = context.create_fence(0, "probe-fence")?;

    for queue in context.queues() {
        let value = queue.signal(&fence, None)?;
        fence.wait(value)?;
        log::info!("{} queue: fence reached {}", queue.capability(), fence.completed_value()?);
    }

    // 跨 queue：compute 等待 graphics 的值之后再 signal
    if let (Ok(graphics), Ok(compute)) =
        (context.queue(QueueCapability::Graphics), context.queue(QueueCapability::Compute))
    {
        let produced = graphics.signal(&fence, None)?;
        compute.wait(&fence, Some(produced))?;
        let consumed = compute.signal(&fence, None)?;
        fence.wait(consumed)?;
        log::info!("graphics -> compute handoff: {} -> {}", produced, consumed);
    }

    let mut allocator = context.create_memory_allocator()?;
    for frame_id in 1..=u64::from(context.frames_in_flight()) {
        let index = allocator.next_frame(frame_id)?;
        log::info!("frame {} -> allocator frame index {}", frame_id, index);
    }

    let pipeline_cache = context.create_pipeline_cache(config.pipeline_cache_path.as_deref())?;
    pipeline_cache.flush()?;

    context.wait_idle()?;
    log::info!("probe finished");
    Ok(())
}
