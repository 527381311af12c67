//! Truvis 的 Vulkan HAL 层
//!
//! 负责设备的创建、queue 之间基于 timeline semaphore 的同步、交换链的 acquire / present，
//! 以及 render pass、framebuffer、pipeline 这类派生对象的缓存。
//!
//! 所有的 vulkan 对象都持有 `Rc<GfxDevice>`，在 `Drop` 中销毁自己；
//! 因此 device 一定比从它创建的对象活得久。
//!
//! # 一帧的流程
//! 1. [`SwapChain::acquire_next_image`](swapchain::render_swapchain::SwapChain::acquire_next_image)
//!    得到图像以及图像可用时 fence 的值
//! 2. 录制 [`CommandList`](commands::command_list::CommandList)，
//!    使用缓存的 [`RenderPass`](render_pass::render_pass::RenderPass) 与
//!    [`Pipeline`](pipelines::pipeline_cache::Pipeline)
//! 3. 提交到 [`CommandQueue`](commands::command_queue::CommandQueue)，等待 acquire 的值并 signal 新的值
//! 4. [`SwapChain::present`](swapchain::render_swapchain::SwapChain::present)

pub mod commands;
pub mod config;
pub mod error;
pub mod foundation;
pub mod pipelines;
pub mod render_pass;
pub mod swapchain;
