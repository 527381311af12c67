pub mod image_ring;
pub mod render_swapchain;
pub mod surface;
