pub mod framebuffer_cache;
#[allow(clippy::module_inception)]
pub mod render_pass;
