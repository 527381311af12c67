pub mod descriptor_layout;
pub mod pipeline_cache;
pub mod shader;
