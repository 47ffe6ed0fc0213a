//! Frame-indexed command submission and descriptor set caching on top of Vulkan.

pub mod renderer;

pub use renderer::Renderer;
pub use renderer::config::RenderConfig;
pub use renderer::contexts::device_ctx::command_encoder::CommandBuffer;
pub use renderer::contexts::device_ctx::queue::{Queue, QueueFamily, QueueMapping, QueueRole};
pub use renderer::contexts::device_ctx::submission::{QueueStats, SignalRequest, SubmitSignals};
pub use renderer::contexts::device_ctx::sync::{FenceHandle, SemaphoreHandle, WaitStatus};
pub use renderer::contexts::resource_ctx::binding_state::ResourceBinding;
pub use renderer::contexts::resource_ctx::descriptor_set_cache::{DescriptorCacheStats, FlushedSet};
pub use renderer::contexts::resource_ctx::program_layout::{ProgramLayout, ProgramStages, ShaderStageLayout};
pub use renderer::contexts::resource_ctx::resource_type::RenderResourceType;
pub use renderer::error::RenderError;
pub use renderer::hal::headless::HeadlessDevice;
pub use renderer::hal::vulkan::AshHal;
pub use renderer::hal::{HalCapabilities, RenderHal};
pub use renderer::internals::per_thread::WorkerToken;
