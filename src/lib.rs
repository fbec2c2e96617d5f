#[cfg(not(any(feature = "vulkan", feature = "sim")))]
compile_error!("enable at least one backend feature: `vulkan` or `sim`");

pub use api;

#[cfg(feature = "sim")]
pub use sim;
#[cfg(feature = "vulkan")]
pub use vulkan;

#[cfg(feature = "vulkan")]
type Backend = vulkan::VulkanBackend;

#[cfg(all(feature = "sim", not(feature = "vulkan")))]
type Backend = sim::SimBackend;

pub mod prelude {
    pub use api::types::*;

    // Pipeline
    pub type Pipeline = api::pipeline::Pipeline<crate::Backend>;
    pub use api::config::PipelineConfig;
    pub use api::pipeline::GpuTiming;

    // Context & payloads
    pub type Context = api::context::Context<crate::Backend>;
    pub type Payload = api::payload::Payload<crate::Backend>;
    pub use api::payload::PayloadPhase;

    // Command buffer
    pub type CommandBuffer = api::command_buffer::CommandBuffer<crate::Backend>;
    pub use api::command_buffer::CommandBufferState;

    // Synchronization
    pub type Semaphore = api::semaphore::Semaphore<crate::Backend>;
    pub use api::sync_point::SyncPoint;

    // Queries
    pub type QueryPool = api::query::QueryPool<crate::Backend>;
    pub type QueryPoolManager = api::query::QueryPoolManager<crate::Backend>;
    pub use api::query::Query;

    // Errors
    pub use api::error::{DeviceError, PipelineError, QueryError};
}
