use ash::vk;

/// A primary command buffer with its own pool, so it can be reset without touching any
/// other buffer.
pub struct VkCommandBuffer {
    pub(crate) pool: vk::CommandPool,
    pub(crate) buffer: vk::CommandBuffer,
}

impl VkCommandBuffer {
    /// Native handle for recording commands the pipeline does not wrap.
    #[inline(always)]
    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }
}

pub struct VkSemaphore {
    pub(crate) raw: vk::Semaphore,
}

impl VkSemaphore {
    #[inline(always)]
    pub fn raw(&self) -> vk::Semaphore {
        self.raw
    }
}

pub struct VkQueryPool {
    pub(crate) raw: vk::QueryPool,
}

/// Timeline value a submit signals on its queue's timeline semaphore.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VkToken {
    pub value: u64,
}
