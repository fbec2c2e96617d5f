use std::time::Duration;

use error::DeviceError;
use types::{PipelineStage, QueryKind, QueryReadback, QueueType};

pub mod command_buffer;
pub mod config;
pub mod context;
pub mod error;
mod interrupt;
pub mod payload;
pub mod pipeline;
pub mod query;
mod queue;
pub mod semaphore;
mod submission;
pub mod sync_point;
pub mod types;

/// One payload's share of a native submit call.
pub struct SubmitBatch<'a, B: Backend> {
    /// Semaphores to wait on, and the stage each wait applies at.
    pub waits: &'a [(&'a B::Semaphore, PipelineStage)],
    pub command_buffers: &'a [&'a B::CommandBuffer],
    /// Semaphores raised once every command buffer in the batch has executed.
    pub signals: &'a [&'a B::Semaphore],
}

/// The device interface the pipeline is written against.
///
/// Everything here is a thin wrapper over a native driver. The pipeline guarantees that
/// objects handed to `destroy_*` are no longer referenced by pending device work, and that
/// a command buffer is only recorded into by one thread at a time.
pub trait Backend: Send + Sync + Sized + 'static {
    type CommandBuffer: Send;
    type QueryPool: Send;
    type Semaphore: Send + Sync;
    /// Completion token returned by [`Backend::submit`]. Shared by every payload of a
    /// coalesced submit.
    type Token: Clone + Send + Sync + std::fmt::Debug;

    /// The hardware queues this device exposes.
    fn queue_types(&self) -> &[QueueType];

    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;

    unsafe fn create_command_buffer(
        &self,
        queue: QueueType,
    ) -> Result<Self::CommandBuffer, DeviceError>;

    unsafe fn begin_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError>;

    unsafe fn end_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError>;

    unsafe fn reset_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError>;

    unsafe fn destroy_command_buffer(&self, cb: Self::CommandBuffer);

    unsafe fn create_semaphore(&self) -> Result<Self::Semaphore, DeviceError>;

    unsafe fn destroy_semaphore(&self, semaphore: &mut Self::Semaphore);

    unsafe fn create_query_pool(
        &self,
        kind: QueryKind,
        count: u32,
    ) -> Result<Self::QueryPool, DeviceError>;

    unsafe fn destroy_query_pool(&self, pool: Self::QueryPool);

    unsafe fn cmd_reset_query_pool(
        &self,
        cb: &mut Self::CommandBuffer,
        pool: &Self::QueryPool,
        first: u32,
        count: u32,
    );

    unsafe fn cmd_begin_query(&self, cb: &mut Self::CommandBuffer, pool: &Self::QueryPool, index: u32);

    unsafe fn cmd_end_query(&self, cb: &mut Self::CommandBuffer, pool: &Self::QueryPool, index: u32);

    unsafe fn cmd_write_timestamp(
        &self,
        cb: &mut Self::CommandBuffer,
        pool: &Self::QueryPool,
        index: u32,
        stage: PipelineStage,
    );

    /// Blocking readback of `out.len()` slots starting at `first`.
    unsafe fn read_query_results(
        &self,
        pool: &Self::QueryPool,
        first: u32,
        out: &mut [QueryReadback],
    ) -> Result<(), DeviceError>;

    /// Issues one native submit covering every batch, in order. Either all batches are
    /// submitted or none are.
    unsafe fn submit(
        &self,
        queue: QueueType,
        batches: &[SubmitBatch<'_, Self>],
    ) -> Result<Self::Token, DeviceError>;

    /// Returns `true` once the work behind `token` has finished executing.
    fn poll(&self, queue: QueueType, token: &Self::Token) -> Result<bool, DeviceError>;

    /// Blocks until at least one of `tokens` is done or `timeout` elapses. Returns whether
    /// any token finished.
    fn wait_for_any(
        &self,
        tokens: &[(QueueType, &Self::Token)],
        timeout: Duration,
    ) -> Result<bool, DeviceError>;
}
