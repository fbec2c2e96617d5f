use std::sync::Arc;

use log::warn;

use crate::{
    command_buffer::CommandBuffer,
    query::{Query, QueryPool},
    semaphore::Semaphore,
    sync_point::SyncPoint,
    types::{PipelineStage, QueueType},
    Backend,
};

/// How far construction of a payload has progressed. Phases only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PayloadPhase {
    Empty,
    HasWaits,
    HasCommands,
    HasSignals,
}

/// Timestamps bracketing a payload's work.
pub(crate) struct PayloadTiming {
    pub begin: Query,
    pub end: Query,
}

/// The atomic unit of scheduled work: waits, then command buffers, then signals.
///
/// Built by a [`Context`](crate::context::Context), moved to the submission engine on
/// enqueue, and destroyed by the completion engine once the device reports it done.
///
/// A payload dropped before that point destroys its command buffers and completes its
/// sync points.
pub struct Payload<B: Backend> {
    backend: Arc<B>,
    pub(crate) queue: QueueType,
    pub(crate) phase: PayloadPhase,
    pub(crate) waits: Vec<(Semaphore<B>, PipelineStage)>,
    pub(crate) command_buffers: Vec<CommandBuffer<B>>,
    pub(crate) signals: Vec<Semaphore<B>>,
    /// Pools resolved before any sync point of this payload completes.
    pub(crate) query_pools: Vec<QueryPool<B>>,
    pub(crate) sync_points: Vec<SyncPoint>,
    /// Assigned at submission.
    pub(crate) token: Option<B::Token>,
    pub(crate) end_frame: bool,
    pub(crate) timing: Option<PayloadTiming>,
}

impl<B: Backend> Payload<B> {
    pub(crate) fn new(backend: Arc<B>, queue: QueueType) -> Self {
        Self {
            backend,
            queue,
            phase: PayloadPhase::Empty,
            waits: Vec::default(),
            command_buffers: Vec::default(),
            signals: Vec::default(),
            query_pools: Vec::default(),
            sync_points: Vec::default(),
            token: None,
            end_frame: false,
            timing: None,
        }
    }

    /// An empty payload whose completion ages the query pool free lists.
    pub(crate) fn end_frame_marker(backend: Arc<B>, queue: QueueType) -> Self {
        let mut payload = Self::new(backend, queue);
        payload.end_frame = true;
        payload
    }

    /// An empty payload that completes `point` once all earlier work on `queue` is done.
    pub(crate) fn sync_marker(backend: Arc<B>, queue: QueueType, point: SyncPoint) -> Self {
        let mut payload = Self::new(backend, queue);
        payload.add_sync_point(point);
        payload
    }

    #[inline(always)]
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    #[inline(always)]
    pub fn phase(&self) -> PayloadPhase {
        self.phase
    }

    #[inline(always)]
    pub fn waits(&self) -> &[(Semaphore<B>, PipelineStage)] {
        &self.waits
    }

    #[inline(always)]
    pub fn command_buffers(&self) -> &[CommandBuffer<B>] {
        &self.command_buffers
    }

    #[inline(always)]
    pub fn signals(&self) -> &[Semaphore<B>] {
        &self.signals
    }

    #[inline(always)]
    pub fn sync_points(&self) -> &[SyncPoint] {
        &self.sync_points
    }

    #[inline(always)]
    pub fn query_pools(&self) -> &[QueryPool<B>] {
        &self.query_pools
    }

    #[inline(always)]
    pub fn token(&self) -> Option<&B::Token> {
        self.token.as_ref()
    }

    #[inline(always)]
    pub fn is_end_frame(&self) -> bool {
        self.end_frame
    }

    /// `true` when submitting this payload would accomplish nothing.
    pub(crate) fn is_empty(&self) -> bool {
        self.waits.is_empty()
            && self.command_buffers.is_empty()
            && self.signals.is_empty()
            && self.query_pools.is_empty()
            && self.sync_points.is_empty()
            && !self.end_frame
    }

    /// The last command buffer, if it is still open for recording.
    pub(crate) fn active_command_buffer(&mut self) -> Option<&mut CommandBuffer<B>> {
        self.command_buffers
            .last_mut()
            .filter(|cb| cb.is_recording())
    }

    pub(crate) fn add_wait(&mut self, semaphore: Semaphore<B>, stage: PipelineStage) {
        debug_assert!(
            self.phase <= PayloadPhase::HasWaits,
            "wait added to a payload that already has commands"
        );
        self.waits.push((semaphore, stage));
        self.phase = PayloadPhase::HasWaits;
    }

    pub(crate) fn push_command_buffer(&mut self, cb: CommandBuffer<B>) {
        debug_assert!(
            self.phase < PayloadPhase::HasSignals,
            "command buffer appended after signals"
        );
        self.command_buffers.push(cb);
        self.phase = PayloadPhase::HasCommands;
    }

    pub(crate) fn add_signal(&mut self, semaphore: Semaphore<B>) {
        self.signals.push(semaphore);
        self.phase = PayloadPhase::HasSignals;
    }

    pub(crate) fn add_sync_point(&mut self, point: SyncPoint) {
        self.sync_points.push(point);
        self.phase = PayloadPhase::HasSignals;
    }
}

impl<B: Backend> Drop for Payload<B> {
    fn drop(&mut self) {
        if self.command_buffers.is_empty() && self.sync_points.is_empty() {
            return;
        }
        warn!(
            "{:?} payload dropped before completing; releasing {} command buffers",
            self.queue,
            self.command_buffers.len()
        );
        for cb in self.command_buffers.drain(..) {
            unsafe { self.backend.destroy_command_buffer(cb.into_raw()) };
        }
        for point in self.sync_points.drain(..) {
            point.complete();
        }
    }
}
