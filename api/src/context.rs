use std::{collections::HashSet, sync::Arc};

use log::{error, warn};

use crate::{
    command_buffer::CommandBuffer,
    error::{PipelineError, QueryError},
    payload::{Payload, PayloadPhase, PayloadTiming},
    pipeline::Shared,
    query::{Query, QueryPool, QueryPoolManager},
    semaphore::Semaphore,
    sync_point::SyncPoint,
    types::{PipelineStage, QueryKind, QueueType},
    Backend,
};

/// Accumulates work for one hardware queue as an ordered list of payloads.
///
/// A context is used by a single thread. Each payload is built strictly as waits, then
/// commands, then signals. Asking for an earlier phase once a later one has begun opens
/// a fresh payload instead, so the recorded order is always preserved.
///
/// Dropping a context without [finalizing](Self::finalize) it discards its work.
pub struct Context<B: Backend> {
    shared: Arc<Shared<B>>,
    queue: QueueType,
    payloads: Vec<Payload<B>>,
    timestamps: Option<QueryPool<B>>,
    occlusion: Option<QueryPool<B>>,
    /// Occlusion query begun but not yet ended, with its slot.
    active_occlusion: Option<(Query, u32)>,
    /// Begin timestamp of the payload being recorded, when timing is enabled.
    timing_begin: Option<Query>,
    signalled: HashSet<u64>,
    next_serial: u64,
}

impl<B: Backend> Context<B> {
    pub(crate) fn new(shared: Arc<Shared<B>>, queue: QueueType) -> Self {
        Self {
            shared,
            queue,
            payloads: Vec::default(),
            timestamps: None,
            occlusion: None,
            active_occlusion: None,
            timing_begin: None,
            signalled: HashSet::default(),
            next_serial: 0,
        }
    }

    #[inline(always)]
    pub fn queue(&self) -> QueueType {
        self.queue
    }

    /// Payloads recorded so far, oldest first.
    #[inline(always)]
    pub fn payloads(&self) -> &[Payload<B>] {
        &self.payloads
    }

    /// Returns the command buffer currently open for recording, opening one if needed.
    ///
    /// A new payload is started when the current one already has signals.
    pub fn command_buffer(&mut self) -> Result<&mut CommandBuffer<B>, PipelineError> {
        self.shared.check_running()?;
        if self
            .payloads
            .last()
            .map_or(true, |payload| payload.phase == PayloadPhase::HasSignals)
        {
            self.begin_payload()?;
        }

        let idx = self.payloads.len() - 1;
        let has_active = self.payloads[idx]
            .command_buffers
            .last()
            .map_or(false, |cb| cb.is_recording());
        if !has_active {
            self.open_command_buffer()?;
        }

        let payload = &mut self.payloads[idx];
        let last = payload.command_buffers.len() - 1;
        Ok(&mut payload.command_buffers[last])
    }

    /// Closes the open command buffer. The next [`command_buffer`](Self::command_buffer)
    /// call opens a new one in the same payload.
    pub fn end_command_buffer(&mut self) -> Result<(), PipelineError> {
        self.close_active_occlusion();
        if let Some(cb) = self
            .payloads
            .last_mut()
            .and_then(|payload| payload.active_command_buffer())
        {
            cb.end(&self.shared.backend)?;
        }
        Ok(())
    }

    /// Makes the next commands wait on `semaphore` at `stage`.
    pub fn add_wait(
        &mut self,
        semaphore: &Semaphore<B>,
        stage: PipelineStage,
    ) -> Result<(), PipelineError> {
        if self
            .payloads
            .last()
            .map_or(true, |payload| payload.phase > PayloadPhase::HasWaits)
        {
            self.begin_payload()?;
        }
        self.current_payload().add_wait(semaphore.clone(), stage);
        Ok(())
    }

    /// Raises `semaphore` once everything recorded so far in the current payload has
    /// executed.
    pub fn add_signal(&mut self, semaphore: &Semaphore<B>) -> Result<(), PipelineError> {
        self.close_payload()?;
        self.current_payload().add_signal(semaphore.clone());
        Ok(())
    }

    /// Completes `point` once everything recorded so far in the current payload has
    /// executed. Signalling the same point twice from one context is a usage error and
    /// the second request is ignored.
    pub fn signal_sync_point(&mut self, point: &SyncPoint) -> Result<(), PipelineError> {
        if !self.signalled.insert(point.id()) {
            debug_assert!(false, "sync point {} signalled twice", point.id());
            error!("ignoring duplicate signal of {point:?}");
            return Ok(());
        }
        self.close_payload()?;
        self.current_payload().add_sync_point(point.clone());
        Ok(())
    }

    /// Records a timestamp write once all prior commands reach `stage`. The returned
    /// query resolves when the owning payload completes.
    pub fn write_timestamp(&mut self, stage: PipelineStage) -> Result<Query, PipelineError> {
        self.command_buffer()?;
        self.record_timestamp(stage)
    }

    /// Starts counting samples that pass depth and stencil testing. Only one occlusion
    /// query may be active at a time.
    pub fn begin_occlusion_query(&mut self) -> Result<Query, PipelineError> {
        if self.active_occlusion.is_some() {
            debug_assert!(false, "occlusion query begun while another is active");
            error!("occlusion query begun while another is active; ending the previous one");
            self.close_active_occlusion();
        }
        self.command_buffer()?;

        let query = Query::new(QueryKind::Occlusion);
        let Self {
            shared,
            payloads,
            occlusion,
            ..
        } = self;
        let payload = current(payloads);
        let slot = reserve(&shared.query_pools, occlusion, payload, &query)?;
        if let (Some(pool), Some(cb)) = (occlusion.as_ref(), payload.active_command_buffer()) {
            unsafe {
                shared
                    .backend
                    .cmd_begin_query(cb.internal_mut(), pool.internal(), slot)
            };
        }
        self.active_occlusion = Some((query.clone(), slot));
        Ok(query)
    }

    /// Stops counting for `query`, which must be the active occlusion query.
    pub fn end_occlusion_query(&mut self, query: &Query) -> Result<(), PipelineError> {
        let is_active = matches!(
            &self.active_occlusion,
            Some((active, _)) if active.ptr_eq(query)
        );
        if is_active {
            self.close_active_occlusion();
        } else {
            debug_assert!(false, "ended an occlusion query that is not active");
            error!("ignoring end of inactive occlusion query {query:?}");
        }
        Ok(())
    }

    /// Hands `pool` to the current payload. Its reserved slots are read back into their
    /// destinations once that payload completes, before any of its sync points fire.
    pub fn attach_query_pool(&mut self, pool: QueryPool<B>) {
        if self
            .payloads
            .last()
            .map_or(true, |payload| payload.phase == PayloadPhase::HasSignals)
        {
            self.payloads.push(Payload::new(self.shared.backend.clone(), self.queue));
        }
        self.current_payload().query_pools.push(pool);
    }

    /// Closes out recording and hands back the payloads, oldest first. A trailing empty
    /// payload is dropped.
    pub fn finalize(&mut self) -> Result<Vec<Payload<B>>, PipelineError> {
        self.close_payload()?;

        let mut payloads = std::mem::take(&mut self.payloads);
        // Closing retired every pool with reserved slots, so what is left is unused.
        for pool in [self.timestamps.take(), self.occlusion.take()]
            .into_iter()
            .flatten()
        {
            self.shared.query_pools.abandon(pool);
        }
        if payloads.last().map_or(false, |payload| payload.is_empty()) {
            payloads.pop();
        }
        self.signalled.clear();
        Ok(payloads)
    }

    /// Finalizes and enqueues everything recorded. The returned sync point completes
    /// once all of it has executed.
    pub fn submit(&mut self) -> Result<SyncPoint, PipelineError> {
        self.shared.check_running()?;
        let existing = self
            .payloads
            .last()
            .and_then(|payload| payload.sync_points.last())
            .cloned();
        let point = match existing {
            Some(point) => point,
            None => {
                let point = SyncPoint::new(None);
                self.signal_sync_point(&point)?;
                point
            }
        };

        let payloads = self.finalize()?;
        self.shared.enqueue(payloads)?;
        Ok(point)
    }

    fn current_payload(&mut self) -> &mut Payload<B> {
        if self.payloads.is_empty() {
            self.payloads.push(Payload::new(self.shared.backend.clone(), self.queue));
        }
        current(&mut self.payloads)
    }

    fn begin_payload(&mut self) -> Result<(), PipelineError> {
        self.close_payload()?;
        self.payloads.push(Payload::new(self.shared.backend.clone(), self.queue));
        Ok(())
    }

    /// Finishes command recording for the current payload. Ends any active occlusion
    /// query, writes the closing timing stamp, hands the open query pools to the payload
    /// and ends the open command buffer.
    fn close_payload(&mut self) -> Result<(), PipelineError> {
        if self.payloads.is_empty() {
            return Ok(());
        }
        self.close_active_occlusion();

        if let Some(begin) = self.timing_begin.take() {
            if current(&mut self.payloads).active_command_buffer().is_none() {
                self.open_command_buffer()?;
            }
            let end = self.record_timestamp(PipelineStage::BOTTOM_OF_PIPE)?;
            current(&mut self.payloads).timing = Some(PayloadTiming { begin, end });
        }

        // Slots written by this payload resolve when it completes, ahead of its signals.
        let payload = current(&mut self.payloads);
        for open in [&mut self.timestamps, &mut self.occlusion] {
            if open.as_ref().map_or(false, |pool| pool.reserved() > 0) {
                if let Some(pool) = open.take() {
                    payload.query_pools.push(pool);
                }
            }
        }

        if let Some(cb) = payload.active_command_buffer() {
            cb.end(&self.shared.backend)?;
        }
        Ok(())
    }

    fn open_command_buffer(&mut self) -> Result<(), PipelineError> {
        let backend: &B = &self.shared.backend;
        let raw = self
            .shared
            .queue(self.queue)?
            .acquire_command_buffer(backend)?;
        let cb = match CommandBuffer::begin(backend, raw, self.next_serial) {
            Ok(cb) => cb,
            Err((raw, err)) => {
                unsafe { backend.destroy_command_buffer(raw) };
                return Err(err.into());
            }
        };
        self.next_serial += 1;

        let payload = current(&mut self.payloads);
        let first = payload.command_buffers.is_empty();
        payload.push_command_buffer(cb);
        if first && self.shared.config.payload_timing {
            self.timing_begin = Some(self.record_timestamp(PipelineStage::TOP_OF_PIPE)?);
        }
        Ok(())
    }

    /// Writes a timestamp into the open command buffer of the current payload.
    fn record_timestamp(&mut self, stage: PipelineStage) -> Result<Query, PipelineError> {
        let query = Query::new(QueryKind::Timestamp);
        let Self {
            shared,
            payloads,
            timestamps,
            ..
        } = self;
        let payload = current(payloads);
        let slot = reserve(&shared.query_pools, timestamps, payload, &query)?;
        if let (Some(pool), Some(cb)) = (timestamps.as_ref(), payload.active_command_buffer()) {
            unsafe {
                shared
                    .backend
                    .cmd_write_timestamp(cb.internal_mut(), pool.internal(), slot, stage)
            };
        }
        Ok(query)
    }

    fn close_active_occlusion(&mut self) {
        let Some((_, slot)) = self.active_occlusion.take() else {
            return;
        };
        let cb = self
            .payloads
            .last_mut()
            .and_then(|payload| payload.active_command_buffer());
        match (self.occlusion.as_ref(), cb) {
            (Some(pool), Some(cb)) => unsafe {
                self.shared
                    .backend
                    .cmd_end_query(cb.internal_mut(), pool.internal(), slot)
            },
            _ => error!("occlusion query slot {slot} lost its command buffer before it ended"),
        }
    }

    /// Releases everything recorded without submitting it.
    fn discard(&mut self) {
        let shared = &self.shared;
        for pool in [self.timestamps.take(), self.occlusion.take()]
            .into_iter()
            .flatten()
        {
            shared.query_pools.abandon(pool);
        }

        let queue = shared.queue(self.queue).ok();
        for mut payload in self.payloads.drain(..) {
            for cb in payload.command_buffers.drain(..) {
                let raw = cb.into_raw();
                match queue {
                    Some(queue) => {
                        if let Err(err) = queue.recycle_command_buffer(&shared.backend, raw) {
                            warn!("failed to recycle discarded command buffer: {err}");
                        }
                    }
                    None => unsafe { shared.backend.destroy_command_buffer(raw) },
                }
            }
            for pool in payload.query_pools.drain(..) {
                shared.query_pools.abandon(pool);
            }
            for point in payload.sync_points.drain(..) {
                point.complete();
            }
        }
        self.active_occlusion = None;
        self.timing_begin = None;
        self.signalled.clear();
    }
}

impl<B: Backend> Drop for Context<B> {
    fn drop(&mut self) {
        if self.payloads.is_empty() && self.timestamps.is_none() && self.occlusion.is_none() {
            return;
        }
        warn!(
            "{:?} context dropped with {} unsubmitted payloads; discarding them",
            self.queue,
            self.payloads.len()
        );
        self.discard();
    }
}

#[inline(always)]
fn current<B: Backend>(payloads: &mut [Payload<B>]) -> &mut Payload<B> {
    let last = payloads.len() - 1;
    &mut payloads[last]
}

/// Reserves a slot for `query` in the open pool, retiring a full pool onto `payload`
/// and acquiring a replacement. New pools are reset on the payload's open command
/// buffer ahead of any use.
fn reserve<B: Backend>(
    manager: &QueryPoolManager<B>,
    open: &mut Option<QueryPool<B>>,
    payload: &mut Payload<B>,
    query: &Query,
) -> Result<u32, PipelineError> {
    if let Some(pool) = open.as_mut() {
        match pool.reserve_slot(query.clone()) {
            Ok(slot) => return Ok(slot),
            Err(QueryError::PoolFull { .. }) => {
                if let Some(full) = open.take() {
                    payload.query_pools.push(full);
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    let mut pool = manager.acquire(query.kind(), 1)?;
    match payload.active_command_buffer() {
        Some(cb) => manager.reset(&mut pool, cb),
        None => {
            manager.release(pool);
            return Err(PipelineError::Query(QueryError::NeedsReset));
        }
    }
    let slot = pool.reserve_slot(query.clone())?;
    *open = Some(pool);
    Ok(slot)
}
