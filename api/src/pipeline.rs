use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::Backoff;
use log::{debug, error, info, warn};

use crate::{
    config::PipelineConfig,
    context::Context,
    error::{DeviceError, PipelineError},
    interrupt::{self, Interrupt},
    payload::Payload,
    query::QueryPoolManager,
    queue::{lock, HardwareQueue},
    semaphore::Semaphore,
    submission::{self, Submitter},
    sync_point::SyncPoint,
    types::QueueType,
    Backend,
};

const RUNNING: u8 = 0;
const SHUT_DOWN: u8 = 1;
const LOST: u8 = 2;

/// Measured device execution time of one payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GpuTiming {
    pub queue: QueueType,
    pub duration: Duration,
}

/// Auto-reset wakeup shared between a worker and the threads feeding it.
pub(crate) struct Wake {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Wake {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self { tx, rx }
    }

    pub fn signal(&self) {
        // A full channel already holds a pending wakeup.
        let _ = self.tx.try_send(());
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

/// State shared by the pipeline handle, its workers and every context.
pub(crate) struct Shared<B: Backend> {
    pub backend: Arc<B>,
    pub config: PipelineConfig,
    queues: Vec<HardwareQueue<B>>,
    queue_lookup: [Option<usize>; 3],
    pub query_pools: QueryPoolManager<B>,
    pub submitter: Submitter<B>,
    pub interrupt: Interrupt,
    state: AtomicU8,
    /// Set once shutdown begins. New work is rejected from then on.
    closing: AtomicBool,
    /// Held shared across the running check and the send of every enqueue. Shutdown
    /// takes it exclusively before draining.
    enqueue_gate: RwLock<()>,
    stop_workers: AtomicBool,
    pub interrupt_worker_active: AtomicBool,
    timings: Mutex<Vec<GpuTiming>>,
}

impl<B: Backend> Shared<B> {
    fn new(backend: Arc<B>, config: PipelineConfig) -> Self {
        let mut queues = Vec::default();
        let mut queue_lookup = [None; 3];
        for &ty in backend.queue_types() {
            if queue_lookup[ty.index()].is_none() {
                queue_lookup[ty.index()] = Some(queues.len());
                queues.push(HardwareQueue::new(ty));
            }
        }

        Self {
            query_pools: QueryPoolManager::new(backend.clone(), &config),
            backend,
            config,
            queues,
            queue_lookup,
            submitter: Submitter::new(),
            interrupt: Interrupt::new(),
            state: AtomicU8::new(RUNNING),
            closing: AtomicBool::new(false),
            enqueue_gate: RwLock::new(()),
            stop_workers: AtomicBool::new(false),
            interrupt_worker_active: AtomicBool::new(false),
            timings: Mutex::new(Vec::default()),
        }
    }

    #[inline(always)]
    pub fn queues(&self) -> &[HardwareQueue<B>] {
        &self.queues
    }

    pub fn queue(&self, ty: QueueType) -> Result<&HardwareQueue<B>, PipelineError> {
        self.queue_lookup[ty.index()]
            .map(|idx| &self.queues[idx])
            .ok_or(PipelineError::UnsupportedQueue(ty))
    }

    #[inline(always)]
    pub fn is_lost(&self) -> bool {
        self.state.load(Ordering::Acquire) == LOST
    }

    /// Fails once the device is lost or shutdown has begun.
    pub fn check_running(&self) -> Result<(), PipelineError> {
        if self.is_lost() {
            return Err(PipelineError::DeviceLost);
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(PipelineError::ShutDown);
        }
        Ok(())
    }

    #[inline(always)]
    pub fn workers_stopping(&self) -> bool {
        self.stop_workers.load(Ordering::Acquire) || self.is_lost()
    }

    /// Latches the lost state. Only the first caller sees the device error itself.
    pub fn mark_lost(&self, err: DeviceError) -> PipelineError {
        if self.state.swap(LOST, Ordering::AcqRel) == LOST {
            return PipelineError::DeviceLost;
        }
        error!("device failure, the pipeline will make no further progress: {err}");
        self.submitter.wake.signal();
        self.interrupt.wake.signal();
        PipelineError::Device(err)
    }

    pub fn push_timing(&self, timing: GpuTiming) {
        lock(&self.timings).push(timing);
    }

    /// Hands `payloads` to the submission engine. Submits inline when no submission
    /// worker is configured. Rejected payloads are dropped, which completes their sync
    /// points.
    pub fn enqueue(&self, payloads: Vec<Payload<B>>) -> Result<(), PipelineError> {
        if payloads.is_empty() {
            return self.check_running();
        }

        let admitted = {
            let _gate = match self.enqueue_gate.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let admitted = self.check_running().and_then(|()| {
                payloads
                    .iter()
                    .try_for_each(|payload| self.queue(payload.queue).map(|_| ()))
            });
            if admitted.is_ok() {
                self.submitter.enqueue(payloads);
            }
            admitted
        };
        // Rejected payloads drop on return, after the gate is released.
        admitted?;

        if !self.config.submission_thread {
            loop {
                match submission::process_once(self) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => return Err(self.mark_lost(err)),
                }
            }
        }
        Ok(())
    }

    pub fn block_until(&self, point: &SyncPoint) -> Result<(), PipelineError> {
        let timeout = self.config.wait_timeout;
        let backoff = Backoff::new();
        loop {
            if point.wait(Some(Duration::ZERO)) {
                return Ok(());
            }
            if self.is_lost() {
                return Err(PipelineError::DeviceLost);
            }
            if self.state.load(Ordering::Acquire) == SHUT_DOWN {
                return Err(PipelineError::ShutDown);
            }

            if self.interrupt_worker_active.load(Ordering::Acquire) {
                point.wait(Some(timeout));
                continue;
            }

            // Only one thread pumps completions at a time. The rest back off and retry.
            match interrupt::try_process_once(self) {
                Some(Ok(true)) => backoff.reset(),
                Some(Ok(false)) => {
                    if let Err(err) = interrupt::wait_for_any(self, timeout) {
                        return Err(self.mark_lost(err));
                    }
                }
                Some(Err(err)) => return Err(self.mark_lost(err)),
                None if backoff.is_completed() => thread::sleep(Duration::from_millis(1)),
                None => backoff.snooze(),
            }
        }
    }
}

impl<B: Backend> Drop for Shared<B> {
    fn drop(&mut self) {
        for queue in &self.queues {
            queue.destroy_command_buffers(&self.backend);
        }
    }
}

/// Owns the hardware queues, the query pool manager and the two worker threads.
pub struct Pipeline<B: Backend> {
    shared: Arc<Shared<B>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Backend> Pipeline<B> {
    pub fn new(backend: B, config: PipelineConfig) -> Result<Self, PipelineError> {
        let shared = Arc::new(Shared::new(Arc::new(backend), config));
        let pipeline = Self {
            shared,
            workers: Mutex::new(Vec::default()),
        };

        let mut workers = Vec::default();
        if pipeline.shared.config.submission_thread {
            let shared = pipeline.shared.clone();
            workers.push(
                thread::Builder::new()
                    .name("gpu-pipe-submit".into())
                    .spawn(move || submission::run_worker(shared))?,
            );
        }
        if pipeline.shared.config.interrupt_thread {
            pipeline
                .shared
                .interrupt_worker_active
                .store(true, Ordering::Release);
            let shared = pipeline.shared.clone();
            let spawned = thread::Builder::new()
                .name("gpu-pipe-interrupt".into())
                .spawn(move || interrupt::run_worker(shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    pipeline
                        .shared
                        .interrupt_worker_active
                        .store(false, Ordering::Release);
                    *lock(&pipeline.workers) = workers;
                    return Err(err.into());
                }
            }
        }
        *lock(&pipeline.workers) = workers;

        info!(
            "pipeline started with {} queues (submission thread: {}, interrupt thread: {})",
            pipeline.shared.queues.len(),
            pipeline.shared.config.submission_thread,
            pipeline.shared.config.interrupt_thread,
        );
        Ok(pipeline)
    }

    #[inline(always)]
    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    #[inline(always)]
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    #[inline(always)]
    pub fn query_pools(&self) -> &QueryPoolManager<B> {
        &self.shared.query_pools
    }

    pub fn queue_types(&self) -> Vec<QueueType> {
        self.shared.queues.iter().map(|queue| queue.ty()).collect()
    }

    /// Opens a producer context recording for `queue`.
    pub fn context(&self, queue: QueueType) -> Result<Context<B>, PipelineError> {
        self.shared.check_running()?;
        self.shared.queue(queue)?;
        Ok(Context::new(self.shared.clone(), queue))
    }

    pub fn create_semaphore(&self) -> Result<Semaphore<B>, PipelineError> {
        Ok(Semaphore::new(self.shared.backend.clone())?)
    }

    /// Hands finalized payloads to the submission engine. Payloads keep their relative
    /// order per queue.
    pub fn enqueue(&self, payloads: Vec<Payload<B>>) -> Result<(), PipelineError> {
        self.shared.enqueue(payloads)
    }

    /// Blocks until `point` has completed and every continuation on it has run.
    ///
    /// Without an interrupt worker the calling thread pumps completions itself.
    pub fn block_until(&self, point: &SyncPoint) -> Result<(), PipelineError> {
        self.shared.block_until(point)
    }

    /// Runs one pass of the submission engine on the calling thread.
    pub fn process_submissions(&self) -> Result<bool, PipelineError> {
        if self.shared.is_lost() {
            return Err(PipelineError::DeviceLost);
        }
        submission::process_once(&self.shared).map_err(|err| self.shared.mark_lost(err))
    }

    /// Runs one pass of the completion engine on the calling thread.
    pub fn process_completions(&self) -> Result<bool, PipelineError> {
        if self.shared.is_lost() {
            return Err(PipelineError::DeviceLost);
        }
        interrupt::process_once(&self.shared).map_err(|err| self.shared.mark_lost(err))
    }

    /// Waits up to `timeout` for the oldest in-flight payload of any queue to finish.
    pub fn wait_for_any(&self, timeout: Duration) -> Result<bool, PipelineError> {
        if self.shared.is_lost() {
            return Err(PipelineError::DeviceLost);
        }
        interrupt::wait_for_any(&self.shared, timeout).map_err(|err| self.shared.mark_lost(err))
    }

    /// Marks the end of a frame. Once all prior main-queue work completes, idle query
    /// pools age by one frame.
    pub fn end_frame(&self) -> Result<(), PipelineError> {
        let queue = self.primary_queue()?;
        let marker = Payload::end_frame_marker(self.shared.backend.clone(), queue);
        self.shared.enqueue(vec![marker])?;
        if !self.shared.interrupt_worker_active.load(Ordering::Acquire) {
            if let Some(Err(err)) = interrupt::try_process_once(&self.shared) {
                return Err(self.shared.mark_lost(err));
            }
        }
        Ok(())
    }

    /// Runs `task` once all work enqueued so far on every queue has completed. The
    /// returned sync point completes after the task has run.
    pub fn enqueue_end_of_pipe(
        &self,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<SyncPoint, PipelineError> {
        self.shared.check_running()?;
        let done = SyncPoint::new(Some("end-of-pipe"));
        let remaining = Arc::new(AtomicUsize::new(self.shared.queues.len()));
        let task = Arc::new(Mutex::new(Some(Box::new(task) as Box<dyn FnOnce() + Send>)));

        let mut payloads = Vec::with_capacity(self.shared.queues.len());
        for queue in &self.shared.queues {
            let point = SyncPoint::new(Some("end-of-pipe queue"));
            let remaining = remaining.clone();
            let task = task.clone();
            let done = done.clone();
            point.add_continuation(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(task) = lock(&task).take() {
                        task();
                    }
                    done.complete();
                }
            });
            let backend = self.shared.backend.clone();
            payloads.push(Payload::sync_marker(backend, queue.ty(), point));
        }

        self.shared.enqueue(payloads)?;
        Ok(done)
    }

    /// Drains the payload timings measured since the last call.
    pub fn take_gpu_timings(&self) -> Vec<GpuTiming> {
        std::mem::take(&mut *lock(&self.shared.timings))
    }

    /// Reset command buffers waiting for reuse on `queue`.
    pub fn free_command_buffers(&self, queue: QueueType) -> usize {
        self.shared
            .queue(queue)
            .map_or(0, |queue| queue.free_command_buffer_count())
    }

    #[inline(always)]
    pub fn is_device_lost(&self) -> bool {
        self.shared.is_lost()
    }

    /// Stops the workers, submits everything still pending and waits for all in-flight
    /// work to complete. Safe to call more than once.
    ///
    /// After a device loss nothing more can complete on the device, so pending payloads
    /// are dropped and their sync points are completed to release any waiters.
    pub fn shutdown(&self) -> Result<(), PipelineError> {
        let shared = &self.shared;
        if shared.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("shutting down pipeline");

        // Waits out enqueues that passed the running check before `closing` was set.
        drop(match shared.enqueue_gate.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        });

        shared.stop_workers.store(true, Ordering::Release);
        shared.submitter.wake.signal();
        shared.interrupt.wake.signal();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if handle.join().is_err() {
                error!("pipeline worker panicked");
            }
        }
        shared.interrupt_worker_active.store(false, Ordering::Release);

        let result = if shared.is_lost() {
            Err(PipelineError::DeviceLost)
        } else {
            drain(shared).map_err(|err| shared.mark_lost(err))
        };
        if shared.is_lost() {
            abandon_all(shared);
        }

        for queue in &shared.queues {
            queue.destroy_command_buffers(&shared.backend);
        }
        shared.query_pools.drain();
        if !shared.is_lost() {
            shared.state.store(SHUT_DOWN, Ordering::Release);
        }
        info!("pipeline shut down");
        result
    }

    /// Queue used for frame markers.
    fn primary_queue(&self) -> Result<QueueType, PipelineError> {
        if self.shared.queue(QueueType::Main).is_ok() {
            return Ok(QueueType::Main);
        }
        self.shared
            .queues
            .first()
            .map(|queue| queue.ty())
            .ok_or(PipelineError::UnsupportedQueue(QueueType::Main))
    }
}

impl<B: Backend> Drop for Pipeline<B> {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!("pipeline shutdown reported an error: {err}");
        }
    }
}

/// Submits everything pending and waits for every queue to go idle.
fn drain<B: Backend>(shared: &Shared<B>) -> Result<(), DeviceError> {
    while submission::process_once(shared)? {}
    while shared.queues.iter().any(|queue| !queue.is_idle()) {
        if !interrupt::process_once(shared)? {
            interrupt::wait_for_any(shared, shared.config.wait_timeout)?;
        }
    }
    debug!("pipeline drained");
    Ok(())
}

/// Drops all unfinished work after a device loss, releasing its resources without
/// touching the device queues.
fn abandon_all<B: Backend>(shared: &Shared<B>) {
    for batch in shared.submitter.take_queued() {
        for payload in batch {
            interrupt::abandon(shared, payload);
        }
    }
    for queue in &shared.queues {
        let payloads = queue
            .take_all_pending()
            .into_iter()
            .chain(queue.take_in_flight());
        for payload in payloads {
            interrupt::abandon(shared, payload);
        }
    }
}
