//! A deterministic in-process device.
//!
//! Submissions either complete the moment they are submitted or wait until the test
//! driving the device completes them, in any order it likes. Recorded commands run when
//! their submission completes, which is what makes query results and the execution log
//! observable.

use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use api::{
    error::DeviceError,
    types::{PipelineStage, QueryKind, QueryReadback, QueueType},
    Backend, SubmitBatch,
};
use fxhash::{FxHashMap, FxHashSet};
use log::{debug, trace};

mod command;

pub use command::{Command, SimCommandBuffer};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionMode {
    /// Work completes as part of the submit call.
    Immediate,
    /// Work completes only when [`SimBackend::complete`] and friends are called.
    Manual,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SimToken(pub u64);

pub struct SimSemaphore {
    id: u64,
}

impl SimSemaphore {
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct SimQueryPool {
    id: u64,
    kind: QueryKind,
    count: u32,
}

impl SimQueryPool {
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    #[inline(always)]
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// One native submit as the device saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: QueueType,
    pub token: SimToken,
    /// Number of payloads coalesced into the submit.
    pub batches: usize,
    pub command_buffers: usize,
    pub waits: usize,
}

struct Submission {
    token: u64,
    queue: QueueType,
    commands: Vec<Command>,
    signals: Vec<u64>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Option<u64>>,
    /// Running sample counts of begun occlusion queries.
    active: FxHashMap<u32, u64>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_token: u64,
    in_flight: Vec<Submission>,
    completed: FxHashSet<u64>,
    pools: FxHashMap<u64, PoolState>,
    semaphore_signals: FxHashMap<u64, u64>,
    markers: Vec<u64>,
    submits: Vec<SubmitRecord>,
    clock: u64,
    lost: Option<String>,
    fail_next_submit: bool,
    fail_next_readback: bool,
    command_buffers_created: u64,
    live_command_buffers: usize,
    live_semaphores: usize,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        match &self.lost {
            Some(reason) => Err(DeviceError::Lost(reason.clone())),
            None => Ok(()),
        }
    }

    fn finish(&mut self, submission: Submission) {
        self.execute(&submission.commands);
        for id in submission.signals {
            *self.semaphore_signals.entry(id).or_default() += 1;
        }
        trace!(
            "completed submission {} on {:?}",
            submission.token,
            submission.queue
        );
        self.completed.insert(submission.token);
    }

    fn execute(&mut self, commands: &[Command]) {
        for command in commands {
            self.clock += 1;
            let clock = self.clock;
            match *command {
                Command::Marker(value) => self.markers.push(value),
                Command::Draw { samples } => {
                    self.clock += samples;
                    for pool in self.pools.values_mut() {
                        for count in pool.active.values_mut() {
                            *count += samples;
                        }
                    }
                }
                Command::ResetQueries { pool, first, count } => {
                    if let Some(pool) = self.pools.get_mut(&pool) {
                        let end = (first + count) as usize;
                        for slot in &mut pool.slots[first as usize..end] {
                            *slot = None;
                        }
                        pool.active.clear();
                    }
                }
                Command::BeginQuery { pool, index } => {
                    if let Some(pool) = self.pools.get_mut(&pool) {
                        pool.active.insert(index, 0);
                    }
                }
                Command::EndQuery { pool, index } => {
                    if let Some(pool) = self.pools.get_mut(&pool) {
                        if let Some(count) = pool.active.remove(&index) {
                            pool.slots[index as usize] = Some(count);
                        }
                    }
                }
                Command::WriteTimestamp { pool, index } => {
                    if let Some(pool) = self.pools.get_mut(&pool) {
                        pool.slots[index as usize] = Some(clock);
                    }
                }
                Command::WriteValue { pool, index, value } => {
                    if let Some(pool) = self.pools.get_mut(&pool) {
                        pool.slots[index as usize] = Some(value);
                    }
                }
            }
        }
    }
}

pub struct SimBackend {
    queues: Vec<QueueType>,
    mode: CompletionMode,
    timestamp_period: f32,
    state: Mutex<State>,
    completed: Condvar,
}

impl SimBackend {
    /// A device exposing every queue type.
    pub fn new(mode: CompletionMode) -> Self {
        Self::with_queues(mode, &QueueType::ALL)
    }

    pub fn with_queues(mode: CompletionMode, queues: &[QueueType]) -> Self {
        Self {
            queues: queues.to_vec(),
            mode,
            timestamp_period: 1.0,
            state: Mutex::new(State::default()),
            completed: Condvar::new(),
        }
    }

    pub fn with_timestamp_period(mut self, period: f32) -> Self {
        self.timestamp_period = period;
        self
    }

    #[inline(always)]
    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    /// Tokens submitted to `queue` that have not completed, oldest first.
    pub fn pending_tokens(&self, queue: QueueType) -> Vec<SimToken> {
        self.lock()
            .in_flight
            .iter()
            .filter(|submission| submission.queue == queue)
            .map(|submission| SimToken(submission.token))
            .collect()
    }

    /// Completes the submission behind `token`, regardless of what was submitted before
    /// it. Returns `false` if it was not in flight.
    pub fn complete(&self, token: SimToken) -> bool {
        let mut state = self.lock();
        let idx = match state.in_flight.iter().position(|s| s.token == token.0) {
            Some(idx) => idx,
            None => return false,
        };
        let submission = state.in_flight.remove(idx);
        state.finish(submission);
        drop(state);
        self.completed.notify_all();
        true
    }

    /// Completes the oldest in-flight submission on `queue`.
    pub fn complete_next(&self, queue: QueueType) -> Option<SimToken> {
        let token = self.pending_tokens(queue).first().copied()?;
        self.complete(token);
        Some(token)
    }

    /// Completes everything in flight in submission order. Returns how many completed.
    pub fn complete_all(&self) -> usize {
        let mut state = self.lock();
        let submissions = std::mem::take(&mut state.in_flight);
        let count = submissions.len();
        for submission in submissions {
            state.finish(submission);
        }
        drop(state);
        self.completed.notify_all();
        count
    }

    /// Every later device call fails with [`DeviceError::Lost`].
    pub fn lose_device(&self, reason: &str) {
        self.lock().lost = Some(reason.to_owned());
        self.completed.notify_all();
    }

    /// Makes the next submit lose the device instead of submitting.
    pub fn fail_next_submit(&self) {
        self.lock().fail_next_submit = true;
    }

    /// Makes the next query readback lose the device.
    pub fn fail_next_readback(&self) {
        self.lock().fail_next_readback = true;
    }

    /// Marker values in the order the device executed them.
    pub fn markers(&self) -> Vec<u64> {
        self.lock().markers.clone()
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.lock().submits.clone()
    }

    /// How many times `semaphore` has been signalled by completed work.
    pub fn signal_count(&self, semaphore: &SimSemaphore) -> u64 {
        self.lock()
            .semaphore_signals
            .get(&semaphore.id)
            .copied()
            .unwrap_or(0)
    }

    pub fn live_query_pools(&self) -> usize {
        self.lock().pools.len()
    }

    pub fn command_buffers_created(&self) -> u64 {
        self.lock().command_buffers_created
    }

    pub fn live_command_buffers(&self) -> usize {
        self.lock().live_command_buffers
    }

    pub fn live_semaphores(&self) -> usize {
        self.lock().live_semaphores
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Backend for SimBackend {
    type CommandBuffer = SimCommandBuffer;
    type QueryPool = SimQueryPool;
    type Semaphore = SimSemaphore;
    type Token = SimToken;

    fn queue_types(&self) -> &[QueueType] {
        &self.queues
    }

    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    unsafe fn create_command_buffer(
        &self,
        _queue: QueueType,
    ) -> Result<Self::CommandBuffer, DeviceError> {
        let mut state = self.lock();
        state.command_buffers_created += 1;
        state.live_command_buffers += 1;
        Ok(SimCommandBuffer {
            id: state.next_id(),
            commands: Vec::default(),
            recording: false,
        })
    }

    unsafe fn begin_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError> {
        cb.commands.clear();
        cb.recording = true;
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError> {
        cb.recording = false;
        Ok(())
    }

    unsafe fn reset_command_buffer(&self, cb: &mut Self::CommandBuffer) -> Result<(), DeviceError> {
        cb.commands.clear();
        cb.recording = false;
        Ok(())
    }

    unsafe fn destroy_command_buffer(&self, _cb: Self::CommandBuffer) {
        self.lock().live_command_buffers -= 1;
    }

    unsafe fn create_semaphore(&self) -> Result<Self::Semaphore, DeviceError> {
        let mut state = self.lock();
        state.live_semaphores += 1;
        Ok(SimSemaphore {
            id: state.next_id(),
        })
    }

    unsafe fn destroy_semaphore(&self, _semaphore: &mut Self::Semaphore) {
        self.lock().live_semaphores -= 1;
    }

    unsafe fn create_query_pool(
        &self,
        kind: QueryKind,
        count: u32,
    ) -> Result<Self::QueryPool, DeviceError> {
        let mut state = self.lock();
        let id = state.next_id();
        state.pools.insert(
            id,
            PoolState {
                slots: vec![None; count as usize],
                active: FxHashMap::default(),
            },
        );
        Ok(SimQueryPool { id, kind, count })
    }

    unsafe fn destroy_query_pool(&self, pool: Self::QueryPool) {
        self.lock().pools.remove(&pool.id);
    }

    unsafe fn cmd_reset_query_pool(
        &self,
        cb: &mut Self::CommandBuffer,
        pool: &Self::QueryPool,
        first: u32,
        count: u32,
    ) {
        cb.record(Command::ResetQueries {
            pool: pool.id,
            first,
            count,
        });
    }

    unsafe fn cmd_begin_query(&self, cb: &mut Self::CommandBuffer, pool: &Self::QueryPool, index: u32) {
        cb.record(Command::BeginQuery {
            pool: pool.id,
            index,
        });
    }

    unsafe fn cmd_end_query(&self, cb: &mut Self::CommandBuffer, pool: &Self::QueryPool, index: u32) {
        cb.record(Command::EndQuery {
            pool: pool.id,
            index,
        });
    }

    unsafe fn cmd_write_timestamp(
        &self,
        cb: &mut Self::CommandBuffer,
        pool: &Self::QueryPool,
        index: u32,
        _stage: PipelineStage,
    ) {
        cb.record(Command::WriteTimestamp {
            pool: pool.id,
            index,
        });
    }

    unsafe fn read_query_results(
        &self,
        pool: &Self::QueryPool,
        first: u32,
        out: &mut [QueryReadback],
    ) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.check_lost()?;
        if std::mem::take(&mut state.fail_next_readback) {
            state.lost = Some(String::from("injected readback failure"));
            drop(state);
            self.completed.notify_all();
            return Err(DeviceError::Lost(String::from("injected readback failure")));
        }
        let slots = match state.pools.get(&pool.id) {
            Some(pool) => &pool.slots,
            None => {
                return Err(DeviceError::Other(format!(
                    "query pool {} does not exist",
                    pool.id
                )))
            }
        };

        let first = first as usize;
        if first + out.len() > slots.len() {
            return Err(DeviceError::Other(String::from(
                "query readback out of range",
            )));
        }
        for (readback, slot) in out.iter_mut().zip(&slots[first..]) {
            *readback = match slot {
                Some(value) => QueryReadback {
                    value: *value,
                    available: true,
                },
                None => QueryReadback::default(),
            };
        }
        Ok(())
    }

    unsafe fn submit(
        &self,
        queue: QueueType,
        batches: &[SubmitBatch<'_, Self>],
    ) -> Result<Self::Token, DeviceError> {
        let mut state = self.lock();
        state.check_lost()?;
        if std::mem::take(&mut state.fail_next_submit) {
            state.lost = Some(String::from("injected submit failure"));
            drop(state);
            self.completed.notify_all();
            return Err(DeviceError::Lost(String::from("injected submit failure")));
        }

        state.next_token += 1;
        let token = state.next_token;
        let submission = Submission {
            token,
            queue,
            commands: batches
                .iter()
                .flat_map(|batch| batch.command_buffers.iter())
                .flat_map(|cb| cb.commands.iter().copied())
                .collect(),
            signals: batches
                .iter()
                .flat_map(|batch| batch.signals.iter().map(|semaphore| semaphore.id))
                .collect(),
        };
        state.submits.push(SubmitRecord {
            queue,
            token: SimToken(token),
            batches: batches.len(),
            command_buffers: batches.iter().map(|batch| batch.command_buffers.len()).sum(),
            waits: batches.iter().map(|batch| batch.waits.len()).sum(),
        });
        debug!("submit {token} on {queue:?} with {} batches", batches.len());

        match self.mode {
            CompletionMode::Immediate => {
                state.finish(submission);
                drop(state);
                self.completed.notify_all();
            }
            CompletionMode::Manual => state.in_flight.push(submission),
        }
        Ok(SimToken(token))
    }

    fn poll(&self, _queue: QueueType, token: &Self::Token) -> Result<bool, DeviceError> {
        let state = self.lock();
        state.check_lost()?;
        Ok(state.completed.contains(&token.0))
    }

    fn wait_for_any(
        &self,
        tokens: &[(QueueType, &Self::Token)],
        timeout: Duration,
    ) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            state.check_lost()?;
            if tokens
                .iter()
                .any(|(_, token)| state.completed.contains(&token.0))
            {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = match self.completed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}
