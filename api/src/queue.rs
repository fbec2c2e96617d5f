use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
};

use crate::{error::DeviceError, payload::Payload, types::QueueType, Backend};

/// One independent device execution lane.
pub(crate) struct HardwareQueue<B: Backend> {
    ty: QueueType,
    /// Enqueued but not yet submitted. Only the submission engine touches this.
    pending: Mutex<VecDeque<Payload<B>>>,
    /// Submitted but not yet confirmed, in strict submission order.
    in_flight: Mutex<VecDeque<Payload<B>>>,
    /// Mirrors `in_flight.len()` for lock-free emptiness checks.
    in_flight_len: AtomicUsize,
    /// Reset command buffers ready for reuse.
    free_command_buffers: Mutex<Vec<B::CommandBuffer>>,
}

impl<B: Backend> HardwareQueue<B> {
    pub fn new(ty: QueueType) -> Self {
        Self {
            ty,
            pending: Mutex::new(VecDeque::default()),
            in_flight: Mutex::new(VecDeque::default()),
            in_flight_len: AtomicUsize::new(0),
            free_command_buffers: Mutex::new(Vec::default()),
        }
    }

    #[inline(always)]
    pub fn ty(&self) -> QueueType {
        self.ty
    }

    pub fn push_pending(&self, payload: Payload<B>) {
        lock(&self.pending).push_back(payload);
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.pending).is_empty()
    }

    /// Removes up to `max` payloads from the front of the pending FIFO.
    pub fn take_pending(&self, max: usize) -> Vec<Payload<B>> {
        let mut pending = lock(&self.pending);
        let count = pending.len().min(max.max(1));
        pending.drain(..count).collect()
    }

    /// Puts payloads whose submit failed back at the front, in their original order.
    pub fn return_pending(&self, payloads: Vec<Payload<B>>) {
        let mut pending = lock(&self.pending);
        for payload in payloads.into_iter().rev() {
            pending.push_front(payload);
        }
    }

    pub fn push_in_flight(&self, payloads: Vec<Payload<B>>) {
        let mut in_flight = lock(&self.in_flight);
        in_flight.extend(payloads);
        self.in_flight_len.store(in_flight.len(), Ordering::Release);
    }

    /// Benign-race check; callers recheck under the lock before mutating.
    #[inline(always)]
    pub fn is_idle(&self) -> bool {
        self.in_flight_len.load(Ordering::Acquire) == 0
    }

    /// Token of the oldest unconfirmed payload.
    pub fn front_token(&self) -> Option<B::Token> {
        lock(&self.in_flight)
            .front()
            .and_then(|payload| payload.token.clone())
    }

    /// Pops the oldest unconfirmed payload if the device reports it done. Later payloads
    /// are never considered before it.
    pub fn pop_completed(&self, backend: &B) -> Result<Option<Payload<B>>, DeviceError> {
        let mut in_flight = lock(&self.in_flight);
        let done = match in_flight.front().and_then(|payload| payload.token.as_ref()) {
            Some(token) => backend.poll(self.ty, token)?,
            None => false,
        };
        if !done {
            return Ok(None);
        }
        let payload = in_flight.pop_front();
        self.in_flight_len.store(in_flight.len(), Ordering::Release);
        Ok(payload)
    }

    /// Takes every unconfirmed payload regardless of device state.
    pub fn take_in_flight(&self) -> Vec<Payload<B>> {
        let mut in_flight = lock(&self.in_flight);
        self.in_flight_len.store(0, Ordering::Release);
        in_flight.drain(..).collect()
    }

    pub fn take_all_pending(&self) -> Vec<Payload<B>> {
        lock(&self.pending).drain(..).collect()
    }

    pub fn acquire_command_buffer(&self, backend: &B) -> Result<B::CommandBuffer, DeviceError> {
        if let Some(cb) = lock(&self.free_command_buffers).pop() {
            return Ok(cb);
        }
        unsafe { backend.create_command_buffer(self.ty) }
    }

    pub fn recycle_command_buffer(
        &self,
        backend: &B,
        mut cb: B::CommandBuffer,
    ) -> Result<(), DeviceError> {
        if let Err(err) = unsafe { backend.reset_command_buffer(&mut cb) } {
            unsafe { backend.destroy_command_buffer(cb) };
            return Err(err);
        }
        lock(&self.free_command_buffers).push(cb);
        Ok(())
    }

    pub fn free_command_buffer_count(&self) -> usize {
        lock(&self.free_command_buffers).len()
    }

    pub fn destroy_command_buffers(&self, backend: &B) {
        let free = std::mem::take(&mut *lock(&self.free_command_buffers));
        for cb in free {
            unsafe { backend.destroy_command_buffer(cb) };
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
