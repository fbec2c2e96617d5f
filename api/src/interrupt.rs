use std::{
    sync::{Arc, Mutex, TryLockError},
    time::Duration,
};

use log::{debug, info, trace, warn};

use crate::{
    error::DeviceError,
    payload::Payload,
    pipeline::{GpuTiming, Shared, Wake},
    queue::{lock, HardwareQueue},
    types::QueueType,
    Backend,
};

/// Completion engine state. Whoever holds `process` is the only thread resolving
/// payloads.
pub(crate) struct Interrupt {
    process: Mutex<()>,
    /// Raised whenever new work goes in flight.
    pub wake: Wake,
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            process: Mutex::new(()),
            wake: Wake::new(),
        }
    }
}

/// One completion pass over every queue. Returns whether any payload was resolved.
pub(crate) fn process_once<B: Backend>(shared: &Shared<B>) -> Result<bool, DeviceError> {
    let _guard = lock(&shared.interrupt.process);
    process_locked(shared)
}

/// Like [`process_once`], but returns `None` instead of blocking when another thread is
/// already processing.
pub(crate) fn try_process_once<B: Backend>(
    shared: &Shared<B>,
) -> Option<Result<bool, DeviceError>> {
    let _guard = match shared.interrupt.process.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return None,
    };
    Some(process_locked(shared))
}

fn process_locked<B: Backend>(shared: &Shared<B>) -> Result<bool, DeviceError> {
    let mut progress = false;
    for queue in shared.queues() {
        while let Some(payload) = queue.pop_completed(&shared.backend)? {
            resolve(shared, queue, payload)?;
            progress = true;
        }
    }
    Ok(progress)
}

/// Releases everything a completed payload owned. Query results land before any sync
/// point fires so continuations observe them. On a device error the rest of the payload
/// is abandoned, so its sync points still complete.
fn resolve<B: Backend>(
    shared: &Shared<B>,
    queue: &HardwareQueue<B>,
    mut payload: Payload<B>,
) -> Result<(), DeviceError> {
    debug!("payload on {:?} completed ({:?})", queue.ty(), payload.token);

    if let Err(err) = release_resources(shared, queue, &mut payload) {
        abandon(shared, payload);
        return Err(err);
    }

    if let Some(timing) = payload.timing.take() {
        match (timing.begin.result(), timing.end.result()) {
            (Some(begin), Some(end)) => {
                let period = shared.backend.timestamp_period();
                shared.push_timing(GpuTiming {
                    queue: queue.ty(),
                    duration: ticks_to_duration(end.saturating_sub(begin), period),
                });
            }
            _ => warn!("payload timing on {:?} was not available", queue.ty()),
        }
    }

    if payload.end_frame {
        shared.query_pools.end_frame();
    }

    for point in payload.sync_points.drain(..) {
        point.complete();
    }
    Ok(())
}

/// Recycles command buffers and resolves query pools. Whatever is left unprocessed after
/// a failure stays on `payload`.
fn release_resources<B: Backend>(
    shared: &Shared<B>,
    queue: &HardwareQueue<B>,
    payload: &mut Payload<B>,
) -> Result<(), DeviceError> {
    let mut command_buffers = std::mem::take(&mut payload.command_buffers).into_iter();
    while let Some(cb) = command_buffers.next() {
        if let Err(err) = queue.recycle_command_buffer(&shared.backend, cb.into_raw()) {
            payload.command_buffers.extend(command_buffers);
            return Err(err);
        }
    }

    let mut pools = std::mem::take(&mut payload.query_pools).into_iter();
    while let Some(mut pool) = pools.next() {
        if let Err(err) = shared.query_pools.resolve_into_targets(&mut pool) {
            shared.query_pools.abandon(pool);
            payload.query_pools.extend(pools);
            return Err(err);
        }
        shared.query_pools.release(pool);
    }
    Ok(())
}

/// Releases a payload that will never complete on the device. Its sync points are
/// completed so nothing waits on them forever.
pub(crate) fn abandon<B: Backend>(shared: &Shared<B>, mut payload: Payload<B>) {
    for cb in payload.command_buffers.drain(..) {
        unsafe { shared.backend.destroy_command_buffer(cb.into_raw()) };
    }
    for pool in payload.query_pools.drain(..) {
        shared.query_pools.abandon(pool);
    }
    for point in payload.sync_points.drain(..) {
        point.complete();
    }
}

/// Blocks until the oldest in-flight payload of some queue finishes or `timeout`
/// elapses. With nothing in flight, waits for the next submission instead.
pub(crate) fn wait_for_any<B: Backend>(
    shared: &Shared<B>,
    timeout: Duration,
) -> Result<bool, DeviceError> {
    let fronts = shared
        .queues()
        .iter()
        .filter_map(|queue| queue.front_token().map(|token| (queue.ty(), token)))
        .collect::<Vec<(QueueType, B::Token)>>();
    if fronts.is_empty() {
        trace!("nothing in flight; idling");
        shared.interrupt.wake.wait(timeout);
        return Ok(false);
    }

    let tokens = fronts
        .iter()
        .map(|(ty, token)| (*ty, token))
        .collect::<Vec<_>>();
    shared.backend.wait_for_any(&tokens, timeout)
}

pub(crate) fn run_worker<B: Backend>(shared: Arc<Shared<B>>) {
    info!("interrupt thread started");
    while !shared.workers_stopping() {
        let result = match process_once(&shared) {
            Ok(true) => Ok(true),
            Ok(false) => wait_for_any(&shared, shared.config.wait_timeout),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            shared.mark_lost(err);
            break;
        }
    }
    shared
        .interrupt_worker_active
        .store(false, std::sync::atomic::Ordering::Release);
    debug!("interrupt thread exiting");
}

fn ticks_to_duration(ticks: u64, period: f32) -> Duration {
    Duration::from_nanos((ticks as f64 * period as f64) as u64)
}
