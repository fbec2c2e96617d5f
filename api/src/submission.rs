use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info};

use crate::{
    error::DeviceError,
    payload::Payload,
    pipeline::{Shared, Wake},
    queue::{lock, HardwareQueue},
    types::PipelineStage,
    Backend, SubmitBatch,
};

/// Producer-facing end of the submission engine.
///
/// Enqueued lists travel over a channel so producers never contend with a submit in
/// progress. The engine routes them into per-queue FIFOs before submitting.
pub(crate) struct Submitter<B: Backend> {
    sender: Sender<Vec<Payload<B>>>,
    receiver: Receiver<Vec<Payload<B>>>,
    /// Held for the whole of one processing pass.
    process: Mutex<()>,
    pub wake: Wake,
}

impl<B: Backend> Submitter<B> {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            sender,
            receiver,
            process: Mutex::new(()),
            wake: Wake::new(),
        }
    }

    pub fn enqueue(&self, payloads: Vec<Payload<B>>) {
        // The receiver lives as long as `self`, so this cannot disconnect.
        let _ = self.sender.send(payloads);
        self.wake.signal();
    }

    /// Lists enqueued but not yet routed to a queue.
    pub fn take_queued(&self) -> Vec<Vec<Payload<B>>> {
        self.receiver.try_iter().collect()
    }
}

/// One submission pass: route newly enqueued payloads, then issue at most one native
/// submit per queue. Returns whether anything was submitted.
pub(crate) fn process_once<B: Backend>(shared: &Shared<B>) -> Result<bool, DeviceError> {
    let _guard = lock(&shared.submitter.process);

    for payloads in shared.submitter.receiver.try_iter() {
        for payload in payloads {
            match shared.queue(payload.queue) {
                Ok(queue) => queue.push_pending(payload),
                // Enqueue validates queues before sending.
                Err(err) => error!("dropping payload: {err}"),
            }
        }
    }

    let mut submitted = false;
    for queue in shared.queues() {
        if !queue.has_pending() {
            continue;
        }
        let mut batch = queue.take_pending(shared.config.max_payloads_per_submit);
        if let Err(err) = submit_batch::<B>(&shared.backend, queue, &mut batch) {
            queue.return_pending(batch);
            return Err(err);
        }
        queue.push_in_flight(batch);
        submitted = true;
    }

    if submitted {
        shared.interrupt.wake.signal();
    }
    Ok(submitted)
}

/// Coalesces `payloads` into a single native submit and stamps each with the token.
fn submit_batch<B: Backend>(
    backend: &B,
    queue: &HardwareQueue<B>,
    payloads: &mut [Payload<B>],
) -> Result<(), DeviceError> {
    let token = {
        let waits = payloads
            .iter()
            .map(|payload| {
                payload
                    .waits
                    .iter()
                    .map(|(semaphore, stage)| (semaphore.internal(), *stage))
                    .collect::<Vec<(&B::Semaphore, PipelineStage)>>()
            })
            .collect::<Vec<_>>();
        let command_buffers = payloads
            .iter()
            .map(|payload| {
                payload
                    .command_buffers
                    .iter()
                    .map(|cb| {
                        debug_assert!(!cb.is_recording(), "submitted an open command buffer");
                        cb.internal()
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let signals = payloads
            .iter()
            .map(|payload| {
                payload
                    .signals
                    .iter()
                    .map(|semaphore| semaphore.internal())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let batches = (0..payloads.len())
            .map(|i| SubmitBatch {
                waits: &waits[i],
                command_buffers: &command_buffers[i],
                signals: &signals[i],
            })
            .collect::<Vec<_>>();

        unsafe { backend.submit(queue.ty(), &batches)? }
    };

    debug!(
        "submitted {} payloads to {:?} as {:?}",
        payloads.len(),
        queue.ty(),
        token
    );
    for payload in payloads.iter_mut() {
        payload.token = Some(token.clone());
    }
    Ok(())
}

pub(crate) fn run_worker<B: Backend>(shared: Arc<Shared<B>>) {
    info!("submission thread started");
    while !shared.workers_stopping() {
        match process_once(&shared) {
            Ok(true) => {}
            Ok(false) => {
                shared.submitter.wake.wait(shared.config.wait_timeout);
            }
            Err(err) => {
                shared.mark_lost(err);
                break;
            }
        }
    }
    debug!("submission thread exiting");
}
