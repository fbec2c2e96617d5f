use thiserror::Error;

use crate::types::{QueryKind, QueueType};

/// Failures reported by a [`Backend`](crate::Backend).
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("the device was lost: {0}")]
    Lost(String),
    #[error("out of device memory")]
    OutOfMemory,
    #[error("an error has occured: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query pool is full ({capacity} slots reserved)")]
    PoolFull { capacity: u32 },
    #[error("expected a {expected:?} pool but found a {found:?} pool")]
    KindMismatch {
        expected: QueryKind,
        found: QueryKind,
    },
    #[error("query pool must be reset before slots can be reserved")]
    NeedsReset,
    #[error("query slot {slot} was not available after the owning work completed")]
    Unavailable { slot: u32 },
}

/// Errors surfaced by the producer-facing API.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("the device was lost and the pipeline can no longer make progress")]
    DeviceLost,
    #[error("the pipeline has been shut down")]
    ShutDown,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("the device does not expose a {0:?} queue")]
    UnsupportedQueue(QueueType),
    #[error("failed to spawn a pipeline worker: {0}")]
    Spawn(#[from] std::io::Error),
}
