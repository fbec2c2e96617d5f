use std::sync::Arc;

use crate::{error::DeviceError, Backend};

/// A device semaphore used as a wait or signal primitive on a payload.
///
/// The native object is destroyed when the last clone is dropped. Payloads in flight hold
/// clones, so a semaphore outlives every submission that references it.
pub struct Semaphore<B: Backend>(pub(crate) Arc<SemaphoreInner<B>>);

pub(crate) struct SemaphoreInner<B: Backend> {
    backend: Arc<B>,
    pub(crate) id: B::Semaphore,
}

impl<B: Backend> Semaphore<B> {
    pub(crate) fn new(backend: Arc<B>) -> Result<Self, DeviceError> {
        let id = unsafe { backend.create_semaphore()? };
        Ok(Self(Arc::new(SemaphoreInner { backend, id })))
    }

    #[inline(always)]
    pub fn internal(&self) -> &B::Semaphore {
        &self.0.id
    }

    #[inline(always)]
    pub fn ptr_eq(&self, other: &Semaphore<B>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<B: Backend> Drop for SemaphoreInner<B> {
    fn drop(&mut self) {
        unsafe {
            self.backend.destroy_semaphore(&mut self.id);
        }
    }
}

impl<B: Backend> Clone for Semaphore<B> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<B: Backend> std::fmt::Debug for Semaphore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore")
            .field(&Arc::as_ptr(&self.0))
            .finish()
    }
}
