use std::{
    fmt,
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use log::{debug, error, warn};

use crate::{
    command_buffer::CommandBuffer,
    config::PipelineConfig,
    error::{DeviceError, QueryError},
    types::{QueryKind, QueryReadback},
    Backend,
};

/// Destination for one resolved query slot.
///
/// Clones observe the same result. The value stays `None` until the payload owning the
/// slot completes and the slot is read back as available.
#[derive(Clone)]
pub struct Query(Arc<QueryInner>);

struct QueryInner {
    kind: QueryKind,
    value: AtomicU64,
    resolved: AtomicBool,
}

impl Query {
    pub fn new(kind: QueryKind) -> Self {
        Self(Arc::new(QueryInner {
            kind,
            value: AtomicU64::new(0),
            resolved: AtomicBool::new(false),
        }))
    }

    #[inline(always)]
    pub fn kind(&self) -> QueryKind {
        self.0.kind
    }

    #[inline(always)]
    pub fn result(&self) -> Option<u64> {
        if self.0.resolved.load(Ordering::Acquire) {
            Some(self.0.value.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// `true` when both handles refer to the same query.
    #[inline(always)]
    pub fn ptr_eq(&self, other: &Query) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn resolve(&self, value: u64) {
        self.0.value.store(value, Ordering::Relaxed);
        self.0.resolved.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("kind", &self.0.kind)
            .field("result", &self.result())
            .finish()
    }
}

/// A fixed-capacity set of device counters of a single kind. The native pool is
/// destroyed when this is dropped.
pub struct QueryPool<B: Backend> {
    backend: Arc<B>,
    raw: ManuallyDrop<B::QueryPool>,
    kind: QueryKind,
    capacity: u32,
    /// Destination of every reserved slot, in slot order.
    targets: Vec<Query>,
    needs_reset: bool,
    resolved: bool,
}

impl<B: Backend> QueryPool<B> {
    #[inline(always)]
    pub fn internal(&self) -> &B::QueryPool {
        &self.raw
    }

    #[inline(always)]
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    #[inline(always)]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline(always)]
    pub fn reserved(&self) -> u32 {
        self.targets.len() as u32
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.reserved() == self.capacity
    }

    #[inline(always)]
    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    /// Reserves the next free slot and registers `target` as its destination.
    pub fn reserve_slot(&mut self, target: Query) -> Result<u32, QueryError> {
        if target.kind() != self.kind {
            return Err(QueryError::KindMismatch {
                expected: self.kind,
                found: target.kind(),
            });
        }
        if self.needs_reset {
            return Err(QueryError::NeedsReset);
        }
        if self.is_full() {
            return Err(QueryError::PoolFull {
                capacity: self.capacity,
            });
        }
        let slot = self.reserved();
        self.targets.push(target);
        self.resolved = false;
        Ok(slot)
    }

    fn has_unresolved(&self) -> bool {
        !self.targets.is_empty() && !self.resolved
    }
}

impl<B: Backend> Drop for QueryPool<B> {
    fn drop(&mut self) {
        unsafe {
            let raw = ManuallyDrop::take(&mut self.raw);
            self.backend.destroy_query_pool(raw);
        }
    }
}

struct FreePool<B: Backend> {
    pool: QueryPool<B>,
    unused_frames: u32,
}

/// Owns the free lists of query pools, one per kind.
pub struct QueryPoolManager<B: Backend> {
    backend: Arc<B>,
    free: Mutex<[Vec<FreePool<B>>; 2]>,
    default_sizes: [u32; 2],
    max_unused_frames: u32,
}

impl<B: Backend> QueryPoolManager<B> {
    pub fn new(backend: Arc<B>, config: &PipelineConfig) -> Self {
        Self {
            backend,
            free: Mutex::new([Vec::default(), Vec::default()]),
            default_sizes: [config.occlusion_pool_size, config.timestamp_pool_size],
            max_unused_frames: config.max_unused_pool_frames,
        }
    }

    /// Returns a pool of `kind` with room for at least `min_count` queries. The smallest
    /// sufficient free pool is reused, otherwise a new pool is created. The pool must be
    /// [reset](Self::reset) before slots are reserved.
    pub fn acquire(&self, kind: QueryKind, min_count: u32) -> Result<QueryPool<B>, DeviceError> {
        let min_count = min_count.max(1);
        {
            let mut free = self.lock();
            let list = &mut free[kind.index()];
            let best = list
                .iter()
                .enumerate()
                .filter(|(_, free)| free.pool.capacity >= min_count)
                .min_by_key(|(_, free)| free.pool.capacity)
                .map(|(i, _)| i);
            if let Some(idx) = best {
                return Ok(list.swap_remove(idx).pool);
            }
        }

        let capacity = min_count.max(self.default_sizes[kind.index()]);
        let raw = unsafe { self.backend.create_query_pool(kind, capacity)? };
        debug!("created {kind:?} query pool with {capacity} slots");
        Ok(QueryPool {
            backend: self.backend.clone(),
            raw: ManuallyDrop::new(raw),
            kind,
            capacity,
            targets: Vec::with_capacity(capacity as usize),
            needs_reset: true,
            resolved: false,
        })
    }

    /// Returns `pool` to the free list with an idle count of zero.
    pub fn release(&self, mut pool: QueryPool<B>) {
        if pool.has_unresolved() {
            debug_assert!(false, "released a query pool with unresolved slots");
            error!(
                "query pool released with {} unresolved slots; their results are dropped",
                pool.reserved()
            );
        }
        pool.targets.clear();
        pool.needs_reset = true;
        pool.resolved = false;

        let kind = pool.kind;
        self.lock()[kind.index()].push(FreePool {
            pool,
            unused_frames: 0,
        });
    }

    /// Returns a pool whose work never reached the device. Its destinations stay unresolved.
    pub(crate) fn abandon(&self, mut pool: QueryPool<B>) {
        pool.targets.clear();
        self.release(pool);
    }

    /// Clears slot bookkeeping and records the device reset on `cb`.
    pub fn reset(&self, pool: &mut QueryPool<B>, cb: &mut CommandBuffer<B>) {
        debug_assert!(cb.is_recording(), "query pool reset on a closed command buffer");
        unsafe {
            self.backend
                .cmd_reset_query_pool(cb.internal_mut(), &pool.raw, 0, pool.capacity);
        }
        pool.targets.clear();
        pool.needs_reset = false;
        pool.resolved = false;
    }

    /// Reads back every reserved slot, in slot order. Only call this once the work that
    /// wrote the slots is known to be complete.
    pub fn resolve_all(
        &self,
        pool: &mut QueryPool<B>,
    ) -> Result<Vec<Result<u64, QueryError>>, DeviceError> {
        if pool.targets.is_empty() {
            return Ok(Vec::default());
        }

        let mut readback = vec![QueryReadback::default(); pool.targets.len()];
        unsafe {
            self.backend
                .read_query_results(&pool.raw, 0, &mut readback)?;
        }
        pool.resolved = true;

        Ok(readback
            .into_iter()
            .enumerate()
            .map(|(slot, result)| {
                if result.available {
                    Ok(result.value)
                } else {
                    Err(QueryError::Unavailable { slot: slot as u32 })
                }
            })
            .collect())
    }

    /// Resolves every reserved slot into its registered destination. Unavailable slots are
    /// logged and their destinations left untouched.
    pub(crate) fn resolve_into_targets(&self, pool: &mut QueryPool<B>) -> Result<(), DeviceError> {
        let results = self.resolve_all(pool)?;
        for (target, result) in pool.targets.iter().zip(results) {
            match result {
                Ok(value) => target.resolve(value),
                Err(err) => warn!("{err}"),
            }
        }
        Ok(())
    }

    /// Ages every free pool by one frame and destroys those idle for longer than the
    /// configured limit. Returns how many pools were destroyed.
    pub fn end_frame(&self) -> usize {
        let max_unused = self.max_unused_frames;
        let mut expired = Vec::default();
        {
            let mut free = self.lock();
            for list in free.iter_mut() {
                let mut i = 0;
                while i < list.len() {
                    list[i].unused_frames += 1;
                    if list[i].unused_frames > max_unused {
                        expired.push(list.swap_remove(i).pool);
                    } else {
                        i += 1;
                    }
                }
            }
        }

        let count = expired.len();
        drop(expired);
        if count > 0 {
            debug!("destroyed {count} idle query pools");
        }
        count
    }

    /// Number of free pools of `kind`.
    pub fn free_count(&self, kind: QueryKind) -> usize {
        self.lock()[kind.index()].len()
    }

    /// Destroys every free pool.
    pub(crate) fn drain(&self) {
        let pools = {
            let mut free = self.lock();
            free.iter_mut()
                .flat_map(|list| list.drain(..))
                .collect::<Vec<_>>()
        };
        drop(pools);
    }

    fn lock(&self) -> MutexGuard<'_, [Vec<FreePool<B>>; 2]> {
        match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
