use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

/// Work to run once a sync point completes.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

const PENDING: u8 = 0;
const DISPATCHING: u8 = 1;
const COMPLETE: u8 = 2;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A single-shot completion signal shared between threads.
///
/// Continuations registered while pending run exactly once, in registration order, on the
/// thread that completes the sync point. Registering after completion runs the continuation
/// immediately on the calling thread instead.
#[derive(Clone)]
pub struct SyncPoint(Arc<SyncPointInner>);

struct SyncPointInner {
    id: u64,
    debug_name: Option<String>,
    state: AtomicU8,
    continuations: Mutex<Vec<Continuation>>,
    dispatched: Condvar,
}

impl SyncPoint {
    pub fn new(debug_name: Option<&str>) -> Self {
        Self(Arc::new(SyncPointInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            debug_name: debug_name.map(String::from),
            state: AtomicU8::new(PENDING),
            continuations: Mutex::new(Vec::default()),
            dispatched: Condvar::new(),
        }))
    }

    /// Process-unique identifier.
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    #[inline(always)]
    pub fn debug_name(&self) -> Option<&str> {
        self.0.debug_name.as_deref()
    }

    /// `true` once every continuation registered before completion has run.
    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.0.state.load(Ordering::Acquire) == COMPLETE
    }

    /// Moves the sync point to complete and runs its continuations. Returns whether this
    /// call performed the transition; later calls are no-ops.
    pub fn complete(&self) -> bool {
        let continuations = {
            let mut list = self.lock();
            if self
                .0
                .state
                .compare_exchange(PENDING, DISPATCHING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            std::mem::take(&mut *list)
        };

        for continuation in continuations {
            continuation();
        }

        // Waiters are released only after every continuation has run
        let _list = self.lock();
        self.0.state.store(COMPLETE, Ordering::Release);
        self.0.dispatched.notify_all();
        true
    }

    /// Defers `continuation` until completion, or runs it now if already complete.
    pub fn add_continuation(&self, continuation: impl FnOnce() + Send + 'static) {
        {
            let mut list = self.lock();
            if self.0.state.load(Ordering::Acquire) == PENDING {
                list.push(Box::new(continuation));
                return;
            }
        }
        continuation();
    }

    /// Blocks until every continuation has been dispatched, or until `timeout` elapses.
    /// `None` blocks indefinitely. Returns whether the sync point is complete.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut list = self.lock();
        while self.0.state.load(Ordering::Acquire) != COMPLETE {
            list = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.0.dispatched.wait_timeout(list, deadline - now) {
                        Ok((list, _)) => list,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => match self.0.dispatched.wait(list) {
                    Ok(list) => list,
                    Err(poisoned) => poisoned.into_inner(),
                },
            };
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Continuation>> {
        match self.0.continuations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("id", &self.0.id)
            .field("debug_name", &self.0.debug_name)
            .field("complete", &self.is_complete())
            .finish()
    }
}
