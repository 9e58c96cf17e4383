use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Dynamic;
use crate::cache::ExportableCacheKey;

/// A single build output held by the solver. Implementations free any
/// underlying resources in [`release`](OpResult::release).
pub trait OpResult: Send + Sync {
    /// Stable identifier of the underlying resource.
    fn id(&self) -> String;

    /// Opaque payload, interpreted by ops and cache managers.
    fn sys(&self) -> Dynamic;

    /// Frees the underlying resources. Called at most once.
    fn release(&self) -> anyhow::Result<()>;
}

/// A clonable handle over an [`OpResult`]. No matter how many clones exist,
/// the underlying result is released at most once.
#[derive(Clone)]
pub struct SharedResult {
    inner: Arc<Shared>,
}

struct Shared {
    res: Box<dyn OpResult>,
    released: AtomicBool,
}

impl SharedResult {
    pub fn new(res: Box<dyn OpResult>) -> Self {
        SharedResult {
            inner: Arc::new(Shared {
                res,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> String {
        self.inner.res.id()
    }

    pub fn sys(&self) -> Dynamic {
        self.inner.res.sys()
    }

    /// Releases the underlying result. Idempotent across all clones.
    pub fn release(&self) -> anyhow::Result<()> {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.res.release()
    }
}

impl std::fmt::Debug for SharedResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedResult({})", self.id())
    }
}

/// A build result together with the cache keys that produced it.
#[derive(Clone)]
pub struct CachedResult {
    pub result: SharedResult,
    pub cache_keys: Vec<ExportableCacheKey>,
}
