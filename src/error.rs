use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::Dynamic;
use crate::digest::Digest;
use crate::result::SharedResult;

/// Errors surfaced by the solver's administrative API.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("job ID {0} exists")]
    JobExists(String),

    #[error("no such job {0}")]
    UnknownJob(String),

    #[error("inactive parent {0}")]
    InactiveParent(Digest),

    #[error("solver is closed")]
    Closed,

    #[error(transparent)]
    Build(#[from] SharedError),
}

/// A clonable error handed to every caller joined on the same computation.
#[derive(Debug, Clone, Error)]
#[error(transparent)]
pub struct SharedError(#[from] pub(crate) Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for SharedError {
    fn from(err: anyhow::Error) -> Self {
        SharedError(Arc::new(err))
    }
}

/// Raised when a call context is cancelled; carries the cancellation cause.
#[derive(Debug, Clone, Error)]
#[error("{cause}")]
pub struct Cancelled {
    pub cause: String,
}

impl Cancelled {
    pub(crate) fn new(cause: impl Into<String>) -> Self {
        Cancelled {
            cause: cause.into(),
        }
    }
}

/// Vertex identification attached to every op-origin error.
#[derive(Debug, Clone)]
pub struct VertexError {
    /// Digest of the vertex before any ignore-cache rewrite.
    pub digest: Digest,
}

impl std::fmt::Display for VertexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "vertex {}", self.digest)
    }
}

/// Op identification attached to every op-origin error.
#[derive(Clone)]
pub struct OpError {
    pub sys: Option<Dynamic>,
    pub description: String,
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op {}", self.description)
    }
}

impl std::fmt::Debug for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpError")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Wraps failures from content-based cache-key computation, preserving the
/// evaluated input result for caller debugging.
#[derive(Clone)]
pub struct SlowCacheError {
    pub index: usize,
    pub result: SharedResult,
}

impl std::fmt::Display for SlowCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to compute cache key for input {}", self.index)
    }
}

impl std::fmt::Debug for SlowCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlowCacheError")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// An error that still holds resources. When such an error is discarded
/// instead of propagated (a cancelled computation that will be retried), the
/// held resources must be returned.
pub struct ResourceError {
    source: Box<dyn std::error::Error + Send + Sync>,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ResourceError {
    pub fn wrap(err: anyhow::Error, release: impl FnOnce() + Send + 'static) -> anyhow::Error {
        anyhow::Error::new(ResourceError {
            source: err.into(),
            release: Mutex::new(Some(Box::new(release))),
        })
    }

    pub fn release(&self) {
        if let Some(f) = self.release.lock().unwrap().take() {
            f();
        }
    }
}

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.source.fmt(f)
    }
}

impl std::fmt::Debug for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceError({:?})", self.source)
    }
}

impl std::error::Error for ResourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Walks the cause chain and returns held resources on every level that
/// carries them.
pub(crate) fn release_error_resources(err: &anyhow::Error) {
    for cause in err.chain() {
        if let Some(re) = cause.downcast_ref::<ResourceError>() {
            re.release();
        }
    }
}

/// Reports whether the error chain carries a cancellation marker.
pub(crate) fn has_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Cancelled>().is_some())
}
