#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod context;
mod digest;
mod edge;
mod error;
mod flight;
mod job;
mod op;
mod progress;
mod result;
mod scheduler;
mod shared_op;
mod solver;
mod state;
mod trace;
mod vertex;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::cache::{
    CacheDep, CacheKey, CacheManager, CacheMap, CacheOpts, CacheRecord, CombinedCacheManager,
    ExportableCacheKey, InMemoryCacheManager, PreprocessFunc, ResultBasedCacheFunc,
};
pub use crate::context::{CancelHandle, Context};
pub use crate::digest::Digest;
pub use crate::error::{
    Cancelled, OpError, ResourceError, SharedError, SlowCacheError, SolverError, VertexError,
};
pub use crate::job::{CachedResultWithProvenance, Job};
pub use crate::op::{
    Builder, Op, ProvenanceProvider, Release, ResolveOpFunc, SessionCallback, SessionGroup,
    SessionIter, Sessions,
};
pub use crate::progress::{
    ClientVertex, MultiReader, MultiWriter, PROGRESS_OPT_KEY, ProgressController, ProgressGroup,
    ProgressRecord, Reader, Writer,
};
pub use crate::result::{CachedResult, OpResult, SharedResult};
pub use crate::solver::{Solver, SolverOpt};
pub use crate::trace::MultiSpan;
pub use crate::vertex::{Edge, Vertex, VertexOptions};

/// A type-erased, thread-safe payload.
pub type Dynamic = std::sync::Arc<dyn std::any::Any + Send + Sync>;
