use std::sync::Arc;

use crate::Dynamic;
use crate::cache::CacheMap;
use crate::context::Context;
use crate::job::CachedResultWithProvenance;
use crate::result::{OpResult, SharedResult};
use crate::vertex::{Edge, Vertex};

/// Provides the session ids of every job that can supply resources for a
/// vertex, nearest owners first.
pub trait SessionGroup: Send + Sync {
    fn session_iterator(&self) -> SessionIter;
}

/// Lazy, deduplicated stream of session ids.
pub struct SessionIter(Box<dyn Iterator<Item = String> + Send>);

impl SessionIter {
    pub(crate) fn new(iter: impl Iterator<Item = String> + Send + 'static) -> Self {
        SessionIter(Box::new(iter))
    }
}

impl Iterator for SessionIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.0.next()
    }
}

/// A fixed set of sessions, used for job-scoped callbacks.
pub struct Sessions(pub Vec<String>);

impl SessionGroup for Sessions {
    fn session_iterator(&self) -> SessionIter {
        SessionIter::new(self.0.clone().into_iter())
    }
}

/// Resource admission guard returned by [`Op::acquire`]. The held resources
/// are returned when the guard drops, on every exit path.
pub struct Release(Option<Box<dyn FnOnce() + Send>>);

impl Release {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Release(Some(Box::new(f)))
    }

    pub fn noop() -> Self {
        Release(None)
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// The executable form of a vertex. Resolved once per active vertex; all
/// calls are serialised per operation by the shared-op layer, so
/// implementations never see concurrent invocations of the same method.
pub trait Op: Send + Sync {
    /// Returns the index-th cache map for the vertex, plus a flag set when
    /// no further maps follow.
    fn cache_map(
        &self,
        ctx: &Context,
        g: &dyn SessionGroup,
        index: usize,
    ) -> anyhow::Result<(CacheMap, bool)>;

    /// Runs the operation over the evaluated inputs, producing one result
    /// per output edge.
    fn exec(
        &self,
        ctx: &Context,
        g: &dyn SessionGroup,
        inputs: &[SharedResult],
    ) -> anyhow::Result<Vec<Box<dyn OpResult>>>;

    /// Admission control before `exec`, e.g. a worker-slot semaphore.
    fn acquire(&self, _ctx: &Context) -> anyhow::Result<Release> {
        Ok(Release::noop())
    }

    /// Optional capability: ops that can report where their outputs came
    /// from expose it here; the provenance walk probes for it.
    fn provenance(&self) -> Option<&dyn ProvenanceProvider> {
        None
    }
}

/// Reports the origin of an op's outputs, for SBOM-like post-build walks.
pub trait ProvenanceProvider: Send + Sync {
    fn provenance(&self) -> Dynamic;
}

/// Finds an [`Op`] implementation for a vertex. The builder grants the op
/// scoped access back into the solver (sub-builds, session scopes, per-job
/// values).
pub type ResolveOpFunc =
    Arc<dyn Fn(&Arc<dyn Vertex>, &Arc<dyn Builder>) -> anyhow::Result<Box<dyn Op>> + Send + Sync>;

/// Callback invoked inside a session scope.
pub type SessionCallback<'a> =
    &'a mut dyn FnMut(&Context, &dyn SessionGroup) -> anyhow::Result<()>;

/// Scoped access into the solver, granted to ops and exposed on jobs.
pub trait Builder: Send + Sync {
    /// Builds another edge on behalf of the caller. Sub-build cache keys
    /// are collected and exported with the owning op's result.
    fn build(&self, ctx: &Context, edge: Edge) -> anyhow::Result<CachedResultWithProvenance>;

    /// Runs `f` with progress and span wired to the owning scope, and a
    /// session group covering every owning job.
    fn in_context(&self, ctx: &Context, f: SessionCallback) -> anyhow::Result<()>;

    /// Iterates the value stored under `key` by every owning job, stopping
    /// at the first error.
    fn each_value(
        &self,
        ctx: &Context,
        key: &str,
        f: &mut dyn FnMut(&Dynamic) -> anyhow::Result<()>,
    ) -> anyhow::Result<()>;
}
