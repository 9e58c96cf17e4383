use std::sync::Arc;

use crate::Dynamic;
use crate::cache::CacheManager;
use crate::digest::Digest;
use crate::progress::ProgressGroup;

/// A node in a client-submitted build DAG, content-addressed by a digest
/// over its kind, inputs and options.
pub trait Vertex: Send + Sync {
    /// Content digest identifying this vertex.
    fn digest(&self) -> Digest;

    /// Human-readable name, shown in progress output.
    fn name(&self) -> String;

    /// Opaque operation payload, interpreted by the resolved [`Op`].
    ///
    /// [`Op`]: crate::Op
    fn sys(&self) -> Dynamic;

    /// Input edges, ordered.
    fn inputs(&self) -> Vec<Edge>;

    fn options(&self) -> &VertexOptions;
}

/// One output of one vertex.
#[derive(Clone)]
pub struct Edge {
    pub index: usize,
    pub vertex: Arc<dyn Vertex>,
}

impl Edge {
    pub fn new(vertex: Arc<dyn Vertex>, index: usize) -> Self {
        Edge { index, vertex }
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Edge({}[{}])", self.vertex.digest(), self.index)
    }
}

#[derive(Clone, Default)]
pub struct VertexOptions {
    /// Skip cache lookups for this vertex. Affects the vertex's effective
    /// identity in the active graph; see the registry's dedup rules.
    pub ignore_cache: bool,
    /// Extra cache sources queried alongside the solver default.
    pub cache_sources: Vec<Arc<dyn CacheManager>>,
    /// Description attached to op-origin errors.
    pub description: String,
    pub progress_group: Option<ProgressGroup>,
}

/// A loaded vertex carrying its effective digest and rewritten input list.
/// This is what the active graph stores and what schedulers see.
pub(crate) struct VertexWithCacheOptions {
    inner: Arc<dyn Vertex>,
    dgst: Digest,
    inputs: Vec<Edge>,
}

impl VertexWithCacheOptions {
    pub(crate) fn new(inner: Arc<dyn Vertex>, dgst: Digest, inputs: Vec<Edge>) -> Self {
        VertexWithCacheOptions {
            inner,
            dgst,
            inputs,
        }
    }
}

impl Vertex for VertexWithCacheOptions {
    fn digest(&self) -> Digest {
        self.dgst
    }

    fn name(&self) -> String {
        self.inner.name()
    }

    fn sys(&self) -> Dynamic {
        self.inner.sys()
    }

    fn inputs(&self) -> Vec<Edge> {
        self.inputs.clone()
    }

    fn options(&self) -> &VertexOptions {
        self.inner.options()
    }
}
