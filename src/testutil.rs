//! Shared fixtures for the crate's tests: a byte-payload result, a
//! name-addressed vertex, and an op whose behaviour each test steers
//! through a shared setup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::Dynamic;
use crate::cache::{CacheDep, CacheManager, CacheMap, ResultBasedCacheFunc};
use crate::context::Context;
use crate::digest::Digest;
use crate::op::{Builder, Op, ProvenanceProvider, ResolveOpFunc, SessionGroup};
use crate::result::{OpResult, SharedResult};
use crate::solver::{Solver, SolverOpt};
use crate::vertex::{Edge, Vertex, VertexOptions};

pub(crate) struct ByteResult {
    id: String,
    data: Vec<u8>,
}

impl ByteResult {
    pub(crate) fn shared(data: &[u8]) -> SharedResult {
        SharedResult::new(Box::new(ByteResult {
            id: format!("res-{}", Digest::hash(data)),
            data: data.to_vec(),
        }))
    }
}

impl OpResult for ByteResult {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn sys(&self) -> Dynamic {
        Arc::new(self.data.clone())
    }

    fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct TestVertex {
    name: String,
    digest: Digest,
    inputs: Vec<Edge>,
    opts: VertexOptions,
}

/// A vertex whose digest derives from its name.
pub(crate) fn vtx(name: &str, inputs: Vec<Edge>) -> Arc<dyn Vertex> {
    vtx_opts(name, inputs, VertexOptions::default())
}

pub(crate) fn vtx_opts(name: &str, inputs: Vec<Edge>, opts: VertexOptions) -> Arc<dyn Vertex> {
    Arc::new(TestVertex {
        name: name.to_string(),
        digest: Digest::hash(name.as_bytes()),
        inputs,
        opts,
    })
}

impl Vertex for TestVertex {
    fn digest(&self) -> Digest {
        self.digest
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn sys(&self) -> Dynamic {
        Arc::new(self.name.clone())
    }

    fn inputs(&self) -> Vec<Edge> {
        self.inputs.clone()
    }

    fn options(&self) -> &VertexOptions {
        &self.opts
    }
}

pub(crate) type ExecHook =
    Arc<dyn Fn(&Context, &Arc<dyn Builder>) -> anyhow::Result<()> + Send + Sync>;

/// Observation point and steering wheel shared between a test and the ops
/// its solver resolves.
#[derive(Default)]
pub(crate) struct TestSetup {
    /// Vertex names in execution order.
    pub(crate) exec_log: Mutex<Vec<String>>,
    pub(crate) cache_map_log: Mutex<Vec<String>>,
    /// Runs at the start of a vertex's exec, keyed by vertex name.
    pub(crate) exec_hooks: Mutex<HashMap<String, ExecHook>>,
    /// Content-based cache function for input 0, keyed by vertex name.
    pub(crate) slow: Mutex<HashMap<String, ResultBasedCacheFunc>>,
    /// Cache-map digest override, keyed by vertex name.
    pub(crate) cm_digests: Mutex<HashMap<String, Digest>>,
}

impl TestSetup {
    pub(crate) fn execs_of(&self, name: &str) -> usize {
        self.exec_log
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.as_str() == name)
            .count()
    }

    pub(crate) fn set_exec_hook(&self, name: &str, hook: ExecHook) {
        self.exec_hooks
            .lock()
            .unwrap()
            .insert(name.to_string(), hook);
    }
}

struct TestOp {
    name: String,
    inputs: usize,
    setup: Arc<TestSetup>,
    builder: Arc<dyn Builder>,
}

impl Op for TestOp {
    fn cache_map(
        &self,
        _ctx: &Context,
        _g: &dyn SessionGroup,
        _index: usize,
    ) -> anyhow::Result<(CacheMap, bool)> {
        self.setup
            .cache_map_log
            .lock()
            .unwrap()
            .push(self.name.clone());

        let digest = self
            .setup
            .cm_digests
            .lock()
            .unwrap()
            .get(&self.name)
            .copied()
            .unwrap_or_else(|| Digest::hash(format!("cachemap-{}", self.name)));
        let slow = self.setup.slow.lock().unwrap().get(&self.name).cloned();
        let deps = (0..self.inputs)
            .map(|i| CacheDep {
                selector: None,
                compute_digest: if i == 0 { slow.clone() } else { None },
                preprocess: None,
            })
            .collect();

        Ok((
            CacheMap {
                digest,
                deps,
                opts: Default::default(),
            },
            true,
        ))
    }

    fn exec(
        &self,
        ctx: &Context,
        _g: &dyn SessionGroup,
        _inputs: &[SharedResult],
    ) -> anyhow::Result<Vec<Box<dyn OpResult>>> {
        let hook = self.setup.exec_hooks.lock().unwrap().get(&self.name).cloned();
        if let Some(hook) = hook {
            hook(ctx, &self.builder)?;
        }
        self.setup.exec_log.lock().unwrap().push(self.name.clone());
        Ok(vec![Box::new(ByteResult {
            id: format!("out-{}", self.name),
            data: self.name.clone().into_bytes(),
        })])
    }

    fn provenance(&self) -> Option<&dyn ProvenanceProvider> {
        Some(self)
    }
}

impl ProvenanceProvider for TestOp {
    fn provenance(&self) -> Dynamic {
        Arc::new(self.name.clone())
    }
}

fn resolver(setup: &Arc<TestSetup>) -> ResolveOpFunc {
    let setup = setup.clone();
    Arc::new(move |v, b| {
        Ok(Box::new(TestOp {
            name: v.name(),
            inputs: v.inputs().len(),
            setup: setup.clone(),
            builder: b.clone(),
        }) as Box<dyn Op>)
    })
}

pub(crate) fn solver_with(setup: &Arc<TestSetup>) -> Solver {
    Solver::new(SolverOpt {
        resolve_op: resolver(setup),
        default_cache: None,
    })
}

pub(crate) fn solver_with_cache(setup: &Arc<TestSetup>, cache: Arc<dyn CacheManager>) -> Solver {
    Solver::new(SolverOpt {
        resolve_op: resolver(setup),
        default_cache: Some(cache),
    })
}
