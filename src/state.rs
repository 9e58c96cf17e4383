use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tracing::Span;

use crate::Dynamic;
use crate::cache::{CacheManager, CombinedCacheManager, ExportableCacheKey};
use crate::context::Context;
use crate::digest::Digest;
use crate::edge::{EdgeIndex, EdgeRecord};
use crate::job::{CachedResultWithProvenance, Job};
use crate::op::{Builder, SessionCallback, SessionGroup, SessionIter};
use crate::progress::{ClientVertex, MultiWriter, WriterId};
use crate::shared_op::SharedOp;
use crate::solver::SolverShared;
use crate::trace::MultiSpan;
use crate::vertex::{Edge, Vertex};

/// An active vertex: the shared node the registry keeps per effective
/// digest while at least one job or parent vertex holds it.
pub(crate) struct VertexState {
    /// Effective digest; the key this state is registered under.
    pub(crate) digest: Digest,
    /// Digest before any ignore-cache rewrite, kept for error attribution.
    pub(crate) orig_digest: Digest,
    pub(crate) vtx: Arc<dyn Vertex>,
    pub(crate) client_vertex: ClientVertex,
    pub(crate) mpw: MultiWriter,
    /// Writers attached to `mpw`, by identity. Guarded separately from
    /// `core` because progress hooks touch it while `core` is held by
    /// their caller (hierarchy: core before all_pw).
    pub(crate) all_pw: Mutex<HashSet<WriterId>>,
    pub(crate) mspan: MultiSpan,
    /// Span of the last execution or cache load; descendant slow-cache
    /// computations attach to it.
    pub(crate) exec_span: Mutex<Option<Span>>,
    pub(crate) main_cache: Arc<dyn CacheManager>,
    pub(crate) solver: Weak<SolverShared>,
    me: Weak<VertexState>,
    pub(crate) core: Mutex<StateCore>,
}

#[derive(Default)]
pub(crate) struct StateCore {
    pub(crate) jobs: HashMap<String, Arc<Job>>,
    pub(crate) parents: HashSet<Digest>,
    pub(crate) child_vtx: HashSet<Digest>,
    pub(crate) edges: HashMap<usize, Arc<EdgeRecord>>,
    pub(crate) op: Option<Arc<SharedOp>>,
    pub(crate) cache: HashMap<String, Arc<dyn CacheManager>>,
}

impl VertexState {
    pub(crate) fn new(
        digest: Digest,
        orig_digest: Digest,
        vtx: Arc<dyn Vertex>,
        client_vertex: ClientVertex,
        main_cache: Arc<dyn CacheManager>,
        solver: Weak<SolverShared>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| VertexState {
            digest,
            orig_digest,
            vtx,
            client_vertex,
            mpw: MultiWriter::new(),
            all_pw: Mutex::new(HashSet::new()),
            mspan: MultiSpan::new(),
            exec_span: Mutex::new(None),
            main_cache,
            solver,
            me: me.clone(),
            core: Mutex::new(StateCore::default()),
        })
    }

    fn ensure_op(&self) -> anyhow::Result<Arc<SharedOp>> {
        let solver = self
            .solver
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("solver is gone"))?;
        let mut core = self.core.lock().unwrap();
        let op = core
            .op
            .get_or_insert_with(|| SharedOp::new(solver.resolve_op.clone(), self.me.clone()));
        Ok(op.clone())
    }

    pub(crate) fn op(&self) -> Option<Arc<SharedOp>> {
        self.core.lock().unwrap().op.clone()
    }

    pub(crate) fn jobs_snapshot(&self) -> Vec<Arc<Job>> {
        self.core.lock().unwrap().jobs.values().cloned().collect()
    }

    pub(crate) fn parents_snapshot(&self) -> Vec<Digest> {
        self.core.lock().unwrap().parents.iter().copied().collect()
    }

    /// The representative edge record for `index`, creating the record and
    /// the shared op on first access. Lookups follow owner chains set up by
    /// merges.
    pub(crate) fn get_edge(&self, index: usize) -> anyhow::Result<Arc<EdgeRecord>> {
        let op = self.ensure_op()?;
        let mut core = self.core.lock().unwrap();
        if let Some(rec) = core.edges.get(&index) {
            return Ok(rec.resolve());
        }
        let rec = EdgeRecord::new(
            Edge {
                index,
                vertex: self.vtx.clone(),
            },
            op,
        );
        core.edges.insert(index, rec.clone());
        Ok(rec)
    }

    /// Redirects this state's edge at `index` to `target`. When the
    /// representative's state is still live, jobs and progress writers are
    /// unioned into it and its whole input closure; when it is already gone
    /// the merge succeeds at the edge-pointer level and performs no further
    /// bookkeeping.
    pub(crate) fn set_edge(
        &self,
        index: usize,
        target: &Arc<EdgeRecord>,
        target_st: Option<&Arc<VertexState>>,
        actives: &HashMap<Digest, Arc<VertexState>>,
    ) -> anyhow::Result<()> {
        {
            let op = self.ensure_op()?;
            let mut core = self.core.lock().unwrap();
            let rec = match core.edges.get(&index) {
                Some(rec) => {
                    let rec = rec.resolve();
                    if Arc::ptr_eq(&rec, target) {
                        return Ok(());
                    }
                    rec
                }
                None => {
                    let rec = EdgeRecord::new(
                        Edge {
                            index,
                            vertex: self.vtx.clone(),
                        },
                        op,
                    );
                    core.edges.insert(index, rec.clone());
                    rec
                }
            };
            target.take_ownership(&rec);
        }

        if let Some(target_st) = target_st {
            let src_jobs = self.jobs_snapshot();
            let mut memo = HashSet::new();
            target_st.add_jobs(&src_jobs, actives, &mut memo);

            let writer = self.mpw.writer();
            let mut all_pw = target_st.all_pw.lock().unwrap();
            if all_pw.insert(writer.id()) {
                target_st.mpw.add(writer);
            }
        }
        Ok(())
    }

    /// Recursively unions `src_jobs` into this state and every input state
    /// reachable from it. Inputs whose edges were themselves merged union
    /// into the representative's state as well.
    ///
    /// The registry lock must be held by the caller (`actives` borrows it).
    pub(crate) fn add_jobs(
        &self,
        src_jobs: &[Arc<Job>],
        actives: &HashMap<Digest, Arc<VertexState>>,
        memo: &mut HashSet<Digest>,
    ) {
        if !memo.insert(self.digest) {
            return;
        }

        {
            let mut core = self.core.lock().unwrap();
            for j in src_jobs {
                core.jobs
                    .entry(j.id().to_string())
                    .or_insert_with(|| j.clone());
            }
        }

        for input in self.vtx.inputs() {
            let Some(input_st) = actives.get(&input.vertex.digest()) else {
                tracing::error!(
                    vertex = %input.vertex.digest(),
                    "input vertex not found during job union"
                );
                continue;
            };
            input_st.add_jobs(src_jobs, actives, memo);

            let Ok(merged) = input_st.get_edge(input.index) else {
                continue;
            };
            if merged.edge.vertex.digest() == input.vertex.digest() {
                continue;
            }
            match actives.get(&merged.edge.vertex.digest()) {
                Some(merged_st) => merged_st.add_jobs(src_jobs, actives, memo),
                None => tracing::error!(
                    vertex = %merged.edge.vertex.digest(),
                    "merged input vertex not found during job union"
                ),
            }
        }
    }

    /// The solver default layered under this vertex's extra cache sources.
    pub(crate) fn combined_cache_manager(&self) -> Arc<dyn CacheManager> {
        let core = self.core.lock().unwrap();
        if core.cache.is_empty() {
            return self.main_cache.clone();
        }
        let mut managers: Vec<Arc<dyn CacheManager>> = Vec::with_capacity(core.cache.len() + 1);
        managers.push(self.main_cache.clone());
        managers.extend(core.cache.values().cloned());
        Arc::new(CombinedCacheManager::new(managers, self.main_cache.clone()))
    }

    /// Tears the state down: releases every locally owned edge record
    /// exactly once and the shared op. Records redirected to another
    /// state's representative release only their own bookkeeping; the
    /// representative belongs to its own state.
    pub(crate) fn release(&self, index: &EdgeIndex) {
        let (edges, op) = {
            let mut core = self.core.lock().unwrap();
            let edges: Vec<Arc<EdgeRecord>> = core.edges.drain().map(|(_, e)| e).collect();
            (edges, core.op.take())
        };

        let mut released = HashSet::new();
        for rec in edges {
            let rep = rec.resolve();
            let local = rep.edge.vertex.digest() == self.digest;
            let target = if local { rep } else { rec };
            if released.insert(Arc::as_ptr(&target) as usize) {
                target.release(index);
            }
        }

        if let Some(op) = op {
            op.release();
        }
    }
}

impl SessionGroup for VertexState {
    fn session_iterator(&self) -> SessionIter {
        let mut queue = VecDeque::new();
        if let Some(me) = self.me.upgrade() {
            queue.push_back(me);
        }
        SessionIter::new(SessionWalk {
            solver: self.solver.clone(),
            queue,
            visited_states: HashSet::new(),
            visited_sessions: HashSet::new(),
            pending: VecDeque::new(),
        })
    }
}

/// Lazy ascent over the parent chain: yields the sessions of this state's
/// own jobs first, then the sessions reachable through each parent, with a
/// shared visited set so no session is yielded twice.
struct SessionWalk {
    solver: Weak<SolverShared>,
    queue: VecDeque<Arc<VertexState>>,
    visited_states: HashSet<Digest>,
    visited_sessions: HashSet<String>,
    pending: VecDeque<String>,
}

impl Iterator for SessionWalk {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if let Some(id) = self.pending.pop_front() {
                return Some(id);
            }
            let st = self.queue.pop_front()?;
            if !self.visited_states.insert(st.digest) {
                continue;
            }

            let (jobs, parents) = {
                let core = st.core.lock().unwrap();
                (
                    core.jobs.values().cloned().collect::<Vec<_>>(),
                    core.parents.iter().copied().collect::<Vec<_>>(),
                )
            };

            for j in jobs {
                let sid = j.session_id();
                if !sid.is_empty() && self.visited_sessions.insert(sid.clone()) {
                    self.pending.push_back(sid);
                }
            }

            if let Some(solver) = self.solver.upgrade() {
                let actives = solver.actives.read().unwrap();
                // ascend the nearest ancestors before their siblings'
                for p in parents.into_iter().rev() {
                    if let Some(ps) = actives.get(&p) {
                        self.queue.push_front(ps.clone());
                    }
                }
            }
        }
    }
}

/// Grants an op scoped access back into the solver. Cache keys of
/// sub-builds are collected here and exported with the owning op's result.
pub(crate) struct SubBuilder {
    st: Weak<VertexState>,
    exporters: Mutex<Vec<ExportableCacheKey>>,
}

impl SubBuilder {
    pub(crate) fn new(st: Weak<VertexState>) -> Self {
        SubBuilder {
            st,
            exporters: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> anyhow::Result<Arc<VertexState>> {
        self.st
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("vertex state released"))
    }

    pub(crate) fn exporters(&self) -> Vec<ExportableCacheKey> {
        self.exporters.lock().unwrap().clone()
    }
}

impl Builder for SubBuilder {
    fn build(&self, ctx: &Context, edge: Edge) -> anyhow::Result<CachedResultWithProvenance> {
        let st = self.state()?;
        let solver = st
            .solver
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("solver is gone"))?;
        let res = solver.sub_build(ctx, edge, &st.vtx)?;
        if let Some(key) = res.cache_keys.first() {
            // sub-build keys already carry their full export chain
            self.exporters.lock().unwrap().push(key.clone());
        }
        Ok(CachedResultWithProvenance::without_job(res))
    }

    fn in_context(&self, ctx: &Context, f: SessionCallback) -> anyhow::Result<()> {
        let st = self.state()?;
        let mut ctx = ctx.with_progress(st.mpw.writer());
        if let Some(span) = st.mspan.primary() {
            ctx = ctx.with_span(span);
        }
        f(&ctx, st.as_ref())
    }

    fn each_value(
        &self,
        ctx: &Context,
        key: &str,
        f: &mut dyn FnMut(&Dynamic) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let st = self.state()?;
        for j in st.jobs_snapshot() {
            j.each_value(ctx, key, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::context::Context;
    use crate::testutil::{TestSetup, solver_with, vtx};

    fn edge(v: Arc<dyn Vertex>) -> Edge {
        Edge::new(v, 0)
    }

    #[test]
    fn test_session_iteration_dedups_across_ancestors() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);

        let a = solver.new_job("a").unwrap();
        a.set_session_id("sa");
        let b = solver.new_job("b").unwrap();
        b.set_session_id("sb");

        // A owns the whole chain, B only the leaf; the leaf's iterator must
        // yield each session exactly once
        a.build(&Context::background(), edge(vtx("p", vec![edge(vtx("c", vec![]))])))
            .unwrap();
        b.build(&Context::background(), edge(vtx("c", vec![]))).unwrap();

        let c_st = {
            let actives = solver.shared().actives.read().unwrap();
            actives[&crate::digest::Digest::hash(b"c")].clone()
        };

        let mut sessions: Vec<String> = c_st.session_iterator().collect();
        sessions.sort();
        assert_eq!(sessions, ["sa", "sb"]);
    }

    #[test]
    fn test_jobs_without_session_are_skipped() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let job = solver.new_job("a").unwrap();

        job.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();

        let st = {
            let actives = solver.shared().actives.read().unwrap();
            actives[&crate::digest::Digest::hash(b"v")].clone()
        };
        assert_eq!(st.session_iterator().count(), 0);
    }

    #[test]
    fn test_sub_build_links_under_owner_and_exports_keys() {
        let setup = Arc::new(TestSetup::default());
        setup.set_exec_hook(
            "outer",
            Arc::new(|ctx, builder| {
                builder.build(ctx, Edge::new(vtx("sub", vec![]), 0))?;
                Ok(())
            }),
        );

        let solver = solver_with(&setup);
        let job = solver.new_job("j").unwrap();
        let res = job
            .build(&Context::background(), edge(vtx("outer", vec![])))
            .unwrap();

        assert_eq!(setup.execs_of("sub"), 1);
        // the sub-build's cache key is exported with the owner's result
        assert_eq!(res.cached().cache_keys.len(), 2);

        let outer_dgst = crate::digest::Digest::hash(b"outer");
        {
            let actives = solver.shared().actives.read().unwrap();
            let sub_st = actives.get(&crate::digest::Digest::hash(b"sub")).unwrap();
            let core = sub_st.core.lock().unwrap();
            assert!(core.jobs.is_empty());
            assert_eq!(core.parents.iter().copied().collect::<Vec<_>>(), [outer_dgst]);
        }

        // tearing down the owner cascades into the sub-built subtree
        job.discard_after(std::time::Duration::from_millis(50));
        assert!(solver.shared().actives.read().unwrap().is_empty());
    }

    #[test]
    fn test_builder_each_value_covers_owning_jobs() {
        let setup = Arc::new(TestSetup::default());
        let collected = Arc::new(Mutex::new(Vec::new()));
        {
            let collected = collected.clone();
            setup.set_exec_hook(
                "v",
                Arc::new(move |ctx, builder| {
                    let collected = collected.clone();
                    builder.each_value(ctx, "token", &mut |v| {
                        collected
                            .lock()
                            .unwrap()
                            .push(*v.downcast_ref::<u32>().unwrap());
                        Ok(())
                    })
                }),
            );
        }

        let solver = solver_with(&setup);
        let job = solver.new_job("j").unwrap();
        job.set_value("token", Arc::new(7u32));
        job.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();

        assert_eq!(*collected.lock().unwrap(), [7]);
    }

    #[test]
    fn test_in_context_exposes_owning_sessions() {
        let setup = Arc::new(TestSetup::default());
        let sessions = Arc::new(Mutex::new(Vec::new()));
        {
            let sessions = sessions.clone();
            setup.set_exec_hook(
                "v",
                Arc::new(move |ctx, builder| {
                    let sessions = sessions.clone();
                    builder.in_context(ctx, &mut |ctx, g| {
                        assert!(ctx.progress().is_some());
                        sessions.lock().unwrap().extend(g.session_iterator());
                        Ok(())
                    })
                }),
            );
        }

        let solver = solver_with(&setup);
        let job = solver.new_job("j").unwrap();
        job.set_session_id("sess");
        job.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();

        assert_eq!(*sessions.lock().unwrap(), ["sess"]);
    }
}
