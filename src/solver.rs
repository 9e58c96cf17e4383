use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::cache::{CacheManager, InMemoryCacheManager};
use crate::context::Context;
use crate::digest::Digest;
use crate::edge::{EdgeIndex, EdgeRecord};
use crate::error::SolverError;
use crate::job::Job;
use crate::op::ResolveOpFunc;
use crate::progress::{self, MultiReader, ProgressRecord, init_client_vertex};
use crate::result::CachedResult;
use crate::scheduler::Scheduler;
use crate::state::VertexState;
use crate::vertex::{Edge, Vertex, VertexWithCacheOptions};

/// How long [`Solver::get`] waits for a job to appear.
pub(crate) const GET_TIMEOUT: Duration = Duration::from_secs(6);

pub struct SolverOpt {
    pub resolve_op: ResolveOpFunc,
    /// Store queried and written by default. In-memory when unset.
    pub default_cache: Option<Arc<dyn CacheManager>>,
}

/// The process-wide shared graph of every vertex currently being solved.
///
/// Every vertex being solved is first loaded into a job; equivalent vertices
/// submitted by different jobs share one active state, so each operation
/// runs at most once. Vertex operations are invoked and progress tracked
/// through jobs.
pub struct Solver {
    shared: Arc<SolverShared>,
}

pub(crate) struct SolverShared {
    pub(crate) jobs: Mutex<HashMap<String, Arc<Job>>>,
    jobs_cond: Condvar,
    pub(crate) actives: RwLock<HashMap<Digest, Arc<VertexState>>>,
    pub(crate) resolve_op: ResolveOpFunc,
    pub(crate) default_cache: Arc<dyn CacheManager>,
    pub(crate) index: EdgeIndex,
    pub(crate) sched: Scheduler,
}

impl Solver {
    pub fn new(opts: SolverOpt) -> Self {
        let default_cache = opts
            .default_cache
            .unwrap_or_else(|| Arc::new(InMemoryCacheManager::new()));
        let shared = Arc::new_cyclic(|me: &Weak<SolverShared>| SolverShared {
            jobs: Mutex::new(HashMap::new()),
            jobs_cond: Condvar::new(),
            actives: RwLock::new(HashMap::new()),
            resolve_op: opts.resolve_op,
            default_cache,
            index: EdgeIndex::new(),
            sched: Scheduler::new(me.clone()),
        });
        Solver { shared }
    }

    /// Registers a new job under a client-supplied id.
    pub fn new_job(&self, id: &str) -> Result<Arc<Job>, SolverError> {
        let mut jobs = self.shared.jobs.lock().unwrap();
        if jobs.contains_key(id) {
            return Err(SolverError::JobExists(id.to_string()));
        }

        let (pw, reader) = progress::pipe();
        let job = Job::new(
            Arc::downgrade(&self.shared),
            id.to_string(),
            pw,
            MultiReader::new(reader),
        );
        jobs.insert(id.to_string(), job.clone());

        self.shared.jobs_cond.notify_all();
        Ok(job)
    }

    /// Returns the job registered under `id`, waiting up to six seconds for
    /// it to appear.
    pub fn get(&self, id: &str) -> Result<Arc<Job>, SolverError> {
        self.get_with_timeout(id, GET_TIMEOUT)
    }

    pub(crate) fn get_with_timeout(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Arc<Job>, SolverError> {
        let deadline = Instant::now() + timeout;
        let mut jobs = self.shared.jobs.lock().unwrap();
        loop {
            if let Some(job) = jobs.get(id) {
                return Ok(job.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SolverError::UnknownJob(id.to_string()));
            }
            jobs = self
                .shared
                .jobs_cond
                .wait_timeout(jobs, deadline - now)
                .unwrap()
                .0;
        }
    }

    /// Stops the scheduler. In-flight builds complete or error; new builds
    /// are rejected.
    pub fn close(&self) {
        self.shared.sched.stop();
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<SolverShared> {
        &self.shared
    }
}

impl SolverShared {
    /// Loads a vertex subtree into the active graph, deduplicating against
    /// existing states, and returns the effective vertex to schedule.
    ///
    /// `parent` links the loaded subtree under an already-active vertex
    /// (sub-builds); `job` marks every loaded state as owned by the job.
    pub(crate) fn load(
        self: &Arc<Self>,
        v: &Arc<dyn Vertex>,
        parent: Option<&Arc<dyn Vertex>>,
        job: Option<&Arc<Job>>,
    ) -> Result<Arc<dyn Vertex>, SolverError> {
        let mut actives = self.actives.write().unwrap();

        let mut inherited: HashMap<String, Arc<dyn CacheManager>> = HashMap::new();
        let parent_digest = match parent {
            Some(parent) => {
                let parent_dgst = parent.digest();
                let parent_st = actives
                    .get(&parent_dgst)
                    .ok_or(SolverError::InactiveParent(parent_dgst))?;
                inherited = parent_st.core.lock().unwrap().cache.clone();
                Some(parent_dgst)
            }
            None => None,
        };

        let mut memo = HashMap::new();
        let (vertex, dgst) = self.load_unlocked(&mut actives, v, job, &inherited, &mut memo)?;

        if let Some(parent_dgst) = parent_digest {
            let st = actives
                .get(&dgst)
                .cloned()
                .expect("freshly loaded state present");
            let parent_st = actives
                .get(&parent_dgst)
                .ok_or(SolverError::InactiveParent(parent_dgst))?
                .clone();
            link_parent(&parent_st, parent_dgst, &st, dgst);
            self.connect_progress_from_state(&actives, &st, &st);
        }

        Ok(vertex)
    }

    fn load_unlocked(
        self: &Arc<Self>,
        actives: &mut HashMap<Digest, Arc<VertexState>>,
        v: &Arc<dyn Vertex>,
        job: Option<&Arc<Job>>,
        inherited: &HashMap<String, Arc<dyn CacheManager>>,
        memo: &mut HashMap<Digest, (Arc<dyn Vertex>, Digest)>,
    ) -> Result<(Arc<dyn Vertex>, Digest), SolverError> {
        let orig_dgst = v.digest();
        if let Some((vertex, dgst)) = memo.get(&orig_dgst) {
            return Ok((vertex.clone(), *dgst));
        }

        // Cache sources flow down: whatever this vertex carries is
        // inherited by its whole input closure.
        let mut next_inherited = inherited.clone();
        for cache in &v.options().cache_sources {
            next_inherited
                .entry(cache.id())
                .or_insert_with(|| cache.clone());
        }

        let mut inputs = Vec::new();
        let mut input_digests = Vec::new();
        for e in v.inputs() {
            let (iv, idgst) =
                self.load_unlocked(actives, &e.vertex, job, &next_inherited, memo)?;
            inputs.push(Edge {
                index: e.index,
                vertex: iv,
            });
            input_digests.push(idgst);
        }

        let mut dgst = orig_dgst;
        let dgst_without_cache = dgst.derived("-ignorecache");

        // Dedup. An existing ignore-cache identity absorbs any newcomer;
        // in the other direction only !ignorecache absorbs ignorecache,
        // never the converse.
        let vertex: Arc<dyn Vertex>;
        let st = match actives.get(&dgst_without_cache) {
            Some(st) => {
                // adopt the existing identity, otherwise the newcomer would
                // carry a digest that can delete the state while in use
                vertex = st.vtx.clone();
                dgst = dgst_without_cache;
                st.clone()
            }
            None => {
                if let Some(existing) = actives.get(&dgst)
                    && !existing.vtx.options().ignore_cache
                    && v.options().ignore_cache
                {
                    dgst = dgst_without_cache;
                }

                vertex = Arc::new(VertexWithCacheOptions::new(v.clone(), dgst, inputs));

                match actives.get(&dgst) {
                    Some(st) => {
                        tracing::debug!(vertex = %vertex.name(), digest = %dgst, "reusing active vertex");
                        st.clone()
                    }
                    None => {
                        let client_vertex = init_client_vertex(&vertex);
                        let st = VertexState::new(
                            dgst,
                            orig_dgst,
                            vertex.clone(),
                            client_vertex,
                            self.default_cache.clone(),
                            Arc::downgrade(self),
                        );
                        tracing::debug!(vertex = %vertex.name(), digest = %dgst, "adding active vertex");
                        actives.insert(dgst, st.clone());
                        st
                    }
                }
            }
        };

        {
            let mut core = st.core.lock().unwrap();
            for cache in &v.options().cache_sources {
                if cache.id() != st.main_cache.id() {
                    core.cache.entry(cache.id()).or_insert_with(|| cache.clone());
                }
            }
            for (cid, cache) in inherited {
                if *cid != st.main_cache.id() {
                    core.cache
                        .entry(cid.clone())
                        .or_insert_with(|| cache.clone());
                }
            }
            if let Some(j) = job {
                core.jobs
                    .entry(j.id().to_string())
                    .or_insert_with(|| j.clone());
            }
        }

        // Link inputs as children of this state.
        for idgst in input_digests {
            if idgst == dgst {
                continue;
            }
            let Some(child) = actives.get(&idgst).cloned() else {
                continue;
            };
            let inserted = child.core.lock().unwrap().parents.insert(dgst);
            if inserted {
                st.core.lock().unwrap().child_vtx.insert(idgst);
            }
        }

        // Attach the progress writer of every job reachable through this
        // state's ancestry; already-attached writers are skipped.
        self.connect_progress_from_state(actives, &st, &st);

        memo.insert(orig_dgst, (vertex.clone(), dgst));
        Ok((vertex, dgst))
    }

    /// Attaches every job writer of `src` (and, transitively, of its
    /// parents) to `target`, emitting the initial vertex record on first
    /// attach so the client learns the vertex exists.
    pub(crate) fn connect_progress_from_state(
        &self,
        actives: &HashMap<Digest, Arc<VertexState>>,
        target: &Arc<VertexState>,
        src: &Arc<VertexState>,
    ) {
        let (jobs, parents) = {
            let core = src.core.lock().unwrap();
            (
                core.jobs.values().cloned().collect::<Vec<_>>(),
                core.parents.iter().copied().collect::<Vec<_>>(),
            )
        };

        for job in jobs {
            let pw = job.pw();
            let span = job.span();
            let mut all_pw = target.all_pw.lock().unwrap();
            if all_pw.insert(pw.id()) {
                target.mpw.add(pw.clone());
                pw.write(ProgressRecord {
                    id: Uuid::new_v4().to_string(),
                    vertex: target.client_vertex.clone(),
                });
                if !span.is_none() {
                    target.mspan.add(span);
                }
            }
        }

        for p in parents {
            if let Some(ps) = actives.get(&p) {
                self.connect_progress_from_state(actives, target, ps);
            }
        }
    }

    pub(crate) fn get_state(&self, e: &Edge) -> Option<Arc<VertexState>> {
        self.actives.read().unwrap().get(&e.vertex.digest()).cloned()
    }

    /// The representative edge record for `e`, or None when its vertex has
    /// no active state.
    pub(crate) fn get_edge(&self, e: &Edge) -> Option<Arc<EdgeRecord>> {
        let st = self.get_state(e)?;
        st.get_edge(e.index).ok()
    }

    /// Redirects `e` to an equivalent representative edge discovered
    /// through the cache-key index.
    pub(crate) fn set_edge(&self, e: &Edge, target: &Arc<EdgeRecord>) {
        let actives = self.actives.read().unwrap();
        let Some(st) = actives.get(&e.vertex.digest()).cloned() else {
            return;
        };
        // An absent representative state is fine: the merge then only
        // redirects the edge pointer and skips the job/progress union.
        let target_st = actives.get(&target.edge.vertex.digest()).cloned();
        if let Err(err) = st.set_edge(e.index, target, target_st.as_ref(), &actives) {
            tracing::error!(vertex = %e.vertex.digest(), "edge merge failed: {err:#}");
        }
    }

    /// Reports whether `owner` owns `target` (or any of its sibling edges),
    /// directly or transitively. Schedulers use this to avoid creating
    /// ownership cycles.
    pub(crate) fn has_owner(&self, target: &Edge, owner: &Edge) -> bool {
        let actives = self.actives.read().unwrap();
        let Some(st) = actives.get(&target.vertex.digest()) else {
            return false;
        };

        let collect_owners = |st: &Arc<VertexState>| {
            let core = st.core.lock().unwrap();
            core.edges
                .values()
                .filter_map(|e| e.owner())
                .map(|o| o.edge.clone())
                .collect::<Vec<_>>()
        };

        let mut owners = collect_owners(st);
        while !owners.is_empty() {
            let mut next = Vec::new();
            for oe in owners {
                let Some(ost) = actives.get(&oe.vertex.digest()) else {
                    continue;
                };
                if ost.vtx.digest() == owner.vertex.digest() {
                    return true;
                }
                next.extend(collect_owners(ost));
            }
            owners = next;
        }
        false
    }

    /// Builds an edge on behalf of an op of `parent` (a sub-build). The
    /// subtree is linked under the parent so it is torn down with it.
    pub(crate) fn sub_build(
        self: &Arc<Self>,
        ctx: &Context,
        mut e: Edge,
        parent: &Arc<dyn Vertex>,
    ) -> anyhow::Result<CachedResult> {
        let v = self.load(&e.vertex, Some(parent), None)?;
        e.vertex = v;
        self.sched.build(ctx, &e)
    }

    /// Removes `job` from every active state and reclaims states left with
    /// no referent.
    pub(crate) fn discard_job(&self, job: &Job) {
        let mut actives = self.actives.write().unwrap();
        let keys: Vec<Digest> = actives.keys().copied().collect();
        for k in keys {
            let Some(st) = actives.get(&k).cloned() else {
                continue;
            };
            let removed = st.core.lock().unwrap().jobs.remove(job.id()).is_some();
            st.all_pw.lock().unwrap().remove(&job.pw_id());
            if removed {
                tracing::debug!(job = %job.id(), vertex = %st.vtx.name(), "deleting job from state");
                self.delete_if_unreferenced(&mut actives, k, &st);
            }
        }
    }

    /// Reclaims a state with no jobs and no parents, cascading into
    /// children that become orphaned by its removal. Terminates because
    /// the child graph is acyclic.
    pub(crate) fn delete_if_unreferenced(
        &self,
        actives: &mut HashMap<Digest, Arc<VertexState>>,
        k: Digest,
        st: &Arc<VertexState>,
    ) {
        let (unreferenced, children) = {
            let core = st.core.lock().unwrap();
            (
                core.jobs.is_empty() && core.parents.is_empty(),
                core.child_vtx.iter().copied().collect::<Vec<_>>(),
            )
        };
        if !unreferenced {
            return;
        }

        tracing::debug!(vertex = %st.vtx.name(), digest = %k, "deleting unreferenced active vertex");
        for ch in children {
            if let Some(child) = actives.get(&ch).cloned() {
                child.core.lock().unwrap().parents.remove(&k);
                self.delete_if_unreferenced(actives, ch, &child);
            }
        }
        st.release(&self.index);
        actives.remove(&k);
    }
}

fn link_parent(
    parent_st: &Arc<VertexState>,
    parent_dgst: Digest,
    st: &Arc<VertexState>,
    dgst: Digest,
) {
    let inserted = st.core.lock().unwrap().parents.insert(parent_dgst);
    if !inserted {
        return;
    }
    parent_st.core.lock().unwrap().child_vtx.insert(dgst);

    let parent_cache: Vec<_> = {
        let core = parent_st.core.lock().unwrap();
        core.cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    let mut core = st.core.lock().unwrap();
    for (cid, cache) in parent_cache {
        core.cache.entry(cid).or_insert(cache);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::digest::Digest;
    use crate::error::has_cancelled;
    use crate::testutil::{TestSetup, solver_with, vtx, vtx_opts};
    use crate::vertex::VertexOptions;

    fn edge(v: Arc<dyn Vertex>) -> Edge {
        Edge::new(v, 0)
    }

    fn active_count(solver: &Solver) -> usize {
        solver.shared().actives.read().unwrap().len()
    }

    #[test]
    fn test_dedup_across_jobs() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let a = solver.new_job("a").unwrap();
        let b = solver.new_job("b").unwrap();

        let (gate_tx, gate_rx) = unbounded::<()>();
        setup.set_exec_hook(
            "v1",
            Arc::new(move |_, _| {
                gate_rx.recv().unwrap();
                Ok(())
            }),
        );

        let (ra, rb) = thread::scope(|s| {
            let ha = s.spawn(|| a.build(&Context::background(), edge(vtx("v1", vec![]))));
            let hb = s.spawn(|| b.build(&Context::background(), edge(vtx("v1", vec![]))));
            // both callers join the same flight before the op finishes
            thread::sleep(Duration::from_millis(200));
            gate_tx.send(()).unwrap();
            (ha.join().unwrap().unwrap(), hb.join().unwrap().unwrap())
        });

        assert_eq!(ra.cached().result.id(), rb.cached().result.id());
        assert_eq!(setup.execs_of("v1"), 1);
        assert_eq!(
            setup
                .cache_map_log
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.as_str() == "v1")
                .count(),
            1
        );
        assert_eq!(active_count(&solver), 1);

        a.discard_after(Duration::from_millis(50));
        {
            let actives = solver.shared().actives.read().unwrap();
            assert_eq!(actives.len(), 1);
            let st = actives.values().next().unwrap();
            let core = st.core.lock().unwrap();
            assert!(core.jobs.contains_key("b"));
            assert!(!core.jobs.contains_key("a"));
        }

        b.discard_after(Duration::from_millis(50));
        assert_eq!(active_count(&solver), 0);

        thread::sleep(Duration::from_millis(300));
        assert!(matches!(
            solver.get_with_timeout("a", Duration::from_millis(50)),
            Err(SolverError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_loading_same_dag_twice_is_noop() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let job = solver.new_job("j").unwrap();

        let dag = || {
            let c = vtx("c", vec![]);
            vtx("p", vec![edge(c)])
        };

        job.build(&Context::background(), edge(dag())).unwrap();
        assert_eq!(active_count(&solver), 2);
        assert_eq!(setup.execs_of("p"), 1);
        assert_eq!(setup.execs_of("c"), 1);

        job.build(&Context::background(), edge(dag())).unwrap();
        assert_eq!(active_count(&solver), 2);
        assert_eq!(setup.execs_of("p"), 1);
        assert_eq!(setup.execs_of("c"), 1);
    }

    #[test]
    fn test_parent_teardown_cascades() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let job = solver.new_job("j").unwrap();

        let c1 = vtx("c1", vec![]);
        let c2 = vtx("c2", vec![]);
        let p = vtx("p", vec![edge(c1), edge(c2)]);
        job.build(&Context::background(), edge(p)).unwrap();

        let p_dgst = Digest::hash(b"p");
        {
            let actives = solver.shared().actives.read().unwrap();
            assert_eq!(actives.len(), 3);
            for name in ["c1", "c2"] {
                let st = actives.get(&Digest::hash(name.as_bytes())).unwrap();
                let core = st.core.lock().unwrap();
                assert_eq!(core.parents.iter().copied().collect::<Vec<_>>(), [p_dgst]);
            }
            let p_st = actives.get(&p_dgst).unwrap();
            assert_eq!(p_st.core.lock().unwrap().child_vtx.len(), 2);
        }

        job.discard_after(Duration::from_millis(50));
        assert_eq!(active_count(&solver), 0);
    }

    #[test]
    fn test_ignore_cache_asymmetry() {
        // !ignorecache first, then ignorecache: the newcomer gets its own
        // rewritten identity
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let a = solver.new_job("a").unwrap();
        let b = solver.new_job("b").unwrap();

        a.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();
        assert_eq!(active_count(&solver), 1);

        let ignoring = vtx_opts(
            "v",
            vec![],
            VertexOptions {
                ignore_cache: true,
                ..Default::default()
            },
        );
        b.build(&Context::background(), edge(ignoring)).unwrap();
        assert_eq!(active_count(&solver), 2);
        assert_eq!(setup.execs_of("v"), 2);
    }

    #[test]
    fn test_ignore_cache_absorbs_reverse() {
        // ignorecache first, then !ignorecache: the existing state is reused
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let a = solver.new_job("a").unwrap();
        let b = solver.new_job("b").unwrap();

        let ignoring = vtx_opts(
            "v",
            vec![],
            VertexOptions {
                ignore_cache: true,
                ..Default::default()
            },
        );
        a.build(&Context::background(), edge(ignoring)).unwrap();
        assert_eq!(active_count(&solver), 1);

        b.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();
        assert_eq!(active_count(&solver), 1);
        assert_eq!(setup.execs_of("v"), 1);
    }

    #[test]
    fn test_merge_via_slow_cache() {
        let setup = Arc::new(TestSetup::default());

        // v2 and v2prime run the same operation over inputs whose content
        // digests agree, so their cache keys unify
        let shared_cm = Digest::hash(b"shared-op");
        {
            let mut cm = setup.cm_digests.lock().unwrap();
            cm.insert("v2".to_string(), shared_cm);
            cm.insert("v2prime".to_string(), shared_cm);
        }
        {
            let mut slow = setup.slow.lock().unwrap();
            for name in ["v2", "v2prime"] {
                slow.insert(
                    name.to_string(),
                    Arc::new(|_: &Context, _: &crate::result::SharedResult, _: &dyn crate::op::SessionGroup| {
                        Ok(Digest::hash(b"d4"))
                    }),
                );
            }
        }

        let solver = solver_with(&setup);
        let b = solver.new_job("b").unwrap();
        let a = solver.new_job("a").unwrap();

        let v2p = vtx("v2prime", vec![edge(vtx("v4", vec![]))]);
        let rb = b.build(&Context::background(), edge(v2p)).unwrap();

        let v2 = vtx("v2", vec![edge(vtx("v3", vec![]))]);
        let ra = a.build(&Context::background(), edge(v2.clone())).unwrap();

        // the redundant edge was never executed; both jobs share one result
        assert_eq!(setup.execs_of("v2prime"), 1);
        assert_eq!(setup.execs_of("v2"), 0);
        assert_eq!(ra.cached().result.id(), rb.cached().result.id());

        let shared = solver.shared();
        let v2_vtx = {
            let actives = shared.actives.read().unwrap();
            actives[&Digest::hash(b"v2")].vtx.clone()
        };
        let rec = shared.get_edge(&Edge::new(v2_vtx, 0)).unwrap();
        assert_eq!(rec.edge.vertex.digest(), Digest::hash(b"v2prime"));

        // ownership is visible through the owner chain
        let v2_st = shared.get_state(&edge(v2)).unwrap();
        let v2p_st = {
            let actives = shared.actives.read().unwrap();
            actives[&Digest::hash(b"v2prime")].clone()
        };
        assert!(shared.has_owner(
            &Edge::new(v2_st.vtx.clone(), 0),
            &Edge::new(v2p_st.vtx.clone(), 0)
        ));

        // job A was unioned into the representative and its input closure
        for name in ["v2prime", "v4"] {
            let actives = shared.actives.read().unwrap();
            let st = actives.get(&Digest::hash(name.as_bytes())).unwrap();
            assert!(
                st.core.lock().unwrap().jobs.contains_key("a"),
                "job a missing on {name}"
            );
        }
    }

    #[test]
    fn test_progress_fanout_retroactive() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let a = solver.new_job("a").unwrap();

        let (gate_tx, gate_rx) = unbounded::<()>();
        setup.set_exec_hook(
            "root",
            Arc::new(move |_, _| {
                gate_rx.recv().unwrap();
                Ok(())
            }),
        );

        let dag = || {
            let leaf = vtx("leaf", vec![]);
            let mid = vtx("mid", vec![edge(leaf)]);
            vtx("root", vec![edge(mid)])
        };

        thread::scope(|s| {
            let ha = s.spawn(|| a.build(&Context::background(), edge(dag())));

            // wait until the deep build is in flight, then join mid-way
            thread::sleep(Duration::from_millis(200));
            let b = solver.new_job("b").unwrap();
            let events = b.progress().subscribe();

            let mid = vtx("mid", vec![edge(vtx("leaf", vec![]))]);
            b.build(&Context::background(), edge(mid)).unwrap();

            let mut seen = std::collections::HashSet::new();
            while let Ok(rec) = events.recv_timeout(Duration::from_millis(200)) {
                seen.insert(rec.vertex.digest);
            }
            assert!(seen.contains(&Digest::hash(b"mid")));
            assert!(seen.contains(&Digest::hash(b"leaf")));

            gate_tx.send(()).unwrap();
            ha.join().unwrap().unwrap();
        });
    }

    #[test]
    fn test_get_waits_for_new_job() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);

        assert!(matches!(
            solver.get_with_timeout("nope", Duration::from_millis(100)),
            Err(SolverError::UnknownJob(_))
        ));

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                solver.new_job("late").unwrap();
            });
            let job = solver.get_with_timeout("late", Duration::from_secs(2)).unwrap();
            assert_eq!(job.id(), "late");
        });
    }

    #[test]
    fn test_new_job_id_clash() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        solver.new_job("dup").unwrap();
        assert!(matches!(
            solver.new_job("dup"),
            Err(SolverError::JobExists(_))
        ));
    }

    #[test]
    fn test_close_rejects_new_builds() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let job = solver.new_job("j").unwrap();

        solver.close();
        let err = job.build(&Context::background(), edge(vtx("v", vec![]))).unwrap_err();
        assert!(matches!(err, SolverError::Build(_)));
    }

    #[test]
    fn test_exec_failure_shared_not_retried() {
        let setup = Arc::new(TestSetup::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        {
            let attempts = attempts.clone();
            setup.set_exec_hook(
                "v",
                Arc::new(move |_, _| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("permanently broken")
                }),
            );
        }

        let solver = solver_with(&setup);
        let a = solver.new_job("a").unwrap();
        let b = solver.new_job("b").unwrap();

        let err = a.build(&Context::background(), edge(vtx("v", vec![]))).unwrap_err();
        assert!(format!("{err:#}").contains("permanently broken"));

        // the failure is memoised on the shared op; no second invocation
        let err = b.build(&Context::background(), edge(vtx("v", vec![]))).unwrap_err();
        assert!(format!("{err:#}").contains("permanently broken"));
        assert!(!has_cancelled(match &err {
            SolverError::Build(shared) => shared.inner(),
            other => panic!("unexpected error {other:?}"),
        }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
