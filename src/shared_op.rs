use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::Dynamic;
use crate::cache::{
    CacheManager, CacheMap, CacheOpts, CacheRecord, ExportableCacheKey, PreprocessFunc,
    ResultBasedCacheFunc,
};
use crate::context::Context;
use crate::error::{
    OpError, SharedError, SlowCacheError, VertexError, has_cancelled, release_error_resources,
};
use crate::flight;
use crate::op::{Builder, ResolveOpFunc};
use crate::progress::{PROGRESS_OPT_KEY, ProgressController, notify_started};
use crate::result::SharedResult;
use crate::state::{SubBuilder, VertexState};
use crate::trace::start_span;

/// The memoised products of one execution.
pub(crate) struct ExecRes {
    pub(crate) outputs: Vec<SharedResult>,
    pub(crate) exporters: Vec<ExportableCacheKey>,
}

pub(crate) struct ResolvedOp {
    pub(crate) op: Box<dyn crate::op::Op>,
    pub(crate) builder: Arc<SubBuilder>,
}

#[derive(Default)]
struct OpMemo {
    cache_res: Vec<Arc<CacheMap>>,
    cache_done: bool,
    cache_err: Option<SharedError>,
    exec_res: Option<Arc<ExecRes>>,
    exec_done: bool,
    exec_err: Option<SharedError>,
}

#[derive(Default)]
struct SlowMemo {
    res: HashMap<usize, crate::digest::Digest>,
    err: HashMap<usize, SharedError>,
}

/// Single-flight wrapper around a vertex's op.
///
/// For each logical computation attached to the vertex (every cache-map
/// level, the execution, each per-input content digest) exactly one caller
/// does the work and all concurrent callers receive the same outcome.
/// Successful results are memoised for the life of the vertex state.
/// Failures are memoised too, with one exception: an error produced purely
/// by cancellation is discarded, so a later caller may retry.
pub(crate) struct SharedOp {
    st: Weak<VertexState>,
    resolver: ResolveOpFunc,
    resolved: OnceLock<Result<ResolvedOp, SharedError>>,
    g_cache: flight::Group<(Vec<Arc<CacheMap>>, bool)>,
    g_exec: flight::Group<Arc<ExecRes>>,
    g_digest: flight::Group<crate::digest::Digest>,
    memo: Mutex<OpMemo>,
    slow: Mutex<SlowMemo>,
}

impl SharedOp {
    pub(crate) fn new(resolver: ResolveOpFunc, st: Weak<VertexState>) -> Arc<Self> {
        Arc::new(SharedOp {
            st,
            resolver,
            resolved: OnceLock::new(),
            g_cache: flight::Group::new(),
            g_exec: flight::Group::new(),
            g_digest: flight::Group::new(),
            memo: Mutex::new(OpMemo::default()),
            slow: Mutex::new(SlowMemo::default()),
        })
    }

    fn state(&self) -> anyhow::Result<Arc<VertexState>> {
        self.st
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("vertex state released"))
    }

    /// Resolves the op on first use. Resolution failures are shared with
    /// every subsequent caller.
    fn get_op(&self) -> anyhow::Result<&ResolvedOp> {
        let st = self.state()?;
        let res = self.resolved.get_or_init(|| {
            let builder = Arc::new(SubBuilder::new(self.st.clone()));
            let dyn_builder: Arc<dyn Builder> = builder.clone();
            match (self.resolver)(&st.vtx, &dyn_builder) {
                Ok(op) => Ok(ResolvedOp { op, builder }),
                Err(err) => Err(SharedError::new(err)),
            }
        });
        match res {
            Ok(resolved) => Ok(resolved),
            Err(err) => Err(err.clone().into()),
        }
    }

    /// The resolved op, if resolution has happened. Used by the provenance
    /// walk to probe capabilities without forcing resolution.
    pub(crate) fn resolved(&self) -> Option<&ResolvedOp> {
        match self.resolved.get() {
            Some(Ok(resolved)) => Some(resolved),
            _ => None,
        }
    }

    pub(crate) fn ignore_cache(&self) -> bool {
        self.st
            .upgrade()
            .is_some_and(|st| st.vtx.options().ignore_cache)
    }

    /// The vertex's cache, with `records` queries augmented by ancestor
    /// cache options so remote providers see the chain they are queried
    /// under.
    pub(crate) fn cache(&self) -> anyhow::Result<Arc<dyn CacheManager>> {
        let st = self.state()?;
        Ok(Arc::new(CacheWithAncestorOpts {
            inner: st.combined_cache_manager(),
            st: self.st.clone(),
        }))
    }

    pub(crate) fn load_cache(
        &self,
        ctx: &Context,
        rec: &CacheRecord,
    ) -> anyhow::Result<SharedResult> {
        let st = self.state()?;
        let mut ctx = ctx.with_progress(st.mpw.writer());
        if let Some(span) = st.mspan.primary() {
            ctx = ctx.with_span(span);
        }

        let span = start_span(&st.mspan, "load cache", &st.digest);
        *st.exec_span.lock().unwrap() = Some(span.clone());
        let ctx = ctx.with_span(span.clone());
        let _enter = span.enter();

        let notify = notify_started(&ctx, &st.client_vertex, true);
        let res = self
            .cache()?
            .load(&with_ancestor_cache_opts(&ctx, &st), rec);
        notify(res.as_ref().err(), true);
        res
    }

    /// Returns the `index`-th cache map for the vertex plus a flag set when
    /// the op declared no more maps.
    pub(crate) fn cache_map(
        &self,
        ctx: &Context,
        index: usize,
    ) -> anyhow::Result<(Arc<CacheMap>, bool)> {
        self.cache_map_inner(ctx, index)
            .map_err(|err| self.wrap_op_vertex(err))
    }

    fn cache_map_inner(
        &self,
        ctx: &Context,
        index: usize,
    ) -> anyhow::Result<(Arc<CacheMap>, bool)> {
        let st = self.state()?;
        let resolved = self.get_op()?;

        let key = format!("cachemap-{index}");
        let (maps, _) = self.g_cache.do_call(ctx, &key, |fctx| {
            let num = {
                let memo = self.memo.lock().unwrap();
                if (!memo.cache_res.is_empty() && memo.cache_done)
                    || index < memo.cache_res.len()
                {
                    return Ok((memo.cache_res.clone(), memo.cache_done));
                }
                if let Some(err) = &memo.cache_err {
                    return Err(err.clone().into());
                }
                memo.cache_res.len()
            };

            let mut fctx = fctx.with_progress(st.mpw.writer());
            if let Some(span) = st.mspan.primary() {
                fctx = fctx.with_span(span);
            }
            let fctx = with_ancestor_cache_opts(&fctx, &st);

            // Leaf vertices never reach the exec phase on a cache hit, so
            // surface the cache request itself as the vertex activity.
            let notify = if st.vtx.inputs().is_empty() {
                let span = start_span(&st.mspan, "cache request", &st.digest);
                Some((span, notify_started(&fctx, &st.client_vertex, false)))
            } else {
                None
            };

            let res = resolved.op.cache_map(&fctx, st.as_ref(), num);
            match res {
                Ok((mut cm, done)) => {
                    cm.opts.insert(
                        PROGRESS_OPT_KEY.to_string(),
                        Arc::new(ProgressController {
                            digest: st.vtx.digest(),
                            name: st.vtx.name(),
                            progress_group: st.vtx.options().progress_group.clone(),
                            writer: st.mpw.writer(),
                        }) as Dynamic,
                    );
                    let mut memo = self.memo.lock().unwrap();
                    memo.cache_res.push(Arc::new(cm));
                    memo.cache_done = done;
                    if let Some((_span, complete)) = notify {
                        complete(None, false);
                    }
                    Ok((memo.cache_res.clone(), done))
                }
                Err(err) => {
                    let err = if fctx.cancelled() && has_cancelled(&err) {
                        // Not memoised; a later caller may retry.
                        release_error_resources(&err);
                        fctx.err().context(err.to_string())
                    } else {
                        let shared = SharedError::new(err);
                        self.memo.lock().unwrap().cache_err = Some(shared.clone());
                        shared.into()
                    };
                    if let Some((_span, complete)) = notify {
                        complete(Some(&err), false);
                    }
                    Err(err)
                }
            }
        })?;

        if maps.len() <= index {
            // Concurrent producers advanced the array past our request;
            // never report "not enough maps" as an outcome.
            return self.cache_map_inner(ctx, index);
        }

        let done = self.memo.lock().unwrap().cache_done;
        Ok((maps[index].clone(), done))
    }

    /// Runs the op over the evaluated inputs. At most one execution per
    /// vertex state ever succeeds; all callers share it.
    pub(crate) fn exec(
        &self,
        ctx: &Context,
        inputs: &[SharedResult],
    ) -> anyhow::Result<(Vec<SharedResult>, Vec<ExportableCacheKey>)> {
        self.exec_inner(ctx, inputs)
            .map_err(|err| self.wrap_op_vertex(err))
    }

    fn exec_inner(
        &self,
        ctx: &Context,
        inputs: &[SharedResult],
    ) -> anyhow::Result<(Vec<SharedResult>, Vec<ExportableCacheKey>)> {
        let st = self.state()?;
        let resolved = self.get_op()?;

        let res = self.g_exec.do_call(ctx, "exec", |fctx| {
            {
                let memo = self.memo.lock().unwrap();
                if memo.exec_done {
                    if let Some(err) = &memo.exec_err {
                        return Err(err.clone().into());
                    }
                    if let Some(res) = &memo.exec_res {
                        return Ok(res.clone());
                    }
                }
            }

            use anyhow::Context as _;
            let _release = resolved
                .op
                .acquire(fctx)
                .context("acquire op resources")?;

            let mut fctx = fctx.with_progress(st.mpw.writer());
            if let Some(span) = st.mspan.primary() {
                fctx = fctx.with_span(span);
            }
            let fctx = with_ancestor_cache_opts(&fctx, &st);

            let span = start_span(&st.mspan, "exec", &st.digest);
            *st.exec_span.lock().unwrap() = Some(span.clone());
            let fctx = fctx.with_span(span.clone());
            let _enter = span.enter();

            let notify = notify_started(&fctx, &st.client_vertex, false);
            match resolved.op.exec(&fctx, st.as_ref(), inputs) {
                Ok(outputs) => {
                    let exec = Arc::new(ExecRes {
                        outputs: outputs.into_iter().map(SharedResult::new).collect(),
                        exporters: resolved.builder.exporters(),
                    });
                    let mut memo = self.memo.lock().unwrap();
                    memo.exec_done = true;
                    memo.exec_res = Some(exec.clone());
                    drop(memo);
                    notify(None, false);
                    Ok(exec)
                }
                Err(err) => {
                    let err = if fctx.cancelled() && has_cancelled(&err) {
                        // Not memoised; a later caller may retry.
                        release_error_resources(&err);
                        fctx.err().context(err.to_string())
                    } else {
                        let shared = SharedError::new(err);
                        let mut memo = self.memo.lock().unwrap();
                        memo.exec_done = true;
                        memo.exec_err = Some(shared.clone());
                        shared.into()
                    };
                    notify(Some(&err), false);
                    Err(err)
                }
            }
        })?;

        Ok((res.outputs.clone(), res.exporters.clone()))
    }

    /// Computes the content digest of an already-evaluated input, the
    /// "slow" half of cache-key derivation.
    pub(crate) fn calc_slow_cache(
        &self,
        ctx: &Context,
        index: usize,
        preprocess: Option<PreprocessFunc>,
        compute: Option<ResultBasedCacheFunc>,
        res: &SharedResult,
    ) -> anyhow::Result<crate::digest::Digest> {
        self.calc_slow_cache_inner(ctx, index, preprocess, compute, res)
            .map_err(|err| {
                let err = err.context(SlowCacheError {
                    index,
                    result: res.clone(),
                });
                self.wrap_op_vertex(err)
            })
    }

    fn calc_slow_cache_inner(
        &self,
        ctx: &Context,
        index: usize,
        preprocess: Option<PreprocessFunc>,
        mut compute: Option<ResultBasedCacheFunc>,
        res: &SharedResult,
    ) -> anyhow::Result<crate::digest::Digest> {
        let st = self.state()?;

        let key = format!("slow-compute-{index}");
        let result = self.g_digest.do_call(ctx, &key, |fctx| {
            {
                let slow = self.slow.lock().unwrap();
                if let Some(dgst) = slow.res.get(&index) {
                    return Ok(*dgst);
                }
                if let Some(err) = slow.err.get(&index) {
                    return Err(err.clone().into());
                }
            }

            let mut failure: Option<anyhow::Error> = None;

            if let Some(p) = &preprocess {
                // The preprocess step runs in the *input's* progress and
                // span context, not this vertex's.
                let input = st.vtx.inputs().into_iter().nth(index).ok_or_else(|| {
                    anyhow::anyhow!("no input {index} on {}", st.vtx.name())
                })?;
                let solver = st
                    .solver
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("solver is gone"))?;
                let child = solver.get_state(&input).ok_or_else(|| {
                    anyhow::anyhow!("failed to get state for input {index} on {}", st.vtx.name())
                })?;
                let mut pctx = fctx.with_progress(child.mpw.writer());
                if let Some(span) = child.exec_span.lock().unwrap().clone() {
                    pctx = pctx.with_span(span);
                } else if let Some(span) = child.mspan.primary() {
                    pctx = pctx.with_span(span);
                }
                if let Err(err) = p(&pctx, res, child.as_ref()) {
                    compute = None;
                    failure = Some(err);
                }
            }

            let mut dgst = crate::digest::Digest::default();
            if let Some(f) = &compute {
                let mut cctx = fctx.with_progress(st.mpw.writer());
                if let Some(span) = st.mspan.primary() {
                    cctx = cctx.with_span(span);
                }
                let cctx = with_ancestor_cache_opts(&cctx, &st);
                match f(&cctx, res, st.as_ref()) {
                    Ok(d) => dgst = d,
                    Err(err) => failure = Some(err),
                }
            }

            match failure {
                None => {
                    self.slow.lock().unwrap().res.insert(index, dgst);
                    Ok(dgst)
                }
                Some(err) => {
                    if fctx.cancelled() && has_cancelled(&err) {
                        // Not memoised; a later caller may retry.
                        release_error_resources(&err);
                        return Err(fctx.err().context(err.to_string()));
                    }
                    let shared = SharedError::new(err);
                    self.slow.lock().unwrap().err.insert(index, shared.clone());
                    Err(shared.into())
                }
            }
        });

        if let Err(err) = &result {
            let mut nctx = ctx.with_progress(st.mpw.writer());
            if let Some(span) = st.mspan.primary() {
                nctx = nctx.with_span(span);
            }
            let notify = notify_started(&nctx, &st.client_vertex, false);
            notify(Some(err), false);
        }
        result
    }

    /// A snapshot of the cache maps produced so far, used to expose this
    /// vertex's options to descendant cache queries.
    pub(crate) fn cache_maps_snapshot(&self) -> Vec<Arc<CacheMap>> {
        self.memo.lock().unwrap().cache_res.clone()
    }

    /// Releases memoised exec results. Releasing may block on I/O, so each
    /// result gets its own detached thread.
    pub(crate) fn release(&self) {
        let memo = self.memo.lock().unwrap();
        if let Some(exec) = &memo.exec_res {
            for r in exec.outputs.iter().cloned() {
                std::thread::spawn(move || {
                    if let Err(err) = r.release() {
                        tracing::warn!("failed to release result {}: {err:#}", r.id());
                    }
                });
            }
        }
    }

    fn wrap_op_vertex(&self, err: anyhow::Error) -> anyhow::Error {
        match self.st.upgrade() {
            Some(st) => err
                .context(OpError {
                    sys: Some(st.vtx.sys()),
                    description: st.vtx.options().description.clone(),
                })
                .context(VertexError {
                    digest: st.orig_digest,
                }),
            None => err,
        }
    }
}

struct CacheWithAncestorOpts {
    inner: Arc<dyn CacheManager>,
    st: Weak<VertexState>,
}

impl CacheManager for CacheWithAncestorOpts {
    fn id(&self) -> String {
        self.inner.id()
    }

    fn records(
        &self,
        ctx: &Context,
        key: &crate::cache::CacheKey,
    ) -> anyhow::Result<Vec<CacheRecord>> {
        // Remote providers may resolve keys during the existence check, so
        // they get the ancestor chain here as well.
        match self.st.upgrade() {
            Some(st) => self.inner.records(&with_ancestor_cache_opts(ctx, &st), key),
            None => self.inner.records(ctx, key),
        }
    }

    fn load(&self, ctx: &Context, rec: &CacheRecord) -> anyhow::Result<SharedResult> {
        self.inner.load(ctx, rec)
    }

    fn save(
        &self,
        ctx: &Context,
        key: &crate::cache::CacheKey,
        res: &SharedResult,
    ) -> anyhow::Result<ExportableCacheKey> {
        self.inner.save(ctx, key, res)
    }
}

/// Attaches the cache options of `st` and its ancestors to the context,
/// nearest first.
pub(crate) fn with_ancestor_cache_opts(ctx: &Context, st: &Arc<VertexState>) -> Context {
    let Some(solver) = st.solver.upgrade() else {
        return ctx.clone();
    };

    let mut opts: Vec<CacheOpts> = Vec::new();
    let mut visited: HashSet<crate::digest::Digest> = HashSet::new();
    let mut queue: VecDeque<Arc<VertexState>> = VecDeque::from([st.clone()]);

    let actives = solver.actives.read().unwrap();
    while let Some(cur) = queue.pop_front() {
        if !visited.insert(cur.digest) {
            continue;
        }
        if let Some(op) = cur.op() {
            for cm in op.cache_maps_snapshot() {
                if !cm.opts.is_empty() {
                    opts.push(cm.opts.clone());
                }
            }
        }
        for parent in cur.parents_snapshot() {
            if let Some(ps) = actives.get(&parent) {
                queue.push_back(ps.clone());
            }
        }
    }

    if opts.is_empty() {
        return ctx.clone();
    }
    ctx.with_cache_opts(Arc::new(opts))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::{Cancelled, SolverError};
    use crate::op::SessionGroup;
    use crate::testutil::{TestSetup, solver_with, vtx};
    use crate::vertex::{Edge, Vertex};

    fn edge(v: Arc<dyn Vertex>) -> Edge {
        Edge::new(v, 0)
    }

    fn build_err_inner(err: &SolverError) -> &anyhow::Error {
        match err {
            SolverError::Build(shared) => shared.inner(),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_cancel_of_joiner_leaves_winner_running() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let a = solver.new_job("a").unwrap();
        let b = solver.new_job("b").unwrap();

        let (gate_tx, gate_rx) = crossbeam_channel::unbounded::<()>();
        setup.set_exec_hook(
            "v",
            Arc::new(move |_, _| {
                gate_rx.recv().unwrap();
                Ok(())
            }),
        );

        thread::scope(|s| {
            // B leads the flight and blocks on the gate
            let hb = s.spawn(|| b.build(&Context::background(), edge(vtx("v", vec![]))));
            thread::sleep(Duration::from_millis(100));

            // A joins, then cancels
            let (actx, cancel) = Context::background().with_cancel();
            let ha = s.spawn(move || a.build(&actx, edge(vtx("v", vec![]))));
            thread::sleep(Duration::from_millis(100));
            cancel.cancel("a gave up");

            let err = ha.join().unwrap().unwrap_err();
            assert!(
                build_err_inner(&err)
                    .chain()
                    .any(|c| c.downcast_ref::<Cancelled>().is_some())
            );

            // the computation keeps going for B
            gate_tx.send(()).unwrap();
            hb.join().unwrap().unwrap();
        });

        assert_eq!(setup.execs_of("v"), 1);
    }

    #[test]
    fn test_cancelled_sole_caller_is_not_memoised() {
        let setup = Arc::new(TestSetup::default());
        let attempts = Arc::new(AtomicUsize::new(0));
        {
            let attempts = attempts.clone();
            setup.set_exec_hook(
                "v",
                Arc::new(move |ctx, _| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    // simulate an op that aborts once its context dies
                    let deadline = std::time::Instant::now() + Duration::from_secs(5);
                    while !ctx.cancelled() {
                        if std::time::Instant::now() > deadline {
                            anyhow::bail!("op was never cancelled");
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(ctx.err())
                }),
            );
        }

        let solver = solver_with(&setup);
        let job = solver.new_job("j").unwrap();

        let (ctx, cancel) = Context::background().with_cancel();
        let err = thread::scope(|s| {
            let h = s.spawn(|| job.build(&ctx, edge(vtx("v", vec![]))));
            thread::sleep(Duration::from_millis(100));
            cancel.cancel("user cancelled");
            h.join().unwrap().unwrap_err()
        });
        assert!(
            build_err_inner(&err)
                .chain()
                .any(|c| c.downcast_ref::<Cancelled>().is_some())
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // the failure was not memoised: a later caller retries and succeeds
        setup.exec_hooks.lock().unwrap().remove("v");
        job.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();
        assert_eq!(setup.execs_of("v"), 1);
    }

    #[test]
    fn test_slow_cache_error_is_wrapped() {
        let setup = Arc::new(TestSetup::default());
        setup.slow.lock().unwrap().insert(
            "p".to_string(),
            Arc::new(|_: &Context, _: &SharedResult, _: &dyn SessionGroup| {
                anyhow::bail!("bad content")
            }),
        );

        let solver = solver_with(&setup);
        let job = solver.new_job("j").unwrap();

        let p = vtx("p", vec![edge(vtx("c", vec![]))]);
        let err = job.build(&Context::background(), edge(p)).unwrap_err();
        let inner = build_err_inner(&err);

        assert!(inner.downcast_ref::<VertexError>().is_some());
        assert!(inner.downcast_ref::<OpError>().is_some());
        let slow = inner.downcast_ref::<SlowCacheError>().unwrap();
        assert_eq!(slow.index, 0);
        assert!(format!("{inner:#}").contains("bad content"));
    }

    #[test]
    fn test_slow_cache_digest_memoised() {
        let setup = Arc::new(TestSetup::default());
        let computes = Arc::new(AtomicUsize::new(0));
        {
            let computes = computes.clone();
            setup.slow.lock().unwrap().insert(
                "p".to_string(),
                Arc::new(move |_: &Context, _: &SharedResult, _: &dyn SessionGroup| {
                    computes.fetch_add(1, Ordering::SeqCst);
                    Ok(crate::digest::Digest::hash(b"content"))
                }),
            );
        }

        let solver = solver_with(&setup);
        let a = solver.new_job("a").unwrap();
        let b = solver.new_job("b").unwrap();

        let dag = || vtx("p", vec![edge(vtx("c", vec![]))]);
        a.build(&Context::background(), edge(dag())).unwrap();
        b.build(&Context::background(), edge(dag())).unwrap();

        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exec_results_survive_for_all_jobs_until_release() {
        let setup = Arc::new(TestSetup::default());
        let solver = solver_with(&setup);
        let a = solver.new_job("a").unwrap();
        let b = solver.new_job("b").unwrap();

        let ra = a.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();
        b.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();
        a.discard_after(Duration::from_millis(50));

        // the state survives through B; the memoised result is still served
        let rb = b.build(&Context::background(), edge(vtx("v", vec![]))).unwrap();
        assert_eq!(ra.cached().result.id(), rb.cached().result.id());
        assert_eq!(setup.execs_of("v"), 1);
    }
}
