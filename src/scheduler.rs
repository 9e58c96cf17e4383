use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::cache::{CacheKey, ExportableCacheKey};
use crate::context::Context;
use crate::digest::DigestBuilder;
use crate::edge::EdgeRecord;
use crate::error::SolverError;
use crate::flight;
use crate::result::{CachedResult, SharedResult};
use crate::solver::SolverShared;
use crate::vertex::Edge;

/// Depth-first reference scheduler.
///
/// Drives an edge to completion: collects the vertex's cache maps, builds
/// the inputs, derives the edge's cache key, registers its fingerprint in
/// the edge index (merging onto an equivalent edge when one is found),
/// queries the cache, and falls back to executing the op. Concurrent builds
/// of the same edge share one flight; finished edges memoise their result
/// on the edge record.
pub(crate) struct Scheduler {
    solver: Weak<SolverShared>,
    closed: AtomicBool,
    g: flight::Group<CachedResult>,
}

impl Scheduler {
    pub(crate) fn new(solver: Weak<SolverShared>) -> Self {
        Scheduler {
            solver,
            closed: AtomicBool::new(false),
            g: flight::Group::new(),
        }
    }

    pub(crate) fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn build(&self, ctx: &Context, e: &Edge) -> anyhow::Result<CachedResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow::Error::new(SolverError::Closed));
        }
        let solver = self
            .solver
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("solver is gone"))?;
        let rec = solver
            .get_edge(e)
            .ok_or_else(|| anyhow::anyhow!("no active state for {e:?}"))?;
        self.build_record(ctx, &solver, rec)
    }

    fn build_record(
        &self,
        ctx: &Context,
        solver: &Arc<SolverShared>,
        rec: Arc<EdgeRecord>,
    ) -> anyhow::Result<CachedResult> {
        let rec = rec.resolve();
        if let Some(res) = rec.result() {
            return Ok(res);
        }
        if ctx.cancelled() {
            return Err(ctx.err());
        }

        let key = format!("build-{}-{}", rec.edge.vertex.digest(), rec.edge.index);
        self.g.do_call(ctx, &key, |fctx| {
            if let Some(res) = rec.result() {
                return Ok(res);
            }

            let op = rec.op.clone();

            // 1. cache maps, in order, until the op declares the last one
            let mut maps = Vec::new();
            loop {
                let (cm, done) = op.cache_map(fctx, maps.len())?;
                maps.push(cm);
                if done {
                    break;
                }
            }

            // 2. inputs first; they may come from cache without executing
            let inputs = rec.edge.vertex.inputs();
            let input_results = self.build_inputs(fctx, &inputs)?;
            if fctx.cancelled() {
                return Err(fctx.err());
            }

            // 3. derive this edge's cache key
            let mut kb = DigestBuilder::default();
            for cm in &maps {
                kb.update(cm.digest.as_bytes());
            }
            let deps = maps.last().map(|cm| cm.deps.clone()).unwrap_or_default();
            for (i, dep) in deps.iter().enumerate().take(inputs.len()) {
                let dgst = match &dep.compute_digest {
                    Some(f) => op.calc_slow_cache(
                        fctx,
                        i,
                        dep.preprocess.clone(),
                        Some(f.clone()),
                        &input_results[i].result,
                    )?,
                    None => input_results[i]
                        .cache_keys
                        .first()
                        .map(|k| k.key.digest)
                        .unwrap_or_else(|| inputs[i].vertex.digest()),
                };
                if let Some(selector) = dep.selector {
                    kb.update(selector.as_bytes());
                }
                kb.update(dgst.as_bytes());
                kb.update(inputs[i].index.to_le_bytes());
            }
            kb.update(rec.edge.index.to_le_bytes());
            let ck = CacheKey {
                digest: kb.finish(),
                output: rec.edge.index,
            };

            // 4. cross-vertex equivalence: a foreign edge under the same
            // fingerprint means both compute the same thing. Ignore-cache
            // edges stay out of the index; they must not adopt anyone
            // else's result.
            let fp = ck.digest.to_hex();
            if !op.ignore_cache() {
                if let Some(other_rec) = self.find_equivalent(solver, &rec, &fp) {
                    tracing::debug!(
                        from = %rec.edge.vertex.digest(),
                        to = %other_rec.edge.vertex.digest(),
                        "merging equivalent edges"
                    );
                    solver.set_edge(&rec.edge, &other_rec);
                    return self.build_record(fctx, solver, other_rec);
                }
            }

            // 5. cache lookup
            if !op.ignore_cache() {
                let cache = op.cache()?;
                match cache.records(fctx, &ck) {
                    Ok(records) if !records.is_empty() => {
                        match op.load_cache(fctx, &records[0]) {
                            Ok(result) => {
                                let res = CachedResult {
                                    result,
                                    cache_keys: vec![ExportableCacheKey {
                                        key: ck,
                                        manager_id: records[0].manager_id.clone(),
                                    }],
                                };
                                rec.set_result(res.clone());
                                return Ok(res);
                            }
                            Err(err) => {
                                tracing::warn!("cache load failed, executing: {err:#}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!("cache query failed: {err:#}"),
                }
            }

            // 6. execute and save
            let shared_inputs: Vec<SharedResult> =
                input_results.iter().map(|r| r.result.clone()).collect();
            let (outputs, exporters) = op.exec(fctx, &shared_inputs)?;
            let result = outputs
                .into_iter()
                .nth(rec.edge.index)
                .ok_or_else(|| anyhow::anyhow!("op produced no output {}", rec.edge.index))?;

            let mut cache_keys = Vec::new();
            match op.cache()?.save(fctx, &ck, &result) {
                Ok(exported) => cache_keys.push(exported),
                Err(err) => tracing::warn!("cache save failed: {err:#}"),
            }
            cache_keys.extend(exporters);

            let res = CachedResult { result, cache_keys };
            rec.set_result(res.clone());
            Ok(res)
        })
    }

    /// Registers the fingerprint for `rec`, returning the representative of
    /// an equivalent foreign edge when the index already maps the
    /// fingerprint to one.
    fn find_equivalent(
        &self,
        solver: &Arc<SolverShared>,
        rec: &Arc<EdgeRecord>,
        fp: &str,
    ) -> Option<Arc<EdgeRecord>> {
        let our_key = rec.key();
        let Some(other_key) = solver.index.load_or_store(fp, our_key) else {
            rec.add_fingerprint(fp.to_string());
            return None;
        };

        let other_st = {
            let actives = solver.actives.read().unwrap();
            actives.get(&other_key.0).cloned()
        };
        let other_rec = other_st
            .and_then(|st| st.get_edge(other_key.1).ok())
            .map(|r| r.resolve());

        match other_rec {
            Some(other_rec)
                if other_rec.edge.vertex.digest() != rec.edge.vertex.digest()
                    && !solver.has_owner(&other_rec.edge, &rec.edge) =>
            {
                Some(other_rec)
            }
            // Would-be ownership cycle (or chain already leads back to us):
            // build independently, leave the index entry alone.
            Some(_) => None,
            None => {
                // Stale entry whose state is gone: claim the fingerprint.
                solver.index.release(fp, &other_key);
                solver.index.load_or_store(fp, our_key);
                rec.add_fingerprint(fp.to_string());
                None
            }
        }
    }

    fn build_inputs(&self, ctx: &Context, inputs: &[Edge]) -> anyhow::Result<Vec<CachedResult>> {
        match inputs {
            [] => Ok(Vec::new()),
            [one] => Ok(vec![self.build(ctx, one)?]),
            many => {
                let results: Vec<anyhow::Result<CachedResult>> = std::thread::scope(|s| {
                    let handles: Vec<_> = many
                        .iter()
                        .map(|e| {
                            let ctx = ctx.clone();
                            s.spawn(move || self.build(&ctx, e))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|h| {
                            h.join()
                                .unwrap_or_else(|_| Err(anyhow::anyhow!("input build panicked")))
                        })
                        .collect()
                });
                results.into_iter().collect()
            }
        }
    }
}
