use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use tracing::Span;
use uuid::Uuid;

use crate::Dynamic;
use crate::context::Context;
use crate::digest::Digest;
use crate::error::{SharedError, SolverError};
use crate::op::{Builder, ProvenanceProvider, SessionCallback, Sessions};
use crate::progress::{MultiReader, Writer, WriterId};
use crate::result::CachedResult;
use crate::solver::SolverShared;
use crate::state::VertexState;
use crate::vertex::Edge;

/// How long a discarded job stays readable so late status requests can
/// still drain its progress.
pub(crate) const JOB_REMOVE_DELAY: Duration = Duration::from_secs(10);

/// A client handle into the solver. Every vertex a job submits is loaded
/// into the shared active graph under this job's ownership; progress for
/// all of them fans out to the job's progress reader.
pub struct Job {
    solver: Weak<SolverShared>,
    me: Weak<Job>,
    id: String,
    /// Internally generated, used for provenance; clients cannot pick it.
    unique_id: String,
    session_id: Mutex<String>,
    pw: Writer,
    pr: MultiReader,
    span: Mutex<Span>,
    started_time: SystemTime,
    completed_time: Mutex<Option<SystemTime>>,
    values: Mutex<HashMap<String, Dynamic>>,
}

impl Job {
    pub(crate) fn new(
        solver: Weak<SolverShared>,
        id: String,
        pw: Writer,
        pr: MultiReader,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Job {
            solver,
            me: me.clone(),
            id,
            unique_id: Uuid::new_v4().to_string(),
            session_id: Mutex::new(String::new()),
            pw,
            pr,
            span: Mutex::new(Span::none()),
            started_time: SystemTime::now(),
            completed_time: Mutex::new(None),
            values: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().unwrap().clone()
    }

    pub fn set_session_id(&self, id: impl Into<String>) {
        *self.session_id.lock().unwrap() = id.into();
    }

    pub fn started_time(&self) -> SystemTime {
        self.started_time
    }

    /// Stamps the completion time on first call and returns it.
    pub fn register_complete_time(&self) -> SystemTime {
        let mut completed = self.completed_time.lock().unwrap();
        *completed.get_or_insert_with(SystemTime::now)
    }

    /// The progress stream clients subscribe to.
    pub fn progress(&self) -> &MultiReader {
        &self.pr
    }

    pub(crate) fn pw(&self) -> Writer {
        self.pw.clone()
    }

    pub(crate) fn pw_id(&self) -> WriterId {
        self.pw.id()
    }

    pub(crate) fn span(&self) -> Span {
        self.span.lock().unwrap().clone()
    }

    /// Loads the edge's vertex subtree into the active graph under this job
    /// and drives the edge to completion.
    pub fn build(&self, ctx: &Context, mut e: Edge) -> Result<CachedResultWithProvenance, SolverError> {
        // adopt the caller's span so vertex spans link into its trace
        if !ctx.span().is_none() {
            *self.span.lock().unwrap() = ctx.span().clone();
        }

        let solver = self.solver.upgrade().ok_or(SolverError::Closed)?;
        let me = self.me.upgrade().ok_or(SolverError::Closed)?;

        let v = solver.load(&e.vertex, None, Some(&me))?;
        e.vertex = v;

        let res = solver
            .sched
            .build(ctx, &e)
            .map_err(|err| SolverError::Build(SharedError::new(err)))?;

        Ok(CachedResultWithProvenance {
            result: res,
            solver: self.solver.clone(),
            edge: Some(e),
        })
    }

    /// Removes this job from every active state and reclaims states left
    /// without any referent. The job itself stays readable for a grace
    /// period so late status requests can still drain progress.
    pub fn discard(&self) {
        self.discard_after(JOB_REMOVE_DELAY);
    }

    pub(crate) fn discard_after(&self, delay: Duration) {
        let Some(solver) = self.solver.upgrade() else {
            return;
        };

        self.pw.close();
        solver.discard_job(self);

        let solver = self.solver.clone();
        let id = self.id.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if let Some(solver) = solver.upgrade() {
                solver.jobs.lock().unwrap().remove(&id);
            }
        });
    }

    /// Closes the progress pipe without discarding the job.
    pub fn close_progress(&self) {
        self.pw.close();
    }

    pub fn set_value(&self, key: impl Into<String>, v: Dynamic) {
        self.values.lock().unwrap().insert(key.into(), v);
    }

    /// Runs `f` with progress wired to this job and a session group
    /// covering its session.
    pub fn in_context(&self, ctx: &Context, f: SessionCallback) -> anyhow::Result<()> {
        let ctx = ctx.with_progress(self.pw.clone());
        f(&ctx, &Sessions(vec![self.session_id()]))
    }

    /// Invokes `f` with the value stored under `key`, if any.
    pub fn each_value(
        &self,
        _ctx: &Context,
        key: &str,
        f: &mut dyn FnMut(&Dynamic) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let v = self.values.lock().unwrap().get(key).cloned();
        match v {
            Some(v) => f(&v),
            None => Ok(()),
        }
    }
}

impl Builder for Job {
    fn build(&self, ctx: &Context, edge: Edge) -> anyhow::Result<CachedResultWithProvenance> {
        Job::build(self, ctx, edge).map_err(Into::into)
    }

    fn in_context(&self, ctx: &Context, f: SessionCallback) -> anyhow::Result<()> {
        Job::in_context(self, ctx, f)
    }

    fn each_value(
        &self,
        ctx: &Context,
        key: &str,
        f: &mut dyn FnMut(&Dynamic) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        Job::each_value(self, ctx, key, f)
    }
}

/// A build result bound to the graph that produced it, so provenance can be
/// walked after the fact.
pub struct CachedResultWithProvenance {
    pub(crate) result: CachedResult,
    pub(crate) solver: Weak<SolverShared>,
    pub(crate) edge: Option<Edge>,
}

impl std::fmt::Debug for CachedResultWithProvenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CachedResultWithProvenance({})", self.result.result.id())
    }
}

impl CachedResultWithProvenance {
    /// A result with no graph attached; provenance walks are no-ops.
    pub(crate) fn without_job(result: CachedResult) -> Self {
        CachedResultWithProvenance {
            result,
            solver: Weak::new(),
            edge: None,
        }
    }

    pub fn cached(&self) -> &CachedResult {
        &self.result
    }

    /// Read-only DFS over the built edge, invoking `f` on every vertex
    /// whose op reports provenance.
    pub fn walk_provenance(
        &self,
        _ctx: &Context,
        f: &mut dyn FnMut(&dyn ProvenanceProvider) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let (Some(solver), Some(edge)) = (self.solver.upgrade(), self.edge.as_ref()) else {
            return Ok(());
        };
        let actives = solver.actives.read().unwrap();
        let mut visited = HashSet::new();
        walk_provenance(&actives, edge, f, &mut visited)
    }
}

fn walk_provenance(
    actives: &HashMap<Digest, Arc<VertexState>>,
    e: &Edge,
    f: &mut dyn FnMut(&dyn ProvenanceProvider) -> anyhow::Result<()>,
    visited: &mut HashSet<Digest>,
) -> anyhow::Result<()> {
    if !visited.insert(e.vertex.digest()) {
        return Ok(());
    }
    if let Some(st) = actives.get(&e.vertex.digest()) {
        let core = st.core.lock().unwrap();
        if let Some(op) = &core.op
            && let Some(resolved) = op.resolved()
            && let Some(provider) = resolved.op.provenance()
        {
            f(provider)?;
        }
    }
    for input in e.vertex.inputs() {
        walk_provenance(actives, &input, f, visited)?;
    }
    Ok(())
}
