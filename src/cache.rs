use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use uuid::Uuid;

use crate::Dynamic;
use crate::context::Context;
use crate::digest::Digest;
use crate::op::SessionGroup;
use crate::result::SharedResult;

/// Opaque per-cache-map options. Cache providers read these by key; the
/// solver records a progress controller here so loads can be attributed to
/// the originating vertex.
pub type CacheOpts = HashMap<String, Dynamic>;

/// Identity of a cacheable result: the derived key digest plus the output
/// index it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub digest: Digest,
    pub output: usize,
}

/// An existing cache entry reported by a manager's `records` query.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub key: CacheKey,
    pub manager_id: String,
    pub created_at: SystemTime,
}

/// A cache key that can be exported to other caches together with the chain
/// that produced it.
#[derive(Debug, Clone)]
pub struct ExportableCacheKey {
    pub key: CacheKey,
    pub manager_id: String,
}

/// Computes a content-based digest of an evaluated input (the "slow" cache,
/// as opposed to the cache map known before execution).
pub type ResultBasedCacheFunc =
    Arc<dyn Fn(&Context, &SharedResult, &dyn SessionGroup) -> anyhow::Result<Digest> + Send + Sync>;

/// Prepares an evaluated input before its content digest is computed.
pub type PreprocessFunc =
    Arc<dyn Fn(&Context, &SharedResult, &dyn SessionGroup) -> anyhow::Result<()> + Send + Sync>;

/// Describes how one level of a vertex's cache key is derived from its
/// inputs. A vertex may produce several of these in sequence.
#[derive(Clone, Default)]
pub struct CacheMap {
    /// Digest of the operation itself, independent of inputs.
    pub digest: Digest,
    /// One entry per vertex input.
    pub deps: Vec<CacheDep>,
    pub opts: CacheOpts,
}

#[derive(Clone, Default)]
pub struct CacheDep {
    /// Narrows which part of the input contributes to the key.
    pub selector: Option<Digest>,
    /// When set, the input must be evaluated and its content digested.
    pub compute_digest: Option<ResultBasedCacheFunc>,
    /// Runs against the evaluated input before `compute_digest`.
    pub preprocess: Option<PreprocessFunc>,
}

/// A store of build results addressed by cache keys. Implementations decide
/// durability and distribution; the solver only sequences queries, loads and
/// saves around vertex execution.
pub trait CacheManager: Send + Sync {
    /// Stable identifier, used to dedup cache sources across vertices.
    fn id(&self) -> String;

    /// Existing records for the key. `ctx` carries ancestor cache options
    /// for providers that resolve keys remotely.
    fn records(&self, ctx: &Context, key: &CacheKey) -> anyhow::Result<Vec<CacheRecord>>;

    fn load(&self, ctx: &Context, rec: &CacheRecord) -> anyhow::Result<SharedResult>;

    fn save(
        &self,
        ctx: &Context,
        key: &CacheKey,
        res: &SharedResult,
    ) -> anyhow::Result<ExportableCacheKey>;
}

/// Queries several managers in order, loading from whichever produced a
/// record; saves go to the main manager only.
pub struct CombinedCacheManager {
    managers: Vec<Arc<dyn CacheManager>>,
    main: Arc<dyn CacheManager>,
    id: String,
}

impl CombinedCacheManager {
    pub fn new(managers: Vec<Arc<dyn CacheManager>>, main: Arc<dyn CacheManager>) -> Self {
        CombinedCacheManager {
            managers,
            main,
            id: format!("combined:{}", Uuid::new_v4()),
        }
    }
}

impl CacheManager for CombinedCacheManager {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn records(&self, ctx: &Context, key: &CacheKey) -> anyhow::Result<Vec<CacheRecord>> {
        let mut out = Vec::new();
        for m in &self.managers {
            match m.records(ctx, key) {
                Ok(recs) => out.extend(recs),
                // A failing secondary source must not mask local results.
                Err(err) => tracing::warn!("cache source {} records failed: {err:#}", m.id()),
            }
        }
        Ok(out)
    }

    fn load(&self, ctx: &Context, rec: &CacheRecord) -> anyhow::Result<SharedResult> {
        for m in &self.managers {
            if m.id() == rec.manager_id {
                return m.load(ctx, rec);
            }
        }
        anyhow::bail!("no cache manager {} for record", rec.manager_id)
    }

    fn save(
        &self,
        ctx: &Context,
        key: &CacheKey,
        res: &SharedResult,
    ) -> anyhow::Result<ExportableCacheKey> {
        self.main.save(ctx, key, res)
    }
}

/// The default store used when the solver is built without one. Keeps
/// results in memory for the life of the process.
pub struct InMemoryCacheManager {
    id: String,
    entries: Mutex<HashMap<CacheKey, (SharedResult, SystemTime)>>,
}

impl InMemoryCacheManager {
    pub fn new() -> Self {
        InMemoryCacheManager {
            id: format!("inmemory:{}", Uuid::new_v4()),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheManager for InMemoryCacheManager {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn records(&self, _ctx: &Context, key: &CacheKey) -> anyhow::Result<Vec<CacheRecord>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .get(key)
            .map(|(_, created_at)| CacheRecord {
                key: *key,
                manager_id: self.id.clone(),
                created_at: *created_at,
            })
            .into_iter()
            .collect())
    }

    fn load(&self, _ctx: &Context, rec: &CacheRecord) -> anyhow::Result<SharedResult> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(&rec.key)
            .map(|(res, _)| res.clone())
            .ok_or_else(|| anyhow::anyhow!("cache record {:?} vanished", rec.key))
    }

    fn save(
        &self,
        _ctx: &Context,
        key: &CacheKey,
        res: &SharedResult,
    ) -> anyhow::Result<ExportableCacheKey> {
        self.entries
            .lock()
            .unwrap()
            .insert(*key, (res.clone(), SystemTime::now()));
        Ok(ExportableCacheKey {
            key: *key,
            manager_id: self.id.clone(),
        })
    }
}
