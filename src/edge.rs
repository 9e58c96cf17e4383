use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::digest::Digest;
use crate::result::CachedResult;
use crate::shared_op::SharedOp;
use crate::vertex::Edge;

/// Identity of an edge within the active graph: effective vertex digest plus
/// output index.
pub(crate) type EdgeKey = (Digest, usize);

/// One schedulable output of an active vertex.
///
/// After a merge the record points at its owner; lookups follow the chain to
/// the canonical representative. Owner chains are acyclic by construction
/// (ownership is only ever granted to an edge of a different vertex, checked
/// against the reverse chain by the registry).
pub(crate) struct EdgeRecord {
    pub(crate) edge: Edge,
    pub(crate) op: Arc<SharedOp>,
    owner: Mutex<Option<Arc<EdgeRecord>>>,
    result: Mutex<Option<CachedResult>>,
    fingerprints: Mutex<Vec<String>>,
}

impl EdgeRecord {
    pub(crate) fn new(edge: Edge, op: Arc<SharedOp>) -> Arc<Self> {
        Arc::new(EdgeRecord {
            edge,
            op,
            owner: Mutex::new(None),
            result: Mutex::new(None),
            fingerprints: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn key(&self) -> EdgeKey {
        (self.edge.vertex.digest(), self.edge.index)
    }

    pub(crate) fn owner(&self) -> Option<Arc<EdgeRecord>> {
        self.owner.lock().unwrap().clone()
    }

    /// Follows the owner chain to the representative record.
    pub(crate) fn resolve(self: &Arc<Self>) -> Arc<EdgeRecord> {
        let mut cur = self.clone();
        while let Some(owner) = cur.owner() {
            cur = owner;
        }
        cur
    }

    /// Redirects `other` to this record. Subsequent lookups of `other`
    /// resolve here; its memoised result is dropped since the
    /// representative's result is authoritative.
    pub(crate) fn take_ownership(self: &Arc<Self>, other: &Arc<EdgeRecord>) {
        *other.owner.lock().unwrap() = Some(self.clone());
        other.result.lock().unwrap().take();
    }

    pub(crate) fn result(&self) -> Option<CachedResult> {
        self.result.lock().unwrap().clone()
    }

    pub(crate) fn set_result(&self, res: CachedResult) {
        *self.result.lock().unwrap() = Some(res);
    }

    pub(crate) fn add_fingerprint(&self, fp: String) {
        self.fingerprints.lock().unwrap().push(fp);
    }

    /// Releases the record on state teardown: deregisters its fingerprints
    /// and drops the memoised result.
    pub(crate) fn release(&self, index: &EdgeIndex) {
        let key = self.key();
        for fp in self.fingerprints.lock().unwrap().drain(..) {
            index.release(&fp, &key);
        }
        if let Some(res) = self.result.lock().unwrap().take() {
            let _ = res.result.release();
        }
    }
}

/// Secondary index from cache-key fingerprints to the edges that produced
/// them. A hit on a foreign edge signals cross-vertex equivalence and
/// triggers an edge merge in the registry.
pub(crate) struct EdgeIndex {
    items: Mutex<HashMap<String, Vec<EdgeKey>>>,
}

impl EdgeIndex {
    pub(crate) fn new() -> Self {
        EdgeIndex {
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `key` under `fp`. Returns a previously registered edge of
    /// a *different* vertex, if any; such a hit means the two edges are
    /// equivalent and should be merged.
    pub(crate) fn load_or_store(&self, fp: &str, key: EdgeKey) -> Option<EdgeKey> {
        let mut items = self.items.lock().unwrap();
        let entries = items.entry(fp.to_string()).or_default();
        if let Some(existing) = entries.iter().find(|k| k.0 != key.0).copied() {
            return Some(existing);
        }
        if !entries.contains(&key) {
            entries.push(key);
        }
        None
    }

    pub(crate) fn release(&self, fp: &str, key: &EdgeKey) {
        let mut items = self.items.lock().unwrap();
        if let Some(entries) = items.get_mut(fp) {
            entries.retain(|k| k != key);
            if entries.is_empty() {
                items.remove(fp);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn fingerprints(&self) -> std::collections::HashSet<String> {
        self.items.lock().unwrap().keys().cloned().collect()
    }
}
