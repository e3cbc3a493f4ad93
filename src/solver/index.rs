//! Graph and key indexes.
//!
//! `GraphIndex` interns vertices by digest and maps (vertex digest, output
//! index) to at most one live edge, so equivalent work submitted twice lands
//! on the same edge. `KeyIndex` is the merge rendezvous: the first edge to
//! claim an index digest keeps it, and a second edge arriving at the same
//! digest is a merge candidate.
//!
//! Both indexes are confined to the dispatcher (they live under the dispatch
//! mutex), so the rendezvous race between concurrently-keyed edges resolves
//! deterministically in dispatch order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::core::digest::Digest;
use crate::core::key::CacheKey;
use crate::core::op::Op;
use crate::core::vertex::{Edge, OutputIndex, Vertex};

/// Arena handle of one live edge.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct EdgeId(u64);

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge#{}", self.0)
    }
}

pub(crate) struct VertexEntry {
    pub vertex: Arc<dyn Vertex>,
    pub op: Arc<dyn Op>,
    /// The vertex this one was first loaded to serve, if any.
    pub owner: Option<Digest>,
    /// Jobs currently referencing the vertex.
    pub jobs: HashSet<String>,
}

#[derive(Default)]
pub(crate) struct GraphIndex {
    next_id: u64,
    vertices: HashMap<Digest, VertexEntry>,
    edges: HashMap<(Digest, OutputIndex), EdgeId>,
}

impl GraphIndex {
    pub fn alloc_id(&mut self) -> EdgeId {
        self.next_id += 1;
        EdgeId(self.next_id)
    }

    /// Intern one vertex for a job. The first loader records the owner link;
    /// later loads of the same digest only add a job reference.
    pub fn intern_vertex(
        &mut self,
        job: &str,
        vertex: &Arc<dyn Vertex>,
        op: Arc<dyn Op>,
        owner: Option<Digest>,
    ) {
        let entry = self
            .vertices
            .entry(vertex.digest())
            .or_insert_with(|| VertexEntry {
                vertex: Arc::clone(vertex),
                op,
                owner,
                jobs: HashSet::new(),
            });
        entry.jobs.insert(job.to_string());
    }

    pub fn vertex(&self, digest: &Digest) -> Option<&VertexEntry> {
        self.vertices.get(digest)
    }

    /// Existing live edge for this (vertex digest, output) pair, following
    /// merge redirects.
    pub fn edge(&self, edge: &Edge) -> Option<EdgeId> {
        self.edges.get(&edge.key()).copied()
    }

    pub fn register_edge(&mut self, edge: &Edge, id: EdgeId) {
        self.edges.insert(edge.key(), id);
    }

    /// Redirect all mappings of a merged-away edge to the survivor.
    pub fn set_edge(&mut self, old: EdgeId, new: EdgeId) {
        for mapped in self.edges.values_mut() {
            if *mapped == old {
                *mapped = new;
            }
        }
    }

    /// True when `owned` was loaded (transitively) to serve an input of
    /// `owner`.
    pub fn has_owner(&self, owner: &Edge, owned: &Edge) -> bool {
        let target = owner.vertex.digest();
        let mut current = owned.vertex.digest();
        let mut hops = 0usize;
        while let Some(entry) = self.vertices.get(&current) {
            let Some(parent) = entry.owner else { return false };
            if parent == target {
                return true;
            }
            current = parent;
            hops += 1;
            if hops > self.vertices.len() {
                return false; // defensive: owner links should be acyclic
            }
        }
        false
    }

    /// Live edge ids registered under one vertex digest.
    pub fn edges_of(&self, digest: &Digest) -> Vec<EdgeId> {
        self.edges
            .iter()
            .filter(|((d, _), _)| d == digest)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn remove_job(&mut self, job: &str) -> Vec<Digest> {
        let mut orphaned = Vec::new();
        for (digest, entry) in self.vertices.iter_mut() {
            entry.jobs.remove(job);
            if entry.jobs.is_empty() {
                orphaned.push(*digest);
            }
        }
        orphaned
    }

    pub fn remove_vertex(&mut self, digest: &Digest) -> Vec<EdgeId> {
        self.vertices.remove(digest);
        let removed: Vec<((Digest, OutputIndex), EdgeId)> = self
            .edges
            .iter()
            .filter(|((d, _), _)| d == digest)
            .map(|(k, v)| (*k, *v))
            .collect();
        let mut ids = Vec::new();
        for (key, id) in removed {
            self.edges.remove(&key);
            // the same id may be mapped from other digests after a merge
            if !self.edges.values().any(|v| *v == id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// Cache-key rendezvous: index digest -> claiming edge.
#[derive(Default)]
pub(crate) struct KeyIndex {
    by_digest: HashMap<Digest, EdgeId>,
    by_edge: HashMap<EdgeId, HashSet<Digest>>,
}

impl KeyIndex {
    /// Claim every unclaimed index digest of `key` for `id`. Returns the
    /// first other edge already holding one of them, if any.
    pub fn load_or_store(&mut self, key: &CacheKey, id: EdgeId) -> Option<EdgeId> {
        let mut found: Option<EdgeId> = None;
        for digest in key.index_digests() {
            match self.by_digest.get(&digest) {
                Some(existing) if *existing != id => {
                    if found.is_none() {
                        found = Some(*existing);
                    }
                }
                Some(_) => {}
                None => {
                    self.by_digest.insert(digest, id);
                    self.by_edge.entry(id).or_default().insert(digest);
                }
            }
        }
        found
    }

    /// Drop every claim held by `id`.
    pub fn release_edge(&mut self, id: EdgeId) {
        if let Some(digests) = self.by_edge.remove(&id) {
            for digest in digests {
                if self.by_digest.get(&digest) == Some(&id) {
                    self.by_digest.remove(&digest);
                }
            }
        }
    }

    /// Re-point every claim of `src` at `dest` after a merge.
    pub fn transfer(&mut self, src: EdgeId, dest: EdgeId) {
        if let Some(digests) = self.by_edge.remove(&src) {
            let dest_set = self.by_edge.entry(dest).or_default();
            for digest in digests {
                if self.by_digest.get(&digest) == Some(&src) {
                    self.by_digest.insert(digest, dest);
                    dest_set.insert(digest);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vertex::OutputIndex;

    fn d(s: &str) -> Digest {
        Digest::of_bytes(s.as_bytes())
    }

    fn id(n: u64) -> EdgeId {
        EdgeId(n)
    }

    #[test]
    fn load_or_store_claims_then_rendezvous() {
        let mut index = KeyIndex::default();
        let key = CacheKey::leaf(d("op"), OutputIndex(0));
        assert_eq!(index.load_or_store(&key, id(1)), None);
        // same edge re-registering is not a rendezvous
        assert_eq!(index.load_or_store(&key, id(1)), None);
        // another edge arriving at the same digest finds the claimant
        assert_eq!(index.load_or_store(&key, id(2)), Some(id(1)));
    }

    #[test]
    fn release_frees_claims() {
        let mut index = KeyIndex::default();
        let key = CacheKey::leaf(d("op"), OutputIndex(0));
        index.load_or_store(&key, id(1));
        index.release_edge(id(1));
        assert_eq!(index.load_or_store(&key, id(2)), None);
    }

    #[test]
    fn transfer_repoints_claims() {
        let mut index = KeyIndex::default();
        let key = CacheKey::leaf(d("op"), OutputIndex(0));
        index.load_or_store(&key, id(1));
        index.transfer(id(1), id(2));
        assert_eq!(index.load_or_store(&key, id(3)), Some(id(2)));
    }
}
