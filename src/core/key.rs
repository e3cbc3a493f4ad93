//! Cache keys.
//!
//! A cache key identifies the work of one edge by structure: the
//! instruction's base digest, the selected output, and one *set of
//! alternative keys* per input. Alternatives accumulate over an edge's life:
//! the fast key computed from input fast keys, slow keys computed from input
//! content, match keys discovered in the backend, and keys folded in from
//! merged-away peers. Two edges are cache-equivalent when any combination of
//! their per-input alternatives coincides; those combinations are the *index
//! digests* stored in the key index.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::digest::Digest;
use super::vertex::OutputIndex;

/// A key contribution of one input, optionally narrowed by a selector.
#[derive(Clone)]
pub struct CacheKeyWithSelector {
    pub key: Arc<CacheKey>,
    pub selector: Option<Digest>,
}

impl CacheKeyWithSelector {
    pub fn new(key: Arc<CacheKey>, selector: Option<Digest>) -> Self {
        Self { key, selector }
    }

    fn ident(&self) -> (Digest, Option<Digest>) {
        (self.key.id(), self.selector)
    }
}

impl fmt::Debug for CacheKeyWithSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.key.id())?;
        if let Some(sel) = &self.selector {
            write!(f, "/{:?}", sel)?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct DepMaterial {
    id: Digest,
    selector: Option<Digest>,
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    base: Digest,
    output: OutputIndex,
    deps: &'a [Vec<DepMaterial>],
}

/// Structural cache identity of one edge.
#[derive(Debug)]
pub struct CacheKey {
    base: Digest,
    output: OutputIndex,
    deps: Vec<Vec<CacheKeyWithSelector>>,
    id: Digest,
}

impl CacheKey {
    /// Build a key over per-input alternative sets. Alternatives are deduped
    /// and sorted so the id is order-independent.
    pub fn new(
        base: Digest,
        output: OutputIndex,
        deps: Vec<Vec<CacheKeyWithSelector>>,
    ) -> Arc<CacheKey> {
        let deps: Vec<Vec<CacheKeyWithSelector>> = deps.into_iter().map(normalize_set).collect();
        let material: Vec<Vec<DepMaterial>> = deps
            .iter()
            .map(|set| {
                set.iter()
                    .map(|alt| DepMaterial {
                        id: alt.key.id(),
                        selector: alt.selector,
                    })
                    .collect()
            })
            .collect();
        let id = Digest::of_canonical(&KeyMaterial {
            base,
            output,
            deps: &material,
        })
        .expect("cache key material is always encodable");
        Arc::new(CacheKey {
            base,
            output,
            deps,
            id,
        })
    }

    /// A key with no inputs: dep-less vertices and content (slow) keys.
    pub fn leaf(base: Digest, output: OutputIndex) -> Arc<CacheKey> {
        Self::new(base, output, Vec::new())
    }

    pub fn base(&self) -> Digest {
        self.base
    }

    pub fn output(&self) -> OutputIndex {
        self.output
    }

    pub fn deps(&self) -> &[Vec<CacheKeyWithSelector>] {
        &self.deps
    }

    /// Structural digest over the full alternative structure.
    pub fn id(&self) -> Digest {
        self.id
    }

    /// All index digests: one per combination of a single alternative chosen
    /// for every input. Empty when any input has no known key yet.
    pub fn index_digests(&self) -> Vec<Digest> {
        if self.deps.iter().any(|set| set.is_empty()) {
            return Vec::new();
        }
        let mut combos: Vec<Vec<DepMaterial>> = vec![Vec::new()];
        for set in &self.deps {
            let mut next = Vec::with_capacity(combos.len() * set.len());
            for combo in &combos {
                for alt in set {
                    let mut c: Vec<DepMaterial> = combo
                        .iter()
                        .map(|d| DepMaterial {
                            id: d.id,
                            selector: d.selector,
                        })
                        .collect();
                    c.push(DepMaterial {
                        id: alt.key.id(),
                        selector: alt.selector,
                    });
                    next.push(c);
                }
            }
            combos = next;
        }
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(combos.len());
        for combo in combos {
            // one singleton alternative set per input, so a combination
            // digests exactly like a key with one known alternative per dep
            let deps: Vec<Vec<DepMaterial>> = combo.into_iter().map(|d| vec![d]).collect();
            let digest = Digest::of_canonical(&KeyMaterial {
                base: self.base,
                output: self.output,
                deps: &deps,
            })
            .expect("cache key material is always encodable");
            if seen.insert(digest) {
                out.push(digest);
            }
        }
        out
    }
}

fn normalize_set(mut set: Vec<CacheKeyWithSelector>) -> Vec<CacheKeyWithSelector> {
    set.sort_by_key(|alt| alt.ident());
    set.dedup_by_key(|alt| alt.ident());
    set
}

/// A cache key as published to a backend, tagged with the backend that
/// accepted it.
#[derive(Clone, Debug)]
pub struct ExportableKey {
    pub key: Arc<CacheKey>,
    pub cache_id: String,
}
