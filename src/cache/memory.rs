//! In-process cache backend.
//!
//! Indexes records by every index digest of the keys they were saved under.
//! Shared across solver instances to serve warm-cache builds in the same
//! process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::core::artifact::{Artifact, ArtifactRef};
use crate::core::digest::Digest;
use crate::core::key::{CacheKey, ExportableKey};
use crate::core::vertex::OutputIndex;

use super::{CacheError, CacheManager, CacheRecord, Saved};

#[derive(Default)]
struct Store {
    /// index digest -> records reachable under it
    records: HashMap<Digest, Vec<Arc<CacheRecord>>>,
    /// index digest -> canonical keys stored under it
    keys: HashMap<Digest, Vec<Arc<CacheKey>>>,
    /// record id -> stored artifact
    artifacts: HashMap<String, Arc<dyn Artifact>>,
}

pub struct InMemoryCache {
    id: String,
    store: Mutex<Store>,
}

impl InMemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: format!("mem-{}", Uuid::new_v4()),
            store: Mutex::new(Store::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().expect("cache store lock poisoned")
    }

    /// Number of stored records. Test and debugging aid.
    pub fn record_count(&self) -> usize {
        self.lock().artifacts.len()
    }
}

impl CacheManager for InMemoryCache {
    fn id(&self) -> &str {
        &self.id
    }

    fn query(&self, key: &CacheKey) -> Result<Vec<Arc<CacheRecord>>, CacheError> {
        let store = self.lock();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for digest in key.index_digests() {
            for record in store.records.get(&digest).into_iter().flatten() {
                if seen.insert(record.id.clone()) {
                    out.push(Arc::clone(record));
                }
            }
        }
        Ok(out)
    }

    fn matches(&self, key: &CacheKey) -> Result<Vec<Arc<CacheKey>>, CacheError> {
        let store = self.lock();
        let own = key.id();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for digest in key.index_digests() {
            for stored in store.keys.get(&digest).into_iter().flatten() {
                if stored.id() != own && seen.insert(stored.id()) {
                    out.push(Arc::clone(stored));
                }
            }
        }
        Ok(out)
    }

    fn load(&self, record: &CacheRecord, _output: OutputIndex) -> Result<ArtifactRef, CacheError> {
        let store = self.lock();
        let artifact =
            store
                .artifacts
                .get(&record.id)
                .ok_or_else(|| CacheError::RecordNotFound {
                    record: record.id.clone(),
                    cache_id: self.id.clone(),
                })?;
        Ok(ArtifactRef::new(Arc::clone(artifact)))
    }

    fn save(&self, key: &Arc<CacheKey>, artifact: &ArtifactRef) -> Result<Saved, CacheError> {
        let record = Arc::new(CacheRecord {
            id: format!("rec-{}", Uuid::new_v4()),
            key: Arc::clone(key),
            cache_id: self.id.clone(),
        });
        let mut store = self.lock();
        store
            .artifacts
            .insert(record.id.clone(), Arc::clone(artifact.artifact()));
        for digest in key.index_digests() {
            store
                .records
                .entry(digest)
                .or_default()
                .push(Arc::clone(&record));
            store.keys.entry(digest).or_default().push(Arc::clone(key));
        }
        Ok(Saved {
            exported: ExportableKey {
                key: Arc::clone(key),
                cache_id: self.id.clone(),
            },
            record,
        })
    }

    fn add_association(
        &self,
        index_digest: Digest,
        record: &Arc<CacheRecord>,
    ) -> Result<(), CacheError> {
        let mut store = self.lock();
        let records = store.records.entry(index_digest).or_default();
        if !records.iter().any(|r| r.id == record.id) {
            records.push(Arc::clone(record));
        }
        let key = Arc::clone(&record.key);
        store.keys.entry(index_digest).or_default().push(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifact::DataArtifact;

    fn d(s: &str) -> Digest {
        Digest::of_bytes(s.as_bytes())
    }

    fn artifact(data: &str) -> ArtifactRef {
        ArtifactRef::new(DataArtifact::new(data.as_bytes().to_vec()))
    }

    #[test]
    fn save_then_query_hits() {
        let cache = InMemoryCache::new();
        let key = CacheKey::leaf(d("op"), OutputIndex(0));
        let a = artifact("out");
        let saved = cache.save(&key, &a).unwrap();
        assert_eq!(saved.exported.cache_id, cache.id());

        let records = cache.query(&key).unwrap();
        assert_eq!(records.len(), 1);
        let loaded = cache.load(&records[0], OutputIndex(0)).unwrap();
        assert_eq!(loaded.id(), a.id());
        loaded.release().unwrap();
        a.release().unwrap();
    }

    #[test]
    fn query_misses_unknown_key() {
        let cache = InMemoryCache::new();
        let key = CacheKey::leaf(d("op"), OutputIndex(0));
        assert!(cache.query(&key).unwrap().is_empty());
    }

    #[test]
    fn association_extends_reach() {
        let cache = InMemoryCache::new();
        let key = CacheKey::leaf(d("op"), OutputIndex(0));
        let a = artifact("out");
        cache.save(&key, &a).unwrap();
        let record = cache.query(&key).unwrap().pop().unwrap();

        let other = CacheKey::leaf(d("merged-peer"), OutputIndex(0));
        let alias = other.index_digests()[0];
        cache.add_association(alias, &record).unwrap();
        assert_eq!(cache.query(&other).unwrap().len(), 1);
        a.release().unwrap();
    }

    #[test]
    fn matches_returns_alternate_keys_only() {
        let cache = InMemoryCache::new();
        let slow = CacheKey::leaf(d("content"), OutputIndex(0));
        let k1 = CacheKey::new(
            d("op"),
            OutputIndex(0),
            vec![vec![
                crate::core::key::CacheKeyWithSelector::new(
                    CacheKey::leaf(d("fast-1"), OutputIndex(0)),
                    None,
                ),
                crate::core::key::CacheKeyWithSelector::new(Arc::clone(&slow), None),
            ]],
        );
        let a = artifact("out");
        cache.save(&k1, &a).unwrap();

        let k2 = CacheKey::new(
            d("op"),
            OutputIndex(0),
            vec![vec![
                crate::core::key::CacheKeyWithSelector::new(
                    CacheKey::leaf(d("fast-2"), OutputIndex(0)),
                    None,
                ),
                crate::core::key::CacheKeyWithSelector::new(slow, None),
            ]],
        );
        let alternates = cache.matches(&k2).unwrap();
        assert_eq!(alternates.len(), 1);
        assert_eq!(alternates[0].id(), k1.id());
        assert!(cache.matches(&k1).unwrap().is_empty());
        a.release().unwrap();
    }
}
