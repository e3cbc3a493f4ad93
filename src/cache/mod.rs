//! Cache backend interface.
//!
//! The scheduler talks to cache storage through [`CacheManager`]: query
//! records by structural key, load a record into an artifact, save an
//! executed result, and register secondary key associations after edge
//! merges. Persistent backends live outside this crate; [`memory`] provides
//! the in-process implementation used by embedders and tests.

pub mod memory;

use std::sync::Arc;

use thiserror::Error;

use crate::core::digest::Digest;
use crate::core::key::{CacheKey, ExportableKey};
use crate::core::artifact::ArtifactRef;
use crate::core::vertex::OutputIndex;

pub use memory::InMemoryCache;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("cache record {record} not found in {cache_id}")]
    RecordNotFound { record: String, cache_id: String },

    #[error("cache backend {cache_id} failed: {cause}")]
    Backend {
        cache_id: String,
        cause: anyhow::Error,
    },
}

/// One stored result under one cache key.
#[derive(Debug)]
pub struct CacheRecord {
    pub id: String,
    pub key: Arc<CacheKey>,
    pub cache_id: String,
}

/// Outcome of saving a result: the exportable key plus the stored record.
#[derive(Debug)]
pub struct Saved {
    pub exported: ExportableKey,
    pub record: Arc<CacheRecord>,
}

/// Cache storage as seen by the solver.
pub trait CacheManager: Send + Sync {
    /// Identifies this backend in exported keys and records.
    fn id(&self) -> &str;

    /// Records matching any index digest of `key`.
    fn query(&self, key: &CacheKey) -> Result<Vec<Arc<CacheRecord>>, CacheError>;

    /// Alternate stored keys matching any index digest of `key` (match
    /// keys). The returned keys may carry alternatives unknown to the caller.
    fn matches(&self, key: &CacheKey) -> Result<Vec<Arc<CacheKey>>, CacheError>;

    /// Materialize a record into an artifact handle. The caller owns the
    /// returned handle.
    fn load(&self, record: &CacheRecord, output: OutputIndex) -> Result<ArtifactRef, CacheError>;

    /// Store an executed result under `key`. The artifact is shared with the
    /// backend; the caller keeps its own handle.
    fn save(&self, key: &Arc<CacheKey>, artifact: &ArtifactRef) -> Result<Saved, CacheError>;

    /// Associate an extra index digest with an existing record, so lookups by
    /// a merged-away edge's keys still hit.
    fn add_association(
        &self,
        index_digest: Digest,
        record: &Arc<CacheRecord>,
    ) -> Result<(), CacheError>;
}
