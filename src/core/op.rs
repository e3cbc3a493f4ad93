//! The opcode contract: how a vertex is keyed and executed.
//!
//! The scheduler resolves each vertex to an [`Op`] and drives it in two
//! phases. `cache_map` is cheap and produces the static keying material;
//! `exec` materializes the vertex's outputs and may be arbitrarily expensive.
//! Both run on worker threads, never on the dispatcher.

use std::sync::Arc;

use super::artifact::ArtifactRef;
use super::cancel::CancelToken;
use super::digest::Digest;
use super::vertex::Vertex;

/// Computes a content digest from a materialized input artifact. Used for
/// slow cache keys; runs on a worker thread and may read artifact content.
pub type ContentDigestFn =
    Arc<dyn Fn(&CancelToken, &ArtifactRef) -> anyhow::Result<Digest> + Send + Sync>;

/// Static keying material for one vertex.
#[derive(Clone)]
pub struct CacheMap {
    /// Base digest of the instruction itself, independent of inputs. Two
    /// occurrences of the same instruction at different graph positions share
    /// this digest.
    pub digest: Digest,
    /// One entry per declared input, in input order.
    pub deps: Vec<CacheMapDep>,
}

#[derive(Clone, Default)]
pub struct CacheMapDep {
    /// Narrows the cache-key contribution of this input (e.g. a sub-path of
    /// the input). Part of key composition only; never triggers content
    /// reads on its own.
    pub selector: Option<Digest>,
    /// When set, this input additionally contributes a slow key computed from
    /// its materialized content.
    pub content_digest: Option<ContentDigestFn>,
    /// A failed optional input is substituted by the sentinel artifact
    /// instead of failing the consumer.
    pub optional: bool,
}

impl std::fmt::Debug for CacheMapDep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMapDep")
            .field("selector", &self.selector)
            .field("content_digest", &self.content_digest.is_some())
            .field("optional", &self.optional)
            .finish()
    }
}

/// The resolved implementation of a vertex.
pub trait Op: Send + Sync {
    /// Produce the static cache map. Called at most once per edge; the result
    /// is retained for the edge's lifetime.
    fn cache_map(&self, token: &CancelToken) -> anyhow::Result<CacheMap>;

    /// Run the vertex. `inputs` holds one materialized artifact per declared
    /// input, in input order; the op borrows them for the duration of the
    /// call. Returns one artifact per output.
    fn exec(&self, token: &CancelToken, inputs: &[ArtifactRef]) -> anyhow::Result<Vec<ArtifactRef>>;
}

/// Maps vertices to their op implementations.
pub trait OpResolver: Send + Sync {
    fn resolve(&self, vertex: &Arc<dyn Vertex>) -> anyhow::Result<Arc<dyn Op>>;
}
