//! Core domain model: digests, vertices, ops, artifacts, cache keys.

pub mod artifact;
pub mod cancel;
pub mod digest;
pub mod error;
pub mod key;
pub mod op;
pub mod vertex;

pub use artifact::{
    sentinel_artifact, sentinel_digest, Artifact, ArtifactRef, CachedArtifact, DataArtifact,
};
pub use cancel::CancelToken;
pub use digest::{canon_json_bytes, Digest};
pub use error::CoreError;
pub use key::{CacheKey, CacheKeyWithSelector, ExportableKey};
pub use op::{CacheMap, CacheMapDep, ContentDigestFn, Op, OpResolver};
pub use vertex::{Edge, OutputIndex, Vertex, VertexOptions};
