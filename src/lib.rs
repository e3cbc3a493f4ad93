#![forbid(unsafe_code)]

//! kiln: a build solver scheduler.
//!
//! kiln evaluates a directed acyclic graph of build instructions into cached
//! results. A single-threaded cooperative dispatcher drives per-edge state
//! machines (key computation, cache lookup, execution, result publication)
//! while worker threads do the actual work and report back through pipes.
//! Equivalent work is deduplicated twice: structurally, by vertex digest, and
//! post-hoc, by merging edges whose cache keys turn out to coincide.

pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod solver;
pub mod telemetry;
pub mod test_harness;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main surface at crate root for convenience
pub use crate::cache::{CacheError, CacheManager, CacheRecord, InMemoryCache, Saved};
pub use crate::config::{LogFormat, LoggingConfig, SolverConfig};
pub use crate::core::{
    Artifact, ArtifactRef, CacheKey, CacheKeyWithSelector, CacheMap, CacheMapDep, CachedArtifact,
    CancelToken, ContentDigestFn, CoreError, DataArtifact, Digest, Edge, ExportableKey, Op,
    OpResolver, OutputIndex, Vertex, VertexOptions,
};
pub use crate::solver::{
    EdgeStatus, ExecMounts, ExecSnapshot, Job, MetricsSnapshot, SolveError, Solver, SolverOpt,
};
