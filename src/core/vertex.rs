//! The vertex model: units of work in the build graph.
//!
//! A vertex describes one build instruction together with its declared inputs
//! (edges into other vertices' outputs) and scheduling options. The solver
//! never inspects instruction payloads; it sees vertices only through this
//! trait and runs them through their resolved [`Op`](super::op::Op).

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::digest::Digest;

/// Index of one typed output of a vertex.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OutputIndex(pub usize);

impl fmt::Display for OutputIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-vertex scheduling options.
#[derive(Clone, Debug, Default)]
pub struct VertexOptions {
    /// Never serve this vertex from cache; always run it.
    pub ignore_cache: bool,
    /// Never merge this vertex's edges with cache-equivalent peers.
    pub skip_merge: bool,
    /// Human-readable description for progress output.
    pub description: Option<String>,
}

/// One unit of work in the build graph.
///
/// Implementations must be cheap to query: the scheduler calls `digest` and
/// `inputs` repeatedly from its dispatch loop.
pub trait Vertex: Send + Sync {
    /// Stable content digest covering the instruction and its input edges.
    fn digest(&self) -> Digest;

    /// Short human-readable name.
    fn name(&self) -> &str;

    /// Declared inputs, one edge per input slot.
    fn inputs(&self) -> &[Edge];

    fn options(&self) -> &VertexOptions;
}

/// A vertex plus one selected output index: the schedulable unit.
#[derive(Clone)]
pub struct Edge {
    pub vertex: Arc<dyn Vertex>,
    pub output: OutputIndex,
}

impl Edge {
    pub fn new(vertex: Arc<dyn Vertex>, output: OutputIndex) -> Self {
        Self { vertex, output }
    }

    /// Identity of this edge in the graph index.
    pub fn key(&self) -> (Digest, OutputIndex) {
        (self.vertex.digest(), self.output)
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Edge({} {:?} #{})",
            self.vertex.name(),
            self.vertex.digest(),
            self.output
        )
    }
}
