//! The build driver.
//!
//! `Solver` is the external entry point: it owns the scheduler and the shared
//! graph. A `Job` scopes one build request: it validates and loads a
//! definition into the graph index (interning every vertex by digest),
//! drives the scheduler, and on discard drops its references so quiescent
//! edges can be pruned.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::cache::CacheManager;
use crate::config::SolverConfig;
use crate::core::artifact::CachedArtifact;
use crate::core::cancel::CancelToken;
use crate::core::digest::Digest;
use crate::core::error::CoreError;
use crate::core::op::OpResolver;
use crate::core::vertex::{Edge, Vertex};

use super::debug;
use super::error::SolveError;
use super::metrics::MetricsSnapshot;
use super::scheduler::Scheduler;

pub struct SolverOpt {
    pub resolver: Arc<dyn OpResolver>,
    pub cache: Arc<dyn CacheManager>,
    pub config: SolverConfig,
}

/// The build solver: evaluates edges of a loaded definition into cached
/// results.
pub struct Solver {
    scheduler: Scheduler,
    resolver: Arc<dyn OpResolver>,
    jobs: Mutex<HashSet<String>>,
}

impl Solver {
    pub fn new(opt: SolverOpt) -> Self {
        if opt.config.scheduler_debug {
            debug::force_enable();
        }
        let metrics = Arc::new(super::metrics::Metrics::new());
        Self {
            scheduler: Scheduler::new(opt.cache, metrics),
            resolver: opt.resolver,
            jobs: Mutex::new(HashSet::new()),
        }
    }

    /// Register a new job. Job ids must be unique among live jobs.
    pub fn new_job(&self, id: impl Into<String>) -> Result<Job<'_>, Arc<SolveError>> {
        let id = id.into();
        let mut jobs = self.jobs.lock().expect("job registry lock poisoned");
        if !jobs.insert(id.clone()) {
            return Err(Arc::new(SolveError::Validation(format!(
                "job {id:?} already exists"
            ))));
        }
        tracing::debug!(job = %id, "job registered");
        Ok(Job {
            solver: self,
            id,
            discarded: false,
        })
    }

    /// One-shot convenience: load the target's definition under a fresh job,
    /// build it, and discard the job.
    pub fn build(
        &self,
        token: &CancelToken,
        edge: &Edge,
    ) -> Result<CachedArtifact, Arc<SolveError>> {
        let job = self.new_job(format!("build-{}", Uuid::new_v4()))?;
        job.load(&edge.vertex)?;
        job.build(token, edge)
    }

    /// Shut down the dispatcher. Idempotent; outstanding pipes are left to
    /// their owners.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.scheduler.metrics().snapshot()
    }

    /// Pending dispatches. After quiescence this is zero.
    pub fn queued_wakeups(&self) -> usize {
        self.scheduler.queued()
    }
}

/// One build request scope.
pub struct Job<'a> {
    solver: &'a Solver,
    id: String,
    discarded: bool,
}

impl Job<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Validate a definition rooted at `vertex` and intern it into the
    /// shared graph. Loading the same vertex twice is cheap.
    pub fn load(&self, vertex: &Arc<dyn Vertex>) -> Result<(), Arc<SolveError>> {
        validate_acyclic(vertex).map_err(|e| Arc::new(SolveError::Core(e)))?;

        // resolve ops outside the dispatch lock: resolvers may do real work
        let mut resolved = Vec::new();
        let mut seen: HashSet<Digest> = HashSet::new();
        let mut stack: Vec<(Arc<dyn Vertex>, Option<Digest>)> = vec![(Arc::clone(vertex), None)];
        while let Some((v, owner)) = stack.pop() {
            let digest = v.digest();
            if !seen.insert(digest) {
                continue;
            }
            let op = self.solver.resolver.resolve(&v).map_err(|err| {
                Arc::new(SolveError::Validation(format!(
                    "failed to resolve op for {}: {err}",
                    v.name()
                )))
            })?;
            for input in v.inputs() {
                stack.push((Arc::clone(&input.vertex), Some(digest)));
            }
            resolved.push((v, op, owner));
        }

        self.solver.scheduler.with_state(|st| {
            for (v, op, owner) in resolved {
                st.graph.intern_vertex(&self.id, &v, op, owner);
            }
        });
        tracing::debug!(job = %self.id, root = %vertex.name(), vertices = seen.len(), "definition loaded");
        Ok(())
    }

    /// Evaluate one edge of the loaded definition. Blocks until the result
    /// is available, the build fails, or `token` is cancelled.
    pub fn build(
        &self,
        token: &CancelToken,
        edge: &Edge,
    ) -> Result<CachedArtifact, Arc<SolveError>> {
        let span = tracing::info_span!("build", job = %self.id, target = %edge.vertex.name());
        let _guard = span.enter();
        let result = self.solver.scheduler.build(token, edge);
        match &result {
            Ok(artifact) => {
                tracing::info!(job = %self.id, artifact = %artifact.id(), "build complete")
            }
            Err(err) if err.is_cancelled() => {
                tracing::info!(job = %self.id, "build cancelled")
            }
            Err(err) => tracing::warn!(job = %self.id, error = %err, "build failed"),
        }
        result
    }

    /// Drop this job's graph references and prune quiescent orphaned edges.
    pub fn discard(mut self) {
        self.discard_inner();
    }

    fn discard_inner(&mut self) {
        if self.discarded {
            return;
        }
        self.discarded = true;
        self.solver.scheduler.with_state(|st| {
            let orphaned = st.graph.remove_job(&self.id);
            for digest in orphaned {
                let ids = st.graph.edges_of(&digest);
                let quiescent = ids.iter().all(|id| {
                    let done = st
                        .edges
                        .get(id)
                        .map(|n| n.state() == super::edge::EdgeStatus::Complete)
                        .unwrap_or(true);
                    done && !st.incoming.contains_key(id) && !st.outgoing.contains_key(id)
                });
                if quiescent {
                    for id in st.graph.remove_vertex(&digest) {
                        st.destroy_edge(id);
                    }
                }
            }
        });
        self.solver
            .jobs
            .lock()
            .expect("job registry lock poisoned")
            .remove(&self.id);
        tracing::debug!(job = %self.id, "job discarded");
    }
}

impl Drop for Job<'_> {
    fn drop(&mut self) {
        self.discard_inner();
    }
}

/// Reject definitions with input cycles before they reach the scheduler.
fn validate_acyclic(root: &Arc<dyn Vertex>) -> Result<(), CoreError> {
    fn visit(
        vertex: &Arc<dyn Vertex>,
        path: &mut HashSet<Digest>,
        done: &mut HashSet<Digest>,
    ) -> Result<(), CoreError> {
        let digest = vertex.digest();
        if done.contains(&digest) {
            return Ok(());
        }
        if !path.insert(digest) {
            return Err(CoreError::DefinitionCycle {
                vertex: vertex.name().to_string(),
                digest,
            });
        }
        for input in vertex.inputs() {
            visit(&input.vertex, path, done)?;
        }
        path.remove(&digest);
        done.insert(digest);
        Ok(())
    }
    let mut path = HashSet::new();
    let mut done = HashSet::new();
    visit(root, &mut path, &mut done)
}
