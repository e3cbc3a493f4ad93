//! Solver error taxonomy.
//!
//! Errors travel on pipes exactly like results, shared as `Arc<SolveError>`
//! so one failure can complete many consumers. Execution failures carry a
//! snapshot of the artifact handles that were in scope; ownership of those
//! handles transfers to the error until the consumer releases it.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::cache::CacheError;
use crate::core::artifact::ArtifactRef;
use crate::core::error::CoreError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SolveError {
    /// The submitted edge is unknown to the graph. Driver bug; surfaced
    /// immediately.
    #[error("invalid build request: {0}")]
    Validation(String),

    /// An input edge completed with an error.
    #[error("input {index} failed: {cause}")]
    Dependency {
        index: usize,
        cause: Arc<SolveError>,
    },

    #[error("cache map failed for {vertex}: {cause}")]
    CacheMap {
        vertex: String,
        cause: anyhow::Error,
    },

    #[error("content digest failed for input {index} of {vertex}: {cause}")]
    ContentDigest {
        vertex: String,
        index: usize,
        cause: anyhow::Error,
    },

    /// The executor failed. Carries the input/mount handles in scope at
    /// failure; the consumer owns them until it calls
    /// [`ExecSnapshot::release`].
    #[error("execution of {vertex} failed: {cause}")]
    Exec {
        vertex: String,
        cause: anyhow::Error,
        snapshot: ExecSnapshot,
    },

    #[error("build cancelled")]
    Cancelled,

    /// Post-unpark tripwire: an algorithm defect in the edge state machine,
    /// never caused by external input.
    #[error("kiln scheduler error: {0}. Please report this with KILN_SCHEDULER_DEBUG=1")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl SolveError {
    /// True when the root cause is cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            SolveError::Cancelled => true,
            SolveError::Dependency { cause, .. } => cause.is_cancelled(),
            _ => false,
        }
    }

    pub fn exec_snapshot(&self) -> Option<&ExecSnapshot> {
        match self {
            SolveError::Exec { snapshot, .. } => Some(snapshot),
            SolveError::Dependency { cause, .. } => cause.exec_snapshot(),
            _ => None,
        }
    }
}

/// Artifact handles in scope when execution failed.
///
/// `release` is safe to call once; subsequent calls are no-ops, so a consumer
/// observing the same failure through several paths cannot double-release.
pub struct ExecSnapshot {
    inputs: Vec<ArtifactRef>,
    mounts: Vec<ArtifactRef>,
    released: AtomicBool,
}

impl ExecSnapshot {
    pub fn new(inputs: Vec<ArtifactRef>, mounts: Vec<ArtifactRef>) -> Self {
        Self {
            inputs,
            mounts,
            released: AtomicBool::new(false),
        }
    }

    pub fn inputs(&self) -> &[ArtifactRef] {
        &self.inputs
    }

    pub fn mounts(&self) -> &[ArtifactRef] {
        &self.mounts
    }

    /// Visit each distinct handle once, inputs before mounts. Aliases of one
    /// handle are visited once; independent handles onto the same artifact
    /// are each visited.
    pub fn each_ref(&self, mut f: impl FnMut(&ArtifactRef)) {
        let mut seen = HashSet::new();
        for handle in self.inputs.iter().chain(self.mounts.iter()) {
            if seen.insert(handle.handle_id()) {
                f(handle);
            }
        }
    }

    /// Release every carried handle. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.each_ref(|handle| {
            if let Err(err) = handle.release() {
                tracing::warn!(error = %err, "exec snapshot release failed");
            }
        });
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ExecSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecSnapshot")
            .field("inputs", &self.inputs.len())
            .field("mounts", &self.mounts.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Carrier for mount handles inside an executor error.
///
/// An op that fails with mounts in scope wraps them so the solver can fold
/// them into the [`ExecSnapshot`]: ownership of the handles travels with the
/// error.
pub struct ExecMounts(pub Vec<ArtifactRef>);

impl fmt::Display for ExecMounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution failed with {} mounts in scope", self.0.len())
    }
}

impl fmt::Debug for ExecMounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecMounts({})", self.0.len())
    }
}

impl std::error::Error for ExecMounts {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::artifact::DataArtifact;

    fn handle() -> ArtifactRef {
        ArtifactRef::new(DataArtifact::new(&b"x"[..]))
    }

    #[test]
    fn snapshot_release_is_idempotent() {
        let a = handle();
        let snap = ExecSnapshot::new(vec![a.clone_ref()], vec![]);
        snap.release();
        snap.release();
        assert!(snap.is_released());
        a.release().unwrap();
    }

    #[test]
    fn each_ref_dedupes_shared_handles() {
        let a = handle();
        let alias = a.clone();
        let snap = ExecSnapshot::new(vec![a], vec![alias]);
        let mut count = 0;
        snap.each_ref(|_| count += 1);
        assert_eq!(count, 1);
        snap.release();
    }

    #[test]
    fn cancellation_is_detected_through_dependency_chain() {
        let err = SolveError::Dependency {
            index: 0,
            cause: Arc::new(SolveError::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(!SolveError::Validation("x".into()).is_cancelled());
    }
}
