//! Crate-level convenience error.
//!
//! Not a "god error": a thin wrapper over the canonical capability errors.

use std::sync::Arc;

use thiserror::Error;

use crate::cache::CacheError;
use crate::core::CoreError;
use crate::solver::SolveError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Solve(Arc<SolveError>),
}

impl From<Arc<SolveError>> for Error {
    fn from(err: Arc<SolveError>) -> Self {
        Error::Solve(err)
    }
}

impl Error {
    /// True when the root cause is cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Solve(err) if err.is_cancelled())
    }
}
