//! Core error taxonomy: definition shape and digesting failures.

use thiserror::Error;

use super::digest::Digest;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    #[error("invalid digest {raw:?}: {reason}")]
    InvalidDigest { raw: String, reason: String },

    #[error("failed to encode digest material: {0}")]
    DigestMaterial(#[source] serde_json::Error),

    #[error("definition cycle through vertex {vertex} ({digest:?})")]
    DefinitionCycle { vertex: String, digest: Digest },

    #[error("artifact {id} released more than once")]
    DoubleRelease { id: String },
}
