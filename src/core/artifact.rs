//! Artifact handles: refcounted results of vertex execution.
//!
//! The underlying `Artifact` is owned by whoever produced it (executor or
//! cache backend). The solver passes around `ArtifactRef` handles; each
//! counted handle must be released exactly once, and releasing the last
//! handle releases the underlying artifact. Handles can be aliased cheaply
//! (struct `Clone`) without affecting the count; only `clone_ref` creates a
//! new countable handle.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use uuid::Uuid;

use super::digest::Digest;
use super::error::CoreError;
use super::key::ExportableKey;

/// A produced result of one vertex output.
pub trait Artifact: Send + Sync {
    /// Stable identifier, unique per produced artifact.
    fn id(&self) -> &str;

    /// Release underlying resources. Called once, when the last counted
    /// handle is released.
    fn release(&self) -> anyhow::Result<()>;

    /// Downcast hook for executors that need concrete artifact types.
    fn as_any(&self) -> &dyn Any;
}

struct ShareState {
    refs: usize,
    released_underlying: bool,
}

struct Share {
    artifact: Arc<dyn Artifact>,
    state: Mutex<ShareState>,
}

/// One countable handle onto a shared artifact.
///
/// Struct clones alias the same handle (same release obligation); use
/// [`ArtifactRef::clone_ref`] to create an independently-releasable handle.
#[derive(Clone)]
pub struct ArtifactRef {
    share: Arc<Share>,
    handle: Arc<AtomicBool>, // released flag for this handle
}

impl ArtifactRef {
    /// Wrap a freshly produced artifact; the returned handle holds the only
    /// reference.
    pub fn new(artifact: Arc<dyn Artifact>) -> Self {
        Self {
            share: Arc::new(Share {
                artifact,
                state: Mutex::new(ShareState {
                    refs: 1,
                    released_underlying: false,
                }),
            }),
            handle: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> String {
        self.share.artifact.id().to_string()
    }

    pub fn artifact(&self) -> &Arc<dyn Artifact> {
        &self.share.artifact
    }

    /// Create a new countable handle onto the same artifact.
    pub fn clone_ref(&self) -> ArtifactRef {
        let mut state = self.share.state.lock().expect("artifact share poisoned");
        state.refs += 1;
        ArtifactRef {
            share: Arc::clone(&self.share),
            handle: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Release this handle. Releasing the last handle releases the
    /// underlying artifact. Releasing the same handle twice is an error.
    pub fn release(&self) -> Result<(), CoreError> {
        if self.handle.swap(true, Ordering::AcqRel) {
            return Err(CoreError::DoubleRelease { id: self.id() });
        }
        let release_underlying = {
            let mut state = self.share.state.lock().expect("artifact share poisoned");
            state.refs -= 1;
            if state.refs == 0 && !state.released_underlying {
                state.released_underlying = true;
                true
            } else {
                false
            }
        };
        if release_underlying {
            if let Err(err) = self.share.artifact.release() {
                tracing::warn!(artifact = %self.id(), error = %err, "artifact release failed");
            }
        }
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.handle.load(Ordering::Acquire)
    }

    /// Identity of this countable handle (aliases share it, `clone_ref`
    /// copies do not).
    pub fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.handle) as usize
    }

    /// Outstanding countable handles. Test and debugging aid.
    pub fn ref_count(&self) -> usize {
        self.share.state.lock().expect("artifact share poisoned").refs
    }
}

impl std::fmt::Debug for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactRef")
            .field("id", &self.id())
            .field("released", &self.is_released())
            .finish()
    }
}

/// An artifact handle together with the cache keys it was published under.
#[derive(Clone, Debug)]
pub struct CachedArtifact {
    reference: ArtifactRef,
    keys: Vec<ExportableKey>,
}

impl CachedArtifact {
    pub fn new(reference: ArtifactRef, keys: Vec<ExportableKey>) -> Self {
        Self { reference, keys }
    }

    pub fn cache_keys(&self) -> &[ExportableKey] {
        &self.keys
    }

    pub fn reference(&self) -> &ArtifactRef {
        &self.reference
    }

    pub fn id(&self) -> String {
        self.reference.id()
    }

    /// An independently-releasable copy sharing the same artifact and keys.
    pub fn clone_cached(&self) -> CachedArtifact {
        CachedArtifact {
            reference: self.reference.clone_ref(),
            keys: self.keys.clone(),
        }
    }

    pub fn release(&self) -> Result<(), CoreError> {
        self.reference.release()
    }
}

/// Simple in-memory artifact carrying opaque bytes. The default artifact of
/// the in-memory cache and the test executors.
pub struct DataArtifact {
    id: String,
    data: Bytes,
}

impl DataArtifact {
    pub fn new(data: impl Into<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            id: format!("data-{}", Uuid::new_v4()),
            data: data.into(),
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl Artifact for DataArtifact {
    fn id(&self) -> &str {
        &self.id
    }

    fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SentinelArtifact;

impl Artifact for SentinelArtifact {
    fn id(&self) -> &str {
        "sentinel"
    }

    fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Fresh handle onto the sentinel artifact that substitutes a failed
/// optional input.
pub fn sentinel_artifact() -> ArtifactRef {
    ArtifactRef::new(Arc::new(SentinelArtifact))
}

/// The sentinel's fixed cache-key contribution. Stable across processes so a
/// rebuild after the same optional-input failure still hits cache.
pub fn sentinel_digest() -> Digest {
    static DIGEST: OnceLock<Digest> = OnceLock::new();
    *DIGEST.get_or_init(|| Digest::of_bytes(b"kiln.input.sentinel.v1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Tracked {
        id: String,
        releases: Arc<AtomicUsize>,
    }

    impl Artifact for Tracked {
        fn id(&self) -> &str {
            &self.id
        }
        fn release(&self) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn tracked() -> (ArtifactRef, Arc<AtomicUsize>) {
        let releases = Arc::new(AtomicUsize::new(0));
        let artifact = Arc::new(Tracked {
            id: "t-1".into(),
            releases: Arc::clone(&releases),
        });
        (ArtifactRef::new(artifact), releases)
    }

    #[test]
    fn last_release_frees_underlying() {
        let (a, releases) = tracked();
        let b = a.clone_ref();
        a.release().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        b.release().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_release_is_an_error() {
        let (a, _) = tracked();
        a.release().unwrap();
        assert!(a.release().is_err());
    }

    #[test]
    fn alias_shares_release_obligation() {
        let (a, releases) = tracked();
        let alias = a.clone();
        alias.release().unwrap();
        assert!(a.release().is_err());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_clone_is_independent() {
        let (a, releases) = tracked();
        let cached = CachedArtifact::new(a, vec![]);
        let copy = cached.clone_cached();
        cached.release().unwrap();
        copy.release().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sentinel_digest_is_stable() {
        assert_eq!(sentinel_digest(), sentinel_digest());
        assert_eq!(sentinel_artifact().id(), "sentinel");
    }
}
