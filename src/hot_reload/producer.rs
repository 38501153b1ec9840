//! External interfaces of the reload pipeline.
//!
//! The core never interprets artifacts: the producer parses descriptor files
//! into opaque handles and the installer swaps them into the host
//! application under a stable identity, on its single install thread.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CoreResult;

/// Opaque artifact handle produced from a descriptor file.
#[derive(Clone)]
pub struct Artifact(Arc<dyn Any + Send + Sync>);

impl Artifact {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast to the producer's concrete artifact type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Artifact(..)")
    }
}

/// Stable identity under which artifacts are installed and replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactId(pub u64);

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "artifact-{}", self.0)
    }
}

/// Parses a descriptor file into a new artifact and validates it.
pub trait ArtifactProducer: Send + Sync {
    fn produce(&self, path: &Path) -> CoreResult<Artifact>;

    fn validate(&self, _artifact: &Artifact) -> CoreResult<()> {
        Ok(())
    }

    /// Descriptor paths referenced by the artifact beyond the `include`
    /// fields the core parses itself.
    fn dependencies(&self, _artifact: &Artifact) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Swaps artifacts under a stable identity. Implementations are
/// single-threaded; the manager funnels every call through the executor's
/// install thread.
pub trait ArtifactInstaller: Send + Sync {
    /// Snapshot the currently installed artifact, used for rollback points.
    fn snapshot(&self, identity: ArtifactId) -> CoreResult<Artifact>;

    /// Replace the artifact installed under `identity`. The installer
    /// transfers layout slot, size, visibility and parent relationship, and
    /// disposes of the predecessor after the successor is parented.
    fn replace(&self, identity: ArtifactId, new_artifact: Artifact) -> CoreResult<()>;

    fn dispose(&self, _artifact: Artifact) {}
}
