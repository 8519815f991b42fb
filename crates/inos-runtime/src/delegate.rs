//! Delegation seam toward the peer mesh.
//!
//! The mesh itself (routing, P2P transport) is an external collaborator; the
//! supervisor only needs somewhere to hand a job it cannot run locally.

use crate::job::{JobRecord, ResultRecord};
use async_trait::async_trait;
use thiserror::Error;

/// Delegation failures. The supervisor surfaces these as a failed
/// [`ResultRecord`], never as a thrown error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegateError {
    #[error("no route to capability {0}")]
    NoRoute(String),
    #[error("peer failed: {0}")]
    PeerFailure(String),
}

/// Hands jobs to a peer supervisor somewhere in the mesh.
#[async_trait]
pub trait MeshDelegator: Send + Sync {
    async fn delegate(&self, job: JobRecord) -> Result<ResultRecord, DelegateError>;
}

/// Delegator for deployments without a mesh: every delegation fails with
/// `NoRoute`.
#[derive(Debug, Default)]
pub struct NoMesh;

#[async_trait]
impl MeshDelegator for NoMesh {
    async fn delegate(&self, job: JobRecord) -> Result<ResultRecord, DelegateError> {
        Err(DelegateError::NoRoute(job.library))
    }
}
