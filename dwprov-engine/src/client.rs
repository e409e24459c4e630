//! Capability interface to a remote control plane for one resource kind.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RemoteError;
use crate::types::ResourceId;

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// The four calls the engine needs from a remote API.
///
/// Every call receives the caller's cancellation token; implementations that
/// perform real I/O should abandon the call once it fires.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Request shape for create and modify.
    type Request: Send + Sync;
    /// Response shape for describe.
    type Response: Send;

    /// Create the resource, returning the identifier it is addressed by.
    async fn create(
        &self,
        req: &Self::Request,
        cancel: &CancellationToken,
    ) -> RemoteResult<ResourceId>;

    /// Describe the resource. `RemoteError::NotFound` means it is absent.
    async fn describe(
        &self,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> RemoteResult<Self::Response>;

    /// Modify an existing resource in place.
    async fn modify(
        &self,
        id: &ResourceId,
        req: &Self::Request,
        cancel: &CancellationToken,
    ) -> RemoteResult<()>;

    /// Delete the resource.
    async fn delete(&self, id: &ResourceId, cancel: &CancellationToken) -> RemoteResult<()>;
}
