//! Reconciler - drives one resource instance toward its desired state
//! through the remote client.
//!
//! Retryable remote failures are absorbed here with bounded backoff; every
//! other failure is handed to the caller unchanged.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::RemoteClient;
use crate::drift::diff_fields;
use crate::error::{Error, Result};
use crate::mapper::StateMapper;
use crate::retry::{RetryConfig, RetryError, retry_remote};
use crate::types::{ReconcileResult, RemoteState, ResourceId, ResourceSpec};

/// Reconciler for one resource kind.
pub struct Reconciler<C, M> {
    client: Arc<C>,
    mapper: Arc<M>,
    retry: RetryConfig,
}

fn retry_failure(operation: &'static str, id: &ResourceId, err: RetryError) -> Error {
    match err {
        RetryError::Rejected { error, .. } => Error::Fatal {
            operation,
            id: id.to_string(),
            source: error,
        },
        RetryError::Exhausted { attempts, last } => Error::RetryExhausted {
            operation,
            id: id.to_string(),
            attempts,
            last,
        },
        RetryError::Canceled { attempts } => Error::Canceled {
            operation,
            id: id.to_string(),
            attempts,
        },
    }
}

fn is_not_found(err: &RetryError) -> bool {
    matches!(err, RetryError::Rejected { error, .. } if error.is_not_found())
}

impl<C, M> Reconciler<C, M>
where
    C: RemoteClient,
    M: StateMapper<Request = C::Request, Response = C::Response>,
{
    pub fn new(client: Arc<C>, mapper: Arc<M>, retry: RetryConfig) -> Self {
        Self {
            client,
            mapper,
            retry,
        }
    }

    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Issue a create call for `spec`.
    ///
    /// A missing parent is fatal; a parent that is not ready yet is retried
    /// until the budget runs out.
    pub async fn create(
        &self,
        spec: &ResourceSpec,
        cancel: &CancellationToken,
    ) -> (ResourceId, ReconcileResult) {
        let id = self.mapper.id_for(spec);
        let req = self.mapper.to_request(spec);
        info!(id = %id, "Creating");

        let outcome = retry_remote(&self.retry, "create", cancel, || {
            self.client.create(&req, cancel)
        })
        .await;

        match outcome {
            Ok(created) => {
                info!(id = %created, "Created");
                (created, ReconcileResult::Converged)
            }
            Err(e) => {
                let result = ReconcileResult::from_error(retry_failure("create", &id, e));
                (id, result)
            }
        }
    }

    /// Describe the resource. `Ok(None)` is a confirmed absence, not an error.
    pub async fn read(
        &self,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> Result<Option<RemoteState>> {
        debug!(id = %id, "Reading");
        match retry_remote(&self.retry, "describe", cancel, || {
            self.client.describe(id, cancel)
        })
        .await
        {
            Ok(resp) => self.mapper.from_response(id, resp),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(retry_failure("describe", id, e)),
        }
    }

    /// Bring the resource at `id` in line with `spec`. No modify call is made
    /// when the remote already matches.
    pub async fn update(
        &self,
        id: &ResourceId,
        spec: &ResourceSpec,
        cancel: &CancellationToken,
    ) -> ReconcileResult {
        let current = match self.read(id, cancel).await {
            Ok(Some(current)) => current,
            Ok(None) => return ReconcileResult::Gone,
            Err(e) => return ReconcileResult::from_error(e),
        };

        let diff = diff_fields(self.mapper.as_ref(), spec, &current);
        if diff.is_empty() {
            debug!(id = %id, "Already converged, skipping modify");
            return ReconcileResult::Converged;
        }

        info!(id = %id, fields = diff.len(), "Modifying");
        let req = self.mapper.to_request(spec);
        match retry_remote(&self.retry, "modify", cancel, || {
            self.client.modify(id, &req, cancel)
        })
        .await
        {
            Ok(()) => ReconcileResult::Converged,
            Err(e) if is_not_found(&e) => ReconcileResult::Gone,
            Err(e) => ReconcileResult::from_error(retry_failure("modify", id, e)),
        }
    }

    /// Delete the resource. Already absent counts as converged, and no
    /// delete call is issued in that case.
    pub async fn delete(&self, id: &ResourceId, cancel: &CancellationToken) -> ReconcileResult {
        match retry_remote(&self.retry, "describe", cancel, || {
            self.client.describe(id, cancel)
        })
        .await
        {
            Ok(resp) => {
                // A malformed response still proves the resource exists.
                if let Ok(None) = self.mapper.from_response(id, resp) {
                    debug!(id = %id, "Already absent, nothing to delete");
                    return ReconcileResult::Converged;
                }
            }
            Err(e) if is_not_found(&e) => {
                debug!(id = %id, "Already absent, nothing to delete");
                return ReconcileResult::Converged;
            }
            Err(e) => return ReconcileResult::from_error(retry_failure("describe", id, e)),
        }

        info!(id = %id, "Deleting");
        match retry_remote(&self.retry, "delete", cancel, || {
            self.client.delete(id, cancel)
        })
        .await
        {
            Ok(()) => ReconcileResult::Converged,
            Err(e) if is_not_found(&e) => ReconcileResult::Converged,
            Err(e) => ReconcileResult::from_error(retry_failure("delete", id, e)),
        }
    }
}

