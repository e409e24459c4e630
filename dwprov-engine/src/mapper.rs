//! Conversion between declared specs and a remote API's request/response
//! shapes.

use crate::error::Result;
use crate::types::{RemoteState, ResourceId, ResourceSpec};

/// Two-way mapping for one resource kind.
///
/// `to_request` followed by a faithful remote echo and `from_response` must
/// reproduce every attribute of a normalized spec.
pub trait StateMapper: Send + Sync {
    type Request: Send + Sync;
    type Response: Send;

    /// Discriminator used as the slot of every identifier of this kind.
    fn slot(&self) -> &'static str;

    /// Validate a declared spec and bring it into canonical form. This is the
    /// only fallible step on the desired-state side; everything downstream
    /// assumes a normalized spec.
    fn normalize(&self, spec: ResourceSpec) -> Result<ResourceSpec>;

    fn to_request(&self, spec: &ResourceSpec) -> Self::Request;

    /// Interpret a describe response. `Ok(None)` means the response itself
    /// reports the resource as absent.
    fn from_response(&self, id: &ResourceId, resp: Self::Response) -> Result<Option<RemoteState>>;

    /// Rebuild a declared spec from observed state (import).
    fn to_spec(&self, name: &str, state: &RemoteState) -> ResourceSpec {
        ResourceSpec {
            name: name.to_string(),
            parent_identifier: state.id.parent().to_string(),
            attributes: state.attributes.clone(),
        }
    }

    /// Attributes the remote fills in when the spec leaves them out. An
    /// undeclared defaulted attribute never counts as drift.
    fn defaulted_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn id_for(&self, spec: &ResourceSpec) -> ResourceId {
        spec.id(self.slot())
    }
}
