//! Drift detection: compare freshly read remote state against the desired
//! spec of a tracked instance.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::RemoteClient;
use crate::error::Result;
use crate::mapper::StateMapper;
use crate::reconciler::Reconciler;
use crate::types::{AttrValue, RemoteState, ResourceId, ResourceSpec, TrackedInstance};

/// One attribute whose remote value differs from the desired value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    pub field: String,
    pub desired: Option<AttrValue>,
    pub actual: Option<AttrValue>,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<AttrValue>| match v {
            Some(v) => v.to_string(),
            None => "(unset)".to_string(),
        };
        write!(
            f,
            "{}: {} -> {}",
            self.field,
            show(&self.actual),
            show(&self.desired)
        )
    }
}

/// Result of comparing remote state to a desired spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftStatus {
    InSync(RemoteState),
    Drifted {
        diff: Vec<FieldDiff>,
        remote: RemoteState,
    },
    /// The remote confirmed the resource is absent.
    Gone,
}

impl DriftStatus {
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone)
    }

    pub fn is_in_sync(&self) -> bool {
        matches!(self, Self::InSync(_))
    }
}

/// Field-by-field comparison of declared attributes against observed ones.
///
/// Computed fields live outside `RemoteState::attributes` and are never
/// compared. Defaulted fields only count when `spec` declares them.
pub fn diff_fields<M>(mapper: &M, spec: &ResourceSpec, actual: &RemoteState) -> Vec<FieldDiff>
where
    M: StateMapper + ?Sized,
{
    let defaulted = mapper.defaulted_fields();
    let keys: BTreeSet<&String> = spec
        .attributes
        .keys()
        .chain(actual.attributes.keys())
        .collect();

    keys.into_iter()
        .filter_map(|key| {
            let desired = spec.attributes.get(key);
            let observed = actual.attributes.get(key);
            if desired.is_none() && defaulted.contains(&key.as_str()) {
                return None;
            }
            (desired != observed).then(|| FieldDiff {
                field: key.clone(),
                desired: desired.cloned(),
                actual: observed.cloned(),
            })
        })
        .collect()
}

/// Re-reads remote state and reports whether it still matches.
pub struct DriftDetector<C, M> {
    reconciler: Arc<Reconciler<C, M>>,
}

impl<C, M> DriftDetector<C, M>
where
    C: RemoteClient,
    M: StateMapper<Request = C::Request, Response = C::Response>,
{
    pub fn new(reconciler: Arc<Reconciler<C, M>>) -> Self {
        Self { reconciler }
    }

    /// Compare the instance's remote state against its last applied spec.
    ///
    /// A transient read failure surfaces as an error; only a confirmed
    /// absence is [`DriftStatus::Gone`].
    pub async fn check(
        &self,
        instance: &TrackedInstance,
        cancel: &CancellationToken,
    ) -> Result<DriftStatus> {
        self.check_against(&instance.id, &instance.spec, cancel).await
    }

    /// Compare the remote state at `id` against an arbitrary desired spec.
    pub async fn check_against(
        &self,
        id: &ResourceId,
        spec: &ResourceSpec,
        cancel: &CancellationToken,
    ) -> Result<DriftStatus> {
        let Some(remote) = self.reconciler.read(id, cancel).await? else {
            info!(id = %id, "Remote resource is gone");
            return Ok(DriftStatus::Gone);
        };

        let diff = diff_fields(self.reconciler.mapper(), spec, &remote);
        if diff.is_empty() {
            debug!(id = %id, "In sync");
            Ok(DriftStatus::InSync(remote))
        } else {
            info!(id = %id, fields = diff.len(), "Drift detected");
            Ok(DriftStatus::Drifted { diff, remote })
        }
    }
}
