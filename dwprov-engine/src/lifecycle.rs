//! Lifecycle controller - top-level create/update/delete orchestration for
//! tracked instances.
//!
//! The controller is the only writer of the tracking store. Calls for the
//! same identifier are serialized through a keyed lock; calls for different
//! identifiers run concurrently.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::RemoteClient;
use crate::drift::{DriftDetector, DriftStatus, FieldDiff};
use crate::error::{Error, Result};
use crate::mapper::StateMapper;
use crate::reconciler::Reconciler;
use crate::retry::RetryConfig;
use crate::store::InstanceStore;
use crate::types::{ReconcileResult, RemoteState, ResourceId, ResourceSpec, TrackedInstance};

/// What `apply` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    Created,
    Updated,
    /// The instance was tracked but gone remotely, and was created again.
    Recreated,
    /// The identifier changed; the old instance was deleted and a new one created.
    Replaced,
    /// Nothing to do.
    InSync,
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Recreated => "recreated",
            Self::Replaced => "replaced",
            Self::InSync => "in sync",
        };
        f.write_str(s)
    }
}

/// Result of a successful `apply`.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub action: ApplyAction,
    pub instance: TrackedInstance,
    /// Remote state read back after the last mutation.
    pub remote: RemoteState,
}

/// Read-only preview of what `apply` would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Create,
    Update(Vec<FieldDiff>),
    Recreate,
    Replace { from: ResourceId },
    NoOp,
}

impl PlannedAction {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::NoOp)
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update(diff) => {
                let fields: Vec<String> = diff.iter().map(ToString::to_string).collect();
                write!(f, "update ({})", fields.join("; "))
            }
            Self::Recreate => f.write_str("recreate (gone remotely)"),
            Self::Replace { from } => write!(f, "replace {}", from),
            Self::NoOp => f.write_str("no changes"),
        }
    }
}

/// Declared specs matched against tracked records.
#[derive(Debug, Default)]
pub struct DeclaredSet {
    pub pairs: Vec<(ResourceSpec, Option<TrackedInstance>)>,
    /// Tracked records no declared spec owns or addresses.
    pub stale: Vec<TrackedInstance>,
}

/// Outcome of synchronizing a full set of declared specs.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub applied: Vec<(String, Result<ApplyOutcome>)>,
    pub pruned: Vec<(ResourceId, Result<()>)>,
}

impl SyncReport {
    pub fn failures(&self) -> usize {
        self.applied.iter().filter(|(_, r)| r.is_err()).count()
            + self.pruned.iter().filter(|(_, r)| r.is_err()).count()
    }
}

type LockMap = Arc<StdMutex<HashMap<ResourceId, Arc<Mutex<()>>>>>;

/// Per-identifier async locks. An entry lives only while someone holds or
/// waits for it.
#[derive(Default)]
struct KeyedLocks {
    locks: LockMap,
}

/// Held lock for one identifier. Releasing the last reference drops the
/// map entry.
struct KeyedGuard {
    id: ResourceId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

impl KeyedLocks {
    /// Acquire the locks for every id, in identifier order.
    async fn acquire(&self, ids: impl IntoIterator<Item = ResourceId>) -> Vec<KeyedGuard> {
        let ordered: BTreeSet<ResourceId> = ids.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for id in ordered {
            let lock = self
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(id.clone())
                .or_default()
                .clone();
            guards.push(KeyedGuard {
                id,
                guard: Some(lock.lock_owned().await),
                locks: Arc::clone(&self.locks),
            });
        }
        guards
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Orchestrates create/update/delete for instances of one resource kind.
pub struct LifecycleController<C, M> {
    reconciler: Arc<Reconciler<C, M>>,
    detector: DriftDetector<C, M>,
    store: Arc<dyn InstanceStore>,
    locks: KeyedLocks,
}

impl<C, M> LifecycleController<C, M>
where
    C: RemoteClient,
    M: StateMapper<Request = C::Request, Response = C::Response>,
{
    pub fn new(
        client: Arc<C>,
        mapper: Arc<M>,
        store: Arc<dyn InstanceStore>,
        retry: RetryConfig,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(client, mapper, retry));
        Self {
            detector: DriftDetector::new(Arc::clone(&reconciler)),
            reconciler,
            store,
            locks: KeyedLocks::default(),
        }
    }

    pub fn mapper(&self) -> &M {
        self.reconciler.mapper()
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// Parse an identifier, accepting a bare parent for this kind's slot.
    pub fn parse_id(&self, s: &str) -> Result<ResourceId> {
        ResourceId::parse(s, self.mapper().slot())
    }

    /// Tracked record declared under `name`, if any.
    pub async fn tracked_by_name(&self, name: &str) -> Result<Option<TrackedInstance>> {
        Ok(self.store.list().await?.into_iter().find(|i| i.name == name))
    }

    /// Converge the remote toward `spec`.
    ///
    /// A tracked instance that is gone remotely is recreated; this is not an
    /// error. Fatal and malformed-response errors are surfaced unchanged.
    pub async fn apply(
        &self,
        spec: ResourceSpec,
        existing: Option<&TrackedInstance>,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome> {
        let spec = self.mapper().normalize(spec)?;
        let id = self.mapper().id_for(&spec);
        let replaced = existing.filter(|prev| prev.id != id);
        let _guards = self
            .locks
            .acquire(std::iter::once(id.clone()).chain(replaced.map(|p| p.id.clone())))
            .await;

        let Some(prev) = existing else {
            return self.create(spec, None, ApplyAction::Created, cancel).await;
        };

        if let Some(old) = replaced {
            info!(from = %old.id, to = %id, "Identifier changed, replacing");
            self.reconciler
                .delete(&old.id, cancel)
                .await
                .into_result("delete", &old.id)?;
            self.store.remove(&old.id).await?;
            return self.create(spec, None, ApplyAction::Replaced, cancel).await;
        }

        match self.detector.check_against(&id, &spec, cancel).await? {
            DriftStatus::InSync(remote) => {
                let mut instance = prev.clone();
                if instance.spec != spec {
                    instance.advance(spec);
                    self.store.put(&instance).await?;
                }
                Ok(ApplyOutcome {
                    action: ApplyAction::InSync,
                    instance,
                    remote,
                })
            }
            DriftStatus::Drifted { .. } => match self.reconciler.update(&id, &spec, cancel).await {
                ReconcileResult::Gone => {
                    warn!(id = %id, "Gone during update, recreating");
                    self.create(spec, Some(prev), ApplyAction::Recreated, cancel)
                        .await
                }
                result => {
                    result.into_result("update", &id)?;
                    let remote = self.read_back(&id, cancel).await?;
                    let mut instance = prev.clone();
                    instance.advance(spec);
                    self.store.put(&instance).await?;
                    info!(id = %id, generation = instance.generation, "Updated");
                    Ok(ApplyOutcome {
                        action: ApplyAction::Updated,
                        instance,
                        remote,
                    })
                }
            },
            DriftStatus::Gone => {
                warn!(id = %id, "Tracked instance is gone remotely, recreating");
                self.create(spec, Some(prev), ApplyAction::Recreated, cancel)
                    .await
            }
        }
    }

    async fn create(
        &self,
        spec: ResourceSpec,
        prev: Option<&TrackedInstance>,
        action: ApplyAction,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome> {
        let (id, result) = self.reconciler.create(&spec, cancel).await;
        result.into_result("create", &id)?;
        let remote = self.read_back(&id, cancel).await?;

        let instance = match prev {
            Some(p) if p.id == id => {
                let mut instance = p.clone();
                instance.advance(spec);
                instance
            }
            _ => TrackedInstance::new(id, spec),
        };
        self.store.put(&instance).await?;
        info!(id = %instance.id, action = %action, "Applied");

        Ok(ApplyOutcome {
            action,
            instance,
            remote,
        })
    }

    async fn read_back(&self, id: &ResourceId, cancel: &CancellationToken) -> Result<RemoteState> {
        self.reconciler
            .read(id, cancel)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} vanished right after apply", id)))
    }

    /// Preview `apply` without mutating anything.
    pub async fn plan(
        &self,
        spec: ResourceSpec,
        existing: Option<&TrackedInstance>,
        cancel: &CancellationToken,
    ) -> Result<PlannedAction> {
        let spec = self.mapper().normalize(spec)?;
        let id = self.mapper().id_for(&spec);

        let Some(prev) = existing else {
            return Ok(PlannedAction::Create);
        };
        if prev.id != id {
            return Ok(PlannedAction::Replace {
                from: prev.id.clone(),
            });
        }

        Ok(match self.detector.check_against(&id, &spec, cancel).await? {
            DriftStatus::InSync(_) => PlannedAction::NoOp,
            DriftStatus::Drifted { diff, .. } => PlannedAction::Update(diff),
            DriftStatus::Gone => PlannedAction::Recreate,
        })
    }

    /// Compare a tracked instance against its remote state.
    pub async fn check(
        &self,
        instance: &TrackedInstance,
        cancel: &CancellationToken,
    ) -> Result<DriftStatus> {
        self.detector.check(instance, cancel).await
    }

    /// Delete the instance remotely and forget it. Succeeds when the remote
    /// is already absent.
    pub async fn destroy(&self, instance: &TrackedInstance, cancel: &CancellationToken) -> Result<()> {
        self.destroy_id(&instance.id, cancel).await
    }

    /// Destroy by identifier, whether or not it is tracked.
    pub async fn destroy_id(&self, id: &ResourceId, cancel: &CancellationToken) -> Result<()> {
        let _guards = self.locks.acquire([id.clone()]).await;
        self.reconciler
            .delete(id, cancel)
            .await
            .into_result("delete", id)?;
        if self.store.remove(id).await? {
            info!(id = %id, "Destroyed");
        } else {
            info!(id = %id, "Destroyed untracked instance");
        }
        Ok(())
    }

    /// Whether the tracked instance still exists remotely. Deleting its
    /// parent makes it report false.
    pub async fn exists(&self, instance: &TrackedInstance, cancel: &CancellationToken) -> Result<bool> {
        Ok(!self.detector.check(instance, cancel).await?.is_gone())
    }

    /// Existence probe by identifier alone.
    pub async fn exists_id(&self, id: &ResourceId, cancel: &CancellationToken) -> Result<bool> {
        Ok(self.reconciler.read(id, cancel).await?.is_some())
    }

    /// Attach an existing remote instance to a tracking record.
    pub async fn import(
        &self,
        id: &ResourceId,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<TrackedInstance> {
        let _guards = self.locks.acquire([id.clone()]).await;
        let remote = self
            .reconciler
            .read(id, cancel)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cannot import {}: no such resource", id)))?;

        let spec = self.mapper().normalize(self.mapper().to_spec(name, &remote))?;
        let instance = match self.store.get(id).await? {
            Some(mut tracked) => {
                tracked.advance(spec);
                tracked
            }
            None => TrackedInstance::new(id.clone(), spec),
        };
        self.store.put(&instance).await?;
        info!(id = %id, name = %name, "Imported");
        Ok(instance)
    }

    /// Fail if any of `ids` still exists remotely.
    pub async fn verify_destroyed(&self, ids: &[ResourceId], cancel: &CancellationToken) -> Result<()> {
        for id in ids {
            if self.exists_id(id, cancel).await? {
                return Err(Error::NotDestroyed(id.clone()));
            }
        }
        Ok(())
    }

    /// Pair each declared spec with the tracked record it owns.
    ///
    /// A record is owned by the spec with the same name or, failing that, by
    /// the spec addressing its identifier when its own name is no longer
    /// declared (a renamed block). Records no spec owns or addresses are
    /// stale. Two specs with the same name or the same identifier are
    /// rejected.
    pub fn pair_declared(
        &self,
        specs: Vec<ResourceSpec>,
        tracked: &[TrackedInstance],
    ) -> Result<DeclaredSet> {
        let mut names = HashSet::new();
        let mut claimed = HashSet::new();
        for spec in &specs {
            if !names.insert(spec.name.clone()) {
                return Err(Error::validation(format!(
                    "resource '{}' is declared more than once",
                    spec.name
                )));
            }
            let id = self.mapper().id_for(spec);
            if !claimed.insert(id.clone()) {
                return Err(Error::validation(format!(
                    "{} is declared by more than one resource",
                    id
                )));
            }
        }

        let mut pairs = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self.mapper().id_for(&spec);
            let existing = tracked
                .iter()
                .find(|t| t.name == spec.name)
                .or_else(|| {
                    tracked
                        .iter()
                        .find(|t| t.id == id && !names.contains(&t.name))
                })
                .cloned();
            if let Some(prev) = &existing {
                claimed.insert(prev.id.clone());
            }
            pairs.push((spec, existing));
        }

        let stale = tracked
            .iter()
            .filter(|t| !claimed.contains(&t.id))
            .cloned()
            .collect();
        Ok(DeclaredSet { pairs, stale })
    }

    /// Apply every declared spec and destroy tracked instances nothing
    /// declares any more. Distinct instances are applied concurrently.
    pub async fn sync(&self, specs: Vec<ResourceSpec>, cancel: &CancellationToken) -> Result<SyncReport> {
        let tracked = self.store.list().await?;
        let DeclaredSet { pairs, stale } = self.pair_declared(specs, &tracked)?;

        let applies = pairs.into_iter().map(|(spec, existing)| {
            let name = spec.name.clone();
            async move {
                let result = self.apply(spec, existing.as_ref(), cancel).await;
                if let Err(e) = &result {
                    error!(name = %name, error = %e, "Apply failed");
                }
                (name, result)
            }
        });
        let applied = join_all(applies).await;

        let mut pruned = Vec::new();
        for instance in &stale {
            info!(id = %instance.id, name = %instance.name, "Pruning undeclared instance");
            let result = self.destroy(instance, cancel).await;
            if let Err(e) = &result {
                error!(id = %instance.id, error = %e, "Prune failed");
            }
            pruned.push((instance.id.clone(), result));
        }

        Ok(SyncReport { applied, pruned })
    }
}
