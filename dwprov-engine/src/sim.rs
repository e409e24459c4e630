//! In-memory warehouse control plane.
//!
//! Answers the logging calls the way the managed service does: logging lives
//! on a cluster, disappears with it, and mutations against a cluster that is
//! still creating or modifying are refused as not ready. Clusters and logging
//! can be manipulated out of band, faults can be injected per operation, and
//! every call is counted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{RemoteClient, RemoteResult};
use crate::error::RemoteError;
use crate::logging::{EnableLoggingRequest, LOGGING_SLOT, LoggingStatus};
use crate::types::ResourceId;

/// Cluster lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    #[default]
    Available,
    Creating,
    Modifying,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Creating => "creating",
            Self::Modifying => "modifying",
        }
    }
}

/// One simulated cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimCluster {
    pub identifier: String,
    pub status: ClusterStatus,
    /// Mutations still to be refused before the cluster becomes available.
    #[serde(default)]
    pub pending_mutations: u32,
    #[serde(default)]
    pub logging: LoggingStatus,
}

/// Serializable view of the whole control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseSnapshot {
    #[serde(default)]
    pub clusters: BTreeMap<String, SimCluster>,
}

/// Remote operations, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Describe,
    Modify,
    Delete,
}

/// Calls received per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: u32,
    pub describe: u32,
    pub modify: u32,
    pub delete: u32,
}

impl CallCounts {
    /// Calls that change remote state.
    pub fn mutations(&self) -> u32 {
        self.create + self.modify + self.delete
    }
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<String, SimCluster>,
    faults: HashMap<Operation, VecDeque<RemoteError>>,
    calls: CallCounts,
}

impl State {
    fn record(&mut self, op: Operation) -> RemoteResult<()> {
        match op {
            Operation::Create => self.calls.create += 1,
            Operation::Describe => self.calls.describe += 1,
            Operation::Modify => self.calls.modify += 1,
            Operation::Delete => self.calls.delete += 1,
        }
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn cluster_mut(&mut self, identifier: &str) -> RemoteResult<&mut SimCluster> {
        self.clusters
            .get_mut(identifier)
            .ok_or_else(|| RemoteError::NotFound(format!("cluster {} not found", identifier)))
    }

    /// Cluster ready to accept a mutation, consuming one pending refusal.
    fn ready_cluster(&mut self, identifier: &str) -> RemoteResult<&mut SimCluster> {
        let cluster = self.cluster_mut(identifier)?;
        if cluster.pending_mutations > 0 {
            cluster.pending_mutations -= 1;
            let status = cluster.status;
            if cluster.pending_mutations == 0 {
                cluster.status = ClusterStatus::Available;
            }
            return Err(RemoteError::NotReady(format!(
                "cluster {} is {}",
                identifier,
                status.as_str()
            )));
        }
        Ok(cluster)
    }
}

fn enable(cluster: &mut SimCluster, req: &EnableLoggingRequest) {
    cluster.logging = LoggingStatus {
        logging_enabled: true,
        log_destination_type: Some(
            req.log_destination_type
                .clone()
                .unwrap_or_else(|| "s3".to_string()),
        ),
        bucket_name: req.bucket_name.clone(),
        s3_key_prefix: req.s3_key_prefix.clone(),
        log_exports: req.log_exports.clone(),
        last_successful_delivery_time: Some(Utc::now().to_rfc3339()),
        last_failure_time: None,
        last_failure_message: None,
    };
}

/// Simulated warehouse control plane implementing the logging client.
#[derive(Default)]
pub struct SimulatedWarehouse {
    state: Mutex<State>,
    latency: Duration,
}

impl SimulatedWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` (cancelable).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn from_snapshot(snapshot: WarehouseSnapshot) -> Self {
        Self {
            state: Mutex::new(State {
                clusters: snapshot.clusters,
                ..Default::default()
            }),
            latency: Duration::ZERO,
        }
    }

    pub async fn snapshot(&self) -> WarehouseSnapshot {
        WarehouseSnapshot {
            clusters: self.state.lock().await.clusters.clone(),
        }
    }

    /// Add an available cluster.
    pub async fn add_cluster(&self, identifier: &str) {
        self.add_pending_cluster(identifier, 0).await;
    }

    /// Add a cluster that refuses the next `pending` mutations as not ready.
    pub async fn add_pending_cluster(&self, identifier: &str, pending: u32) {
        let status = if pending > 0 {
            ClusterStatus::Creating
        } else {
            ClusterStatus::Available
        };
        self.state.lock().await.clusters.insert(
            identifier.to_string(),
            SimCluster {
                identifier: identifier.to_string(),
                status,
                pending_mutations: pending,
                logging: LoggingStatus::default(),
            },
        );
    }

    /// Put an existing cluster into a modifying window of `pending` refusals.
    pub async fn set_pending(&self, identifier: &str, pending: u32) -> bool {
        let mut state = self.state.lock().await;
        match state.clusters.get_mut(identifier) {
            Some(cluster) => {
                cluster.pending_mutations = pending;
                cluster.status = if pending > 0 {
                    ClusterStatus::Modifying
                } else {
                    ClusterStatus::Available
                };
                true
            }
            None => false,
        }
    }

    /// Delete a cluster out of band. Its logging goes with it.
    pub async fn delete_cluster(&self, identifier: &str) -> bool {
        self.state
            .lock()
            .await
            .clusters
            .remove(identifier)
            .is_some()
    }

    /// Disable logging out of band.
    pub async fn disable_logging(&self, identifier: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.clusters.get_mut(identifier) {
            Some(cluster) => {
                cluster.logging = LoggingStatus::default();
                true
            }
            None => false,
        }
    }

    /// Overwrite the logging status out of band.
    pub async fn overwrite_logging(&self, identifier: &str, logging: LoggingStatus) -> bool {
        let mut state = self.state.lock().await;
        match state.clusters.get_mut(identifier) {
            Some(cluster) => {
                cluster.logging = logging;
                true
            }
            None => false,
        }
    }

    /// Fail the next call of `op` with `err`. Injected faults queue up.
    pub async fn inject(&self, op: Operation, err: RemoteError) {
        self.state
            .lock()
            .await
            .faults
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub async fn calls(&self) -> CallCounts {
        self.state.lock().await.calls
    }

    pub async fn cluster(&self, identifier: &str) -> Option<SimCluster> {
        self.state.lock().await.clusters.get(identifier).cloned()
    }

    async fn wait(&self, cancel: &CancellationToken) -> RemoteResult<()> {
        if self.latency.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(RemoteError::Unavailable("request canceled".to_string())),
            _ = tokio::time::sleep(self.latency) => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteClient for SimulatedWarehouse {
    type Request = EnableLoggingRequest;
    type Response = LoggingStatus;

    async fn create(
        &self,
        req: &Self::Request,
        cancel: &CancellationToken,
    ) -> RemoteResult<ResourceId> {
        self.wait(cancel).await?;
        let mut state = self.state.lock().await;
        state.record(Operation::Create)?;
        debug!(cluster = %req.cluster_identifier, "sim: enable logging");
        let cluster = state.ready_cluster(&req.cluster_identifier)?;
        enable(cluster, req);
        Ok(ResourceId::new(req.cluster_identifier.clone(), LOGGING_SLOT))
    }

    async fn describe(
        &self,
        id: &ResourceId,
        cancel: &CancellationToken,
    ) -> RemoteResult<Self::Response> {
        self.wait(cancel).await?;
        let mut state = self.state.lock().await;
        state.record(Operation::Describe)?;
        Ok(state.cluster_mut(id.parent())?.logging.clone())
    }

    async fn modify(
        &self,
        id: &ResourceId,
        req: &Self::Request,
        cancel: &CancellationToken,
    ) -> RemoteResult<()> {
        self.wait(cancel).await?;
        let mut state = self.state.lock().await;
        state.record(Operation::Modify)?;
        debug!(id = %id, "sim: modify logging");
        let cluster = state.ready_cluster(id.parent())?;
        enable(cluster, req);
        Ok(())
    }

    async fn delete(&self, id: &ResourceId, cancel: &CancellationToken) -> RemoteResult<()> {
        self.wait(cancel).await?;
        let mut state = self.state.lock().await;
        state.record(Operation::Delete)?;
        debug!(id = %id, "sim: disable logging");
        let cluster = state.ready_cluster(id.parent())?;
        cluster.logging = LoggingStatus::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cluster: &str) -> EnableLoggingRequest {
        EnableLoggingRequest {
            cluster_identifier: cluster.to_string(),
            log_destination_type: Some("cloudwatch".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enable_then_describe() {
        let sim = SimulatedWarehouse::new();
        sim.add_cluster("c1").await;
        let cancel = CancellationToken::new();

        let id = sim.create(&request("c1"), &cancel).await.unwrap();
        assert_eq!(id.to_string(), "c1:logging");

        let status = sim.describe(&id, &cancel).await.unwrap();
        assert!(status.logging_enabled);
        assert_eq!(status.log_destination_type.as_deref(), Some("cloudwatch"));
        assert!(status.last_successful_delivery_time.is_some());
    }

    #[tokio::test]
    async fn missing_cluster_is_not_found() {
        let sim = SimulatedWarehouse::new();
        let cancel = CancellationToken::new();
        let id = ResourceId::new("c9", LOGGING_SLOT);
        assert!(sim.describe(&id, &cancel).await.unwrap_err().is_not_found());
        assert!(sim.create(&request("c9"), &cancel).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn pending_cluster_refuses_mutations() {
        let sim = SimulatedWarehouse::new();
        sim.add_pending_cluster("c1", 2).await;
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let err = sim.create(&request("c1"), &cancel).await.unwrap_err();
            assert!(matches!(err, RemoteError::NotReady(_)));
        }
        assert!(sim.create(&request("c1"), &cancel).await.is_ok());
        assert_eq!(
            sim.cluster("c1").await.unwrap().status,
            ClusterStatus::Available
        );
        assert_eq!(sim.calls().await.create, 3);
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let sim = SimulatedWarehouse::new();
        sim.add_cluster("c1").await;
        sim.inject(Operation::Describe, RemoteError::Throttled("slow down".into()))
            .await;
        let cancel = CancellationToken::new();
        let id = ResourceId::new("c1", LOGGING_SLOT);

        assert!(sim.describe(&id, &cancel).await.is_err());
        assert!(sim.describe(&id, &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_json() {
        let sim = SimulatedWarehouse::new();
        sim.add_cluster("c1").await;
        let cancel = CancellationToken::new();
        sim.create(&request("c1"), &cancel).await.unwrap();

        let json = serde_json::to_string(&sim.snapshot().await).unwrap();
        let restored = SimulatedWarehouse::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.snapshot().await, sim.snapshot().await);
        assert_eq!(restored.calls().await, CallCounts::default());
    }
}
