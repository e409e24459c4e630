//! Test helpers for dwprov-engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use dwprov_engine::logging::{ATTR_BUCKET_NAME, ATTR_LOG_DESTINATION_TYPE};
use dwprov_engine::{
    InstanceStore, LifecycleController, LoggingMapper, MemoryStore, ResourceSpec, RetryConfig,
    SimulatedWarehouse,
};
use tokio_util::sync::CancellationToken;

/// Small, deterministic backoff so retries finish quickly.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 10,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
        max_elapsed_secs: 60,
        jitter: false,
    }
}

pub fn cloudwatch(parent: &str) -> ResourceSpec {
    ResourceSpec::new("test", parent).with_attr(ATTR_LOG_DESTINATION_TYPE, "cloudwatch")
}

pub fn s3(parent: &str, bucket: &str) -> ResourceSpec {
    ResourceSpec::new("test", parent)
        .with_attr(ATTR_LOG_DESTINATION_TYPE, "s3")
        .with_attr(ATTR_BUCKET_NAME, bucket)
}

pub type Controller = LifecycleController<SimulatedWarehouse, LoggingMapper>;

/// Simulated control plane plus a controller wired to it.
pub struct Harness {
    pub sim: Arc<SimulatedWarehouse>,
    pub store: Arc<dyn InstanceStore>,
    pub controller: Controller,
    pub cancel: CancellationToken,
}

impl Harness {
    /// Harness with the given clusters already available.
    pub async fn new(clusters: &[&str]) -> Self {
        Self::with_store(clusters, Arc::new(MemoryStore::new()), fast_retry()).await
    }

    pub async fn with_store(
        clusters: &[&str],
        store: Arc<dyn InstanceStore>,
        retry: RetryConfig,
    ) -> Self {
        let sim = Arc::new(SimulatedWarehouse::new());
        for cluster in clusters {
            sim.add_cluster(cluster).await;
        }
        let controller = LifecycleController::new(
            Arc::clone(&sim),
            Arc::new(LoggingMapper),
            Arc::clone(&store),
            retry,
        );
        Self {
            sim,
            store,
            controller,
            cancel: CancellationToken::new(),
        }
    }
}
