//! Reconciler behavior against the simulated control plane.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{cloudwatch, fast_retry};
use dwprov_engine::logging::{ATTR_LOG_EXPORTS, LoggingStatus};
use dwprov_engine::sim::Operation;
use dwprov_engine::{
    Error, LoggingMapper, ReconcileResult, Reconciler, RemoteError, ResourceId, RetryConfig,
    SimulatedWarehouse, StateMapper,
};
use tokio_util::sync::CancellationToken;

async fn reconciler(
    clusters: &[&str],
    retry: RetryConfig,
) -> (Arc<SimulatedWarehouse>, Reconciler<SimulatedWarehouse, LoggingMapper>) {
    let sim = Arc::new(SimulatedWarehouse::new());
    for cluster in clusters {
        sim.add_cluster(cluster).await;
    }
    let reconciler = Reconciler::new(Arc::clone(&sim), Arc::new(LoggingMapper), retry);
    (sim, reconciler)
}

#[tokio::test]
async fn test_create_then_read() {
    let (_sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();
    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();

    let (id, result) = reconciler.create(&spec, &cancel).await;
    assert!(result.is_converged());
    assert_eq!(id, ResourceId::new("c1", "logging"));

    // Round trip through the remote reproduces every declared attribute.
    let state = reconciler.read(&id, &cancel).await.unwrap().unwrap();
    assert_eq!(state.attributes, spec.attributes);
    assert_eq!(state.parent_identifier(), "c1");
}

#[tokio::test]
async fn test_read_absent_is_none_not_error() {
    let (_sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();

    // Cluster exists, logging never enabled.
    let id = ResourceId::new("c1", "logging");
    assert!(reconciler.read(&id, &cancel).await.unwrap().is_none());

    // Cluster does not exist at all.
    let id = ResourceId::new("nope", "logging");
    assert!(reconciler.read(&id, &cancel).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_create_retries_not_ready_then_converges() {
    let sim = Arc::new(SimulatedWarehouse::new());
    sim.add_pending_cluster("c1", 3).await;
    let reconciler = Reconciler::new(Arc::clone(&sim), Arc::new(LoggingMapper), fast_retry());
    let cancel = CancellationToken::new();

    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (_, result) = reconciler.create(&spec, &cancel).await;

    assert!(result.is_converged());
    let calls = sim.calls().await;
    assert_eq!(calls.create, 4);
    assert!(calls.create <= fast_retry().max_attempts);
}

#[tokio::test(start_paused = true)]
async fn test_create_not_ready_past_budget_is_retryable() {
    let sim = Arc::new(SimulatedWarehouse::new());
    sim.add_pending_cluster("c1", 100).await;
    let reconciler = Reconciler::new(Arc::clone(&sim), Arc::new(LoggingMapper), fast_retry());
    let cancel = CancellationToken::new();

    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (_, result) = reconciler.create(&spec, &cancel).await;

    assert!(matches!(
        result,
        ReconcileResult::Retryable {
            attempts: 5,
            last: RemoteError::NotReady(_)
        }
    ));
    assert_eq!(sim.calls().await.create, 5);
}

#[tokio::test(start_paused = true)]
async fn test_create_canceled_mid_retry() {
    let sim = Arc::new(SimulatedWarehouse::new());
    sim.add_pending_cluster("c1", u32::MAX).await;
    let retry = RetryConfig {
        max_attempts: 0,
        initial_delay_ms: 1_000,
        max_delay_ms: 1_000,
        max_elapsed_secs: 3_600,
        jitter: false,
        ..Default::default()
    };
    let reconciler = Reconciler::new(Arc::clone(&sim), Arc::new(LoggingMapper), retry);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        trigger.cancel();
    });

    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (_, result) = reconciler.create(&spec, &cancel).await;

    assert!(matches!(result, ReconcileResult::Canceled { attempts: 4 }));
}

#[tokio::test]
async fn test_create_on_missing_parent_is_fatal() {
    let (sim, reconciler) = reconciler(&[], fast_retry()).await;
    let cancel = CancellationToken::new();

    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (_, result) = reconciler.create(&spec, &cancel).await;

    assert!(matches!(
        result,
        ReconcileResult::Fatal(Error::Fatal {
            operation: "create",
            source: RemoteError::NotFound(_),
            ..
        })
    ));
    assert_eq!(sim.calls().await.create, 1);
}

#[tokio::test]
async fn test_update_without_changes_skips_modify() {
    let (sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();
    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (id, _) = reconciler.create(&spec, &cancel).await;

    let result = reconciler.update(&id, &spec, &cancel).await;
    assert!(result.is_converged());
    assert_eq!(sim.calls().await.modify, 0);
}

#[tokio::test]
async fn test_update_with_changes_modifies() {
    let (sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();
    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (id, _) = reconciler.create(&spec, &cancel).await;

    let changed = LoggingMapper
        .normalize(cloudwatch("c1").with_attr(ATTR_LOG_EXPORTS, vec!["userlog"]))
        .unwrap();
    let result = reconciler.update(&id, &changed, &cancel).await;
    assert!(result.is_converged());
    assert_eq!(sim.calls().await.modify, 1);

    let state = reconciler.read(&id, &cancel).await.unwrap().unwrap();
    assert_eq!(state.attributes, changed.attributes);
}

#[tokio::test]
async fn test_update_gone_resource() {
    let (sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();
    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (id, _) = reconciler.create(&spec, &cancel).await;
    sim.delete_cluster("c1").await;

    let result = reconciler.update(&id, &spec, &cancel).await;
    assert!(matches!(result, ReconcileResult::Gone));
    assert_eq!(sim.calls().await.modify, 0);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();
    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (id, _) = reconciler.create(&spec, &cancel).await;

    assert!(reconciler.delete(&id, &cancel).await.is_converged());
    assert_eq!(sim.calls().await.delete, 1);

    assert!(reconciler.delete(&id, &cancel).await.is_converged());
    assert_eq!(sim.calls().await.delete, 1);
}

#[tokio::test]
async fn test_delete_with_malformed_status_still_deletes() {
    let (sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();
    sim.overwrite_logging(
        "c1",
        LoggingStatus {
            logging_enabled: true,
            ..Default::default()
        },
    )
    .await;

    let id = ResourceId::new("c1", "logging");
    assert!(matches!(
        reconciler.read(&id, &cancel).await,
        Err(Error::MalformedResponse { .. })
    ));
    assert!(reconciler.delete(&id, &cancel).await.is_converged());
    assert_eq!(sim.calls().await.delete, 1);
}

#[tokio::test(start_paused = true)]
async fn test_read_retries_throttling() {
    let (sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();
    sim.inject(Operation::Describe, RemoteError::Throttled("rate exceeded".into()))
        .await;
    sim.inject(Operation::Describe, RemoteError::Unavailable("connection reset".into()))
        .await;

    let id = ResourceId::new("c1", "logging");
    assert!(reconciler.read(&id, &cancel).await.unwrap().is_none());
    assert_eq!(sim.calls().await.describe, 3);
}

#[tokio::test]
async fn test_fatal_modify_is_not_retried() {
    let (sim, reconciler) = reconciler(&["c1"], fast_retry()).await;
    let cancel = CancellationToken::new();
    let spec = LoggingMapper.normalize(cloudwatch("c1")).unwrap();
    let (id, _) = reconciler.create(&spec, &cancel).await;
    sim.inject(
        Operation::Modify,
        RemoteError::Fatal("InsufficientS3BucketPolicyFault".into()),
    )
    .await;

    let changed = LoggingMapper
        .normalize(cloudwatch("c1").with_attr(ATTR_LOG_EXPORTS, vec!["connectionlog"]))
        .unwrap();
    let result = reconciler.update(&id, &changed, &cancel).await;
    assert!(matches!(result, ReconcileResult::Fatal(Error::Fatal { .. })));
    assert_eq!(sim.calls().await.modify, 1);
}
