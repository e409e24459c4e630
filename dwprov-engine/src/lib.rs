//! dwprov-engine: declarative-resource reconciliation engine.
//!
//! Drives remote resources toward a declared spec:
//! - [`mapper`] converts between declared specs and remote request/response shapes
//! - [`reconciler`] issues create/describe/modify/delete calls with bounded backoff
//! - [`drift`] re-reads remote state and reports drift or disappearance
//! - [`lifecycle`] orchestrates apply/destroy/import and owns the tracking [`store`]
//!
//! [`logging`] is the concrete resource kind (warehouse cluster audit logging)
//! and [`sim`] an in-memory control plane serving it.

pub mod client;
pub mod drift;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod mapper;
pub mod reconciler;
pub mod retry;
pub mod sim;
pub mod store;
pub mod types;

pub use client::RemoteClient;
pub use drift::{DriftDetector, DriftStatus, FieldDiff};
pub use error::{Error, RemoteError, Result};
pub use lifecycle::{
    ApplyAction, ApplyOutcome, DeclaredSet, LifecycleController, PlannedAction, SyncReport,
};
pub use logging::{LoggingMapper, LOGGING_SLOT};
pub use mapper::StateMapper;
pub use reconciler::Reconciler;
pub use retry::RetryConfig;
pub use sim::SimulatedWarehouse;
pub use store::{InstanceStore, MemoryStore, SqliteStore};
pub use types::{AttrValue, ReconcileResult, RemoteState, ResourceId, ResourceSpec, TrackedInstance};
