//! Controllers for the NATS Kubernetes Operator
//!
//! One [`ClusterController`] runs per NatsCluster and reconciles the actual
//! object graph with the desired state of the custom resource.

mod cluster;

pub use cluster::{ClusterController, PodPhase, PodRecord, SpecDiff, StopOutcome};
