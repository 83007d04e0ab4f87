//! Custom Resource Definitions for the NATS Kubernetes Operator
//!
//! - NatsCluster: a NATS server cluster deployment

mod cluster;

pub use cluster::{
    ClusterCondition, ClusterKey, ClusterPhase, NatsCluster, NatsClusterSpec, NatsClusterStatus,
    ServerConfigSpec, TlsConfig,
};
