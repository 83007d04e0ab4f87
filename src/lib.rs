//! NATS Kubernetes Operator
//!
//! A Kubernetes operator that runs NATS server clusters declared as
//! `NatsCluster` custom resources.
//!
//! ## Custom Resources
//!
//! - `NatsCluster`: a set of NATS server pods wired together through a
//!   headless routes service, with a client service in front and a shared
//!   server configuration in a ConfigMap
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: messaging.nats.io/v1alpha2
//! kind: NatsCluster
//! metadata:
//!   name: my-cluster
//! spec:
//!   size: 3
//!   version: "2.10.22"
//!   tls:
//!     serverSecret: nats-server-tls
//!     routesSecret: nats-routes-tls
//! ```

pub mod conditions;
pub mod config;
pub mod constants;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod operator;
pub mod registrar;
pub mod registry;
pub mod resources;
pub mod runtime;

pub use controllers::{ClusterController, PodPhase, PodRecord, SpecDiff, StopOutcome};
pub use crd::{
    ClusterCondition, ClusterKey, ClusterPhase, NatsCluster, NatsClusterSpec, NatsClusterStatus,
    ServerConfigSpec, TlsConfig,
};
pub use error::{OperatorError, RegistrationError, Result};
pub use events::ClusterEvent;
pub use operator::{Operator, OperatorConfig, OperatorState};
pub use runtime::{ClusterRuntime, KubeRuntimeProvider, RuntimeProvider};
