//! NatsCluster Custom Resource Definition
//!
//! The NatsCluster resource: desired size, version and TLS material of a NATS server cluster.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// NatsCluster is the Schema for the natsclusters API
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "messaging.nats.io",
    version = "v1alpha2",
    kind = "NatsCluster",
    plural = "natsclusters",
    singular = "natscluster",
    namespaced,
    status = "NatsClusterStatus",
    shortname = "nats",
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readySize"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NatsClusterSpec {
    /// Number of NATS servers in the cluster
    #[serde(default = "default_size")]
    pub size: u32,

    /// NATS server release the cluster runs
    #[serde(default = "default_version")]
    pub version: String,

    /// Container image repository, tagged with `version`
    #[serde(default = "default_server_image")]
    pub server_image: String,

    /// TLS configuration
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Server logging flags
    #[serde(default)]
    pub server_config: Option<ServerConfigSpec>,
}

/// Secrets holding the certificates for the client and route listeners
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Secret with `ca.pem`, `server.pem` and `server-key.pem` for the client port
    #[serde(default)]
    pub server_secret: Option<String>,

    /// Secret with `ca.pem`, `route.pem` and `route-key.pem` for the cluster port
    #[serde(default)]
    pub routes_secret: Option<String>,
}

/// Server logging flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfigSpec {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub trace: bool,
}

impl NatsClusterSpec {
    /// Secret name for the client listener, if client TLS is configured
    pub fn server_secret(&self) -> Option<&str> {
        self.tls.as_ref().and_then(|t| t.server_secret.as_deref())
    }

    /// Secret name for the route listener, if route TLS is configured
    pub fn routes_secret(&self) -> Option<&str> {
        self.tls.as_ref().and_then(|t| t.routes_secret.as_deref())
    }

    /// Full image reference for the server container
    pub fn image(&self) -> String {
        format!("{}:{}", self.server_image, self.version)
    }
}

/// Status of the NatsCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NatsClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,
    /// Number of live server pods
    #[serde(default)]
    pub size: u32,
    /// Number of pods reporting Ready
    #[serde(default)]
    pub ready_size: u32,
    /// Server version of the desired spec
    #[serde(default)]
    pub version: String,
    /// Conditions representing cluster state
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
    /// Last update timestamp
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Phase of the cluster lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    /// No pod has been observed yet
    #[default]
    Pending,
    /// Pods are being created for the first time
    Creating,
    /// Live pods match the desired size and revision
    Running,
    /// Pods are being added or removed
    Scaling,
    /// Pods are being replaced with a new revision
    Upgrading,
}

/// Condition of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Registry key identifying one declared cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a NatsCluster object; cluster-scoped lookups fall back to `default`
    pub fn of(cluster: &NatsCluster) -> Self {
        Self::new(
            cluster.namespace().unwrap_or_else(|| "default".to_string()),
            cluster.name_any(),
        )
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// Default value functions
fn default_size() -> u32 {
    1
}

fn default_version() -> String {
    "2.10.22".to_string()
}

fn default_server_image() -> String {
    "nats".to_string()
}
