//! Names, ports and paths shared by the object builders and the controllers

use std::time::Duration;

/// Field manager / component name used on API calls
pub const OPERATOR_NAME: &str = "nats-operator";

// Ports exposed by every server container
pub const CLIENT_PORT: i32 = 4222;
pub const CLUSTER_PORT: i32 = 6222;
pub const MONITORING_PORT: i32 = 8222;

/// Name of the NATS server container
pub const CONTAINER_NAME: &str = "nats";

// Identity labels carried by every managed object
pub const LABEL_APP: &str = "app";
pub const LABEL_APP_VALUE: &str = "nats";
pub const LABEL_CLUSTER: &str = "nats_cluster";
pub const LABEL_VERSION: &str = "nats_version";
/// Hash of the pod template inputs, used to spot pods that need replacing
pub const LABEL_REVISION: &str = "nats_revision";

// Configuration bundle
pub const CONFIG_VOLUME: &str = "config";
pub const CONFIG_MOUNT_PATH: &str = "/etc/nats-config";
pub const CONFIG_FILE_NAME: &str = "nats.conf";

// TLS material
pub const SERVER_TLS_VOLUME: &str = "server-tls-certs";
pub const SERVER_TLS_MOUNT_PATH: &str = "/etc/nats-server-tls-certs";
pub const ROUTES_TLS_VOLUME: &str = "routes-tls-certs";
pub const ROUTES_TLS_MOUNT_PATH: &str = "/etc/nats-routes-tls-certs";
pub const TLS_CA_FILE: &str = "ca.pem";
pub const SERVER_CERT_FILE: &str = "server.pem";
pub const SERVER_KEY_FILE: &str = "server-key.pem";
pub const ROUTES_CERT_FILE: &str = "route.pem";
pub const ROUTES_KEY_FILE: &str = "route-key.pem";

/// Pods are never restarted by the kubelet; the controller replaces them
pub const POD_RESTART_POLICY: &str = "Never";

// Timings
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
pub const CONTROLLER_STOP_GRACE: Duration = Duration::from_secs(10);
pub const CRD_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const CRD_READY_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Capacity of the event channel between the watcher and the dispatch loop
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Full path of the rendered configuration inside a server container
pub fn config_file_path() -> String {
    format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_FILE_NAME)
}

/// Name of the headless service that publishes one address per pod
pub fn routes_service_name(cluster: &str) -> String {
    format!("{}-routes", cluster)
}
