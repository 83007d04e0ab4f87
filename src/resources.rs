//! Kubernetes object builders for a NATS cluster
//!
//! Pure functions from a cluster's declared state to the Services, ConfigMap
//! and Pods the controller creates.

use crate::config::ServerConfig;
use crate::constants::{
    config_file_path, routes_service_name, CLIENT_PORT, CLUSTER_PORT, CONFIG_FILE_NAME,
    CONFIG_MOUNT_PATH, CONFIG_VOLUME, CONTAINER_NAME, LABEL_APP, LABEL_APP_VALUE, LABEL_CLUSTER,
    LABEL_REVISION, LABEL_VERSION, MONITORING_PORT, POD_RESTART_POLICY, ROUTES_TLS_MOUNT_PATH,
    ROUTES_TLS_VOLUME, SERVER_TLS_MOUNT_PATH, SERVER_TLS_VOLUME,
};
use crate::crd::{NatsCluster, NatsClusterSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, Pod, PodSpec,
    Probe, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Alphabet used by Kubernetes for generated name suffixes (no vowels, no
/// ambiguous digits)
const NAME_SUFFIX_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;

/// Identity of the cluster the objects belong to
#[derive(Debug, Clone)]
pub struct ClusterIdentity {
    pub name: String,
    pub namespace: String,
    pub owner: Option<OwnerReference>,
}

impl ClusterIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            owner: None,
        }
    }

    /// Identity of a NatsCluster, owning its objects when the UID is known
    pub fn of(cluster: &NatsCluster) -> Self {
        Self {
            name: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_else(|| "default".to_string()),
            owner: owner_reference(cluster),
        }
    }

    fn metadata(&self, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: self.owner.clone().map(|o| vec![o]),
            ..Default::default()
        }
    }
}

/// Owner reference pointing at the NatsCluster so that deleting it garbage
/// collects every managed object
pub fn owner_reference(cluster: &NatsCluster) -> Option<OwnerReference> {
    let uid = cluster.metadata.uid.clone()?;
    Some(OwnerReference {
        api_version: NatsCluster::api_version(&()).to_string(),
        kind: NatsCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Generates `<cluster>-<random suffix>`
pub fn generate_pod_name(cluster: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", cluster, suffix)
}

/// Resolvable address of a pod through the routes service
pub fn route_address(pod: &str, cluster: &str, namespace: &str) -> String {
    format!("{}.{}.{}.svc", pod, routes_service_name(cluster), namespace)
}

/// Labels selecting every pod of the cluster
pub fn pod_selector(cluster: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
    labels.insert(LABEL_CLUSTER.to_string(), cluster.to_string());
    labels
}

/// Selector string for list calls
pub fn label_selector(cluster: &str) -> String {
    pod_selector(cluster)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn common_labels(cluster: &str, version: &str) -> BTreeMap<String, String> {
    let mut labels = pod_selector(cluster);
    labels.insert(LABEL_VERSION.to_string(), version.to_string());
    labels
}

/// Hash of the pod template inputs. A pod whose revision label differs from
/// the current one was built from an older spec.
pub fn pod_revision(spec: &NatsClusterSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.image().as_bytes());
    hasher.update([0]);
    hasher.update(spec.server_secret().unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(spec.routes_secret().unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())[..10].to_string()
}

/// Headless service publishing one DNS record per pod, ready or not, so that
/// routes resolve before the servers pass their health checks
pub fn routes_service(id: &ClusterIdentity, spec: &NatsClusterSpec) -> Service {
    Service {
        metadata: id.metadata(
            routes_service_name(&id.name),
            common_labels(&id.name, &spec.version),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(pod_selector(&id.name)),
            ports: Some(vec![ServicePort {
                name: Some("cluster".to_string()),
                port: CLUSTER_PORT,
                target_port: Some(IntOrString::Int(CLUSTER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service for application clients
pub fn client_service(id: &ClusterIdentity, spec: &NatsClusterSpec) -> Service {
    Service {
        metadata: id.metadata(id.name.clone(), common_labels(&id.name, &spec.version)),
        spec: Some(ServiceSpec {
            selector: Some(pod_selector(&id.name)),
            ports: Some(vec![ServicePort {
                name: Some("client".to_string()),
                port: CLIENT_PORT,
                target_port: Some(IntOrString::Int(CLIENT_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ConfigMap named after the cluster holding the rendered configuration
pub fn config_map(id: &ClusterIdentity, spec: &NatsClusterSpec, config: &ServerConfig) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(CONFIG_FILE_NAME.to_string(), config.render());

    ConfigMap {
        metadata: id.metadata(id.name.clone(), common_labels(&id.name, &spec.version)),
        data: Some(data),
        ..Default::default()
    }
}

fn server_container(spec: &NatsClusterSpec) -> Container {
    let mut volume_mounts = vec![VolumeMount {
        name: CONFIG_VOLUME.to_string(),
        mount_path: CONFIG_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }];
    if spec.server_secret().is_some() {
        volume_mounts.push(VolumeMount {
            name: SERVER_TLS_VOLUME.to_string(),
            mount_path: SERVER_TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    if spec.routes_secret().is_some() {
        volume_mounts.push(VolumeMount {
            name: ROUTES_TLS_VOLUME.to_string(),
            mount_path: ROUTES_TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image()),
        command: Some(vec![
            "nats-server".to_string(),
            "--config".to_string(),
            config_file_path(),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: CLIENT_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("cluster".to_string()),
                container_port: CLUSTER_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("monitoring".to_string()),
                container_port: MONITORING_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(volume_mounts),
        liveness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/".to_string()),
                port: IntOrString::Int(MONITORING_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            timeout_seconds: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_volumes(id: &ClusterIdentity, spec: &NatsClusterSpec) -> Vec<Volume> {
    let mut volumes = vec![Volume {
        name: CONFIG_VOLUME.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: id.name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }];
    if let Some(secret) = spec.server_secret() {
        volumes.push(Volume {
            name: SERVER_TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if let Some(secret) = spec.routes_secret() {
        volumes.push(Volume {
            name: ROUTES_TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    volumes
}

/// Server pod whose hostname and subdomain make it resolvable at its route
/// address. The kubelet never restarts it.
pub fn pod(id: &ClusterIdentity, spec: &NatsClusterSpec, pod_name: &str) -> Pod {
    let mut labels = common_labels(&id.name, &spec.version);
    labels.insert(LABEL_REVISION.to_string(), pod_revision(spec));

    Pod {
        metadata: id.metadata(pod_name.to_string(), labels),
        spec: Some(PodSpec {
            hostname: Some(pod_name.to_string()),
            subdomain: Some(routes_service_name(&id.name)),
            containers: vec![server_container(spec)],
            volumes: Some(pod_volumes(id, spec)),
            restart_policy: Some(POD_RESTART_POLICY.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
