//! ClusterRuntime adapter
//!
//! The controllers talk to the platform only through [`ClusterRuntime`], one
//! instance per namespace. Creates are idempotent: a 409 surfaces as
//! [`OperatorError::AlreadyExists`] and callers count it as success.

use crate::constants::OPERATOR_NAME;
use crate::crd::{NatsCluster, NatsClusterStatus};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use tracing::debug;

/// Create/list primitives for the objects of one namespace
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<()>;

    /// Create a ConfigMap, replacing its data if it already exists
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Create a Pod
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// List Pods matching a label selector
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>>;

    /// Delete a Pod by name
    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// Write the status subresource of a NatsCluster
    async fn patch_status(&self, name: &str, status: &NatsClusterStatus) -> Result<()>;
}

/// Hands out a runtime scoped to a namespace
pub trait RuntimeProvider: Send + Sync {
    fn for_namespace(&self, namespace: &str) -> Arc<dyn ClusterRuntime>;
}

/// AlreadyExists stays distinguishable, anything else is a create failure
fn create_error(kind: &str, name: &str, err: kube::Error) -> OperatorError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => OperatorError::AlreadyExists(name.to_string()),
        other => OperatorError::ObjectCreate(format!("{} {}: {}", kind, name, other)),
    }
}

/// [`ClusterRuntime`] backed by the Kubernetes API
pub struct KubeRuntime {
    services: Api<Service>,
    config_maps: Api<ConfigMap>,
    pods: Api<Pod>,
    clusters: Api<NatsCluster>,
}

impl KubeRuntime {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            services: Api::namespaced(client.clone(), namespace),
            config_maps: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client.clone(), namespace),
            clusters: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ClusterRuntime for KubeRuntime {
    async fn create_service(&self, service: &Service) -> Result<()> {
        self.services
            .create(&PostParams::default(), service)
            .await
            .map_err(|e| create_error("service", &service.name_any(), e))?;
        Ok(())
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let name = config_map.name_any();
        match self.config_maps.get_opt(&name).await? {
            Some(_existing) => {
                debug!(configmap = %name, "Replacing configuration bundle");
                self.config_maps
                    .patch(
                        &name,
                        &PatchParams::apply(OPERATOR_NAME).force(),
                        &Patch::Apply(config_map),
                    )
                    .await?;
            }
            None => {
                self.config_maps
                    .create(&PostParams::default(), config_map)
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.pods
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| create_error("pod", &pod.name_any(), e))?;
        Ok(())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(&self, name: &str, status: &NatsClusterStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.clusters
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        Ok(())
    }
}

/// [`RuntimeProvider`] sharing one Kubernetes client across namespaces
#[derive(Clone)]
pub struct KubeRuntimeProvider {
    client: Client,
}

impl KubeRuntimeProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl RuntimeProvider for KubeRuntimeProvider {
    fn for_namespace(&self, namespace: &str) -> Arc<dyn ClusterRuntime> {
        Arc::new(KubeRuntime::new(self.client.clone(), namespace))
    }
}

/// In-memory runtime used by the controller and operator tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeState {
        pub services: BTreeMap<String, Service>,
        pub config_maps: BTreeMap<String, ConfigMap>,
        pub pods: BTreeMap<String, Pod>,
        pub statuses: BTreeMap<String, NatsClusterStatus>,
        pub config_map_writes: usize,
        pub pod_creates: usize,
        pub deleted_pods: Vec<String>,
        /// Pod names whose create call fails
        pub failing_pods: HashSet<String>,
        /// Fail every pod create
        pub fail_all_pod_creates: bool,
        pub fail_lists: bool,
        /// Number of upcoming service creates that fail
        pub failing_service_creates: usize,
    }

    /// Shared in-memory namespace
    #[derive(Default, Clone)]
    pub struct FakeRuntime {
        pub state: Arc<Mutex<FakeState>>,
    }

    impl FakeRuntime {
        pub fn pod_names(&self) -> Vec<String> {
            self.state.lock().unwrap().pods.keys().cloned().collect()
        }

        pub fn config_text(&self, name: &str) -> Option<String> {
            let state = self.state.lock().unwrap();
            state
                .config_maps
                .get(name)
                .and_then(|cm| cm.data.as_ref())
                .and_then(|d| d.get(crate::constants::CONFIG_FILE_NAME).cloned())
        }

        pub fn set_pod_phase(&self, name: &str, phase: &str) {
            let mut state = self.state.lock().unwrap();
            if let Some(pod) = state.pods.get_mut(name) {
                pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
                    phase: Some(phase.to_string()),
                    ..Default::default()
                });
            }
        }

        /// Running with a true Ready condition
        pub fn set_pod_ready(&self, name: &str) {
            let mut state = self.state.lock().unwrap();
            if let Some(pod) = state.pods.get_mut(name) {
                pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
                    phase: Some("Running".to_string()),
                    conditions: Some(vec![k8s_openapi::api::core::v1::PodCondition {
                        type_: "Ready".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                });
            }
        }

        pub fn service_names(&self) -> Vec<String> {
            self.state.lock().unwrap().services.keys().cloned().collect()
        }

        pub fn remove_service(&self, name: &str) {
            self.state.lock().unwrap().services.remove(name);
        }
    }

    fn matches(pod: &Pod, selector: &str) -> bool {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        selector.split(',').all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
    }

    #[async_trait]
    impl ClusterRuntime for FakeRuntime {
        async fn create_service(&self, service: &Service) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let name = service.name_any();
            if state.failing_service_creates > 0 {
                state.failing_service_creates -= 1;
                return Err(OperatorError::ObjectCreate(format!("injected failure for {}", name)));
            }
            if state.services.contains_key(&name) {
                return Err(OperatorError::AlreadyExists(name));
            }
            state.services.insert(name, service.clone());
            Ok(())
        }

        async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.config_map_writes += 1;
            state
                .config_maps
                .insert(config_map.name_any(), config_map.clone());
            Ok(())
        }

        async fn create_pod(&self, pod: &Pod) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let name = pod.name_any();
            if state.fail_all_pod_creates || state.failing_pods.contains(&name) {
                return Err(OperatorError::KubeApi(format!("injected failure for {}", name)));
            }
            if state.pods.contains_key(&name) {
                return Err(OperatorError::AlreadyExists(name));
            }
            state.pod_creates += 1;
            let mut created = pod.clone();
            created.metadata.creation_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    chrono::Utc::now() + chrono::Duration::milliseconds(state.pod_creates as i64),
                ),
            );
            state.pods.insert(name, created);
            Ok(())
        }

        async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>> {
            let state = self.state.lock().unwrap();
            if state.fail_lists {
                return Err(OperatorError::KubeApi("injected list failure".to_string()));
            }
            Ok(state
                .pods
                .values()
                .filter(|p| matches(p, label_selector))
                .cloned()
                .collect())
        }

        async fn delete_pod(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.pods.remove(name);
            state.deleted_pods.push(name.to_string());
            Ok(())
        }

        async fn patch_status(&self, name: &str, status: &NatsClusterStatus) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.statuses.insert(name.to_string(), status.clone());
            Ok(())
        }
    }

    /// Hands out the same fake for every namespace
    #[derive(Default, Clone)]
    pub struct FakeProvider {
        pub runtime: FakeRuntime,
    }

    impl RuntimeProvider for FakeProvider {
        fn for_namespace(&self, _namespace: &str) -> Arc<dyn ClusterRuntime> {
            Arc::new(self.runtime.clone())
        }
    }
}
