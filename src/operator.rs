//! Operator
//!
//! Owns the controller registry and dispatches NatsCluster events to it.
//! Every controller runs in its own task with a cancellation token derived
//! from the operator's root token, and holds a [`TaskTracker`] token until
//! its stop sequence completes so shutdown can wait for all of them.

use crate::constants::{
    CONTROLLER_STOP_GRACE, CRD_POLL_INTERVAL, CRD_READY_TIMEOUT, DEFAULT_RECONCILE_INTERVAL,
    EVENT_CHANNEL_CAPACITY,
};
use crate::controllers::{ClusterController, StopOutcome};
use crate::crd::{ClusterKey, NatsCluster};
use crate::error::{OperatorError, Result};
use crate::events::{watch_clusters, ClusterEvent};
use crate::registrar::{check_connectivity, CrdRegistrar, KubeCrdClient, Registration};
use crate::registry::ControllerRegistry;
use crate::runtime::RuntimeProvider;
use futures::future::join_all;
use kube::core::CustomResourceExt;
use kube::{Api, Client};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Operator settings
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch, all namespaces when `None`
    pub namespace: Option<String>,
    /// Period of each controller's reconciliation tick
    pub reconcile_interval: Duration,
    /// How long shutdown and deletion wait for a controller to stop
    pub stop_grace: Duration,
    pub crd_poll_interval: Duration,
    pub crd_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            stop_grace: CONTROLLER_STOP_GRACE,
            crd_poll_interval: CRD_POLL_INTERVAL,
            crd_timeout: CRD_READY_TIMEOUT,
        }
    }
}

/// Process lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct Operator {
    config: OperatorConfig,
    provider: Arc<dyn RuntimeProvider>,
    registry: Arc<ControllerRegistry>,
    tracker: TaskTracker,
    root: CancellationToken,
    state: Mutex<OperatorState>,
}

impl Operator {
    pub fn new(config: OperatorConfig, provider: Arc<dyn RuntimeProvider>) -> Self {
        Self {
            config,
            provider,
            registry: Arc::new(ControllerRegistry::new()),
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
            state: Mutex::new(OperatorState::Starting),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, OperatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> OperatorState {
        *self.lock_state()
    }

    pub fn registry(&self) -> &ControllerRegistry {
        &self.registry
    }

    /// Root cancellation scope; every controller token derives from it
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Check connectivity, register the CRD, start the watcher and run the
    /// dispatch loop until shutdown.
    pub async fn start(&self, client: Client) -> Result<()> {
        check_connectivity(&client).await?;

        let registrar = CrdRegistrar::new(KubeCrdClient::new(client.clone()))
            .with_timing(self.config.crd_poll_interval, self.config.crd_timeout);
        if registrar.register(&NatsCluster::crd()).await? == Registration::TimedOut {
            warn!("NatsCluster CRD is not established, reconciliation may fail until it is");
        }

        let api: Api<NatsCluster> = match &self.config.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };
        info!(
            namespace = self.config.namespace.as_deref().unwrap_or("all"),
            "Watching namespace"
        );

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let watch_token = self.root.child_token();
        tokio::spawn(async move {
            if let Err(e) = watch_clusters(api, tx, watch_token).await {
                error!(error = %e, "NatsCluster watcher failed");
            }
        });

        self.run(rx).await
    }

    /// Dispatch events until the root scope is cancelled. Always returns
    /// [`OperatorError::Shutdown`], which callers treat as a clean exit.
    pub async fn run(&self, mut events: mpsc::Receiver<ClusterEvent>) -> Result<()> {
        {
            let mut state = self.lock_state();
            if *state == OperatorState::Starting {
                *state = OperatorState::Running;
            }
        }
        info!("Operator running");

        loop {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Event stream ended, shutting down");
                        self.shutdown().await;
                        break;
                    }
                }
            }
        }

        Err(OperatorError::Shutdown)
    }

    pub async fn handle_event(&self, event: ClusterEvent) {
        if matches!(
            self.state(),
            OperatorState::ShuttingDown | OperatorState::Stopped
        ) {
            let key = event.key();
            debug!(namespace = %key.namespace, cluster = %key.name, "Dropping event during shutdown");
            return;
        }

        match event {
            ClusterEvent::Added(cluster) => {
                self.add_cluster(&cluster);
            }
            ClusterEvent::Updated { new, .. } => self.update_cluster(&new),
            ClusterEvent::Deleted(cluster) => self.delete_cluster(&cluster),
        }
    }

    /// Register and spawn a controller. Returns false when a controller is
    /// already registered for the cluster or the operator is shutting down.
    pub fn add_cluster(&self, cluster: &NatsCluster) -> bool {
        let key = ClusterKey::of(cluster);
        let controller = Arc::new(ClusterController::new(
            cluster,
            self.provider.for_namespace(&key.namespace),
            self.root.child_token(),
            self.config.reconcile_interval,
        ));

        {
            // Holding the state lock keeps a shutdown snapshot from missing this controller
            let state = self.lock_state();
            if matches!(*state, OperatorState::ShuttingDown | OperatorState::Stopped) {
                return false;
            }
            if let Err(e) = self.registry.insert(controller.clone()) {
                info!(namespace = %key.namespace, cluster = %key.name, error = %e, "Ignoring duplicate cluster");
                return false;
            }
            controller.attach_supervision(self.tracker.token());
        }

        info!(
            namespace = %key.namespace,
            cluster = %key.name,
            size = cluster.spec.size,
            version = %cluster.spec.version,
            "Cluster added"
        );
        let span = info_span!("cluster", namespace = %key.namespace, cluster = %key.name);
        tokio::spawn(controller.run().instrument(span));
        true
    }

    fn update_cluster(&self, cluster: &NatsCluster) {
        let key = ClusterKey::of(cluster);
        let Some(controller) = self.registry.get(&key).filter(|c| !c.is_cancelled()) else {
            debug!(namespace = %key.namespace, cluster = %key.name, "Update for unknown or stopping cluster");
            self.add_cluster(cluster);
            return;
        };

        let diff = controller.update(cluster);
        if diff.is_empty() {
            debug!(namespace = %key.namespace, cluster = %key.name, "Spec unchanged");
        } else {
            info!(
                namespace = %key.namespace,
                cluster = %key.name,
                size = ?diff.size,
                version = ?diff.version,
                image = diff.image,
                tls = diff.tls,
                server_config = diff.server_config,
                "Cluster updated"
            );
        }
    }

    /// Stop the cluster's controller and unregister it once it is done. The
    /// wait runs in its own task so the dispatch loop keeps going.
    fn delete_cluster(&self, cluster: &NatsCluster) {
        let key = ClusterKey::of(cluster);
        let Some(controller) = self.registry.get(&key) else {
            debug!(namespace = %key.namespace, cluster = %key.name, "Delete for unknown cluster");
            return;
        };

        info!(namespace = %key.namespace, cluster = %key.name, "Cluster deleted, stopping controller");
        controller.stop();
        let registry = Arc::clone(&self.registry);
        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            controller.stop_and_wait(grace).await;
            if !registry.remove_controller(&controller) {
                debug!(
                    namespace = %key.namespace,
                    cluster = %key.name,
                    "Cluster was declared again while its old controller stopped"
                );
            }
        });
    }

    /// Stop every registered controller, wait for their stop sequences and
    /// cancel the root scope. Later calls return immediately.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if matches!(*state, OperatorState::ShuttingDown | OperatorState::Stopped) {
                return;
            }
            *state = OperatorState::ShuttingDown;
        }

        let controllers = self.registry.snapshot();
        info!(controllers = controllers.len(), "Shutting down operator");

        let grace = self.config.stop_grace;
        let outcomes = join_all(controllers.iter().map(|c| c.stop_and_wait(grace))).await;
        let timed_out = outcomes
            .iter()
            .filter(|o| **o == StopOutcome::TimedOut)
            .count();
        if timed_out > 0 {
            error!(timed_out, "Some controllers did not stop within the grace period");
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.root.cancel();

        *self.lock_state() = OperatorState::Stopped;
        info!("Operator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NatsClusterStatus;
    use crate::runtime::fake::{FakeProvider, FakeRuntime};
    use crate::runtime::ClusterRuntime;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};

    fn cluster(namespace: &str, name: &str, size: u32) -> NatsCluster {
        let mut c = NatsCluster::new(
            name,
            serde_json::from_value(serde_json::json!({ "size": size })).unwrap(),
        );
        c.metadata.namespace = Some(namespace.to_string());
        c
    }

    fn operator(provider: FakeProvider) -> Arc<Operator> {
        Arc::new(Operator::new(
            OperatorConfig {
                reconcile_interval: Duration::from_millis(50),
                ..Default::default()
            },
            Arc::new(provider),
        ))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_duplicate_added_yields_one_controller() {
        let provider = FakeProvider::default();
        let op = operator(provider.clone());

        op.handle_event(ClusterEvent::Added(cluster("ns", "c1", 2))).await;
        op.handle_event(ClusterEvent::Added(cluster("ns", "c1", 2))).await;
        assert_eq!(op.registry().len(), 1);

        settle().await;
        assert_eq!(provider.runtime.pod_names().len(), 2);
        assert_eq!(provider.runtime.state.lock().unwrap().pod_creates, 2);

        op.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_forwards_spec() {
        let provider = FakeProvider::default();
        let op = operator(provider.clone());
        let old = cluster("ns", "c1", 1);
        op.handle_event(ClusterEvent::Added(old.clone())).await;
        settle().await;

        let new = cluster("ns", "c1", 3);
        op.handle_event(ClusterEvent::Updated { old, new }).await;
        let controller = op.registry().get(&ClusterKey::new("ns", "c1")).unwrap();
        assert_eq!(controller.spec().size, 3);

        settle().await;
        assert_eq!(provider.runtime.pod_names().len(), 3);
        op.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_for_unknown_cluster_adds_it() {
        let op = operator(FakeProvider::default());
        op.handle_event(ClusterEvent::Updated {
            old: cluster("ns", "c1", 1),
            new: cluster("ns", "c1", 2),
        })
        .await;
        assert!(op.registry().get(&ClusterKey::new("ns", "c1")).is_some());
        op.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_stops_and_unregisters() {
        let provider = FakeProvider::default();
        let op = operator(provider.clone());
        op.handle_event(ClusterEvent::Added(cluster("ns", "c1", 1))).await;
        settle().await;
        let controller = op.registry().get(&ClusterKey::new("ns", "c1")).unwrap();

        op.handle_event(ClusterEvent::Deleted(cluster("ns", "c1", 1))).await;
        assert!(controller.is_cancelled());
        settle().await;
        assert!(op.registry().is_empty());
        assert!(!op.root_token().is_cancelled());
        // Cleanup is left to owner-reference garbage collection
        assert_eq!(provider.runtime.pod_names().len(), 1);

        // The same name can be declared again
        op.handle_event(ClusterEvent::Added(cluster("ns", "c1", 1))).await;
        assert_eq!(op.registry().len(), 1);
        op.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_controller() {
        let op = operator(FakeProvider::default());
        for name in ["c1", "c2", "c3"] {
            op.handle_event(ClusterEvent::Added(cluster("ns", name, 1))).await;
        }
        settle().await;
        let controllers = op.registry().snapshot();

        op.shutdown().await;
        assert_eq!(op.state(), OperatorState::Stopped);
        assert!(op.root_token().is_cancelled());
        assert!(controllers.iter().all(|c| c.is_cancelled()));

        op.handle_event(ClusterEvent::Added(cluster("ns", "late", 1))).await;
        assert!(op.registry().get(&ClusterKey::new("ns", "late")).is_none());
    }

    #[tokio::test]
    async fn test_run_returns_shutdown_error() {
        let op = operator(FakeProvider::default());
        let (tx, rx) = mpsc::channel(8);
        let runner = {
            let op = op.clone();
            tokio::spawn(async move { op.run(rx).await })
        };

        tx.send(ClusterEvent::Added(cluster("ns", "c1", 1))).await.unwrap();
        settle().await;
        assert_eq!(op.state(), OperatorState::Running);
        assert_eq!(op.registry().len(), 1);

        op.shutdown().await;
        let err = runner.await.unwrap().unwrap_err();
        assert!(err.is_shutdown());
    }

    #[tokio::test]
    async fn test_closed_event_stream_shuts_down() {
        let op = operator(FakeProvider::default());
        let (tx, rx) = mpsc::channel(8);
        drop(tx);
        let err = op.run(rx).await.unwrap_err();
        assert!(err.is_shutdown());
        assert_eq!(op.state(), OperatorState::Stopped);
    }

    /// Runtime whose pod listing never completes
    struct StalledRuntime;

    #[async_trait]
    impl ClusterRuntime for StalledRuntime {
        async fn create_service(&self, _service: &Service) -> Result<()> {
            Ok(())
        }
        async fn apply_config_map(&self, _config_map: &ConfigMap) -> Result<()> {
            Ok(())
        }
        async fn create_pod(&self, _pod: &Pod) -> Result<()> {
            Ok(())
        }
        async fn list_pods(&self, _label_selector: &str) -> Result<Vec<Pod>> {
            std::future::pending().await
        }
        async fn delete_pod(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn patch_status(&self, _name: &str, _status: &NatsClusterStatus) -> Result<()> {
            Ok(())
        }
    }

    struct MixedProvider {
        healthy: FakeRuntime,
    }

    impl RuntimeProvider for MixedProvider {
        fn for_namespace(&self, namespace: &str) -> Arc<dyn ClusterRuntime> {
            if namespace == "stalled" {
                Arc::new(StalledRuntime)
            } else {
                Arc::new(self.healthy.clone())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_delete_does_not_block_other_clusters() {
        let healthy = FakeRuntime::default();
        let op = Operator::new(
            OperatorConfig::default(),
            Arc::new(MixedProvider {
                healthy: healthy.clone(),
            }),
        );
        op.handle_event(ClusterEvent::Added(cluster("stalled", "c1", 1))).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        op.handle_event(ClusterEvent::Deleted(cluster("stalled", "c1", 1))).await;
        op.handle_event(ClusterEvent::Added(cluster("ns", "c2", 2))).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(healthy.pod_names().len(), 2);
        assert!(op
            .registry()
            .get(&ClusterKey::new("stalled", "c1"))
            .is_some());

        // Unregistered once the grace period runs out
        tokio::time::sleep(CONTROLLER_STOP_GRACE).await;
        assert!(op
            .registry()
            .get(&ClusterKey::new("stalled", "c1"))
            .is_none());
        op.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_redeclared_cluster_survives_old_controller_cleanup() {
        let op = Operator::new(
            OperatorConfig::default(),
            Arc::new(MixedProvider {
                healthy: FakeRuntime::default(),
            }),
        );
        let key = ClusterKey::new("stalled", "c1");
        op.handle_event(ClusterEvent::Added(cluster("stalled", "c1", 1))).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let old = op.registry().get(&key).unwrap();

        op.handle_event(ClusterEvent::Deleted(cluster("stalled", "c1", 1))).await;
        op.handle_event(ClusterEvent::Added(cluster("stalled", "c1", 1))).await;
        let fresh = op.registry().get(&key).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));

        tokio::time::sleep(CONTROLLER_STOP_GRACE * 2).await;
        assert!(Arc::ptr_eq(&op.registry().get(&key).unwrap(), &fresh));
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_grace_on_stuck_controller() {
        let op = Operator::new(
            OperatorConfig::default(),
            Arc::new(MixedProvider {
                healthy: FakeRuntime::default(),
            }),
        );
        op.handle_event(ClusterEvent::Added(cluster("stalled", "c1", 1))).await;
        op.handle_event(ClusterEvent::Added(cluster("ns", "c2", 1))).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        op.shutdown().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= CONTROLLER_STOP_GRACE);
        assert!(elapsed < CONTROLLER_STOP_GRACE * 2);
        assert_eq!(op.state(), OperatorState::Stopped);
    }
}
