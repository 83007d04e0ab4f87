//! Cluster Controller
//!
//! One controller per NatsCluster. It creates the routes and client
//! Services, keeps the shared ConfigMap in sync with the route list and
//! creates, replaces or removes server pods until the cluster matches its
//! spec. Reconciliation runs on a fixed tick and right after spec updates.

use crate::conditions::{
    build_condition, same_conditions, set_condition, CLUSTER_CONDITION_PROGRESSING,
    CLUSTER_CONDITION_READY, CONDITION_FALSE, CONDITION_TRUE,
};
use crate::config::ServerConfig;
use crate::constants::{LABEL_REVISION, LABEL_VERSION};
use crate::crd::{ClusterKey, ClusterPhase, NatsCluster, NatsClusterSpec, NatsClusterStatus};
use crate::resources::{self, ClusterIdentity};
use crate::runtime::ClusterRuntime;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tracing::{debug, error, info, warn};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle phase of a server pod as reported by the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Pods are never restarted, so a finished pod has to be replaced
    pub fn is_terminated(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// A server pod owned by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRecord {
    pub name: String,
    pub route_address: String,
    pub phase: PodPhase,
}

/// What changed between two specs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecDiff {
    pub size: Option<(u32, u32)>,
    pub version: Option<(String, String)>,
    pub image: bool,
    pub tls: bool,
    pub server_config: bool,
}

impl SpecDiff {
    pub fn between(old: &NatsClusterSpec, new: &NatsClusterSpec) -> Self {
        Self {
            size: (old.size != new.size).then_some((old.size, new.size)),
            version: (old.version != new.version)
                .then(|| (old.version.clone(), new.version.clone())),
            image: old.server_image != new.server_image,
            tls: old.tls != new.tls,
            server_config: old.server_config != new.server_config,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.version.is_none()
            && !self.image
            && !self.tls
            && !self.server_config
    }
}

/// Result of asking a controller to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The reconciliation loop exited within the grace period
    Stopped,
    /// The grace period elapsed first
    TimedOut,
    /// Another caller already consumed the done signal
    AlreadyStopping,
}

/// A pod that survived the cleanup step of a pass
struct LivePod {
    record: PodRecord,
    revision: Option<String>,
    created: Option<DateTime<Utc>>,
    ready: bool,
}

impl LivePod {
    fn is_healthy(&self) -> bool {
        self.record.phase == PodPhase::Running && self.ready
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == CONDITION_TRUE)
        })
}

/// Converges one NatsCluster toward its declared spec
pub struct ClusterController {
    key: ClusterKey,
    identity: ClusterIdentity,
    spec: Mutex<NatsClusterSpec>,
    runtime: Arc<dyn ClusterRuntime>,
    interval: Duration,
    token: CancellationToken,
    wake: Notify,
    pods: Mutex<BTreeMap<String, PodRecord>>,
    last_config: Mutex<Option<String>>,
    last_status: Mutex<Option<NatsClusterStatus>>,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
    supervision: Mutex<Option<TaskTrackerToken>>,
}

impl ClusterController {
    /// Create a controller for `cluster`. `token` is the controller's own
    /// cancellation scope, normally a child of the operator's root token.
    pub fn new(
        cluster: &NatsCluster,
        runtime: Arc<dyn ClusterRuntime>,
        token: CancellationToken,
        interval: Duration,
    ) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        Self {
            key: ClusterKey::of(cluster),
            identity: ClusterIdentity::of(cluster),
            spec: Mutex::new(cluster.spec.clone()),
            runtime,
            interval,
            token,
            wake: Notify::new(),
            pods: Mutex::new(BTreeMap::new()),
            last_config: Mutex::new(None),
            last_status: Mutex::new(None),
            done_tx: Mutex::new(Some(done_tx)),
            done_rx: Mutex::new(Some(done_rx)),
            supervision: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &ClusterKey {
        &self.key
    }

    /// Snapshot of the current desired spec
    pub fn spec(&self) -> NatsClusterSpec {
        guard(&self.spec).clone()
    }

    /// Pods created or observed by the last reconciliation pass
    pub fn pods(&self) -> Vec<PodRecord> {
        guard(&self.pods).values().cloned().collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Hold a supervision token until the stop sequence completes
    pub(crate) fn attach_supervision(&self, token: TaskTrackerToken) {
        *guard(&self.supervision) = Some(token);
    }

    /// Store a new spec and wake the loop when anything relevant changed
    pub fn update(&self, cluster: &NatsCluster) -> SpecDiff {
        let diff = {
            let mut spec = guard(&self.spec);
            let diff = SpecDiff::between(&spec, &cluster.spec);
            if !diff.is_empty() {
                *spec = cluster.spec.clone();
            }
            diff
        };
        if !diff.is_empty() {
            self.wake.notify_one();
        }
        diff
    }

    /// Cancel this controller's scope; the loop exits at its next tick boundary
    pub fn stop(&self) {
        debug!(namespace = %self.key.namespace, cluster = %self.key.name, "Stopping controller");
        self.token.cancel();
    }

    /// Stop the controller and wait up to `grace` for its done signal. Only
    /// the first caller consumes the signal and releases supervision.
    pub async fn stop_and_wait(&self, grace: Duration) -> StopOutcome {
        self.stop();
        let done = guard(&self.done_rx).take();
        let Some(done) = done else {
            return StopOutcome::AlreadyStopping;
        };

        let outcome = match tokio::time::timeout(grace, done).await {
            Ok(_) => StopOutcome::Stopped,
            Err(_) => {
                error!(
                    namespace = %self.key.namespace,
                    cluster = %self.key.name,
                    "Controller took too long to stop"
                );
                StopOutcome::TimedOut
            }
        };
        guard(&self.supervision).take();
        outcome
    }

    /// Reconcile right away and then on every tick until cancelled. The done
    /// signal fires when this returns.
    pub async fn run(self: Arc<Self>) {
        let _done = guard(&self.done_tx).take();
        info!("Starting cluster controller");

        self.reconcile_once().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => self.reconcile_once().await,
                _ = self.wake.notified() => {
                    debug!("Spec changed, reconciling");
                    self.reconcile_once().await;
                }
            }
        }

        info!("Cluster controller stopped");
    }

    /// Create the routes and client Services. Existing services are kept.
    pub async fn ensure_services(&self) {
        let spec = self.spec();
        let services = [
            resources::routes_service(&self.identity, &spec),
            resources::client_service(&self.identity, &spec),
        ];
        for service in &services {
            let name = service.name_any();
            match self.runtime.create_service(service).await {
                Ok(()) => info!(service = %name, "Created service"),
                Err(e) if e.is_already_exists() => debug!(service = %name, "Service already exists"),
                Err(e) => warn!(service = %name, error = %e, "Failed to create service"),
            }
        }
    }

    /// One reconciliation pass: services, then the cluster's pods
    pub async fn reconcile_once(&self) {
        self.ensure_services().await;

        let spec = self.spec();
        let revision = resources::pod_revision(&spec);
        let desired = spec.size as usize;

        let listed = match self
            .runtime
            .list_pods(&resources::label_selector(&self.identity.name))
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Failed to list pods");
                return;
            }
        };

        let mut live = Vec::with_capacity(listed.len());
        for pod in &listed {
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let name = pod.name_any();
            let phase = PodPhase::of(pod);
            if phase.is_terminated() {
                info!(pod = %name, phase = ?phase, "Replacing terminated pod");
                self.delete_pod(&name).await;
                continue;
            }
            live.push(LivePod {
                record: PodRecord {
                    route_address: resources::route_address(
                        &name,
                        &self.identity.name,
                        &self.identity.namespace,
                    ),
                    name,
                    phase,
                },
                revision: pod.labels().get(LABEL_REVISION).cloned(),
                created: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
                ready: is_ready(pod),
            });
        }
        live.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.record.name.cmp(&b.record.name))
        });

        let observed = live.len();
        let mut replaced = false;
        if live.len() > desired {
            // Scale down by removing the newest pods
            let excess = live.split_off(desired);
            for pod in excess.iter().rev() {
                info!(pod = %pod.record.name, "Removing pod above desired size");
                self.delete_pod(&pod.record.name).await;
            }
        } else if live.len() == desired {
            let is_outdated = |p: &LivePod| p.revision.as_deref() != Some(revision.as_str());
            let (broken, kept): (Vec<LivePod>, Vec<LivePod>) = live
                .into_iter()
                .partition(|p| is_outdated(p) && !p.is_healthy());
            live = kept;

            // Outdated pods that never came up serve nothing, replace them all
            for pod in &broken {
                info!(pod = %pod.record.name, phase = ?pod.record.phase, "Replacing unhealthy pod built from an older spec");
                self.delete_pod(&pod.record.name).await;
            }
            replaced = !broken.is_empty();

            // Healthy ones roll one per pass, and only while every pod is healthy
            if !replaced && live.iter().all(LivePod::is_healthy) {
                if let Some(idx) = live.iter().position(is_outdated) {
                    let outdated = live.remove(idx);
                    info!(pod = %outdated.record.name, "Replacing pod built from an older spec");
                    self.delete_pod(&outdated.record.name).await;
                    replaced = true;
                }
            }
        }
        let outdated_remaining = live
            .iter()
            .any(|p| p.revision.as_deref() != Some(revision.as_str()));

        let shortfall = desired.saturating_sub(live.len());
        let planned = self.plan_pod_names(&live, shortfall);

        let routes = live
            .iter()
            .map(|p| p.record.route_address.clone())
            .chain(planned.iter().map(|name| {
                resources::route_address(name, &self.identity.name, &self.identity.namespace)
            }))
            .collect();
        self.apply_config(&spec, ServerConfig::for_cluster(&spec, routes))
            .await;

        let mut records: BTreeMap<String, PodRecord> = live
            .iter()
            .map(|p| (p.record.name.clone(), p.record.clone()))
            .collect();
        for name in &planned {
            if let Some(record) = self.create_pod(&spec, name).await {
                records.insert(name.clone(), record);
            }
        }
        let ready = live.iter().filter(|p| p.ready).count();
        let size = records.len();
        *guard(&self.pods) = records;

        let phase = if observed == 0 && !planned.is_empty() {
            ClusterPhase::Creating
        } else if observed != desired || size != desired {
            ClusterPhase::Scaling
        } else if replaced || outdated_remaining {
            ClusterPhase::Upgrading
        } else {
            ClusterPhase::Running
        };
        self.publish_status(&spec, phase, size, ready).await;
    }

    /// Fresh names for `count` new pods, unique among the live pods and
    /// each other. Collisions with foreign pods surface as create failures.
    fn plan_pod_names(&self, live: &[LivePod], count: usize) -> Vec<String> {
        let mut taken: HashSet<String> = live.iter().map(|p| p.record.name.clone()).collect();
        let mut planned = Vec::with_capacity(count);
        while planned.len() < count {
            let name = resources::generate_pod_name(&self.identity.name);
            if taken.insert(name.clone()) {
                planned.push(name);
            }
        }
        planned
    }

    /// Write the ConfigMap when the rendered document changed
    async fn apply_config(&self, spec: &NatsClusterSpec, config: ServerConfig) {
        let rendered = config.render();
        if guard(&self.last_config).as_deref() == Some(rendered.as_str()) {
            return;
        }

        let config_map = resources::config_map(&self.identity, spec, &config);
        match self.runtime.apply_config_map(&config_map).await {
            Ok(()) => {
                info!(routes = config.cluster.routes.len(), "Applied configuration");
                *guard(&self.last_config) = Some(rendered);
            }
            Err(e) => {
                warn!(error = %e, "Failed to apply configuration");
                *guard(&self.last_config) = None;
            }
        }
    }

    async fn create_pod(&self, spec: &NatsClusterSpec, name: &str) -> Option<PodRecord> {
        let pod = resources::pod(&self.identity, spec, name);
        match self.runtime.create_pod(&pod).await {
            Ok(()) => {
                info!(pod = %name, version = ?pod.labels().get(LABEL_VERSION), "Created pod");
                Some(PodRecord {
                    name: name.to_string(),
                    route_address: resources::route_address(
                        name,
                        &self.identity.name,
                        &self.identity.namespace,
                    ),
                    phase: PodPhase::Pending,
                })
            }
            Err(e) if e.is_already_exists() => {
                warn!(pod = %name, "Pod name collision, retrying on the next pass");
                None
            }
            Err(e) => {
                warn!(pod = %name, error = %e, "Failed to create pod");
                None
            }
        }
    }

    async fn delete_pod(&self, name: &str) {
        if let Err(e) = self.runtime.delete_pod(name).await {
            warn!(pod = %name, error = %e, "Failed to delete pod");
        }
    }

    async fn publish_status(
        &self,
        spec: &NatsClusterSpec,
        phase: ClusterPhase,
        size: usize,
        ready: usize,
    ) {
        let desired = spec.size as usize;
        let previous = guard(&self.last_status).clone();
        let mut conditions = previous
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();

        let (ready_status, ready_reason) = if ready == desired && phase == ClusterPhase::Running {
            (CONDITION_TRUE, "AllServersReady")
        } else {
            (CONDITION_FALSE, "ServersNotReady")
        };
        set_condition(
            &mut conditions,
            build_condition(
                CLUSTER_CONDITION_READY,
                ready_status,
                ready_reason,
                &format!("{}/{} servers ready", ready, desired),
            ),
        );
        let (progress_status, progress_reason) = match phase {
            ClusterPhase::Running => (CONDITION_FALSE, "UpToDate"),
            ClusterPhase::Upgrading => (CONDITION_TRUE, "RollingUpgrade"),
            _ => (CONDITION_TRUE, "Scaling"),
        };
        set_condition(
            &mut conditions,
            build_condition(
                CLUSTER_CONDITION_PROGRESSING,
                progress_status,
                progress_reason,
                &format!("{} of {} servers created", size, desired),
            ),
        );

        let status = NatsClusterStatus {
            phase,
            size: size as u32,
            ready_size: ready as u32,
            version: spec.version.clone(),
            conditions,
            last_updated: Some(Utc::now().to_rfc3339()),
        };

        let unchanged = previous.as_ref().is_some_and(|p| {
            p.phase == status.phase
                && p.size == status.size
                && p.ready_size == status.ready_size
                && p.version == status.version
                && same_conditions(&p.conditions, &status.conditions)
        });
        if unchanged {
            return;
        }

        match self
            .runtime
            .patch_status(&self.identity.name, &status)
            .await
        {
            Ok(()) => *guard(&self.last_status) = Some(status),
            Err(e) => warn!(error = %e, "Failed to update cluster status"),
        }
    }
}
