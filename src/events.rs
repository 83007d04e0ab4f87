//! NatsCluster change events
//!
//! Adapts the kube watcher stream into tagged [`ClusterEvent`]s on a bounded
//! channel, so the operator consumes one typed queue and never sees the
//! watch machinery.

use crate::crd::{ClusterKey, NatsCluster};
use crate::error::Result;
use futures::{StreamExt, TryStreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A change to a NatsCluster, carrying the full declared object
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    Added(NatsCluster),
    Updated { old: NatsCluster, new: NatsCluster },
    Deleted(NatsCluster),
}

impl ClusterEvent {
    pub fn key(&self) -> ClusterKey {
        match self {
            ClusterEvent::Added(c) | ClusterEvent::Deleted(c) => ClusterKey::of(c),
            ClusterEvent::Updated { new, .. } => ClusterKey::of(new),
        }
    }
}

/// Turns raw watcher events into Added/Updated/Deleted.
///
/// The watcher only reports the current object, so the classifier keeps the
/// last object seen per key. Applies that leave the spec untouched (status
/// writes, label edits) produce nothing. After a relist, keys that did not
/// come back are reported as deleted.
#[derive(Default)]
pub struct EventClassifier {
    seen: HashMap<ClusterKey, NatsCluster>,
    relist: Option<HashSet<ClusterKey>>,
}

impl EventClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, event: watcher::Event<NatsCluster>) -> Vec<ClusterEvent> {
        match event {
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(cluster) => {
                if let Some(relisted) = self.relist.as_mut() {
                    relisted.insert(ClusterKey::of(&cluster));
                }
                self.apply(cluster).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relist.take() else {
                    return Vec::new();
                };
                let gone: Vec<ClusterKey> = self
                    .seen
                    .keys()
                    .filter(|k| !relisted.contains(*k))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|k| self.seen.remove(&k))
                    .map(ClusterEvent::Deleted)
                    .collect()
            }
            watcher::Event::Apply(cluster) => self.apply(cluster).into_iter().collect(),
            watcher::Event::Delete(cluster) => {
                self.seen.remove(&ClusterKey::of(&cluster));
                vec![ClusterEvent::Deleted(cluster)]
            }
        }
    }

    fn apply(&mut self, cluster: NatsCluster) -> Option<ClusterEvent> {
        match self.seen.insert(ClusterKey::of(&cluster), cluster.clone()) {
            None => Some(ClusterEvent::Added(cluster)),
            Some(old) if old.spec != cluster.spec => Some(ClusterEvent::Updated { old, new: cluster }),
            Some(_) => None,
        }
    }
}

/// Watch NatsClusters through `api` and forward classified events to `tx`
/// until `token` is cancelled or the receiver goes away. Watch errors are
/// retried with backoff.
pub async fn watch_clusters(
    api: Api<NatsCluster>,
    tx: mpsc::Sender<ClusterEvent>,
    token: CancellationToken,
) -> Result<()> {
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut classifier = EventClassifier::new();
    info!("Watching NatsCluster resources");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = stream.try_next() => match next {
                Ok(Some(event)) => {
                    for event in classifier.classify(event) {
                        let key = event.key();
                        debug!(namespace = %key.namespace, cluster = %key.name, "Dispatching cluster event");
                        if tx.send(event).await.is_err() {
                            debug!("Event channel closed, stopping watcher");
                            return Ok(());
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(error = %e, "NatsCluster watch error"),
            }
        }
    }

    info!("Stopped watching NatsCluster resources");
    Ok(())
}
