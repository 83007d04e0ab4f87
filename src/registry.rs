//! ControllerRegistry
//!
//! Keyed store of the running cluster controllers. At most one controller is
//! registered per (namespace, name); the map never leaves its lock.

use crate::controllers::ClusterController;
use crate::crd::ClusterKey;
use crate::error::{OperatorError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Mutex<HashMap<ClusterKey, Arc<ClusterController>>>,
}

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClusterKey, Arc<ClusterController>>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.controllers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a controller; rejects a second controller for the same key.
    /// A controller that is already stopping no longer holds its key.
    pub fn insert(&self, controller: Arc<ClusterController>) -> Result<()> {
        let key = controller.key().clone();
        let mut controllers = self.lock();
        if controllers.get(&key).is_some_and(|c| !c.is_cancelled()) {
            return Err(OperatorError::DuplicateRegistration(key.to_string()));
        }
        controllers.insert(key, controller);
        Ok(())
    }

    pub fn get(&self, key: &ClusterKey) -> Option<Arc<ClusterController>> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &ClusterKey) -> Option<Arc<ClusterController>> {
        self.lock().remove(key)
    }

    /// Remove `controller` only if it is still the one registered for its key
    pub fn remove_controller(&self, controller: &Arc<ClusterController>) -> bool {
        let mut controllers = self.lock();
        match controllers.get(controller.key()) {
            Some(current) if Arc::ptr_eq(current, controller) => {
                controllers.remove(controller.key());
                true
            }
            _ => false,
        }
    }

    /// Copy of every registered controller, taken under the lock
    pub fn snapshot(&self) -> Vec<Arc<ClusterController>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::ClusterController;
    use crate::crd::NatsCluster;
    use crate::runtime::fake::FakeRuntime;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn controller(namespace: &str, name: &str) -> Arc<ClusterController> {
        let mut cluster = NatsCluster::new(name, serde_json::from_str(r#"{"size":1}"#).unwrap());
        cluster.metadata.namespace = Some(namespace.to_string());
        Arc::new(ClusterController::new(
            &cluster,
            Arc::new(FakeRuntime::default()),
            CancellationToken::new(),
            Duration::from_secs(5),
        ))
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = ControllerRegistry::new();
        registry.insert(controller("ns", "c1")).unwrap();

        let err = registry.insert(controller("ns", "c1")).unwrap_err();
        assert!(matches!(err, OperatorError::DuplicateRegistration(ref k) if k == "ns/c1"));
        assert_eq!(registry.len(), 1);

        registry.insert(controller("other", "c1")).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_get_remove_snapshot() {
        let registry = ControllerRegistry::new();
        let first = controller("ns", "c1");
        registry.insert(first.clone()).unwrap();
        registry.insert(controller("ns", "c2")).unwrap();

        let key = ClusterKey::new("ns", "c1");
        assert!(Arc::ptr_eq(&registry.get(&key).unwrap(), &first));
        assert_eq!(registry.snapshot().len(), 2);

        assert!(registry.remove(&key).is_some());
        assert!(registry.get(&key).is_none());
        assert!(registry.remove(&key).is_none());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_stopping_controller_can_be_replaced() {
        let registry = ControllerRegistry::new();
        let stopping = controller("ns", "c1");
        registry.insert(stopping.clone()).unwrap();
        stopping.stop();

        let fresh = controller("ns", "c1");
        registry.insert(fresh.clone()).unwrap();
        assert_eq!(registry.len(), 1);

        // Late cleanup of the old controller leaves the new one in place
        assert!(!registry.remove_controller(&stopping));
        assert!(registry.remove_controller(&fresh));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_keep_one_controller_per_key() {
        let registry = Arc::new(ControllerRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.insert(controller("ns", "c1")).is_ok())
            })
            .collect();
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(registry.len(), 1);
    }
}
