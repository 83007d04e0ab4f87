//! CRD Registrar
//!
//! Makes sure the NatsCluster CustomResourceDefinition exists and waits for
//! the API server to report it as established. A name conflict aborts
//! startup; running out of time only degrades the operator, since the CRD
//! may still become ready out-of-band.

use crate::conditions::{
    CONDITION_FALSE, CONDITION_TRUE, CRD_CONDITION_ESTABLISHED, CRD_CONDITION_NAMES_ACCEPTED,
};
use crate::constants::{CRD_POLL_INTERVAL, CRD_READY_TIMEOUT};
use crate::error::{OperatorError, RegistrationError, Result};
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// Create/read access to CustomResourceDefinitions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdClient: Send + Sync {
    /// Create the CRD; AlreadyExists is reported as [`OperatorError::AlreadyExists`]
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<()>;

    /// Fetch a CRD by name, `None` when it does not exist (yet)
    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>>;
}

/// [`CrdClient`] backed by the Kubernetes API
pub struct KubeCrdClient {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdClient {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdClient for KubeCrdClient {
    async fn create(&self, crd: &CustomResourceDefinition) -> Result<()> {
        self.api.create(&PostParams::default(), crd).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<CustomResourceDefinition>> {
        Ok(self.api.get_opt(name).await?)
    }
}

/// Outcome of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The API server reports the CRD as established
    Established,
    /// The CRD was not established in time; reconciliation may fail until it is
    TimedOut,
}

/// What a single readiness poll observed
#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    Established,
    Pending,
    NameConflict(String),
}

fn readiness(crd: &CustomResourceDefinition) -> Readiness {
    let conditions = crd
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    for cond in conditions {
        if cond.type_ == CRD_CONDITION_NAMES_ACCEPTED && cond.status == CONDITION_FALSE {
            return Readiness::NameConflict(cond.reason.clone().unwrap_or_default());
        }
    }
    if conditions
        .iter()
        .any(|c| c.type_ == CRD_CONDITION_ESTABLISHED && c.status == CONDITION_TRUE)
    {
        Readiness::Established
    } else {
        Readiness::Pending
    }
}

/// Registers a CRD and polls it until established
pub struct CrdRegistrar<C> {
    client: C,
    interval: Duration,
    timeout: Duration,
}

impl<C: CrdClient> CrdRegistrar<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            interval: CRD_POLL_INTERVAL,
            timeout: CRD_READY_TIMEOUT,
        }
    }

    /// Override the poll interval and the overall readiness timeout
    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    /// Ensure `crd` exists and wait for it to become established
    pub async fn register(&self, crd: &CustomResourceDefinition) -> Result<Registration> {
        let name = crd.name_any();

        match self.client.create(crd).await {
            Ok(()) => info!(crd = %name, "CRD created"),
            Err(e) if e.is_already_exists() => info!(crd = %name, "CRD already exists"),
            Err(e) => {
                return Err(OperatorError::Registration(RegistrationError::CreateFailed(
                    e.to_string(),
                )))
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.client.get(&name).await {
                Ok(Some(current)) => match readiness(&current) {
                    Readiness::Established => {
                        info!(crd = %name, "CRD is established");
                        return Ok(Registration::Established);
                    }
                    Readiness::NameConflict(reason) => {
                        return Err(OperatorError::Registration(
                            RegistrationError::NameConflict(reason),
                        ));
                    }
                    Readiness::Pending => debug!(crd = %name, "CRD not established yet"),
                },
                Ok(None) => debug!(crd = %name, "CRD not found yet"),
                Err(e) => warn!(crd = %name, error = %e, "Failed to read CRD status"),
            }

            if Instant::now() + self.interval > deadline {
                warn!(
                    crd = %name,
                    timeout = ?self.timeout,
                    "Gave up waiting for CRD to be established, continuing in degraded mode"
                );
                return Ok(Registration::TimedOut);
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Ping the API server; failing here means the operator cannot do anything
pub async fn check_connectivity(client: &Client) -> Result<()> {
    let version = client
        .apiserver_version()
        .await
        .map_err(|e| OperatorError::Connectivity(e.to_string()))?;
    info!(
        version = %version.git_version,
        platform = %version.platform,
        "Connected to Kubernetes API server"
    );
    Ok(())
}
