//! NATS Kubernetes Operator
//!
//! Watches `NatsCluster` resources and runs one controller per cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Watch every namespace using the in-cluster or default kubeconfig
//! nats-operator
//!
//! # Watch a single namespace with debug logging
//! nats-operator --namespace messaging --debug
//! ```

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use nats_operator::constants::DEFAULT_RECONCILE_INTERVAL;
use nats_operator::{KubeRuntimeProvider, Operator, OperatorConfig, OperatorError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// NATS Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "nats-operator")]
#[command(version, about = "Kubernetes Operator for NATS server clusters")]
struct Args {
    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Path to a kubeconfig file (in-cluster or default config when unset)
    #[arg(long, env = "KUBERNETES_CONFIG_FILE")]
    kubeconfig: Option<PathBuf>,

    /// Seconds between reconciliation passes of each cluster
    #[arg(long, default_value_t = DEFAULT_RECONCILE_INTERVAL.as_secs())]
    reconcile_interval: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Enable trace logging
    #[arg(long)]
    trace: bool,
}

impl Args {
    fn default_directive(&self) -> &'static str {
        if self.trace {
            "trace"
        } else if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    fn operator_config(&self) -> Result<OperatorConfig, OperatorError> {
        if self.reconcile_interval == 0 {
            return Err(OperatorError::Configuration(
                "reconcile interval must be at least one second".to_string(),
            ));
        }
        Ok(OperatorConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            reconcile_interval: Duration::from_secs(self.reconcile_interval),
            ..Default::default()
        })
    }
}

async fn build_client(kubeconfig: Option<&PathBuf>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| OperatorError::Configuration(format!("{}: {}", path.display(), e)))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| OperatorError::Configuration(e.to_string()))?;
    Ok(Client::try_from(config)?)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.default_directive())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting NATS Kubernetes Operator");
    let config = args.operator_config()?;

    let client = build_client(args.kubeconfig.as_ref()).await?;
    let operator = Arc::new(Operator::new(
        config,
        Arc::new(KubeRuntimeProvider::new(client.clone())),
    ));

    let signals = {
        let operator = Arc::clone(&operator);
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Received shutdown signal");
            operator.shutdown().await;
        })
    };

    let result = operator.start(client).await;
    signals.abort();

    match result {
        Err(e) if e.is_shutdown() => {
            info!("NATS Operator shut down");
            Ok(())
        }
        Err(e) => {
            error!("Operator failed: {}", e);
            Err(e.into())
        }
        Ok(()) => Ok(()),
    }
}
