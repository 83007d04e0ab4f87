//! Rendered NATS server configuration
//!
//! The operator writes one configuration document per cluster into the shared
//! ConfigMap. Every server mounts the same document, so the route list names
//! every peer, including the server itself.

use crate::constants::{
    CLIENT_PORT, CLUSTER_PORT, MONITORING_PORT, ROUTES_CERT_FILE, ROUTES_KEY_FILE,
    ROUTES_TLS_MOUNT_PATH, SERVER_CERT_FILE, SERVER_KEY_FILE, SERVER_TLS_MOUNT_PATH, TLS_CA_FILE,
};
use crate::crd::NatsClusterSpec;
use std::fmt::Write;

/// File paths for one TLS-enabled listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsBlock {
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
}

impl TlsBlock {
    fn server() -> Self {
        Self {
            ca_file: format!("{}/{}", SERVER_TLS_MOUNT_PATH, TLS_CA_FILE),
            cert_file: format!("{}/{}", SERVER_TLS_MOUNT_PATH, SERVER_CERT_FILE),
            key_file: format!("{}/{}", SERVER_TLS_MOUNT_PATH, SERVER_KEY_FILE),
        }
    }

    fn routes() -> Self {
        Self {
            ca_file: format!("{}/{}", ROUTES_TLS_MOUNT_PATH, TLS_CA_FILE),
            cert_file: format!("{}/{}", ROUTES_TLS_MOUNT_PATH, ROUTES_CERT_FILE),
            key_file: format!("{}/{}", ROUTES_TLS_MOUNT_PATH, ROUTES_KEY_FILE),
        }
    }

    fn render(&self, out: &mut String, indent: &str) {
        let _ = writeln!(out, "{indent}tls {{");
        let _ = writeln!(out, "{indent}  ca_file: \"{}\"", self.ca_file);
        let _ = writeln!(out, "{indent}  cert_file: \"{}\"", self.cert_file);
        let _ = writeln!(out, "{indent}  key_file: \"{}\"", self.key_file);
        let _ = writeln!(out, "{indent}}}");
    }
}

/// The `cluster { ... }` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterBlock {
    pub port: i32,
    /// Route addresses in the order they are rendered
    pub routes: Vec<String>,
    pub tls: Option<TlsBlock>,
}

/// A complete server configuration document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub client_port: i32,
    pub http_port: i32,
    pub debug: bool,
    pub trace: bool,
    pub tls: Option<TlsBlock>,
    pub cluster: ClusterBlock,
}

impl ServerConfig {
    /// Builds the configuration for `spec` with the given ordered route addresses
    pub fn for_cluster(spec: &NatsClusterSpec, routes: Vec<String>) -> Self {
        let flags = spec.server_config.clone().unwrap_or_default();
        Self {
            client_port: CLIENT_PORT,
            http_port: MONITORING_PORT,
            debug: flags.debug,
            trace: flags.trace,
            tls: spec.server_secret().map(|_| TlsBlock::server()),
            cluster: ClusterBlock {
                port: CLUSTER_PORT,
                routes,
                tls: spec.routes_secret().map(|_| TlsBlock::routes()),
            },
        }
    }

    /// Renders the document in the NATS configuration syntax
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "port: {}", self.client_port);
        let _ = writeln!(out, "http: {}", self.http_port);
        let _ = writeln!(out, "debug: {}", self.debug);
        let _ = writeln!(out, "trace: {}", self.trace);
        if let Some(tls) = &self.tls {
            out.push('\n');
            tls.render(&mut out, "");
        }

        out.push('\n');
        let _ = writeln!(out, "cluster {{");
        let _ = writeln!(out, "  port: {}", self.cluster.port);
        let _ = writeln!(out, "  routes = [");
        for route in &self.cluster.routes {
            let _ = writeln!(out, "    nats://{}:{}", route, self.cluster.port);
        }
        let _ = writeln!(out, "  ]");
        if let Some(tls) = &self.cluster.tls {
            tls.render(&mut out, "  ");
        }
        let _ = writeln!(out, "}}");
        out
    }
}
