//! Error types for the NATS Kubernetes Operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Reasons the custom resource definition could not be registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The API server rejected the CRD names (`NamesAccepted=False`)
    NameConflict(String),
    /// The create call failed for a reason other than AlreadyExists
    CreateFailed(String),
}

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum OperatorError {
    /// The orchestration API could not be reached
    Connectivity(String),
    /// CRD registration failed
    Registration(RegistrationError),
    /// Object already exists (treated as success by idempotent creates)
    AlreadyExists(String),
    /// Creating or updating a managed object failed
    ObjectCreate(String),
    /// A controller is already registered for this cluster
    DuplicateRegistration(String),
    /// Kubernetes API error
    KubeApi(String),
    /// Configuration error
    Configuration(String),
    /// Serialization error
    Serialization(String),
    /// The operator root scope was cancelled by a requested shutdown
    Shutdown,
}

impl OperatorError {
    /// True for AlreadyExists, which idempotent creates count as success
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperatorError::AlreadyExists(_))
    }

    /// True when the error is the expected result of a requested shutdown
    pub fn is_shutdown(&self) -> bool {
        matches!(self, OperatorError::Shutdown)
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationError::NameConflict(reason) => write!(f, "name conflict: {}", reason),
            RegistrationError::CreateFailed(msg) => write!(f, "create failed: {}", msg),
        }
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::Connectivity(msg) => {
                write!(f, "Cannot reach Kubernetes API server: {}", msg)
            }
            OperatorError::Registration(err) => write!(f, "CRD registration error: {}", err),
            OperatorError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            OperatorError::ObjectCreate(msg) => write!(f, "Object create error: {}", msg),
            OperatorError::DuplicateRegistration(key) => {
                write!(f, "Controller already registered for {}", key)
            }
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::Shutdown => write!(f, "operator shut down"),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::AlreadyExists(ae.message),
            other => OperatorError::KubeApi(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}
