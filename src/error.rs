//! Error types for the Lightspeed Operator

use thiserror::Error;

use crate::certs::CertificateError;

/// Result type for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the operator
///
/// Variants fall into three families: input errors that always name the
/// offending object, platform errors from the object store, and invariant
/// violations in the compiled desired state.
#[derive(Debug, Error)]
pub enum Error {
    /// A referenced Secret or ConfigMap does not exist
    #[error("{referrer} {kind} {name} not found")]
    MissingReference {
        referrer: String,
        kind: &'static str,
        name: String,
    },

    /// A referenced object exists but lacks a required key
    #[error("{referrer} {kind} {name} is missing key '{key}'")]
    MissingKey {
        referrer: String,
        kind: &'static str,
        name: String,
        key: String,
    },

    /// A trust bundle entry is not a usable certificate
    #[error("{referrer} configmap {name} entry '{key}' is not a valid certificate: {source}")]
    InvalidCertificate {
        referrer: String,
        name: String,
        key: String,
        #[source]
        source: CertificateError,
    },

    /// The configuration object is invalid
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The operator itself is misconfigured or a platform fact is unusable
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Object store failure
    #[error("Failed to {action} {kind} {name}: {message}")]
    StoreError {
        action: &'static str,
        kind: String,
        name: String,
        message: String,
    },

    /// Two desired objects were compiled under the same kind and name
    #[error("Duplicate desired object {kind}/{name}")]
    DuplicateObject { kind: String, name: String },

    /// Serialization of a generated artifact failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The cycle was abandoned at a step boundary
    #[error("Reconcile cycle cancelled before step {0}")]
    Cancelled(&'static str),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

impl Error {
    /// Input errors are caused by user-supplied objects and will not clear
    /// until one of them changes.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::MissingReference { .. }
                | Error::MissingKey { .. }
                | Error::InvalidCertificate { .. }
                | Error::ValidationError(_)
        )
    }

    /// The part of the config that referred to the offending object
    pub fn referrer(&self) -> Option<&str> {
        match self {
            Error::MissingReference { referrer, .. }
            | Error::MissingKey { referrer, .. }
            | Error::InvalidCertificate { referrer, .. } => Some(referrer),
            _ => None,
        }
    }

    /// Short label for metrics and condition reasons
    pub fn reason(&self) -> &'static str {
        match self {
            Error::MissingReference { .. } => "MissingReference",
            Error::MissingKey { .. } => "MissingKey",
            Error::InvalidCertificate { .. } => "InvalidCertificate",
            Error::ValidationError(_) => "InvalidConfig",
            Error::ConfigError(_) => "OperatorConfigError",
            Error::StoreError { .. } => "StoreError",
            Error::DuplicateObject { .. } => "DuplicateObject",
            Error::SerializationError(_) => "SerializationError",
            Error::Cancelled(_) => "Cancelled",
            Error::FinalizerError(_) => "FinalizerError",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::FinalizerError(Box::new(err))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}
