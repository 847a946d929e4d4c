//! Error types for certificate lifecycle management

use thiserror::Error;

/// Errors from the filesystem certificate store
#[derive(Debug, Error)]
pub enum StoreError {
    /// No certificate stored for the domain
    #[error("no certificate stored for '{domain}'")]
    NotFound { domain: String },

    /// The root CA has not been generated yet
    #[error("root certificate has not been generated")]
    RootMissing,

    #[error("certificate store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid PEM in {path}: {message}")]
    Pem { path: String, message: String },

    #[error("invalid X.509 certificate in {path}: {message}")]
    X509 { path: String, message: String },
}

/// Errors while regenerating the proxy certificate list
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to list stored certificates: {0}")]
    Store(#[from] StoreError),

    #[error("failed to write proxy config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize proxy config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to parse proxy config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to replace proxy config: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Errors surfaced by lifecycle operations
#[derive(Debug, Error)]
pub enum CertError {
    /// The name cannot be used as a certificate domain
    #[error("invalid domain '{domain}': {reason}")]
    InvalidDomain { domain: String, reason: &'static str },

    /// The domain has no certificate
    #[error("no certificate for '{domain}'")]
    NotFound { domain: String },

    /// Renewal refused by policy
    #[error("certificate for '{domain}' not due for renewal ({days_remaining} days remaining)")]
    NotDueForRenewal { domain: String, days_remaining: i64 },

    /// The engine reported a non-zero status
    #[error("certificate engine failed for '{domain}' (status {status}): {diagnostic}")]
    EngineFailure {
        domain: String,
        status: i32,
        diagnostic: String,
    },

    /// The certificate was issued but the proxy config could not be written
    #[error("certificate for '{domain}' issued but proxy config was not updated: {source}")]
    ConfigWrite {
        domain: String,
        #[source]
        source: SyncError,
    },

    /// A stored domain is missing its certificate files
    #[error("certificate for '{domain}' is unreadable: no certificate file in its directory")]
    UnreadableCertificate { domain: String },

    /// The root CA does not exist yet
    #[error("root certificate has not yet been generated")]
    RootMissing,

    /// The root CA could not be created
    #[error("failed to create root certificate (status {status}): {diagnostic}")]
    Bootstrap { status: i32, diagnostic: String },

    #[error(transparent)]
    Store(StoreError),
}

impl CertError {
    /// Engine exit status carried by the error, if any
    pub fn status(&self) -> i32 {
        match self {
            CertError::EngineFailure { status, .. } | CertError::Bootstrap { status, .. } => {
                *status
            }
            _ => 1,
        }
    }
}

impl From<StoreError> for CertError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { domain } => CertError::NotFound { domain },
            StoreError::RootMissing => CertError::RootMissing,
            other => CertError::Store(other),
        }
    }
}
