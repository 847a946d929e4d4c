//! Certificate engine boundary
//!
//! The engine is whatever actually mints certificates. Given a working
//! directory it creates the root CA there on first use and writes
//! `<domain>/cert.pem` and `<domain>/key.pem` for each request. The adapter
//! classifies requests, bounds every call with a timeout and checks the
//! post-condition that the files exist.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::request::{DomainKind, DomainRequest};
use super::store::CERT_FILE;

/// Status reported when an engine call exceeds the timeout
pub const TIMEOUT_STATUS: i32 = 124;

/// Status reported when the engine claims success but produced no files
pub const MISSING_OUTPUT_STATUS: i32 = 70;

/// Outcome of one engine invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    /// 0 on success, otherwise the engine's exit status
    pub code: i32,
    /// Diagnostic text from the engine, empty on success
    pub diagnostic: String,
}

impl EngineStatus {
    pub fn success() -> Self {
        Self {
            code: 0,
            diagnostic: String::new(),
        }
    }

    pub fn failure(code: i32, diagnostic: impl Into<String>) -> Self {
        Self {
            // A failure must never look like success
            code: if code == 0 { 1 } else { code },
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// A certificate generation capability
#[async_trait]
pub trait CertificateEngine: Send + Sync + fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Issue a certificate for a single plain domain
    async fn issue_plain(&self, domain: &str, workdir: &Path) -> EngineStatus;

    /// Issue a certificate for `*.<base>`, optionally also covering `<base>`
    async fn issue_wildcard(&self, pattern: &str, include_base: bool, workdir: &Path)
        -> EngineStatus;
}

/// Uniform entry point into the configured engine
#[derive(Clone)]
pub struct EngineAdapter {
    engine: Arc<dyn CertificateEngine>,
    /// Store root, passed to the engine as its working directory
    workdir: PathBuf,
    timeout: Duration,
}

impl EngineAdapter {
    pub fn new(engine: Arc<dyn CertificateEngine>, workdir: &Path, timeout: Duration) -> Self {
        Self {
            engine,
            workdir: workdir.to_path_buf(),
            timeout,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Issue a certificate for `domain`.
    ///
    /// On success the certificate exists under the domain's store directory
    /// when this returns.
    pub async fn issue(&self, domain: &str, include_base: bool) -> EngineStatus {
        let request = DomainRequest::classify(domain, include_base);
        debug!(
            domain = %domain,
            engine = self.engine.name(),
            kind = ?request.kind(),
            "Invoking certificate engine"
        );

        let call = async {
            match request.kind() {
                DomainKind::Plain => self.engine.issue_plain(domain, &self.workdir).await,
                DomainKind::Wildcard { include_base } => {
                    self.engine
                        .issue_wildcard(domain, include_base, &self.workdir)
                        .await
                }
            }
        };

        let status = match tokio::time::timeout(self.timeout, call).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    domain = %domain,
                    engine = self.engine.name(),
                    timeout_secs = self.timeout.as_secs(),
                    "Certificate engine timed out"
                );
                return EngineStatus::failure(
                    TIMEOUT_STATUS,
                    format!("{} timed out after {:?}", self.engine.name(), self.timeout),
                );
            }
        };

        if status.is_success() {
            let cert_path = self.workdir.join(request.key()).join(CERT_FILE);
            if !cert_path.is_file() {
                warn!(
                    domain = %domain,
                    path = %cert_path.display(),
                    "Engine reported success without writing a certificate"
                );
                return EngineStatus::failure(
                    MISSING_OUTPUT_STATUS,
                    format!("{} produced no certificate at {}", self.engine.name(), cert_path.display()),
                );
            }
        }

        status
    }
}

impl fmt::Debug for EngineAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineAdapter")
            .field("engine", &self.engine.name())
            .field("workdir", &self.workdir)
            .field("timeout", &self.timeout)
            .finish()
    }
}
