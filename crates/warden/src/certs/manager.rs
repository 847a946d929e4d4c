//! Certificate lifecycle policy
//!
//! [`CertificateManager`] decides when a domain certificate is issued,
//! renewed or left alone, owns the root CA bootstrap, and keeps the proxy
//! certificate list in step with the store.
//!
//! # Serialization
//!
//! The HTTP API and the discovery watcher call into the same manager
//! concurrently. Every mutating operation holds a per-domain lock for its
//! whole duration, including the proxy file rewrite, so at most one
//! issuance or renewal is in flight per domain. The proxy file itself is
//! rewritten under a global lock inside [`ProxyConfigSync`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::engine::{CertificateEngine, EngineAdapter};
use super::error::{CertError, StoreError};
use super::ownership::{OwnershipHook, Principal};
use super::request::{domain_from_key, domain_key, validate_domain, DomainRequest};
use super::store::CertificateStore;
use super::sync::ProxyConfigSync;

/// Certificates with fewer whole days left than this are renewed
pub const RENEWAL_THRESHOLD_DAYS: i64 = 31;

/// Throwaway name issued once to make the engine create the root CA
pub const BOOTSTRAP_DOMAIN: &str = "bootstrap.invalid";

/// Whether a certificate with `days_remaining` whole days left must be renewed
pub fn is_due_for_renewal(days_remaining: i64) -> bool {
    days_remaining < RENEWAL_THRESHOLD_DAYS
}

/// Result of an issuance, in the shape returned over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueReport {
    /// Engine exit status, 0 on success
    pub error: i32,
    pub message: String,
    pub domain: String,
}

impl IssueReport {
    pub fn success(domain: &str) -> Self {
        Self {
            error: 0,
            message: "success".to_string(),
            domain: domain.to_string(),
        }
    }
}

/// What `renew_if_due` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// No certificate existed; one was issued
    Issued(IssueReport),
    /// The stale certificate was discarded and reissued
    Renewed(IssueReport),
    /// Enough validity left; nothing changed
    NotDue { domain: String, days_remaining: i64 },
}

impl RenewalOutcome {
    pub fn report(&self) -> IssueReport {
        match self {
            RenewalOutcome::Issued(report) | RenewalOutcome::Renewed(report) => report.clone(),
            RenewalOutcome::NotDue { domain, .. } => IssueReport {
                error: 0,
                message: "Not due to expire".to_string(),
                domain: domain.clone(),
            },
        }
    }

    pub fn changed_store(&self) -> bool {
        !matches!(self, RenewalOutcome::NotDue { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed,
    NotPresent,
}

/// Counters from one sweep over all stored domains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
}

/// Held per-domain lock; the map entry is dropped once nobody else wants it
struct DomainLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DomainLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Certificate lifecycle manager
pub struct CertificateManager {
    store: CertificateStore,
    engine: EngineAdapter,
    sync: ProxyConfigSync,
    ownership: Option<(Arc<dyn OwnershipHook>, Principal)>,
    /// Per-domain-key mutation locks
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CertificateManager {
    /// Create a manager over `store`.
    ///
    /// `proxy_config_path` is the generated certificate list and
    /// `engine_timeout` bounds every engine call.
    pub fn new(
        store: CertificateStore,
        engine: Arc<dyn CertificateEngine>,
        proxy_config_path: &Path,
        engine_timeout: Duration,
    ) -> Self {
        let adapter = EngineAdapter::new(engine, store.root(), engine_timeout);
        let sync = ProxyConfigSync::new(store.clone(), proxy_config_path);
        Self {
            store,
            engine: adapter,
            sync,
            ownership: None,
            locks: DashMap::new(),
        }
    }

    /// Hand issued files to `principal` through `hook`
    pub fn with_ownership(mut self, hook: Arc<dyn OwnershipHook>, principal: Principal) -> Self {
        self.ownership = Some((hook, principal));
        self
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    pub fn proxy_config(&self) -> &ProxyConfigSync {
        &self.sync
    }

    async fn lock_domain(&self, domain: &str) -> DomainLock<'_> {
        let key = domain_key(domain);
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        DomainLock {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    // =========================================================================
    // Bootstrap
    // =========================================================================

    /// Make sure the root CA exists.
    ///
    /// When it is missing, a placeholder certificate is issued so the engine
    /// creates the CA, then the placeholder is removed. Failure here means no
    /// certificate can ever be signed; callers must stop.
    pub async fn bootstrap(&self) -> Result<(), CertError> {
        if self.store.has_root_certificate() {
            debug!(path = %self.store.root_certificate_path().display(), "Root certificate present");
        } else {
            info!(engine = self.engine.engine_name(), "Initializing root certificate");
            let _guard = self.lock_domain(BOOTSTRAP_DOMAIN).await;

            let status = self.engine.issue(BOOTSTRAP_DOMAIN, false).await;
            if !status.is_success() || !self.store.has_root_certificate() {
                error!(
                    status = status.code,
                    diagnostic = %status.diagnostic,
                    "Cannot initialize root certificate"
                );
                return Err(CertError::Bootstrap {
                    status: if status.is_success() { 1 } else { status.code },
                    diagnostic: if status.diagnostic.is_empty() {
                        "engine did not create a root certificate".to_string()
                    } else {
                        status.diagnostic
                    },
                });
            }

            self.store.delete_certificate(BOOTSTRAP_DOMAIN)?;
            self.store.publish_root_certificate()?;
            self.grant_ownership(vec![self.store.root_certificate_path()]);

            info!(path = %self.store.root_certificate_path().display(), "Root certificate created");
        }

        self.sync
            .regenerate()
            .await
            .map_err(|source| CertError::ConfigWrite {
                domain: BOOTSTRAP_DOMAIN.to_string(),
                source,
            })?;
        Ok(())
    }

    // =========================================================================
    // Issuance and renewal
    // =========================================================================

    /// Issue a certificate for `domain` whether or not one exists
    pub async fn issue(&self, domain: &str, include_base: bool) -> Result<IssueReport, CertError> {
        check_domain(domain)?;
        let _guard = self.lock_domain(domain).await;
        self.issue_locked(domain, include_base).await
    }

    async fn issue_locked(&self, domain: &str, include_base: bool) -> Result<IssueReport, CertError> {
        info!(domain = %domain, include_base, "Issuing certificate");

        let status = self.engine.issue(domain, include_base).await;

        if !status.is_success() {
            error!(
                domain = %domain,
                status = status.code,
                diagnostic = %status.diagnostic,
                "Certificate issuance failed"
            );
            // A failed run may still have touched the store
            if let Err(e) = self.sync.regenerate().await {
                warn!(domain = %domain, error = %e, "Failed to refresh proxy config after engine failure");
            }
            return Err(CertError::EngineFailure {
                domain: domain.to_string(),
                status: status.code,
                diagnostic: status.diagnostic,
            });
        }

        let (cert_path, key_path) = self.store.certificate_paths(domain);
        self.grant_ownership(vec![cert_path, key_path]);

        self.sync
            .regenerate()
            .await
            .map_err(|source| CertError::ConfigWrite {
                domain: domain.to_string(),
                source,
            })?;

        info!(domain = %domain, "Certificate issued");
        Ok(IssueReport::success(domain))
    }

    /// Issue when missing, renew when fewer than 31 days remain, else no-op
    pub async fn renew_if_due(&self, domain: &str) -> Result<RenewalOutcome, CertError> {
        check_domain(domain)?;
        let _guard = self.lock_domain(domain).await;

        match self.renew_locked(domain).await {
            Ok(report) => Ok(RenewalOutcome::Renewed(report)),
            Err(CertError::NotFound { .. }) => {
                info!(domain = %domain, "No certificate stored, issuing");
                self.issue_locked(domain, false)
                    .await
                    .map(RenewalOutcome::Issued)
            }
            Err(CertError::NotDueForRenewal {
                domain,
                days_remaining,
            }) => Ok(RenewalOutcome::NotDue {
                domain,
                days_remaining,
            }),
            Err(e) => Err(e),
        }
    }

    /// Renew an existing certificate that is due.
    ///
    /// Unlike [`renew_if_due`](Self::renew_if_due) a missing certificate is
    /// `NotFound` and one with enough validity left is `NotDueForRenewal`.
    pub async fn renew(&self, domain: &str) -> Result<IssueReport, CertError> {
        check_domain(domain)?;
        let _guard = self.lock_domain(domain).await;
        self.renew_locked(domain).await
    }

    async fn renew_locked(&self, domain: &str) -> Result<IssueReport, CertError> {
        let record = self.store.read_certificate(domain)?;

        let days_remaining = record.days_until_expiry(Utc::now());
        if !is_due_for_renewal(days_remaining) {
            debug!(domain = %domain, days_remaining, "Certificate not due for renewal");
            return Err(CertError::NotDueForRenewal {
                domain: domain.to_string(),
                days_remaining,
            });
        }

        info!(
            domain = %domain,
            days_remaining,
            not_after = %record.not_after,
            "Certificate due for renewal"
        );

        // Keep the base name covered if the old certificate had it
        let include_base = DomainRequest::classify(domain, true)
            .base_domain()
            .is_some_and(|base| record.covers(base));

        self.store.delete_certificate(domain)?;
        self.issue_locked(domain, include_base).await
    }

    /// Remove the certificate for `domain` and update the proxy file
    pub async fn delete(&self, domain: &str) -> Result<DeleteOutcome, CertError> {
        check_domain(domain)?;
        let _guard = self.lock_domain(domain).await;

        if !self.store.delete_certificate(domain)? {
            return Ok(DeleteOutcome::NotPresent);
        }

        self.sync
            .regenerate()
            .await
            .map_err(|source| CertError::ConfigWrite {
                domain: domain.to_string(),
                source,
            })?;
        Ok(DeleteOutcome::Removed)
    }

    /// Run `renew_if_due` for every stored domain, continuing past failures
    pub async fn check_all(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        let keys: Vec<String> = match self.store.list_domains() {
            Ok(keys) => keys
                .filter_map(|key| match key {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable store entry");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to list stored certificates");
                return summary;
            }
        };

        info!(domain_count = keys.len(), "Checking certificates for renewal");

        for key in keys {
            let domain = domain_from_key(&key);
            summary.checked += 1;
            match self.renew_if_due(&domain).await {
                Ok(outcome) if outcome.changed_store() => {
                    info!(domain = %domain, "Certificate renewed");
                    summary.renewed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(domain = %domain, error = %e, "Certificate renewal failed");
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Expiry of every stored certificate, keyed by store key
    pub fn expiry_report(&self) -> Result<BTreeMap<String, DateTime<Utc>>, CertError> {
        let mut report = BTreeMap::new();
        for key in self.store.list_domains()? {
            let key = key?;
            let record = self.store.read_certificate(&key).map_err(|e| match e {
                // The directory was listed, so a missing file is damage, not absence
                StoreError::NotFound { domain } => CertError::UnreadableCertificate { domain },
                other => other.into(),
            })?;
            report.insert(key, record.not_after);
        }
        Ok(report)
    }

    pub fn root_certificate_pem(&self) -> Result<Vec<u8>, CertError> {
        Ok(self.store.read_root_pem()?)
    }

    pub fn root_certificate_der(&self) -> Result<Vec<u8>, CertError> {
        Ok(self.store.read_root_der()?)
    }

    fn grant_ownership(&self, paths: Vec<PathBuf>) {
        let Some((hook, principal)) = &self.ownership else {
            return;
        };
        if let Err(e) = hook.grant_ownership(&paths, *principal) {
            warn!(error = %e, "Failed to transfer certificate ownership");
        }
    }
}

fn check_domain(domain: &str) -> Result<(), CertError> {
    validate_domain(domain).map_err(|reason| {
        warn!(domain = %domain, reason, "Rejected domain name");
        CertError::InvalidDomain {
            domain: domain.to_string(),
            reason,
        }
    })
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("store", &self.store.root())
            .field("engine", &self.engine)
            .field("proxy_config", &self.sync.path())
            .field("has_ownership_hook", &self.ownership.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::builtin::BuiltinEngine;
    use crate::certs::engine::EngineStatus;
    use crate::certs::ownership::OwnershipError;
    use crate::certs::testing::{write_leaf, write_leaf_with_names};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug)]
    struct BrokenEngine;

    #[async_trait]
    impl CertificateEngine for BrokenEngine {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn issue_plain(&self, _: &str, _: &Path) -> EngineStatus {
            EngineStatus::failure(2, "no entropy")
        }
        async fn issue_wildcard(&self, _: &str, _: bool, _: &Path) -> EngineStatus {
            EngineStatus::failure(2, "no entropy")
        }
    }

    fn setup() -> (TempDir, CertificateManager) {
        let temp_dir = TempDir::new().unwrap();
        let store = CertificateStore::open(&temp_dir.path().join("certificates")).unwrap();
        let proxy_path = store.root().join("certificates.toml");
        let manager = CertificateManager::new(
            store,
            Arc::new(BuiltinEngine::default()),
            &proxy_path,
            Duration::from_secs(30),
        );
        (temp_dir, manager)
    }

    async fn bootstrapped() -> (TempDir, CertificateManager) {
        let (temp_dir, manager) = setup();
        manager.bootstrap().await.unwrap();
        (temp_dir, manager)
    }

    /// Domain keys listed in the proxy file
    fn proxy_domains(manager: &CertificateManager) -> BTreeSet<String> {
        let root = manager.store().root().to_path_buf();
        manager
            .proxy_config()
            .read_current()
            .unwrap()
            .unwrap()
            .tls
            .certificates
            .iter()
            .map(|entry| {
                Path::new(&entry.cert_file)
                    .parent()
                    .unwrap()
                    .strip_prefix(&root)
                    .unwrap()
                    .display()
                    .to_string()
            })
            .collect()
    }

    fn store_domains(manager: &CertificateManager) -> BTreeSet<String> {
        manager
            .store()
            .list_domains()
            .unwrap()
            .map(|key| key.unwrap())
            .collect()
    }

    #[test]
    fn test_renewal_threshold_boundary() {
        assert!(is_due_for_renewal(30));
        assert!(!is_due_for_renewal(31));
        assert!(is_due_for_renewal(-2));
    }

    #[tokio::test]
    async fn test_bootstrap_creates_root_without_placeholder() {
        let (_temp_dir, manager) = setup();
        assert!(!manager.store().has_root_certificate());

        manager.bootstrap().await.unwrap();

        assert!(manager.store().has_root_certificate());
        assert!(!manager.store().domain_path(BOOTSTRAP_DOMAIN).exists());
        assert!(store_domains(&manager).is_empty());
        assert!(proxy_domains(&manager).is_empty());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(manager.store().root_certificate_path())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_existing_root() {
        let (_temp_dir, manager) = bootstrapped().await;
        let before = manager.root_certificate_pem().unwrap();

        manager.bootstrap().await.unwrap();

        assert_eq!(manager.root_certificate_pem().unwrap(), before);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let store = CertificateStore::open(temp_dir.path()).unwrap();
        let manager = CertificateManager::new(
            store,
            Arc::new(BrokenEngine),
            &temp_dir.path().join("certificates.toml"),
            Duration::from_secs(5),
        );

        let err = manager.bootstrap().await.unwrap_err();
        assert!(matches!(err, CertError::Bootstrap { status: 2, .. }));
    }

    #[tokio::test]
    async fn test_issue_then_read() {
        let (_temp_dir, manager) = bootstrapped().await;

        let report = manager.issue("app.example.com", false).await.unwrap();
        assert_eq!(report, IssueReport::success("app.example.com"));

        let record = manager.store().read_certificate("app.example.com").unwrap();
        assert!(record.covers("app.example.com"));
        assert_eq!(proxy_domains(&manager), store_domains(&manager));
    }

    #[tokio::test]
    async fn test_issue_is_unconditional() {
        let (_temp_dir, manager) = bootstrapped().await;
        manager.issue("app.example.com", false).await.unwrap();
        let first = std::fs::read(manager.store().certificate_paths("app.example.com").0).unwrap();

        manager.issue("app.example.com", false).await.unwrap();
        let second = std::fs::read(manager.store().certificate_paths("app.example.com").0).unwrap();

        assert_ne!(first, second);
        assert_eq!(store_domains(&manager).len(), 1);
    }

    #[tokio::test]
    async fn test_renew_if_due_issues_missing() {
        let (_temp_dir, manager) = bootstrapped().await;

        let outcome = manager.renew_if_due("new.example.com").await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Issued(_)));
        assert!(manager.store().contains("new.example.com"));
        assert_eq!(proxy_domains(&manager), store_domains(&manager));
    }

    #[tokio::test]
    async fn test_renew_if_due_is_idempotent_when_valid() {
        let (_temp_dir, manager) = bootstrapped().await;
        manager.issue("app.example.com", false).await.unwrap();
        let before = manager.store().read_certificate("app.example.com").unwrap();
        let bytes_before =
            std::fs::read(manager.store().certificate_paths("app.example.com").0).unwrap();

        for _ in 0..2 {
            let outcome = manager.renew_if_due("app.example.com").await.unwrap();
            assert!(matches!(outcome, RenewalOutcome::NotDue { days_remaining, .. } if days_remaining >= 31));
            assert_eq!(outcome.report().message, "Not due to expire");
        }

        let after = manager.store().read_certificate("app.example.com").unwrap();
        assert_eq!(before.not_after, after.not_after);
        assert_eq!(
            bytes_before,
            std::fs::read(manager.store().certificate_paths("app.example.com").0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_thirty_one_days_is_not_renewed() {
        let (_temp_dir, manager) = bootstrapped().await;
        write_leaf(
            manager.store(),
            "edge.example.com",
            chrono::Duration::days(31) + chrono::Duration::hours(1),
        );

        let outcome = manager.renew_if_due("edge.example.com").await.unwrap();
        assert_eq!(
            outcome,
            RenewalOutcome::NotDue {
                domain: "edge.example.com".to_string(),
                days_remaining: 31
            }
        );
    }

    #[tokio::test]
    async fn test_thirty_days_is_renewed() {
        let (_temp_dir, manager) = bootstrapped().await;
        write_leaf(
            manager.store(),
            "edge.example.com",
            chrono::Duration::days(30) + chrono::Duration::hours(1),
        );
        let old = manager.store().read_certificate("edge.example.com").unwrap();

        let outcome = manager.renew_if_due("edge.example.com").await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Renewed(ref report) if report.error == 0));

        let new = manager.store().read_certificate("edge.example.com").unwrap();
        assert!(new.not_after > old.not_after);
        assert!(new.days_until_expiry(Utc::now()) >= RENEWAL_THRESHOLD_DAYS);
        assert_eq!(proxy_domains(&manager), store_domains(&manager));
    }

    #[tokio::test]
    async fn test_strict_renew() {
        let (_temp_dir, manager) = bootstrapped().await;

        let err = manager.renew("missing.example.com").await.unwrap_err();
        assert!(matches!(err, CertError::NotFound { .. }));
        assert!(!manager.store().contains("missing.example.com"));

        manager.issue("app.example.com", false).await.unwrap();
        let err = manager.renew("app.example.com").await.unwrap_err();
        assert!(matches!(err, CertError::NotDueForRenewal { days_remaining, .. } if days_remaining >= 31));

        write_leaf(manager.store(), "old.example.com", chrono::Duration::days(10));
        let report = manager.renew("old.example.com").await.unwrap();
        assert_eq!(report, IssueReport::success("old.example.com"));
    }

    #[tokio::test]
    async fn test_renewal_keeps_wildcard_base() {
        let (_temp_dir, manager) = bootstrapped().await;
        manager.issue("*.a.example.com", true).await.unwrap();

        write_leaf_with_names(
            manager.store(),
            "*.a.example.com",
            &["*.a.example.com", "a.example.com"],
            chrono::Duration::days(5),
        );
        let outcome = manager.renew_if_due("*.a.example.com").await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Renewed(_)));

        let record = manager.store().read_certificate("*.a.example.com").unwrap();
        assert!(record.covers("*.a.example.com"));
        assert!(record.covers("a.example.com"));
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp_dir, manager) = bootstrapped().await;
        manager.issue("a.example.com", false).await.unwrap();
        manager.issue("b.example.com", false).await.unwrap();

        assert_eq!(manager.delete("a.example.com").await.unwrap(), DeleteOutcome::Removed);
        assert_eq!(proxy_domains(&manager), BTreeSet::from(["b.example.com".to_string()]));
    }

    #[tokio::test]
    async fn test_delete_missing_leaves_proxy_config() {
        let (_temp_dir, manager) = bootstrapped().await;
        manager.issue("a.example.com", false).await.unwrap();
        let path = manager.proxy_config().path().to_path_buf();
        let before = std::fs::read(&path).unwrap();
        let modified_before = std::fs::metadata(&path).unwrap().modified().unwrap();

        let outcome = manager.delete("missing.example.com").await.unwrap();

        assert_eq!(outcome, DeleteOutcome::NotPresent);
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified_before);
    }

    #[tokio::test]
    async fn test_expiry_report() {
        let (_temp_dir, manager) = bootstrapped().await;
        manager.issue("a.example.com", false).await.unwrap();
        manager.issue("*.b.example.com", false).await.unwrap();

        let report = manager.expiry_report().unwrap();
        assert_eq!(
            report.keys().cloned().collect::<Vec<_>>(),
            vec!["_.b.example.com".to_string(), "a.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_expiry_report_surfaces_unreadable_certificate() {
        let (_temp_dir, manager) = bootstrapped().await;
        let dir = manager.store().domain_path("broken.example.com");
        std::fs::create_dir_all(&dir).unwrap();

        let err = manager.expiry_report().unwrap_err();
        assert!(matches!(
            err,
            CertError::UnreadableCertificate { domain } if domain == "broken.example.com"
        ));
    }

    #[tokio::test]
    async fn test_path_like_domains_are_rejected() {
        let (temp_dir, manager) = bootstrapped().await;
        manager.issue("app.example.com", false).await.unwrap();
        let outside = temp_dir.path().join("outside.txt");
        std::fs::write(&outside, "keep").unwrap();

        for domain in [".", "..", "../escaped", "a/b", ""] {
            let err = manager.delete(domain).await.unwrap_err();
            assert!(matches!(err, CertError::InvalidDomain { .. }), "delete {domain:?}");
            let err = manager.issue(domain, false).await.unwrap_err();
            assert!(matches!(err, CertError::InvalidDomain { .. }), "issue {domain:?}");
            let err = manager.renew(domain).await.unwrap_err();
            assert!(matches!(err, CertError::InvalidDomain { .. }), "renew {domain:?}");
            let err = manager.renew_if_due(domain).await.unwrap_err();
            assert!(matches!(err, CertError::InvalidDomain { .. }), "renew_if_due {domain:?}");
        }

        assert!(manager.store().has_root_certificate());
        assert!(manager.store().contains("app.example.com"));
        assert!(outside.exists());
        assert!(!temp_dir.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn test_domain_locks_are_released() {
        let (_temp_dir, manager) = bootstrapped().await;
        manager.issue("a.example.com", false).await.unwrap();
        manager.renew_if_due("a.example.com").await.unwrap();
        manager.renew("missing.example.com").await.unwrap_err();
        manager.delete("a.example.com").await.unwrap();
        manager.delete("../x").await.unwrap_err();

        assert!(manager.locks.is_empty());

        let held = manager.lock_domain("b.example.com").await;
        assert_eq!(manager.locks.len(), 1);
        drop(held);
        assert!(manager.locks.is_empty());
    }

    #[tokio::test]
    async fn test_check_all_renews_only_due() {
        let (_temp_dir, manager) = bootstrapped().await;
        manager.issue("fresh.example.com", false).await.unwrap();
        write_leaf(manager.store(), "stale.example.com", chrono::Duration::days(3));
        write_leaf(manager.store(), "*.w.example.com", chrono::Duration::days(3));

        let summary = manager.check_all().await;

        assert_eq!(
            summary,
            SweepSummary {
                checked: 3,
                renewed: 2,
                failed: 0
            }
        );
        let record = manager.store().read_certificate("*.w.example.com").unwrap();
        assert!(record.covers("*.w.example.com"));
    }

    #[tokio::test]
    async fn test_engine_failure_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let store = CertificateStore::open(temp_dir.path()).unwrap();
        let proxy_path = temp_dir.path().join("certificates.toml");
        let manager = CertificateManager::new(
            store,
            Arc::new(BrokenEngine),
            &proxy_path,
            Duration::from_secs(5),
        );

        let err = manager.issue("app.example.com", false).await.unwrap_err();
        match err {
            CertError::EngineFailure {
                domain,
                status,
                diagnostic,
            } => {
                assert_eq!(domain, "app.example.com");
                assert_eq!(status, 2);
                assert_eq!(diagnostic, "no entropy");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!manager.store().contains("app.example.com"));
        // The proxy file is refreshed even when the engine fails
        assert!(proxy_path.is_file());
    }

    #[tokio::test]
    async fn test_concurrent_renewals_issue_once() {
        #[derive(Debug)]
        struct CountingEngine {
            inner: BuiltinEngine,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl CertificateEngine for CountingEngine {
            fn name(&self) -> &'static str {
                "counting"
            }
            async fn issue_plain(&self, domain: &str, workdir: &Path) -> EngineStatus {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.inner.issue_plain(domain, workdir).await
            }
            async fn issue_wildcard(&self, p: &str, b: bool, workdir: &Path) -> EngineStatus {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.inner.issue_wildcard(p, b, workdir).await
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let store = CertificateStore::open(temp_dir.path()).unwrap();
        let engine = Arc::new(CountingEngine {
            inner: BuiltinEngine::default(),
            calls: AtomicUsize::new(0),
        });
        let manager = Arc::new(CertificateManager::new(
            store,
            engine.clone(),
            &temp_dir.path().join("certificates.toml"),
            Duration::from_secs(30),
        ));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.renew_if_due("race.example.com").await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ownership_hook_receives_issued_files() {
        #[derive(Debug, Default)]
        struct RecordingHook {
            seen: std::sync::Mutex<Vec<(PathBuf, Principal)>>,
        }

        impl OwnershipHook for RecordingHook {
            fn grant_ownership(
                &self,
                paths: &[PathBuf],
                principal: Principal,
            ) -> Result<(), OwnershipError> {
                let mut seen = self.seen.lock().unwrap();
                seen.extend(paths.iter().map(|p| (p.clone(), principal)));
                Ok(())
            }
        }

        let (_temp_dir, manager) = setup();
        let hook = Arc::new(RecordingHook::default());
        let principal = Principal { uid: 1000, gid: 1000 };
        let manager = manager.with_ownership(hook.clone(), principal);

        manager.bootstrap().await.unwrap();
        manager.issue("owned.example.com", false).await.unwrap();

        let seen = hook.seen.lock().unwrap();
        let paths: Vec<&PathBuf> = seen.iter().map(|(p, _)| p).collect();
        assert_eq!(paths.len(), 3);
        assert!(paths[0].ends_with("minica.pem"));
        assert!(paths[1].ends_with("owned.example.com/cert.pem"));
        assert!(paths[2].ends_with("owned.example.com/key.pem"));
        assert!(seen.iter().all(|(_, p)| *p == principal));
    }
}
