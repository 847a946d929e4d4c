//! Container discovery loop
//!
//! Consumes container start events, pulls host names out of their router
//! labels and makes sure each one has a valid certificate.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::docker::{ContainerEvent, EventFeed, FeedError};
use super::rules::hosts_in_labels;
use crate::certs::{CertificateManager, RenewalOutcome};
use crate::notify::DiscoveryNotifier;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("event feed failed: {0}")]
    Feed(#[from] FeedError),

    #[error("event feed closed")]
    FeedClosed,
}

/// Watches container starts and provisions certificates for their hosts
pub struct DiscoveryWatcher {
    manager: Arc<CertificateManager>,
    notifier: Option<Arc<dyn DiscoveryNotifier>>,
    /// Domains already handled during this run
    discovered: HashSet<String>,
}

impl DiscoveryWatcher {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self {
            manager,
            notifier: None,
            discovered: HashSet::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DiscoveryNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Domains handled so far
    pub fn discovered(&self) -> &HashSet<String> {
        &self.discovered
    }

    /// Process events until the feed ends or fails.
    ///
    /// Never returns `Ok`; losing the feed is the caller's to handle.
    pub async fn run<F: EventFeed>(mut self, mut feed: F) -> Result<(), WatchError> {
        info!("Watching container events for router hosts");

        loop {
            match feed.next_event().await? {
                Some(event) => {
                    self.handle_event(&event).await;
                }
                None => {
                    error!(discovered = self.discovered.len(), "Container event feed closed");
                    return Err(WatchError::FeedClosed);
                }
            }
        }
    }

    /// Handle one event; returns the domains newly processed
    pub async fn handle_event(&mut self, event: &ContainerEvent) -> Vec<String> {
        let hosts = hosts_in_labels(&event.actor.attributes);
        if hosts.is_empty() {
            debug!(container = %event.container_name(), "No router hosts on container");
            return Vec::new();
        }

        let mut processed = Vec::new();
        for domain in hosts {
            // Marked before processing so a failing domain is not retried per event
            if !self.discovered.insert(domain.clone()) {
                debug!(domain = %domain, "Domain already handled");
                continue;
            }

            info!(
                domain = %domain,
                container = %event.container_name(),
                "Discovered router host"
            );
            self.provision(&domain).await;
            processed.push(domain);
        }
        processed
    }

    async fn provision(&self, domain: &str) {
        match self.manager.renew_if_due(domain).await {
            Ok(outcome) => {
                match &outcome {
                    RenewalOutcome::Issued(_) => info!(domain = %domain, "Issued certificate"),
                    RenewalOutcome::Renewed(_) => info!(domain = %domain, "Renewed certificate"),
                    RenewalOutcome::NotDue { days_remaining, .. } => {
                        debug!(domain = %domain, days_remaining, "Certificate still valid")
                    }
                }
                self.announce(domain).await;
            }
            Err(e) => {
                error!(domain = %domain, error = %e, "Failed to provision certificate");
            }
        }
    }

    async fn announce(&self, domain: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(e) = notifier.announce(domain).await {
            warn!(domain = %domain, error = %e, "Failed to announce domain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::{BuiltinEngine, CertificateEngine, CertificateStore, EngineStatus};
    use crate::notify::NotifyError;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

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
            if domain.starts_with("fail.") {
                return EngineStatus::failure(1, "refused");
            }
            self.inner.issue_plain(domain, workdir).await
        }
        async fn issue_wildcard(&self, p: &str, b: bool, workdir: &Path) -> EngineStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.issue_wildcard(p, b, workdir).await
        }
    }

    #[derive(Debug, Default)]
    struct RecordingNotifier {
        announced: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DiscoveryNotifier for RecordingNotifier {
        async fn announce(&self, domain: &str) -> Result<(), NotifyError> {
            self.announced.lock().unwrap().push(domain.to_string());
            Ok(())
        }
    }

    struct ScriptedFeed(VecDeque<ContainerEvent>);

    #[async_trait]
    impl EventFeed for ScriptedFeed {
        async fn next_event(&mut self) -> Result<Option<ContainerEvent>, FeedError> {
            Ok(self.0.pop_front())
        }
    }

    fn event(labels: &[(&str, &str)]) -> ContainerEvent {
        let mut event = ContainerEvent {
            kind: "container".to_string(),
            action: "start".to_string(),
            ..Default::default()
        };
        event.actor.attributes = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        event
    }

    fn setup() -> (TempDir, Arc<CountingEngine>, Arc<CertificateManager>) {
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
        (temp_dir, engine, manager)
    }

    #[tokio::test]
    async fn test_same_domain_issued_once() {
        let (_temp_dir, engine, manager) = setup();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut watcher = DiscoveryWatcher::new(Arc::clone(&manager)).with_notifier(notifier.clone());

        let start = event(&[("traefik.http.routers.web.rule", "Host(`app.example.com`)")]);
        assert_eq!(watcher.handle_event(&start).await, vec!["app.example.com"]);
        assert!(watcher.handle_event(&start).await.is_empty());

        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert!(manager.store().contains("app.example.com"));
        assert_eq!(*notifier.announced.lock().unwrap(), vec!["app.example.com"]);
    }

    #[tokio::test]
    async fn test_existing_valid_certificate_is_announced_without_issuing() {
        let (_temp_dir, engine, manager) = setup();
        manager.issue("app.example.com", false).await.unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut watcher = DiscoveryWatcher::new(Arc::clone(&manager)).with_notifier(notifier.clone());

        watcher
            .handle_event(&event(&[("traefik.http.routers.web.rule", "Host(`app.example.com`)")]))
            .await;

        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*notifier.announced.lock().unwrap(), vec!["app.example.com"]);
    }

    #[tokio::test]
    async fn test_failure_is_not_announced_and_loop_continues() {
        let (_temp_dir, _engine, manager) = setup();
        let notifier = Arc::new(RecordingNotifier::default());
        let mut watcher = DiscoveryWatcher::new(Arc::clone(&manager)).with_notifier(notifier.clone());

        let processed = watcher
            .handle_event(&event(&[(
                "traefik.http.routers.web.rule",
                "Host(`fail.example.com`) || Host(`ok.example.com`)",
            )]))
            .await;

        assert_eq!(processed, vec!["fail.example.com", "ok.example.com"]);
        assert!(watcher.discovered().contains("fail.example.com"));
        assert_eq!(*notifier.announced.lock().unwrap(), vec!["ok.example.com"]);
    }

    #[tokio::test]
    async fn test_events_without_hosts_are_ignored() {
        let (_temp_dir, engine, manager) = setup();
        let mut watcher = DiscoveryWatcher::new(manager);

        assert!(watcher.handle_event(&event(&[])).await.is_empty());
        assert!(watcher
            .handle_event(&event(&[("traefik.http.routers.web.rule", "PathPrefix(`/`)")]))
            .await
            .is_empty());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_ends_with_feed_closed() {
        let (_temp_dir, engine, manager) = setup();
        let feed = ScriptedFeed(VecDeque::from([
            event(&[("traefik.http.routers.a.rule", "Host(`a.example.com`)")]),
            event(&[("traefik.http.routers.b.rule", "Host(`a.example.com`)")]),
        ]));

        let err = DiscoveryWatcher::new(Arc::clone(&manager)).run(feed).await.unwrap_err();

        assert!(matches!(err, WatchError::FeedClosed));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        let proxy = manager.proxy_config().read_current().unwrap().unwrap();
        assert_eq!(proxy.tls.certificates.len(), 1);
    }
}
