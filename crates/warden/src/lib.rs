//! certwarden
//!
//! Issues and renews TLS certificates signed by a local root CA for domains
//! served behind a reverse proxy, and keeps the proxy's certificate list in
//! step with what is on disk.
//!
//! - **Certificates**: store layout, engine boundary (`minica` or in-process
//!   rcgen), issue / renew-if-due / delete policy with per-domain locking
//! - **Proxy sync**: regenerates the Traefik dynamic TLS file atomically
//! - **Discovery**: watches Docker container starts and provisions
//!   certificates for hosts named in router rules
//! - **Notification**: optional MQTT announcement of discovered domains
//! - **API**: HTTP front end for manual issuance and root CA download

// ============================================================================
// Module Declarations
// ============================================================================

pub mod api;
pub mod certs;
pub mod discovery;
pub mod notify;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use certs::{
    CertError, CertificateManager, CertificateStore, DeleteOutcome, IssueReport,
    RenewalOutcome, RenewalScheduler,
};
pub use discovery::{DiscoveryWatcher, DockerEventFeed, EventFeed};
pub use notify::{DiscoveryNotifier, MqttNotifier};
