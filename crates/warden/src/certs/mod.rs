//! Local-CA certificate lifecycle
//!
//! - [`store`]: filesystem layout of the root CA and per-domain certificates
//! - [`engine`]: the boundary to whatever mints certificates, with the
//!   [`minica`] subprocess and [`builtin`] rcgen implementations
//! - [`manager`]: issue, renew-if-due, delete and bootstrap policy
//! - [`sync`]: the proxy certificate list derived from the store
//! - [`scheduler`]: periodic renewal sweeps

pub mod builtin;
pub mod engine;
pub mod error;
pub mod manager;
pub mod minica;
pub mod ownership;
pub mod request;
pub mod scheduler;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use certwarden_config::{Config, EngineKind};
use tracing::info;

pub use builtin::BuiltinEngine;
pub use engine::{CertificateEngine, EngineAdapter, EngineStatus};
pub use error::{CertError, StoreError, SyncError};
pub use manager::{
    is_due_for_renewal, CertificateManager, DeleteOutcome, IssueReport, RenewalOutcome,
    SweepSummary, BOOTSTRAP_DOMAIN, RENEWAL_THRESHOLD_DAYS,
};
pub use minica::MinicaEngine;
pub use ownership::{ChownHook, OwnershipError, OwnershipHook, Principal};
pub use request::{domain_key, is_wildcard, validate_domain, DomainKind, DomainRequest};
pub use scheduler::RenewalScheduler;
pub use store::{CertificateRecord, CertificateStore};
pub use sync::{ProxyConfig, ProxyConfigSync};

/// Build the engine selected by `ENGINE`
pub fn engine_from_config(config: &Config) -> Arc<dyn CertificateEngine> {
    match config.engine {
        EngineKind::Minica => Arc::new(MinicaEngine::new(&config.minica_bin)),
        EngineKind::Builtin => Arc::new(BuiltinEngine::new(Duration::from_secs(
            u64::from(config.leaf_validity_days) * 86_400,
        ))),
    }
}

impl CertificateManager {
    /// Open the store and assemble a manager from configuration
    pub fn from_config(config: &Config) -> Result<Self, CertError> {
        let store = CertificateStore::open(&config.cert_dir)?;
        let engine = engine_from_config(config);
        info!(
            engine = engine.name(),
            store_path = %store.root().display(),
            proxy_config = %config.proxy_config_path().display(),
            "Configured certificate manager"
        );

        let manager = Self::new(
            store,
            engine,
            &config.proxy_config_path(),
            config.engine_timeout(),
        );
        Ok(match config.owner() {
            Some(owner) => manager.with_ownership(Arc::new(ChownHook), Principal::from(owner)),
            None => manager,
        })
    }
}
