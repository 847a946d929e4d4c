//! Proxy certificate list synchronization
//!
//! Writes the Traefik dynamic configuration listing every stored
//! certificate:
//!
//! ```toml
//! [[tls.certificates]]
//! certFile = "/srv/certificates/app.example.com/cert.pem"
//! keyFile = "/srv/certificates/app.example.com/key.pem"
//! ```
//!
//! The document is rebuilt from the store on every call and swapped in with a
//! rename, so readers see either the old or the new list.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::SyncError;
use super::store::CertificateStore;

/// One certificate/key pair as the proxy expects it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCertificateEntry {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSection {
    pub certificates: Vec<ProxyCertificateEntry>,
}

/// The generated proxy document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub tls: TlsSection,
}

/// Regenerates the proxy file from the store; writes are serialized
#[derive(Debug)]
pub struct ProxyConfigSync {
    store: CertificateStore,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProxyConfigSync {
    pub fn new(store: CertificateStore, path: &Path) -> Self {
        Self {
            store,
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build the document for the current store contents, sorted by domain key
    pub fn build(&self) -> Result<ProxyConfig, SyncError> {
        let mut domains = self
            .store
            .list_domains()?
            .collect::<Result<Vec<_>, _>>()?;
        domains.sort();

        let certificates = domains
            .iter()
            .map(|domain| {
                let (cert, key) = self.store.certificate_paths(domain);
                ProxyCertificateEntry {
                    cert_file: cert.display().to_string(),
                    key_file: key.display().to_string(),
                }
            })
            .collect();

        Ok(ProxyConfig {
            tls: TlsSection { certificates },
        })
    }

    /// Rewrite the proxy file; returns the number of entries written
    pub async fn regenerate(&self) -> Result<usize, SyncError> {
        let _guard = self.write_lock.lock().await;

        let document = self.build()?;
        let contents = toml::to_string_pretty(&document)?;
        self.write_atomic(contents.as_bytes())?;

        let count = document.tls.certificates.len();
        info!(
            path = %self.path.display(),
            certificates = count,
            "Regenerated proxy certificate list"
        );
        Ok(count)
    }

    /// Parse the file currently on disk, if any
    pub fn read_current(&self) -> Result<Option<ProxyConfig>, SyncError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(toml::from_str(&contents)?))
    }

    fn write_atomic(&self, contents: &[u8]) -> Result<(), SyncError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut file = NamedTempFile::new_in(parent)?;
        file.write_all(contents)?;
        file.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644))?;
        }
        file.persist(&self.path)?;

        debug!(path = %self.path.display(), "Replaced proxy config file");
        Ok(())
    }
}
