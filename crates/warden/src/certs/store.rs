//! Filesystem certificate store
//!
//! Holds the root CA and one directory per domain, in the layout minica
//! produces:
//!
//! ```text
//! certificates/
//! ├── minica.pem            # Root CA certificate
//! ├── minica-key.pem        # Root CA private key
//! ├── certificates.toml     # Generated proxy certificate list
//! └── app.example.com/
//!     ├── cert.pem          # Leaf certificate
//!     └── key.pem           # Leaf private key
//! ```
//!
//! Wildcard domains live under a directory whose leading `*` is replaced by
//! `_`. The store only reads and removes files; issuing is the engine's job and
//! policy belongs to [`CertificateManager`](super::CertificateManager).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use super::error::StoreError;
use super::request::domain_key;

/// Root CA certificate file name
pub const ROOT_CERT_FILE: &str = "minica.pem";
/// Root CA private key file name
pub const ROOT_KEY_FILE: &str = "minica-key.pem";
/// Leaf certificate file name inside a domain directory
pub const CERT_FILE: &str = "cert.pem";
/// Leaf private key file name inside a domain directory
pub const KEY_FILE: &str = "key.pem";

/// Decoded metadata of a stored domain certificate
#[derive(Debug, Clone, Serialize)]
pub struct CertificateRecord {
    /// Store key (directory name)
    pub domain: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
}

impl CertificateRecord {
    /// Whole days until expiry, rounded down (negative once expired)
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_seconds().div_euclid(86_400)
    }

    /// Whether the certificate names `domain`
    pub fn covers(&self, domain: &str) -> bool {
        self.dns_names.iter().any(|name| name == domain)
    }
}

/// Filesystem-backed certificate repository
#[derive(Debug, Clone)]
pub struct CertificateStore {
    /// Absolute store root
    root: PathBuf,
}

impl CertificateStore {
    /// Open the store at `root`, creating the directory if needed.
    ///
    /// The root is canonicalized so that every path handed out is absolute.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root)?;
        let root = fs::canonicalize(root)?;

        info!(store_path = %root.display(), "Opened certificate store");

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // =========================================================================
    // Root CA
    // =========================================================================

    pub fn root_certificate_path(&self) -> PathBuf {
        self.root.join(ROOT_CERT_FILE)
    }

    pub fn root_key_path(&self) -> PathBuf {
        self.root.join(ROOT_KEY_FILE)
    }

    /// Whether the root CA has been generated
    pub fn has_root_certificate(&self) -> bool {
        self.root_certificate_path().is_file()
    }

    /// Root certificate as stored (PEM)
    pub fn read_root_pem(&self) -> Result<Vec<u8>, StoreError> {
        let path = self.root_certificate_path();
        if !path.is_file() {
            return Err(StoreError::RootMissing);
        }
        Ok(fs::read(path)?)
    }

    /// Root certificate re-encoded as DER
    pub fn read_root_der(&self) -> Result<Vec<u8>, StoreError> {
        let pem_bytes = self.read_root_pem()?;
        let block = parse_pem(&self.root_certificate_path(), &pem_bytes)?;
        Ok(block.contents().to_vec())
    }

    /// Make the root certificate world-readable
    pub fn publish_root_certificate(&self) -> Result<(), StoreError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(self.root_certificate_path(), fs::Permissions::from_mode(0o644))?;
        }
        debug!("Root certificate permissions set to 0644");
        Ok(())
    }

    // =========================================================================
    // Domain certificates
    // =========================================================================

    /// Directory holding the certificate for `domain`
    pub fn domain_path(&self, domain: &str) -> PathBuf {
        self.root.join(domain_key(domain))
    }

    /// Certificate and key paths for `domain`, whether or not they exist
    pub fn certificate_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let dir = self.domain_path(domain);
        (dir.join(CERT_FILE), dir.join(KEY_FILE))
    }

    /// Whether a certificate is stored for `domain`
    pub fn contains(&self, domain: &str) -> bool {
        self.certificate_paths(domain).0.is_file()
    }

    /// Read and decode the certificate stored for `domain`
    pub fn read_certificate(&self, domain: &str) -> Result<CertificateRecord, StoreError> {
        let (cert_path, key_path) = self.certificate_paths(domain);

        if !cert_path.is_file() {
            trace!(domain = %domain, "No stored certificate found");
            return Err(StoreError::NotFound {
                domain: domain.to_string(),
            });
        }

        let pem_bytes = fs::read(&cert_path)?;
        let block = parse_pem(&cert_path, &pem_bytes)?;
        let x509_error = |message: String| StoreError::X509 {
            path: cert_path.display().to_string(),
            message,
        };

        let (_, cert) =
            parse_x509_certificate(block.contents()).map_err(|e| x509_error(e.to_string()))?;

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| x509_error("notBefore out of range".to_string()))?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| x509_error("notAfter out of range".to_string()))?;

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => return Err(x509_error(e.to_string())),
        };

        debug!(
            domain = %domain,
            not_after = %not_after,
            "Loaded stored certificate"
        );

        Ok(CertificateRecord {
            domain: domain_key(domain),
            cert_path,
            key_path,
            not_before,
            not_after,
            dns_names,
        })
    }

    /// Remove the directory of `domain`.
    ///
    /// Returns `false` when nothing was stored.
    pub fn delete_certificate(&self, domain: &str) -> Result<bool, StoreError> {
        let dir = self.domain_path(domain);

        if !dir.exists() {
            warn!(domain = %domain, "Certificate to delete not found");
            return Ok(false);
        }

        fs::remove_dir_all(&dir)?;
        info!(domain = %domain, "Deleted stored certificate");
        Ok(true)
    }

    /// Iterate over stored domain keys, one per subdirectory.
    ///
    /// Each call starts a fresh directory scan.
    pub fn list_domains(&self) -> Result<DomainKeys, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(DomainKeys { entries })
    }
}

/// Lazy scan of the store's domain directories
#[derive(Debug)]
pub struct DomainKeys {
    entries: Option<fs::ReadDir>,
}

impl Iterator for DomainKeys {
    type Item = Result<String, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        loop {
            let entry = match entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e.into())),
            };
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => {}
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
            match entry.file_name().into_string() {
                Ok(name) => return Some(Ok(name)),
                Err(name) => {
                    warn!(name = ?name, "Skipping store directory with non UTF-8 name");
                }
            }
        }
    }
}

fn parse_pem(path: &Path, bytes: &[u8]) -> Result<::pem::Pem, StoreError> {
    ::pem::parse(bytes).map_err(|e| StoreError::Pem {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}
