//! In-process engine built on `rcgen`
//!
//! Produces the same files as minica: `minica.pem` / `minica-key.pem` at the
//! root of the working directory (created on first use) and a leaf signed by
//! it under `<domain>/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use tracing::{error, info};

use super::engine::{CertificateEngine, EngineStatus};
use super::request::{domain_key, DomainRequest};
use super::store::{CERT_FILE, KEY_FILE, ROOT_CERT_FILE, ROOT_KEY_FILE};

/// minica's leaf lifetime: two years and thirty days
pub const DEFAULT_LEAF_VALIDITY: Duration = Duration::from_secs(760 * 86_400);

const ROOT_VALIDITY: Duration = Duration::from_secs(100 * 365 * 86_400);

#[derive(Debug, Error)]
enum GenerateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),

    #[error("generator task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// rcgen-backed engine
#[derive(Debug, Clone)]
pub struct BuiltinEngine {
    leaf_validity: Duration,
}

impl Default for BuiltinEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LEAF_VALIDITY)
    }
}

impl BuiltinEngine {
    pub fn new(leaf_validity: Duration) -> Self {
        Self { leaf_validity }
    }

    async fn generate(&self, names: Vec<String>, workdir: &Path) -> EngineStatus {
        let workdir = workdir.to_path_buf();
        let validity = self.leaf_validity;
        let primary = names.first().cloned().unwrap_or_default();

        let result = tokio::task::spawn_blocking(move || write_leaf(&names, &workdir, validity))
            .await
            .map_err(GenerateError::from)
            .and_then(|inner| inner);

        match result {
            Ok(dir) => {
                info!(domain = %primary, path = %dir.display(), "Generated certificate");
                EngineStatus::success()
            }
            Err(e) => {
                error!(domain = %primary, error = %e, "Builtin certificate generation failed");
                EngineStatus::failure(1, e.to_string())
            }
        }
    }
}

#[async_trait]
impl CertificateEngine for BuiltinEngine {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn issue_plain(&self, domain: &str, workdir: &Path) -> EngineStatus {
        self.generate(vec![domain.to_string()], workdir).await
    }

    async fn issue_wildcard(
        &self,
        pattern: &str,
        include_base: bool,
        workdir: &Path,
    ) -> EngineStatus {
        let names = DomainRequest::classify(pattern, include_base).names();
        self.generate(names, workdir).await
    }
}

/// Load the root CA from `workdir`, creating it if absent
fn load_or_create_root(workdir: &Path) -> Result<Issuer<'static, KeyPair>, GenerateError> {
    let cert_path = workdir.join(ROOT_CERT_FILE);
    let key_path = workdir.join(ROOT_KEY_FILE);

    if cert_path.is_file() && key_path.is_file() {
        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pair = KeyPair::from_pem(&fs::read_to_string(&key_path)?)?;
        return Ok(Issuer::from_ca_cert_pem(&cert_pem, key_pair)?);
    }

    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "certwarden root ca");
    params.distinguished_name = dn;
    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + ROOT_VALIDITY).into();

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    fs::create_dir_all(workdir)?;
    write_private(&key_path, &key_pair.serialize_pem())?;
    fs::write(&cert_path, cert.pem())?;

    info!(path = %cert_path.display(), "Generated root certificate");

    Ok(Issuer::new(params, key_pair))
}

/// Sign a leaf for `names` and write it under the first name's directory
fn write_leaf(names: &[String], workdir: &Path, validity: Duration) -> Result<PathBuf, GenerateError> {
    let issuer = load_or_create_root(workdir)?;

    let mut params = CertificateParams::new(names.to_vec())?;
    let mut dn = DistinguishedName::new();
    if let Some(primary) = names.first() {
        dn.push(DnType::CommonName, primary.as_str());
    }
    params.distinguished_name = dn;
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + validity).into();

    let key_pair = KeyPair::generate()?;
    let cert = params.signed_by(&key_pair, &issuer)?;

    let dir = workdir.join(domain_key(names.first().map(String::as_str).unwrap_or_default()));
    fs::create_dir_all(&dir)?;
    write_private(&dir.join(KEY_FILE), &key_pair.serialize_pem())?;
    fs::write(dir.join(CERT_FILE), cert.pem())?;

    Ok(dir)
}

/// Write a private key readable only by its owner
fn write_private(path: &Path, contents: &str) -> Result<(), std::io::Error> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
