//! Fixtures shared by the certificate tests

use std::fs;
use std::time::SystemTime;

use rcgen::{CertificateParams, KeyPair};

use super::store::{CertificateStore, CERT_FILE, KEY_FILE};

/// Write a self-signed leaf for `domain` expiring `validity` from now
pub(crate) fn write_leaf(store: &CertificateStore, domain: &str, validity: chrono::Duration) {
    write_leaf_with_names(store, domain, &[domain], validity);
}

/// Write a self-signed leaf under `domain`'s directory covering `names`
pub(crate) fn write_leaf_with_names(
    store: &CertificateStore,
    domain: &str,
    names: &[&str],
    validity: chrono::Duration,
) {
    let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
    let mut params = CertificateParams::new(names).unwrap();
    let now = SystemTime::now();
    params.not_before = (now - std::time::Duration::from_secs(60)).into();
    params.not_after = (now + validity.to_std().unwrap()).into();

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let dir = store.domain_path(domain);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(CERT_FILE), cert.pem()).unwrap();
    fs::write(dir.join(KEY_FILE), key_pair.serialize_pem()).unwrap();
}
