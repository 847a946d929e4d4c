//! Domain request classification
//!
//! Decides whether a requested name is issued as a plain domain or as a
//! wildcard pattern, and maps names onto store directory keys.

/// Character substituted for the leading `*` of wildcard names on disk
pub const WILDCARD_PLACEHOLDER: char = '_';

/// Longest name accepted, as for DNS
pub const MAX_DOMAIN_LEN: usize = 253;

/// Check that `domain` is a dot-separated host name safe to use as a store key.
///
/// Labels are non-empty and drawn from `[A-Za-z0-9_-]`; the first label may
/// instead be a lone `*`. This rules out `.`, `..` and any path separator.
pub fn validate_domain(domain: &str) -> Result<(), &'static str> {
    if domain.is_empty() {
        return Err("name is empty");
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err("name is too long");
    }

    for (index, label) in domain.split('.').enumerate() {
        if label.is_empty() {
            return Err("name has an empty label");
        }
        if label == "*" {
            if index == 0 {
                continue;
            }
            return Err("'*' is only allowed as the first label");
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err("name contains characters outside [A-Za-z0-9*._-]");
        }
    }
    Ok(())
}

/// How a domain is handed to the certificate engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Plain,
    /// `*.<label>.<domain>.<tld...>`; `include_base` also covers the suffix itself
    Wildcard { include_base: bool },
}

/// A classified issuance request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRequest {
    domain: String,
    kind: DomainKind,
}

impl DomainRequest {
    /// Classify `domain`. `include_base` only matters for wildcard names.
    pub fn classify(domain: &str, include_base: bool) -> Self {
        let kind = if is_wildcard(domain) {
            DomainKind::Wildcard { include_base }
        } else {
            DomainKind::Plain
        };
        Self {
            domain: domain.to_string(),
            kind,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.kind, DomainKind::Wildcard { .. })
    }

    /// The wildcard suffix (`a.example.com` for `*.a.example.com`)
    pub fn base_domain(&self) -> Option<&str> {
        match self.kind {
            DomainKind::Wildcard { .. } => self.domain.strip_prefix("*."),
            DomainKind::Plain => None,
        }
    }

    /// Names the issued certificate must cover, primary name first
    pub fn names(&self) -> Vec<String> {
        let mut names = vec![self.domain.clone()];
        if let DomainKind::Wildcard { include_base: true } = self.kind {
            if let Some(base) = self.base_domain() {
                names.push(base.to_string());
            }
        }
        names
    }

    /// Store directory key for this request
    pub fn key(&self) -> String {
        domain_key(&self.domain)
    }
}

/// Whether `domain` is a wildcard with at least three labels after `*.`
pub fn is_wildcard(domain: &str) -> bool {
    let Some(rest) = domain.strip_prefix("*.") else {
        return false;
    };
    let labels: Vec<&str> = rest.split('.').collect();
    labels.len() >= 3 && labels.iter().all(|label| !label.is_empty() && !label.contains('*'))
}

/// Filesystem-safe key for a domain: a leading `*` becomes `_`
pub fn domain_key(domain: &str) -> String {
    match domain.strip_prefix('*') {
        Some(rest) => format!("{WILDCARD_PLACEHOLDER}{rest}"),
        None => domain.to_string(),
    }
}

/// Inverse of [`domain_key`] for keys listed from the store.
///
/// Only keys that name a wildcard pattern get their `*` back, so a plain
/// directory that happens to start with `_` keeps its name.
pub fn domain_from_key(key: &str) -> String {
    match key.strip_prefix(WILDCARD_PLACEHOLDER) {
        Some(rest) if is_wildcard(&format!("*{rest}")) => format!("*{rest}"),
        _ => key.to_string(),
    }
}
