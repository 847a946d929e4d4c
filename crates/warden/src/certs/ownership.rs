//! File ownership delegation for issued certificates
//!
//! Services that read their certificate as a dedicated user need the files
//! handed over after issuance. Account provisioning happens elsewhere; this
//! module only changes ownership of existing files.

use std::fmt;
use std::path::PathBuf;

use certwarden_config::OwnerIds;
use nix::unistd::{chown, Gid, Uid};
use thiserror::Error;
use tracing::debug;

/// Target owner of issued files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub uid: u32,
    pub gid: u32,
}

impl From<OwnerIds> for Principal {
    fn from(ids: OwnerIds) -> Self {
        Self {
            uid: ids.uid,
            gid: ids.gid,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

#[derive(Debug, Error)]
#[error("failed to hand {path} to {principal}: {source}")]
pub struct OwnershipError {
    pub path: PathBuf,
    pub principal: Principal,
    #[source]
    pub source: nix::errno::Errno,
}

/// Capability to transfer file ownership
pub trait OwnershipHook: Send + Sync + fmt::Debug {
    fn grant_ownership(&self, paths: &[PathBuf], principal: Principal) -> Result<(), OwnershipError>;
}

/// `chown(2)` based hook
#[derive(Debug, Clone, Copy, Default)]
pub struct ChownHook;

impl OwnershipHook for ChownHook {
    fn grant_ownership(&self, paths: &[PathBuf], principal: Principal) -> Result<(), OwnershipError> {
        for path in paths {
            chown(
                path.as_path(),
                Some(Uid::from_raw(principal.uid)),
                Some(Gid::from_raw(principal.gid)),
            )
            .map_err(|source| OwnershipError {
                path: path.clone(),
                principal,
                source,
            })?;
            debug!(path = %path.display(), owner = %principal, "Transferred file ownership");
        }
        Ok(())
    }
}
