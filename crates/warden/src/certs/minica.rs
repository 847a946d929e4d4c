//! `minica` subprocess engine

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error};

use super::engine::{CertificateEngine, EngineStatus};
use super::request::DomainRequest;

/// Status used when the binary cannot be started (shell convention)
pub const SPAWN_FAILURE_STATUS: i32 = 127;

/// Runs the `minica` binary with the store root as working directory
#[derive(Debug, Clone)]
pub struct MinicaEngine {
    binary: PathBuf,
}

impl MinicaEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, domains: &str, workdir: &Path) -> EngineStatus {
        debug!(binary = %self.binary.display(), domains = %domains, "Running minica");

        let output = Command::new(&self.binary)
            .arg("--domains")
            .arg(domains)
            .current_dir(workdir)
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!(binary = %self.binary.display(), error = %e, "Failed to start minica");
                return EngineStatus::failure(
                    SPAWN_FAILURE_STATUS,
                    format!("failed to run {}: {e}", self.binary.display()),
                );
            }
        };

        if output.status.success() {
            return EngineStatus::success();
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        EngineStatus::failure(
            output.status.code().unwrap_or(-1),
            if stderr.is_empty() {
                "Error generating pem".to_string()
            } else {
                stderr
            },
        )
    }
}

#[async_trait]
impl CertificateEngine for MinicaEngine {
    fn name(&self) -> &'static str {
        "minica"
    }

    async fn issue_plain(&self, domain: &str, workdir: &Path) -> EngineStatus {
        self.run(domain, workdir).await
    }

    async fn issue_wildcard(
        &self,
        pattern: &str,
        include_base: bool,
        workdir: &Path,
    ) -> EngineStatus {
        let names = DomainRequest::classify(pattern, include_base).names();
        self.run(&names.join(","), workdir).await
    }
}
