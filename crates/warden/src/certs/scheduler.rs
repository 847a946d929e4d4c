//! Background certificate renewal scheduler
//!
//! Periodically sweeps the store and renews certificates that are due.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::manager::{CertificateManager, SweepSummary};

/// Default check interval (12 hours)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 hour)
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Delay before the first sweep after startup
const INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Background certificate renewal scheduler
///
/// Runs as a background task. Each sweep calls
/// [`CertificateManager::check_all`], which takes the same per-domain locks
/// as the HTTP API and the discovery watcher.
pub struct RenewalScheduler {
    manager: Arc<CertificateManager>,
    check_interval: Duration,
    initial_delay: Duration,
}

impl RenewalScheduler {
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self {
            manager,
            check_interval: DEFAULT_CHECK_INTERVAL,
            initial_delay: INITIAL_DELAY,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 hour to avoid
    /// excessive polling.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run one sweep now
    pub async fn sweep(&self) -> SweepSummary {
        let start = Instant::now();
        let summary = self.manager.check_all().await;

        if summary.failed > 0 {
            warn!(
                checked = summary.checked,
                renewed = summary.renewed,
                failed = summary.failed,
                duration_ms = start.elapsed().as_millis() as u64,
                "Certificate renewal sweep finished with failures"
            );
        } else {
            info!(
                checked = summary.checked,
                renewed = summary.renewed,
                duration_ms = start.elapsed().as_millis() as u64,
                "Certificate renewal sweep finished"
            );
        }
        summary
    }

    /// Run the renewal loop forever
    pub async fn run(self) {
        info!(
            check_interval_hours = self.check_interval.as_secs() / 3600,
            "Starting certificate renewal scheduler"
        );

        tokio::time::sleep(self.initial_delay).await;

        let mut interval = interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The first tick completes immediately
            interval.tick().await;
            debug!("Running scheduled certificate renewal check");
            self.sweep().await;
        }
    }
}
