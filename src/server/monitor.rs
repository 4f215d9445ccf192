//! Health monitoring: a single periodic loop that confirms each running
//! child is alive, probes configured HTTP endpoints, and enforces the
//! restart policy through the supervisor interface.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::ServerState;
use super::supervisor::{ManagedServer, Supervisor};

/// Per-probe HTTP timeout; probe failures and timeouts both count as
/// unhealthy.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive unhealthy observations required before a restart.
const UNHEALTHY_THRESHOLD: u32 = 2;

/// Classify one record as healthy or unhealthy with a brief reason.
///
/// A record is healthy when its process is alive and, if a probe URL is
/// configured, the probe returns a success status within the timeout.
pub async fn probe_record(
    client: &reqwest::Client,
    record: &ManagedServer,
) -> Result<(), String> {
    if !record.is_alive().await {
        return Err("process not running".to_string());
    }
    let Some(url) = &record.config.probe_url else {
        return Ok(());
    };
    match client.get(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(resp) if resp.status().is_success() => Ok(()),
        Ok(resp) => Err(format!("health probe returned {}", resp.status())),
        Err(e) if e.is_timeout() => Err("health probe timed out".to_string()),
        Err(e) => Err(format!("health probe failed: {e}")),
    }
}

/// The monitor loop. Holds only the supervisor's public interface; the
/// supervisor stores no reference back.
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    client: reqwest::Client,
    interval: Duration,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<Supervisor>, interval: Duration, cancel: CancellationToken) -> Self {
        HealthMonitor {
            supervisor,
            client: reqwest::Client::new(),
            interval,
            cancel,
        }
    }

    /// Run until cancelled.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = self.cancel.cancelled() => {
                    tracing::info!("health monitor stopped");
                    return;
                }
            }
        }
    }

    /// One pass over every record.
    pub async fn sweep(&self) {
        for record in self.supervisor.records() {
            match record.state() {
                ServerState::Running => self.check_running(&record).await,
                // An unexpected exit already flipped the record to Error;
                // hand it to the restart policy.
                ServerState::Error => self.schedule_restart(&record, "process_exit"),
                _ => {}
            }
        }
    }

    async fn check_running(&self, record: &Arc<ManagedServer>) {
        match probe_record(&self.client, record).await {
            Ok(()) => record.mark_healthy(),
            Err(reason) => {
                let failures = record.mark_unhealthy(&reason);
                tracing::warn!(
                    server = %record.config.id,
                    failures,
                    reason = %reason,
                    "unhealthy"
                );
                if failures >= UNHEALTHY_THRESHOLD {
                    self.schedule_restart(record, "health_check_failure");
                }
            }
        }
    }

    /// Restart in a spawned task so the policy backoff never blocks the
    /// sweep of other records.
    fn schedule_restart(&self, record: &Arc<ManagedServer>, reason: &'static str) {
        let supervisor = self.supervisor.clone();
        let id = record.config.id.clone();
        tokio::spawn(async move {
            match supervisor.restart_with_policy(&id, reason).await {
                Ok(true) => tracing::info!(server = %id, reason, "restarted"),
                Ok(false) => {}
                Err(e) => tracing::warn!(server = %id, error = %e, "restart failed"),
            }
        });
    }
}
