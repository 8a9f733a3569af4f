use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{info, warn};

use thinx_common::DeviceConfig;

// Consecutive probe failures before the link is declared lost.
const LOSS_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Up,
    Lost,
    Skipped,
}

/// Local-link abstraction for the host target. The operating system owns the
/// physical interface, so "bring up" means verifying a route to the cloud
/// exists; the access-point fallback advertises a provisioning identity and
/// flags that no cloud route is available.
pub struct NetworkLink {
    probe_host: String,
    probe_port: u16,
    probe_timeout: Duration,
    probe_interval_ms: u64,
    migration_timeout: Duration,
    access_point_name: String,
    access_point: bool,
    last_probe_ms: u64,
    consecutive_failures: u32,
}

impl NetworkLink {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            probe_host: config.cloud.host.clone(),
            probe_port: config.cloud.active_api_port(),
            probe_timeout: Duration::from_millis(config.timing.link_probe_timeout_ms),
            probe_interval_ms: config.timing.link_probe_interval_ms,
            migration_timeout: Duration::from_millis(config.timing.migration_timeout_ms),
            access_point_name: config.access_point_name.clone(),
            access_point: false,
            last_probe_ms: 0,
            consecutive_failures: 0,
        }
    }

    pub fn is_access_point(&self) -> bool {
        self.access_point
    }

    pub async fn bring_up(&mut self) -> bool {
        let up = self.probe().await;
        if up {
            self.access_point = false;
            self.consecutive_failures = 0;
        }
        up
    }

    /// Fallback once station-mode retries are exhausted. There is no captive
    /// portal on this target; the mode only parks the device for provisioning.
    pub fn start_access_point(&mut self) -> bool {
        info!(name = %self.access_point_name, "advertising provisioning access point");
        self.access_point = true;
        true
    }

    /// Periodic liveness check, rate-limited to the probe interval. Only a
    /// failure streak is reported as loss so one dropped dial does not tear
    /// the whole session down.
    pub async fn check(&mut self, now_ms: u64) -> LinkHealth {
        if self.access_point {
            return LinkHealth::Skipped;
        }
        if now_ms.saturating_sub(self.last_probe_ms) < self.probe_interval_ms {
            return LinkHealth::Skipped;
        }
        self.last_probe_ms = now_ms;

        if self.probe().await {
            self.consecutive_failures = 0;
            LinkHealth::Up
        } else {
            self.consecutive_failures += 1;
            if self.consecutive_failures >= LOSS_THRESHOLD {
                self.consecutive_failures = 0;
                LinkHealth::Lost
            } else {
                LinkHealth::Skipped
            }
        }
    }

    /// One-shot credential migration pushed from the cloud. The supplicant is
    /// driven externally on this target, so the migration is a bounded
    /// wait-for-the-link-to-come-back; success and failure are both non-fatal.
    pub async fn migrate(&mut self, ssid: &str, _pass: &str) -> bool {
        info!(ssid, "attempting network credential migration");
        let deadline = tokio::time::Instant::now() + self.migration_timeout;
        loop {
            if self.probe().await {
                info!("credential migration successful");
                self.access_point = false;
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("credential migration failed");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn probe(&self) -> bool {
        let target = (self.probe_host.as_str(), self.probe_port);
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}
