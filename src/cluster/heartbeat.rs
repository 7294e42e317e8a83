//! Liveness monitoring of lead clients.
//!
//! Every lease a broker grants to a client (lead publisher, lead subscriber)
//! is watched by a [`HeartbeatMonitor`]. Each interval the monitor sends an
//! alive-check over the client's link:
//!
//! 1. **Success**: the consecutive failure count resets to zero
//! 2. **Failure or timeout**: the count goes up by one
//! 3. **Count reaches the threshold**: the lease is released (its node
//!    deleted exactly once) and the monitor exits with
//!    [`MonitorExit::Revoked`]
//!
//! The monitor's owner reacts to `Revoked` by detaching the client. When the
//! owner lets the client go voluntarily it cancels the monitor instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::HeartbeatConfig;
use super::lease::Lease;
use super::metrics::{ACTIVE_MONITORS, HEARTBEAT_FAILURES, LEASES_REVOKED};
use crate::transport::ClientLink;

/// Consecutive failure counting, separated from timing for testability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounter {
    threshold: u32,
    consecutive: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Returns true once the threshold is reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.threshold
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Why a monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The failure threshold was reached and the lease was released.
    Revoked,
    /// Canceled by its owner.
    Stopped,
    /// The lease was released by someone else first.
    LeaseGone,
}

pub struct HeartbeatMonitor {
    interval: Duration,
    check_timeout: Duration,
    counter: FailureCounter,
    link: Arc<dyn ClientLink>,
    lease: Arc<Lease>,
}

impl HeartbeatMonitor {
    pub fn new(config: &HeartbeatConfig, link: Arc<dyn ClientLink>, lease: Arc<Lease>) -> Self {
        Self {
            interval: config.interval(),
            check_timeout: config.check_timeout(),
            counter: FailureCounter::new(config.failure_threshold),
            link,
            lease,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<MonitorExit> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) -> MonitorExit {
        ACTIVE_MONITORS.inc();
        let exit = self.watch(&cancel).await;
        ACTIVE_MONITORS.dec();
        debug!(holder = %self.lease.holder(), path = %self.lease.path(), ?exit, "Heartbeat monitor stopped");
        exit
    }

    async fn watch(&mut self, cancel: &CancellationToken) -> MonitorExit {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; checks start one interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return MonitorExit::Stopped,
                _ = ticker.tick() => {}
            }
            if self.lease.is_released() {
                return MonitorExit::LeaseGone;
            }

            let alive = matches!(
                tokio::time::timeout(self.check_timeout, self.link.alive_check()).await,
                Ok(Ok(()))
            );
            if alive {
                self.counter.record_success();
                continue;
            }

            HEARTBEAT_FAILURES.inc();
            let reached = self.counter.record_failure();
            debug!(
                holder = %self.lease.holder(),
                url = %self.link.url(),
                consecutive = self.counter.consecutive(),
                "Alive-check failed"
            );
            if !reached {
                continue;
            }
            if cancel.is_cancelled() {
                return MonitorExit::Stopped;
            }

            match self.lease.release().await {
                Ok(true) => {
                    LEASES_REVOKED.inc();
                    info!(
                        holder = %self.lease.holder(),
                        path = %self.lease.path(),
                        failures = self.counter.consecutive(),
                        "Lead client unresponsive, lease revoked"
                    );
                    return MonitorExit::Revoked;
                }
                Ok(false) => return MonitorExit::LeaseGone,
                Err(e) => {
                    // The node is left to session expiry; the client is still detached.
                    warn!(holder = %self.lease.holder(), error = %e, "Failed to delete lease node");
                    return MonitorExit::Revoked;
                }
            }
        }
    }
}
