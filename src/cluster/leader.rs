//! Cluster leader election and load ranking.
//!
//! One broker holds the ephemeral leader node and answers allocation requests.
//! Election is a race to create the node; losers watch it and race again when
//! it disappears.
//!
//! ```text
//!   campaign() ──create leader node──▶ leader
//!        │
//!        └─ AlreadyOwned ──▶ watch(leader) ──Deleted──▶ campaign()
//! ```

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::lease::Lease;
use super::metadata::MetadataStore;
use crate::error::{Error, Result};
use crate::types::{BrokerDescriptor, LeaderDescriptor};

/// How long one watch round waits before re-arming.
const LEADER_WATCH_ROUND: Duration = Duration::from_secs(30);

const MAX_CAMPAIGN_JITTER_MS: u64 = 20;

pub struct LeaderElection {
    metadata: MetadataStore,
    me: LeaderDescriptor,
    lease: Mutex<Option<Lease>>,
}

impl LeaderElection {
    pub fn new(metadata: MetadataStore, me: LeaderDescriptor) -> Self {
        Self {
            metadata,
            me,
            lease: Mutex::new(None),
        }
    }

    /// Try to become leader. Returns whether this broker now leads.
    pub async fn campaign(&self) -> Result<bool> {
        let mut lease = self.lease.lock().await;
        if let Some(held) = lease.as_ref() {
            if held.is_held().await? {
                return Ok(true);
            }
        }

        let path = self.metadata.paths().leader().to_string();
        let descriptor = LeaderDescriptor {
            term: uuid::Uuid::new_v4().to_string(),
            ..self.me.clone()
        };
        let body = Bytes::from(serde_json::to_vec(&descriptor)?);
        match Lease::acquire_with_body(
            Arc::clone(self.metadata.store()),
            path,
            self.me.name.clone(),
            body,
        )
        .await
        {
            Ok(acquired) => {
                info!(broker = %self.me.name, url = %self.me.url, "Became cluster leader");
                *lease = Some(acquired);
                Ok(true)
            }
            Err(Error::AlreadyOwned(_)) => {
                *lease = None;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether this broker believes it is leader.
    pub async fn is_leader(&self) -> bool {
        self.lease
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.is_released())
    }

    /// URL of the current leader.
    pub async fn leader_url(&self) -> Result<String> {
        self.metadata
            .get_leader()
            .await?
            .map(|l| l.url)
            .ok_or_else(|| Error::NotFound("cluster leader".to_string()))
    }

    /// Give up leadership (shutdown).
    pub async fn resign(&self) -> Result<()> {
        if let Some(lease) = self.lease.lock().await.take() {
            lease.release().await?;
            info!(broker = %self.me.name, "Resigned cluster leadership");
        }
        Ok(())
    }

    /// Campaign now and again whenever the leader node disappears.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.campaign().await {
                    warn!(error = %e, "Leader campaign failed");
                }
                let path = self.metadata.paths().leader().to_string();
                match self
                    .metadata
                    .wait_for_removal(&path, LEADER_WATCH_ROUND, &cancel)
                    .await
                {
                    // Spread the race for the vacated node across followers.
                    Ok(()) => {
                        tokio::select! {
                            _ = tokio::time::sleep(campaign_jitter()) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                    Err(Error::Timeout) => {}
                    Err(Error::Canceled) => break,
                    Err(e) => {
                        warn!(error = %e, "Leader watch failed");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                }
            }
        })
    }
}

fn campaign_jitter() -> Duration {
    Duration::from_millis(fastrand::u64(0..=MAX_CAMPAIGN_JITTER_MS))
}

/// Order brokers for allocation: lowest load index first, name as tiebreak.
pub fn rank_brokers(mut brokers: Vec<BrokerDescriptor>) -> Vec<BrokerDescriptor> {
    brokers.sort_by(|a, b| {
        a.load_index
            .partial_cmp(&b.load_index)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    brokers
}
