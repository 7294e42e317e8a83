//! Ephemeral leadership nodes as explicit leases.
//!
//! A [`Lease`] is the only way the broker creates a lead node (lead publisher,
//! lead subscriber, cluster leader). Acquisition writes a body that is unique
//! to this acquisition (a [`LeaseHolder`] with a fresh token, or a caller
//! supplied body that embeds one); release deletes the node only while it
//! still carries that exact body, so a late release can never remove a
//! successor's node.
//!
//! Release is idempotent: the first call does the work, later calls return
//! `Ok(false)`. The heartbeat monitor and a voluntary leave may race to
//! release the same lease; exactly one of them deletes the node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::metadata::MetadataStore;
use super::traits::CoordinationStore;
use crate::error::{Error, Result};
use crate::types::LeaseHolder;

pub struct Lease {
    store: Arc<dyn CoordinationStore>,
    path: String,
    holder: String,
    body: Bytes,
    released: AtomicBool,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("path", &self.path)
            .field("holder", &self.holder)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Lease {
    /// Create the ephemeral node at `path` on behalf of `holder`.
    ///
    /// Fails with `AlreadyOwned` when the node exists.
    pub async fn acquire(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
        holder: impl Into<String>,
    ) -> Result<Self> {
        let holder = LeaseHolder {
            holder: holder.into(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at_ms: Utc::now().timestamp_millis(),
        };
        let body = Bytes::from(serde_json::to_vec(&holder)?);
        Self::acquire_with_body(store, path, holder.holder, body).await
    }

    /// Like [`Lease::acquire`] with a caller-built body.
    ///
    /// The body must be unique to this acquisition.
    pub async fn acquire_with_body(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
        holder: impl Into<String>,
        body: Bytes,
    ) -> Result<Self> {
        let path = path.into();
        let holder = holder.into();
        match store.create_ephemeral(&path, body.clone()).await {
            Ok(()) => {
                debug!(path = %path, holder = %holder, "Lease acquired");
                Ok(Self {
                    store,
                    path,
                    holder,
                    body,
                    released: AtomicBool::new(false),
                })
            }
            Err(Error::NodeExists(_)) => Err(Error::AlreadyOwned(path)),
            Err(e) => Err(e),
        }
    }

    /// Read whoever currently holds `path`.
    pub async fn current_holder(
        store: &dyn CoordinationStore,
        path: &str,
    ) -> Result<Option<LeaseHolder>> {
        match store.get(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data.value)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// True while the node exists and still carries this lease's body.
    pub async fn is_held(&self) -> Result<bool> {
        if self.is_released() {
            return Ok(false);
        }
        match self.store.get(&self.path).await {
            Ok(data) => Ok(data.value == self.body),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete the node if it is still ours.
    ///
    /// Returns `true` only for the call that actually removed the node.
    pub async fn release(&self) -> Result<bool> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let data = match self.store.get(&self.path).await {
            Ok(data) => data,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if data.value != self.body {
            warn!(
                path = %self.path,
                holder = %self.holder,
                "Lease node replaced by another holder, not deleting"
            );
            return Ok(false);
        }

        match self.store.delete(&self.path, Some(data.version)).await {
            Ok(()) => {
                debug!(path = %self.path, holder = %self.holder, "Lease released");
                Ok(true)
            }
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Acquire `path`, waiting for the current holder to let go first.
///
/// Bounded by `timeout` (`Timeout`) and `cancel` (`Canceled`). Nothing is
/// registered while waiting.
pub async fn acquire_when_free(
    metadata: &MetadataStore,
    path: &str,
    holder: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PendingLease> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match Lease::acquire(Arc::clone(metadata.store()), path, holder).await {
            Ok(lease) => return Ok(PendingLease(Some(lease))),
            Err(Error::AlreadyOwned(_)) => {}
            Err(e) => return Err(e),
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        metadata.wait_for_removal(path, remaining, cancel).await?;
    }
}

/// A lease acquired after a wait that its caller has not installed yet.
///
/// Dropping it unclaimed (for example when the waiting request is canceled
/// right after acquisition) releases the node in the background.
pub struct PendingLease(Option<Lease>);

impl PendingLease {
    pub fn claim(mut self) -> Option<Lease> {
        self.0.take()
    }
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        if let Some(lease) = self.0.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = lease.release().await {
                        warn!(path = %lease.path(), error = %e, "Failed to release unclaimed lease");
                    }
                });
            }
        }
    }
}
