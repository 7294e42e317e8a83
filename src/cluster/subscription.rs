//! Subscription membership and cursors.
//!
//! A [`Subscription`] is the broker-side state of one named subscription on
//! one partition: its mode, its cursor record and the handles of the
//! attached members.
//!
//! # Join rules
//!
//! | Mode      | Lead node | Join outcome |
//! |-----------|-----------|--------------|
//! | Exclusive | free      | lead member |
//! | Exclusive | held      | `AlreadyOwned` |
//! | Failover  | free      | lead member |
//! | Failover  | held      | wait for the node to go, then lead |
//! | Shared    | n/a       | member |
//! | KeyShared | n/a       | member, messages routed by key |
//!
//! A join with a different mode than the stored one fails with
//! `ModeConflict`. A join under a name that is already attached replaces the
//! handle and keeps every offset.
//!
//! # Locking
//!
//! The subscription lock is held for a whole delivery batch (read, send,
//! advance), so concurrent pulls on one subscription never deliver the same
//! msid twice. A failover waiter does not hold it while waiting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::bundle::hash_key;
use super::config::HeartbeatConfig;
use super::connections::ClientHandle;
use super::heartbeat::{HeartbeatMonitor, MonitorExit};
use super::keys::{subscription_record_key, LEADER_NODE};
use super::lease::{acquire_when_free, Lease};
use super::metadata::MetadataStore;
use super::metrics::{GaugeGuard, ACTIVE_SUBSCRIPTIONS, CAS_CONFLICTS};
use super::partition_state::PartitionState;
use super::traits::{LogStore, Version};
use crate::error::{Error, Result};
use crate::transport::ClientLink;
use crate::types::{
    Message, Msid, PartitionDescriptor, PartitionId, SubscribeMode, SubscriptionDescriptor,
    SubscriptionRecord,
};

/// Picks the member a key-shared message goes to.
pub trait KeyRouter: Send + Sync {
    /// Index in `0..member_count`. Only called with `member_count > 0`.
    fn route(&self, key: &str, member_count: usize) -> usize;
}

/// CRC32 of the key modulo the member count.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32KeyRouter;

impl KeyRouter for Crc32KeyRouter {
    fn route(&self, key: &str, member_count: usize) -> usize {
        hash_key(key) as usize % member_count
    }
}

fn same_link(a: &Arc<dyn ClientLink>, b: &Arc<dyn ClientLink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// First msid a fresh subscription delivers.
///
/// `0` means "after what was already pushed"; an explicit offset is honored
/// when it names an existing message and clamped otherwise.
pub fn initial_offset(partition: &PartitionDescriptor, sub_offset: Msid) -> Msid {
    if sub_offset != 0 && sub_offset <= partition.message_count {
        sub_offset
    } else {
        partition.push_offset + 1
    }
}

/// Shared dependencies of every subscription on a broker.
#[derive(Clone)]
pub struct SubscriptionContext {
    pub metadata: MetadataStore,
    pub log: Arc<dyn LogStore>,
    pub key_router: Arc<dyn KeyRouter>,
    pub heartbeat: HeartbeatConfig,
}

struct LeadSlot {
    member: String,
    lease: Arc<Lease>,
    epoch: u64,
    monitor: CancellationToken,
}

pub(crate) struct SubscriptionInner {
    record: SubscriptionRecord,
    members: BTreeMap<String, ClientHandle>,
    lead: Option<LeadSlot>,
    version: Version,
    closed: bool,
    /// Counts this subscription in `ACTIVE_SUBSCRIPTIONS` until closed or
    /// shut down.
    active: Option<GaugeGuard>,
}

impl SubscriptionInner {
    /// Next msid to deliver; `0` until the first member joins.
    pub(crate) fn push_offset(&self) -> Msid {
        self.record.push_offset
    }

    pub(crate) fn record(&self) -> SubscriptionRecord {
        self.record
    }

    pub(crate) fn advance(&mut self, delivered: Msid) {
        self.record.push_offset = self.record.push_offset.max(delivered + 1);
    }

    /// Puller must be attached, and hold the lead role in lead modes.
    pub(crate) fn check_puller(&self, mode: SubscribeMode, puller: &str) -> Result<()> {
        if !self.members.contains_key(puller) {
            return Err(Error::NotFound(format!("member {puller}")));
        }
        if mode.has_lead() {
            match &self.lead {
                Some(lead) if lead.member == puller => {}
                Some(lead) => return Err(Error::AlreadyOwned(lead.member.clone())),
                None => return Err(Error::AlreadyOwned(format!("no lead for {puller}"))),
            }
        }
        Ok(())
    }

    /// Member that receives `message` on a pull issued by `puller`.
    pub(crate) fn recipient(
        &self,
        mode: SubscribeMode,
        puller: &str,
        message: &Message,
        router: &dyn KeyRouter,
    ) -> Result<ClientHandle> {
        let handle = match mode {
            SubscribeMode::KeyShared => {
                if self.members.is_empty() {
                    None
                } else {
                    let index = router.route(&message.routing_key(), self.members.len());
                    self.members.values().nth(index % self.members.len())
                }
            }
            _ => self.members.get(puller),
        };
        handle
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("member {puller}")))
    }
}

/// Held by a join in flight; a subscription with outstanding tickets is
/// never closed.
pub struct JoinTicket {
    joins: Arc<AtomicUsize>,
}

impl Drop for JoinTicket {
    fn drop(&mut self) {
        self.joins.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Subscription {
    topic: String,
    partition: PartitionId,
    name: String,
    mode: SubscribeMode,
    ctx: SubscriptionContext,
    inner: Mutex<SubscriptionInner>,
    joins: Arc<AtomicUsize>,
    next_epoch: AtomicU64,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Load the subscription, creating its descriptor when absent.
    ///
    /// Members recorded by a previous broker incarnation are dropped; their
    /// handles did not survive. The cursor record is kept.
    pub async fn open(
        ctx: SubscriptionContext,
        topic: &str,
        partition: PartitionId,
        name: &str,
        mode: SubscribeMode,
    ) -> Result<Arc<Self>> {
        let fresh = SubscriptionDescriptor {
            name: name.to_string(),
            topic: topic.to_string(),
            partition,
            mode,
            members: Vec::new(),
        };
        let (stored, mut version) = ctx.metadata.ensure_subscription(&fresh).await?;
        if stored.mode != mode {
            return Err(Error::ModeConflict(format!(
                "{topic}/p{partition}/{name} is {}, requested {mode}",
                stored.mode
            )));
        }

        let sub_path = ctx.metadata.paths().subscription(topic, partition, name);
        for child in ctx.metadata.store().list_children(&sub_path).await? {
            if child != LEADER_NODE {
                ctx.metadata.remove_member(topic, partition, name, &child).await?;
            }
        }
        if !stored.members.is_empty() {
            debug!(topic, partition, subscription = name, stale = stored.members.len(), "Dropping stale members");
            version = ctx.metadata.update_subscription(&fresh, version).await?;
        }

        let record_key = subscription_record_key(topic, partition, name);
        let record = match ctx.log.get(&record_key).await? {
            Some(bytes) => {
                let record: SubscriptionRecord = serde_json::from_slice(&bytes)?;
                if record.mode == mode {
                    record
                } else {
                    SubscriptionRecord { mode, push_offset: 0, ack_offset: 0 }
                }
            }
            None => SubscriptionRecord { mode, push_offset: 0, ack_offset: 0 },
        };

        let active = GaugeGuard::new(&ACTIVE_SUBSCRIPTIONS);
        info!(
            topic,
            partition,
            subscription = name,
            %mode,
            push_offset = record.push_offset,
            ack_offset = record.ack_offset,
            "Subscription opened"
        );

        Ok(Arc::new(Self {
            topic: topic.to_string(),
            partition,
            name: name.to_string(),
            mode,
            ctx,
            inner: Mutex::new(SubscriptionInner {
                record,
                members: BTreeMap::new(),
                lead: None,
                version,
                closed: false,
                active: Some(active),
            }),
            joins: Arc::new(AtomicUsize::new(0)),
            next_epoch: AtomicU64::new(1),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> SubscribeMode {
        self.mode
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn key_router(&self) -> &dyn KeyRouter {
        self.ctx.key_router.as_ref()
    }

    /// Take a ticket before releasing the registry lock that found this
    /// subscription.
    pub fn join_ticket(&self) -> JoinTicket {
        self.joins.fetch_add(1, Ordering::SeqCst);
        JoinTicket {
            joins: Arc::clone(&self.joins),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SubscriptionInner> {
        self.inner.lock().await
    }

    pub async fn record(&self) -> SubscriptionRecord {
        self.inner.lock().await.record
    }

    pub async fn members(&self) -> Vec<String> {
        self.inner.lock().await.members.keys().cloned().collect()
    }

    pub async fn lead(&self) -> Option<String> {
        self.inner.lock().await.lead.as_ref().map(|l| l.member.clone())
    }

    pub async fn is_member(&self, name: &str) -> bool {
        self.inner.lock().await.members.contains_key(name)
    }

    fn lead_path(&self) -> String {
        self.ctx
            .metadata
            .paths()
            .subscription_leader(&self.topic, self.partition, &self.name)
    }

    /// Attach `handle` according to the subscription mode.
    #[allow(clippy::too_many_arguments)]
    pub async fn join(
        self: &Arc<Self>,
        _ticket: JoinTicket,
        partition: &PartitionState,
        handle: ClientHandle,
        mode: SubscribeMode,
        sub_offset: Msid,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if mode != self.mode {
            return Err(Error::ModeConflict(format!(
                "{}/p{}/{} is {}, requested {mode}",
                self.topic, self.partition, self.name, self.mode
            )));
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::NotFound(format!("subscription {}", self.name)));
        }

        if inner.members.contains_key(&handle.name) {
            return self.rejoin(&mut inner, handle);
        }

        match self.mode {
            SubscribeMode::Exclusive => {
                if let Some(holder) = inner.members.keys().next() {
                    return Err(Error::AlreadyOwned(holder.clone()));
                }
                let lease = Lease::acquire(
                    Arc::clone(self.ctx.metadata.store()),
                    self.lead_path(),
                    handle.name.clone(),
                )
                .await?;
                self.attach_lead(&mut inner, partition, handle, lease, sub_offset)
                    .await
            }
            SubscribeMode::Failover => {
                match Lease::acquire(
                    Arc::clone(self.ctx.metadata.store()),
                    self.lead_path(),
                    handle.name.clone(),
                )
                .await
                {
                    Ok(lease) => {
                        self.attach_lead(&mut inner, partition, handle, lease, sub_offset)
                            .await
                    }
                    Err(Error::AlreadyOwned(_)) => {
                        drop(inner);
                        self.wait_for_lead(partition, handle, sub_offset, timeout, cancel)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            SubscribeMode::Shared | SubscribeMode::KeyShared => {
                self.ctx
                    .metadata
                    .register_member(&self.topic, self.partition, &self.name, &handle.name)
                    .await?;
                self.seed(&mut inner, partition, sub_offset).await;
                let name = handle.name.clone();
                inner.members.insert(name.clone(), handle);
                if let Err(e) = self.persist(&mut inner).await {
                    inner.members.remove(&name);
                    let _ = self
                        .ctx
                        .metadata
                        .remove_member(&self.topic, self.partition, &self.name, &name)
                        .await;
                    return Err(e);
                }
                debug!(subscription = %self.name, member = %name, mode = %self.mode, "Member attached");
                Ok(())
            }
        }
    }

    fn rejoin(self: &Arc<Self>, inner: &mut SubscriptionInner, handle: ClientHandle) -> Result<()> {
        let name = handle.name.clone();
        let link = Arc::clone(&handle.link);
        inner.members.insert(name.clone(), handle);

        if let Some(lead) = inner.lead.as_mut() {
            if lead.member == name {
                lead.monitor.cancel();
                lead.epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
                lead.monitor = self.spawn_monitor(name.clone(), link, Arc::clone(&lead.lease), lead.epoch);
            }
        }
        debug!(subscription = %self.name, member = %name, "Member handle replaced");
        Ok(())
    }

    async fn wait_for_lead(
        self: &Arc<Self>,
        partition: &PartitionState,
        handle: ClientHandle,
        sub_offset: Msid,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(subscription = %self.name, member = %handle.name, "Waiting for failover lead");
        let pending =
            acquire_when_free(&self.ctx.metadata, &self.lead_path(), &handle.name, timeout, cancel)
                .await?;

        let mut inner = self.inner.lock().await;
        let Some(lease) = pending.claim() else {
            return Err(Error::Canceled);
        };
        if inner.closed {
            let _ = lease.release().await;
            return Err(Error::NotFound(format!("subscription {}", self.name)));
        }
        info!(subscription = %self.name, member = %handle.name, "Failover waiter took the lead");
        self.attach_lead(&mut inner, partition, handle, lease, sub_offset)
            .await
    }

    async fn attach_lead(
        self: &Arc<Self>,
        inner: &mut SubscriptionInner,
        partition: &PartitionState,
        handle: ClientHandle,
        lease: Lease,
        sub_offset: Msid,
    ) -> Result<()> {
        self.seed(inner, partition, sub_offset).await;
        let name = handle.name.clone();
        let link = Arc::clone(&handle.link);
        inner.members.insert(name.clone(), handle);

        if let Err(e) = self.persist(inner).await {
            inner.members.remove(&name);
            let _ = lease.release().await;
            return Err(e);
        }

        let lease = Arc::new(lease);
        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let monitor = self.spawn_monitor(name.clone(), link, Arc::clone(&lease), epoch);
        inner.lead = Some(LeadSlot {
            member: name.clone(),
            lease,
            epoch,
            monitor,
        });
        info!(
            subscription = %self.name,
            member = %name,
            push_offset = inner.record.push_offset,
            "Lead member attached"
        );
        Ok(())
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        member: String,
        link: Arc<dyn ClientLink>,
        lease: Arc<Lease>,
        epoch: u64,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(&self.ctx.heartbeat, link, lease);
        let sub: Weak<Self> = Arc::downgrade(self);
        let token = cancel.clone();
        tokio::spawn(async move {
            if monitor.run(token).await == MonitorExit::Revoked {
                if let Some(sub) = sub.upgrade() {
                    sub.on_revoked(&member, epoch).await;
                }
            }
        });
        cancel
    }

    /// Detach a lead member whose lease the heartbeat monitor removed.
    async fn on_revoked(&self, member: &str, epoch: u64) {
        let mut inner = self.inner.lock().await;
        let current = inner.lead.as_ref().map(|l| (l.member.clone(), l.epoch));
        match current {
            Some((_, lead_epoch)) if lead_epoch == epoch => {
                inner.lead = None;
            }
            // The same name already holds a newer lead; leave it alone.
            Some((lead_member, _)) if lead_member == member => return,
            _ => {}
        }
        if inner.members.remove(member).is_some() {
            warn!(subscription = %self.name, member, "Detached unresponsive lead member");
            if let Err(e) = self.persist(&mut inner).await {
                warn!(subscription = %self.name, error = %e, "Failed to persist member set");
            }
        }
    }

    /// Detach `member`. Returns whether the subscription is now empty.
    ///
    /// A released lead node is not handed to anyone here; waiters pick it up
    /// from their own watch.
    pub async fn leave(&self, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(handle) = inner.members.remove(member) else {
            return Err(Error::NotFound(format!(
                "{member} in subscription {}",
                self.name
            )));
        };
        if let Err(e) = self.persist(&mut inner).await {
            inner.members.insert(member.to_string(), handle);
            return Err(e);
        }

        let is_lead = inner.lead.as_ref().is_some_and(|l| l.member == member);
        let lead = if is_lead { inner.lead.take() } else { None };
        if matches!(self.mode, SubscribeMode::Shared | SubscribeMode::KeyShared) {
            self.ctx
                .metadata
                .remove_member(&self.topic, self.partition, &self.name, member)
                .await?;
        }
        if let Some(lead) = lead {
            lead.monitor.cancel();
            lead.lease.release().await?;
        }
        info!(subscription = %self.name, member, "Member left");
        Ok(inner.members.is_empty() && inner.lead.is_none())
    }

    /// Detach every Shared/KeyShared member reached over `link` (its
    /// connection closed). Lead members are left to the heartbeat monitor.
    ///
    /// The cursor is kept; the subscription stays open for later joins.
    pub async fn detach_link(&self, link: &Arc<dyn ClientLink>) -> Result<Vec<String>> {
        if !matches!(self.mode, SubscribeMode::Shared | SubscribeMode::KeyShared) {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().await;
        let gone: Vec<String> = inner
            .members
            .iter()
            .filter(|(_, handle)| same_link(&handle.link, link))
            .map(|(name, _)| name.clone())
            .collect();
        if gone.is_empty() {
            return Ok(gone);
        }

        let mut removed = Vec::with_capacity(gone.len());
        for name in &gone {
            if let Some(handle) = inner.members.remove(name) {
                removed.push(handle);
            }
        }
        if let Err(e) = self.persist(&mut inner).await {
            for handle in removed {
                inner.members.insert(handle.name.clone(), handle);
            }
            return Err(e);
        }
        for name in &gone {
            self.ctx
                .metadata
                .remove_member(&self.topic, self.partition, &self.name, name)
                .await?;
        }
        warn!(subscription = %self.name, members = ?gone, "Detached members of a closed connection");
        Ok(gone)
    }

    /// Delete the subscription if nobody is attached or joining.
    ///
    /// Call with the registry lock held so no new join can find it.
    pub async fn try_close(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(true);
        }
        if !inner.members.is_empty() || inner.lead.is_some() || self.joins.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        self.ctx
            .metadata
            .delete_subscription(&self.topic, self.partition, &self.name)
            .await?;
        self.ctx
            .log
            .delete(&subscription_record_key(&self.topic, self.partition, &self.name))
            .await?;
        inner.closed = true;
        inner.active.take();
        info!(topic = %self.topic, partition = self.partition, subscription = %self.name, "Subscription removed");
        Ok(true)
    }

    /// Stop monitors and release the lead node (broker shutdown).
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.active.take();
        if let Some(lead) = inner.lead.take() {
            lead.monitor.cancel();
            if let Err(e) = lead.lease.release().await {
                warn!(subscription = %self.name, error = %e, "Failed to release lead on shutdown");
            }
        }
    }

    /// Raise the subscription ack offset, clamped to what was delivered.
    pub async fn ack(&self, offset: Msid) -> Result<Msid> {
        let mut inner = self.inner.lock().await;
        let delivered = inner.record.push_offset.saturating_sub(1);
        let target = offset.min(delivered);
        if target > inner.record.ack_offset {
            inner.record.ack_offset = target;
            self.persist_record(&inner).await?;
        }
        Ok(inner.record.ack_offset)
    }

    async fn seed(&self, inner: &mut SubscriptionInner, partition: &PartitionState, sub_offset: Msid) {
        if inner.record.push_offset == 0 {
            let snapshot = partition.snapshot().await;
            inner.record.push_offset = initial_offset(&snapshot, sub_offset);
            inner.record.ack_offset = inner.record.ack_offset.min(inner.record.push_offset - 1);
            debug!(
                subscription = %self.name,
                sub_offset,
                push_offset = inner.record.push_offset,
                "Seeded subscription cursor"
            );
        }
    }

    /// Write the member set and the cursor record.
    ///
    /// A stale descriptor version surfaces as `Conflict` and nothing is
    /// written; call [`Self::refresh`] before retrying.
    async fn persist(&self, inner: &mut SubscriptionInner) -> Result<()> {
        let descriptor = SubscriptionDescriptor {
            name: self.name.clone(),
            topic: self.topic.clone(),
            partition: self.partition,
            mode: self.mode,
            members: inner.members.keys().cloned().collect(),
        };
        match self
            .ctx
            .metadata
            .update_subscription(&descriptor, inner.version)
            .await
        {
            Ok(version) => inner.version = version,
            Err(Error::Conflict(msg)) => {
                CAS_CONFLICTS.inc();
                warn!(
                    subscription = %self.name,
                    expected_version = inner.version,
                    "Subscription descriptor changed underneath us"
                );
                return Err(Error::Conflict(msg));
            }
            Err(e) => return Err(e),
        }
        self.persist_record(inner).await
    }

    /// Re-read the persisted descriptor version after a `Conflict`.
    ///
    /// The member set stays as attached here; handles of members recorded by
    /// another writer do not exist on this broker.
    pub async fn refresh(&self) -> Result<()> {
        let (stored, version) = self
            .ctx
            .metadata
            .get_subscription(&self.topic, self.partition, &self.name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("subscription {}", self.name)))?;
        let mut inner = self.inner.lock().await;
        debug!(
            subscription = %self.name,
            stored_members = stored.members.len(),
            version,
            "Refreshed subscription descriptor"
        );
        inner.version = version;
        Ok(())
    }

    pub(crate) async fn persist_record(&self, inner: &SubscriptionInner) -> Result<()> {
        let key = subscription_record_key(&self.topic, self.partition, &self.name);
        self.ctx
            .log
            .put(&key, Bytes::from(serde_json::to_vec(&inner.record)?))
            .await
    }
}
