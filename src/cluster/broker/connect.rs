//! Connect, disconnect and publisher leadership.
//!
//! Publishers on an `Exclusive` or `WaitExclusive` topic compete for the
//! partition's lead-publisher node. The winner is watched by a heartbeat
//! monitor; when the monitor revokes the lease the publisher's name is
//! dropped so it can no longer publish. A `WaitExclusive` publisher that
//! finds the node taken waits for it to go away (bounded by the connect
//! timeout) and then proceeds as `Exclusive`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Broker, ClientSession, LeadPublisher, PartitionEntry, Publishers};
use crate::cluster::connections::{full_name, ClientHandle};
use crate::cluster::heartbeat::{HeartbeatMonitor, MonitorExit};
use crate::cluster::lease::{acquire_when_free, Lease};
use crate::cluster::validation::{validate_client_name, validate_partition, validate_topic_name};
use crate::error::{Error, Result};
use crate::protocol::ConnectRequest;
use crate::types::{PublishMode, TopicDescriptor};

impl Broker {
    /// Register a client and return its broker-assigned full name.
    ///
    /// Creates the topic on first connect. Subscriber handles are parked
    /// until the matching subscribe.
    pub async fn connect(&self, session: &ClientSession, req: ConnectRequest) -> Result<String> {
        validate_topic_name(&req.topic)?;
        validate_client_name(&req.name)?;
        if req.client_id.is_empty() {
            return Err(Error::InvalidArgument("client id cannot be empty".to_string()));
        }
        if req.partition_count == 0 {
            return Err(Error::InvalidArgument("partition count must be at least 1".to_string()));
        }
        self.ensure_owned(&req.topic, req.partition).await?;

        let topic = self
            .metadata
            .register_topic(&TopicDescriptor {
                name: req.topic.clone(),
                partition_count: req.partition_count,
                publish_mode: req.publish_mode,
            })
            .await?;
        validate_partition(&topic.name, req.partition, topic.partition_count)?;
        let entry = self.partition(&req.topic, req.partition).await?;

        let base = full_name(&req.topic, req.partition, req.role, &req.name);
        let assigned = self.connections.assign(&base, &req.client_id)?;
        let handle = ClientHandle {
            name: assigned.name.clone(),
            client_id: req.client_id.clone(),
            link: Arc::clone(&session.link),
        };

        let attached = if req.role.is_publisher() {
            self.attach_publisher(
                &entry,
                handle,
                Duration::from_millis(req.timeout_ms),
                &session.cancel,
            )
            .await
        } else {
            self.connections.park(handle);
            Ok(())
        };
        if let Err(e) = attached {
            if !assigned.reconnect {
                self.connections.release(&assigned.name);
            }
            return Err(e);
        }

        info!(
            name = %assigned.name,
            role = %req.role,
            url = %req.url,
            reconnect = assigned.reconnect,
            "Client connected"
        );
        Ok(assigned.name)
    }

    async fn attach_publisher(
        &self,
        entry: &Arc<PartitionEntry>,
        handle: ClientHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let topic = entry.state.topic().to_string();
        let partition = entry.state.partition();

        if entry.publish_mode == PublishMode::Shared {
            self.metadata
                .register_publisher(&topic, partition, &handle.name)
                .await?;
            entry
                .publishers
                .lock()
                .await
                .shared
                .insert(handle.name.clone(), handle);
            return Ok(());
        }

        let path = self.metadata.paths().publisher_leader(&topic, partition);
        {
            let mut publishers = entry.publishers.lock().await;
            let current = publishers
                .lead
                .as_ref()
                .map(|l| (l.client_id == handle.client_id, l.name.clone()));
            match current {
                Some((true, _)) => {
                    self.replace_lead_publisher(entry, &mut publishers, handle);
                    return Ok(());
                }
                Some((false, holder)) if entry.publish_mode == PublishMode::Exclusive => {
                    return Err(Error::AlreadyOwned(holder));
                }
                Some(_) => {}
                None => {
                    match Lease::acquire(
                        Arc::clone(self.metadata.store()),
                        path.clone(),
                        handle.client_id.clone(),
                    )
                    .await
                    {
                        Ok(lease) => {
                            self.install_lead_publisher(entry, &mut publishers, handle, lease);
                            return Ok(());
                        }
                        Err(Error::AlreadyOwned(holder))
                            if entry.publish_mode == PublishMode::Exclusive =>
                        {
                            return Err(Error::AlreadyOwned(holder));
                        }
                        Err(Error::AlreadyOwned(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        debug!(name = %handle.name, %path, "Waiting for lead publisher to go away");
        let pending = acquire_when_free(&self.metadata, &path, &handle.client_id, timeout, cancel).await?;
        let mut publishers = entry.publishers.lock().await;
        let lease = pending.claim().ok_or(Error::Canceled)?;
        self.install_lead_publisher(entry, &mut publishers, handle, lease);
        Ok(())
    }

    fn install_lead_publisher(
        &self,
        entry: &Arc<PartitionEntry>,
        publishers: &mut Publishers,
        handle: ClientHandle,
        lease: Lease,
    ) {
        publishers.next_epoch += 1;
        let epoch = publishers.next_epoch;
        let lease = Arc::new(lease);
        let monitor = self.spawn_publisher_monitor(entry, &handle, Arc::clone(&lease), epoch);
        info!(name = %handle.name, topic = %entry.state.topic(), partition = entry.state.partition(), "Lead publisher installed");
        publishers.lead = Some(LeadPublisher {
            name: handle.name,
            client_id: handle.client_id,
            lease,
            epoch,
            monitor,
        });
    }

    /// Same client reconnected: keep the lease, watch the new link.
    fn replace_lead_publisher(
        &self,
        entry: &Arc<PartitionEntry>,
        publishers: &mut Publishers,
        handle: ClientHandle,
    ) {
        publishers.next_epoch += 1;
        let epoch = publishers.next_epoch;
        if let Some(lead) = publishers.lead.as_mut() {
            lead.monitor.cancel();
            lead.epoch = epoch;
            lead.monitor = self.spawn_publisher_monitor(entry, &handle, Arc::clone(&lead.lease), epoch);
            debug!(name = %lead.name, "Lead publisher link replaced");
        }
    }

    fn spawn_publisher_monitor(
        &self,
        entry: &Arc<PartitionEntry>,
        handle: &ClientHandle,
        lease: Arc<Lease>,
        epoch: u64,
    ) -> CancellationToken {
        let cancel = self.cancel.child_token();
        let monitor = HeartbeatMonitor::new(&self.config.heartbeat, Arc::clone(&handle.link), lease);
        let entry: Weak<PartitionEntry> = Arc::downgrade(entry);
        let connections = Arc::clone(&self.connections);
        let name = handle.name.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            if monitor.run(token).await != MonitorExit::Revoked {
                return;
            }
            let Some(entry) = entry.upgrade() else {
                return;
            };
            let mut publishers = entry.publishers.lock().await;
            if publishers.lead.as_ref().is_some_and(|l| l.epoch == epoch) {
                publishers.lead = None;
                connections.release(&name);
                warn!(name = %name, "Dropped unresponsive lead publisher");
            }
        });
        cancel
    }

    /// Forget a client name and everything attached under it.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        if !self.connections.is_assigned(name) {
            return Err(Error::NotFound(format!("client {name}")));
        }
        self.connections.release(name);

        let entries: Vec<Arc<PartitionEntry>> =
            self.partitions.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let lead = {
                let mut publishers = entry.publishers.lock().await;
                let is_lead = publishers.lead.as_ref().is_some_and(|l| l.name == name);
                if publishers.shared.remove(name).is_some() {
                    self.metadata
                        .remove_publisher(entry.state.topic(), entry.state.partition(), name)
                        .await?;
                }
                if is_lead {
                    publishers.lead.take()
                } else {
                    None
                }
            };
            if let Some(lead) = lead {
                lead.monitor.cancel();
                lead.lease.release().await?;
            }

            let subs: Vec<_> = entry.subscriptions.lock().await.values().cloned().collect();
            for sub in subs {
                match sub.leave(name).await {
                    Ok(true) => self.close_if_idle(&entry, &sub).await?,
                    Ok(false) | Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        info!(name, "Client disconnected");
        Ok(())
    }
}
