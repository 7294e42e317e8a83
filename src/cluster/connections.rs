//! Client names and parked connection handles.
//!
//! A broker hands every connecting client a full name of the form
//! `<topic>:p<partition>:<role>:<name>`. `:` is not allowed in identifiers,
//! so two full names are equal only when all four parts are. On collision
//! with a different client the name gets a `(n)` suffix, or the connect is
//! rejected when renaming is disabled.
//!
//! A subscriber's handle is parked here between `Connect` and `Subscribe`;
//! `Subscribe` takes it out and hands it to the subscription. Publisher
//! handles go straight to the partition's publisher record.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::ClientLink;
use crate::types::{ClientRole, PartitionId};

/// Upper bound on `(n)` suffixes tried before giving up.
const MAX_RENAME_ATTEMPTS: u32 = 1024;

/// A named connection to one client.
#[derive(Clone)]
pub struct ClientHandle {
    pub name: String,
    pub client_id: String,
    pub link: Arc<dyn ClientLink>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("url", &self.link.url())
            .finish()
    }
}

/// Outcome of [`ConnectionTable::assign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assigned {
    pub name: String,
    /// The same client already held this name; its handle is being replaced.
    pub reconnect: bool,
}

pub fn full_name(topic: &str, partition: PartitionId, role: ClientRole, name: &str) -> String {
    format!("{topic}:p{partition}:{}:{name}", role.as_str())
}

pub struct ConnectionTable {
    /// Full name to owning client id.
    names: DashMap<String, String>,
    pending: DashMap<String, ClientHandle>,
    allow_rename: bool,
}

impl ConnectionTable {
    pub fn new(allow_rename: bool) -> Self {
        Self {
            names: DashMap::new(),
            pending: DashMap::new(),
            allow_rename,
        }
    }

    /// Reserve `base` (or a suffixed variant) for `client_id`.
    pub fn assign(&self, base: &str, client_id: &str) -> Result<Assigned> {
        for n in 0..MAX_RENAME_ATTEMPTS {
            let candidate = if n == 0 {
                base.to_string()
            } else {
                format!("{base}({n})")
            };
            match self.names.entry(candidate.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(client_id.to_string());
                    return Ok(Assigned {
                        name: candidate,
                        reconnect: false,
                    });
                }
                Entry::Occupied(slot) if slot.get() == client_id => {
                    return Ok(Assigned {
                        name: candidate,
                        reconnect: true,
                    });
                }
                Entry::Occupied(_) if !self.allow_rename => {
                    return Err(Error::NameConflict(base.to_string()));
                }
                Entry::Occupied(_) => continue,
            }
        }
        Err(Error::NameConflict(base.to_string()))
    }

    pub fn is_assigned(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn client_id(&self, name: &str) -> Option<String> {
        self.names.get(name).map(|id| id.value().clone())
    }

    /// Park a handle until a subscribe claims it. Replaces any older handle.
    pub fn park(&self, handle: ClientHandle) {
        debug!(name = %handle.name, "Parked connection");
        self.pending.insert(handle.name.clone(), handle);
    }

    /// Move a parked handle out of the table.
    pub fn take(&self, name: &str) -> Option<ClientHandle> {
        self.pending.remove(name).map(|(_, handle)| handle)
    }

    /// Forget the name and any parked handle.
    pub fn release(&self, name: &str) {
        self.pending.remove(name);
        if self.names.remove(name).is_some() {
            debug!(name, "Released client name");
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
