use tracing::debug;

use super::Broker;
use crate::error::{Error, Result};
use crate::protocol::PublishRequest;
use crate::types::{Msid, PublishMode};

impl Broker {
    /// Append one message and return its msid.
    ///
    /// On a topic with a lead publisher only the lead may publish, and the
    /// lead check covers the whole write. A `Conflict` means the persisted
    /// descriptor moved under us; the mirror is re-read before the error is
    /// returned so the next publish starts from fresh state.
    pub async fn publish(&self, req: PublishRequest) -> Result<Msid> {
        if !self.connections.is_assigned(&req.name) {
            return Err(Error::NotFound(format!("publisher {}", req.name)));
        }
        let entry = self.partition(&req.topic, req.partition).await?;

        // Held until the message is committed, so a lead that is being
        // replaced cannot land a publish after its successor takes over.
        let publishers = entry.publishers.lock().await;
        match entry.publish_mode {
            PublishMode::Shared => {
                if !publishers.shared.contains_key(&req.name) {
                    return Err(Error::NotFound(format!("publisher {}", req.name)));
                }
            }
            PublishMode::Exclusive | PublishMode::WaitExclusive => match &publishers.lead {
                Some(lead) if lead.name == req.name => {}
                Some(lead) => return Err(Error::AlreadyOwned(lead.name.clone())),
                None => return Err(Error::NotFound(format!("lead publisher of {}", req.topic))),
            },
        }

        match entry.state.apply_publish(req.mid, req.key, req.payload).await {
            Ok(msid) => {
                debug!(publisher = %req.name, mid = req.mid, msid, "Published");
                Ok(msid)
            }
            Err(Error::Conflict(msg)) => {
                drop(publishers);
                entry.state.refresh().await?;
                Err(Error::Conflict(msg))
            }
            Err(e) => Err(e),
        }
    }
}
