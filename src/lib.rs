//! # bundlemq
//! A partitioned publish/subscribe broker with a companion client.
//!
//! Topics are split into numbered partitions. Each partition hashes into a
//! *bundle* (a range of the u32 hash space) and each bundle is owned by one
//! broker at a time, assigned by the cluster leader on first use. Clients
//! look up the owner, connect, then publish or subscribe.
//!
//! Subscriptions come in four modes:
//! - **Exclusive**: one member; a second join fails with `AlreadyOwned`.
//! - **Failover**: one lead, others wait; a lead that stops answering
//!   alive-checks loses the role and a waiter takes over from the persisted
//!   cursor.
//! - **Shared**: messages go round-robin to members.
//! - **KeyShared**: messages with the same key go to the same member.
//!
//! Delivery is pull-driven: a subscriber asks for at most as many messages as
//! it can buffer and the broker pushes them in msid order.
//!
//! ## Layout
//! - [`cluster`]: the broker and its coordination/storage building blocks
//! - [`client`]: publishers and subscribers
//! - [`transport`]: the seams between the two, in-process or TCP
//! - [`server`]: the TCP front end of a broker
//! - [`redo`]: bounded retry of timed-out calls, used on both sides
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bundlemq::client::{Client, ClientConfig, Publisher, Subscriber, SubscribeOptions};
//! use bundlemq::cluster::{Broker, BrokerConfig, MemoryCoordinator, MemoryLogStore};
//! use bundlemq::transport::local::LocalNetwork;
//! use bundlemq::types::{PublishMode, SubscribeMode};
//!
//! #[tokio::main]
//! async fn main() -> bundlemq::Result<()> {
//!     let broker = Broker::start(
//!         BrokerConfig::default(),
//!         Arc::new(MemoryCoordinator::new()),
//!         Arc::new(MemoryLogStore::new()),
//!     )
//!     .await?;
//!     let network = LocalNetwork::new();
//!     network.register(broker.clone());
//!
//!     let client = Client::new(ClientConfig::new(broker.url()), Arc::new(network));
//!     let publisher = Publisher::connect(&client, "t", 1, "p", PublishMode::Shared).await?;
//!     let mut subscriber = Subscriber::subscribe(
//!         &client,
//!         "t",
//!         Some(1),
//!         SubscribeOptions::new("s", SubscribeMode::Shared),
//!     )
//!     .await?;
//!
//!     publisher.publish("hello").await?;
//!     let message = subscriber.receive().await?;
//!     subscriber.ack(&message).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod client;
pub mod cluster;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod redo;
pub mod server;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use error::{Error, Result};

pub mod prelude {
    //! Common imports for applications.
    pub use crate::client::{
        Client, ClientConfig, PartitionRouting, PartitionedPublisher, Publisher, SubscribeOptions,
        Subscriber,
    };
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::types::{Message, Msid, PartitionId, PublishMode, SubscribeMode};

    pub use bytes;
}
